//! Download engine
//!
//! Accepts URLs, probes them, fetches them over one stream or several parallel
//! byte-range transfers, and publishes job state for observers.

mod actor;
mod assemble;
pub mod client;
pub mod error;
mod handle;
pub mod models;
pub mod plan;
pub mod probe;
pub mod sampler;
mod settings;
#[cfg(test)]
pub(crate) mod test_server;
pub mod transfer;

pub use handle::{Engine, JobRequest, parse_source_url};
pub use models::{DownloadStatus, JobId};
pub use plan::StrategyPolicy;
pub use settings::{EngineOptions, EngineSettings};
