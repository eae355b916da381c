use std::{path::PathBuf, time::Duration};

use super::plan::StrategyPolicy;

/// User-adjustable settings, read by the engine whenever a job is submitted
/// or a strategy is chosen. The engine only ever reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub download_dir: PathBuf,
    pub max_connections: usize,
    pub min_chunked_size: u64,
    pub intercept_browser: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_connections: 8,
            min_chunked_size: 4 * 1024 * 1024,
            intercept_browser: true,
        }
    }
}

/// Fixed for the lifetime of an engine instance
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub temp_dir: PathBuf,
    pub max_connections_per_host: usize,
    pub policy: StrategyPolicy,
    pub user_agent: String,
    pub transfer_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("fetchd"),
            max_connections_per_host: 16,
            policy: StrategyPolicy::single_stream_for(["googleusercontent.com"]),
            user_agent: concat!("fetchd/", env!("CARGO_PKG_VERSION")).to_string(),
            transfer_timeout: Duration::from_secs(300),
        }
    }
}
