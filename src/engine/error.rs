//! Error types for the download engine

use reqwest::StatusCode;
use std::io;
use thiserror::Error;

use super::models::JobId;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The submission can't be probed at all (bad URL, unsupported scheme)
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Every probe tier failed; defaults were substituted
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Reassembly failed: {0}")]
    ReassemblyFailed(#[from] io::Error),

    /// A transfer stopped because its job was paused
    #[error("Transfer cancelled by pause")]
    ExpectedCancellation,

    #[error("Download {0} not found")]
    NotFound(JobId),

    #[error("Engine is not running")]
    EngineClosed,

    #[error("Engine setup failed: {0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a single transfer task stopped before finishing
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error: {}", .0.as_u16())]
    Status(StatusCode),

    /// A chunk request was answered with the whole entity instead of a range
    #[error("Server ignored range request (status {})", .0.as_u16())]
    RangeIgnored(StatusCode),

    #[error("Body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Cancellation-class errors are the only ones a pause may produce
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
