//! Data structures for the download engine
//!
//! These are the externally observed value types: a [`Download`] job and the
//! [`Chunk`]s it is split into. They carry state and derived fields only; all
//! mutation happens inside the engine actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc, time::Duration};
use ulid::Ulid;
use url::Url;

/// Process-unique job identifier
pub type JobId = Ulid;

/// Published view of every job the engine currently owns
pub type JobTable = Arc<BTreeMap<JobId, Download>>;

/// Status of a download
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Download has been submitted but no transfer has started yet
    #[default]
    Queued,
    /// At least one transfer is running
    Downloading,
    /// Transfers are suspended or aborted with their progress retained
    Paused,
    /// Download completed successfully
    Completed,
    /// Download failed, see [`Download::error_message`]
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One contiguous byte range of a job, fetched by its own transfer
///
/// `start_byte` and `end_byte` are inclusive and never change once planned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub downloaded_bytes: u64,
    pub is_complete: bool,
}

impl Chunk {
    pub fn new(id: usize, start_byte: u64, end_byte: u64) -> Self {
        Self {
            id,
            start_byte,
            end_byte,
            downloaded_bytes: 0,
            is_complete: false,
        }
    }

    /// Number of bytes covered by this chunk
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    /// Absolute offset the next range request for this chunk starts at
    pub fn resume_offset(&self) -> u64 {
        self.start_byte + self.downloaded_bytes
    }

    /// Raise the recorded progress to `cumulative`, clamped to the chunk length.
    ///
    /// Returns whether the value changed. Lower values are ignored.
    pub fn record_progress(&mut self, cumulative: u64) -> bool {
        let cumulative = cumulative.min(self.len());
        if cumulative > self.downloaded_bytes {
            self.downloaded_bytes = cumulative;
            true
        } else {
            false
        }
    }
}

/// A single user-requested download and its observable state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: JobId,
    pub source_url: Url,
    pub filename: String,
    /// Size in bytes; an estimate until the server reports the real total
    pub filesize: u64,
    pub destination_path: PathBuf,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,
    /// Average bytes per second since `started_at`
    pub speed: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub chunks: Vec<Chunk>,
}

impl Download {
    pub fn new(id: JobId, source_url: Url, filename: String, destination_path: PathBuf) -> Self {
        Self {
            id,
            source_url,
            filename,
            filesize: 0,
            destination_path,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            speed: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            chunks: Vec::new(),
        }
    }

    /// Completed fraction in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.filesize == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.filesize as f64).min(1.0)
    }

    /// Estimated time left at the current average speed
    ///
    /// Returns None if the job isn't transferring or no speed is known yet
    pub fn eta(&self) -> Option<Duration> {
        if self.status != DownloadStatus::Downloading || self.speed <= 0.0 {
            return None;
        }
        let remaining = self.filesize.saturating_sub(self.downloaded_bytes);
        Some(Duration::from_secs_f64(remaining as f64 / self.speed))
    }

    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Recompute the aggregate from chunk progress. Never tracked on its own.
    pub(crate) fn sum_chunks(&mut self) {
        self.downloaded_bytes = self.chunks.iter().map(|c| c.downloaded_bytes).sum();
    }

    pub(crate) fn refresh_speed(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.started_at).num_milliseconds();
        self.speed = if elapsed > 0 {
            self.downloaded_bytes as f64 / (elapsed as f64 / 1000.0)
        } else {
            0.0
        };
    }
}

/// Parse filename from Content-Disposition header
/// Returns Some(filename) if successful, None otherwise
#[tracing::instrument(level = "trace", ret)]
pub fn parse_content_disposition(content_disposition: &str) -> Option<String> {
    // RFC 5987 takes precedence when both forms are present
    if let Some(pos) = content_disposition.find("filename*=") {
        let value = &content_disposition[pos + "filename*=".len()..];
        let value = value.split(';').next().unwrap_or_default().trim();
        // charset'language'percent-encoded
        if let Some(encoded) = value.splitn(3, '\'').nth(2) {
            if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                let filename = decoded.to_string();
                if !filename.is_empty() {
                    tracing::trace!(filename = %filename, "Found encoded filename");
                    return Some(filename);
                }
            }
        }
    }

    // filename="..." (RFC 6266)
    if let Some(pos) = content_disposition.find("filename=\"") {
        let start = pos + "filename=\"".len();
        if let Some(end) = content_disposition[start..].find('"') {
            let filename = content_disposition[start..(start + end)].to_string();
            if !filename.is_empty() {
                tracing::trace!(filename = %filename, "Found quoted filename");
                return Some(filename);
            }
        }
    }

    // filename=... (without quotes)
    if let Some(pos) = content_disposition.find("filename=") {
        let start = pos + "filename=".len();
        let end = content_disposition[start..]
            .find(|c: char| c.is_whitespace() || c == ';')
            .unwrap_or(content_disposition[start..].len());

        if end > 0 {
            let filename = content_disposition[start..(start + end)].to_string();
            tracing::trace!(filename = %filename, "Found unquoted filename");
            return Some(filename);
        }
    }

    None
}

/// Last non-empty path segment of a URL, percent-decoded
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize_filename(&decoded)
}

/// Reduce a server or user supplied name to a single safe path component
pub fn sanitize_filename(name: &str) -> Option<String> {
    let name = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"');
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.chars().filter(|c| !c.is_control()).collect())
}
