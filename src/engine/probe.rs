//! Metadata probe
//!
//! Learns size, suggested filename and byte-range support for a URL before a
//! strategy is chosen. The probe never fails: a HEAD request is tried first,
//! then a one-byte ranged GET, and when both are unusable a fixed default is
//! returned so the job can still start.

use reqwest::{Client, Response, StatusCode, header, header::HeaderMap};
use std::time::Duration;
use tracing::{debug, instrument, trace};
use url::Url;

use super::models::{filename_from_url, parse_content_disposition, sanitize_filename};
use super::plan::range_header;

pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const RANGE_TEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Size assumed when the server won't tell (100 MiB)
pub const FALLBACK_FILESIZE: u64 = 100 * 1024 * 1024;
pub const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub filesize: u64,
    pub filename: String,
    pub supports_ranges: bool,
}

/// Which probe tier produced the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSource {
    Head,
    RangeGet,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub metadata: Metadata,
    pub source: ProbeSource,
}

/// What one tier could read off a response
#[derive(Debug, Default)]
struct Partial {
    filesize: Option<u64>,
    filename: Option<String>,
    supports_ranges: bool,
}

#[instrument(name = "probe", level = "debug", skip(client, headers), fields(url = %url))]
pub async fn probe(client: &Client, url: &Url, headers: &HeaderMap) -> ProbeOutcome {
    let head = match probe_head(client, url, headers).await {
        Ok(partial) => Some(partial),
        Err(e) => {
            debug!(error = %e, "HEAD probe failed, trying range request");
            None
        }
    };

    // A HEAD without a length still needs the ranged GET to size the file
    let needs_range_test = head.as_ref().is_none_or(|p| p.filesize.is_none());
    let ranged = if needs_range_test {
        match probe_range(client, url, headers).await {
            Ok(partial) => Some(partial),
            Err(e) => {
                debug!(error = %e, "Range probe failed");
                None
            }
        }
    } else {
        None
    };

    let url_name = || filename_from_url(url).unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    let outcome = match (head, ranged) {
        (Some(head), None) if head.filesize.is_some() => ProbeOutcome {
            metadata: Metadata {
                filesize: head.filesize.unwrap_or(FALLBACK_FILESIZE),
                filename: head.filename.unwrap_or_else(url_name),
                supports_ranges: head.supports_ranges,
            },
            source: ProbeSource::Head,
        },
        (head, Some(ranged)) => {
            let head = head.unwrap_or_default();
            ProbeOutcome {
                metadata: Metadata {
                    filesize: ranged.filesize.unwrap_or(FALLBACK_FILESIZE),
                    filename: head.filename.or(ranged.filename).unwrap_or_else(url_name),
                    supports_ranges: head.supports_ranges || ranged.supports_ranges,
                },
                source: ProbeSource::RangeGet,
            }
        }
        (head, None) => {
            let filename = head.and_then(|h| h.filename).unwrap_or_else(url_name);
            debug!(filename = %filename, "No probe tier answered, assuming defaults");
            ProbeOutcome {
                metadata: Metadata {
                    filesize: FALLBACK_FILESIZE,
                    filename,
                    supports_ranges: true,
                },
                source: ProbeSource::Fallback,
            }
        }
    };

    debug!(
        filesize = outcome.metadata.filesize,
        filename = %outcome.metadata.filename,
        ranges = outcome.metadata.supports_ranges,
        source = ?outcome.source,
        "Probe finished"
    );
    outcome
}

async fn probe_head(client: &Client, url: &Url, headers: &HeaderMap) -> reqwest::Result<Partial> {
    let response = client
        .head(url.clone())
        .headers(headers.clone())
        .timeout(HEAD_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    trace!(status = %response.status(), "HEAD response");

    let supports_ranges = response
        .headers()
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));

    Ok(Partial {
        filesize: content_length(&response),
        filename: suggested_filename(&response),
        supports_ranges,
    })
}

async fn probe_range(client: &Client, url: &Url, headers: &HeaderMap) -> reqwest::Result<Partial> {
    let response = client
        .get(url.clone())
        .headers(headers.clone())
        .header(header::RANGE, range_header(0, Some(0)))
        .timeout(RANGE_TEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    trace!(status = %response.status(), "Range probe response");

    let partial = response.status() == StatusCode::PARTIAL_CONTENT;
    let filesize = if partial {
        content_range_total(&response)
    } else {
        content_length(&response)
    };

    Ok(Partial {
        filesize,
        filename: suggested_filename(&response),
        supports_ranges: partial,
    })
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|cl| cl.to_str().ok())
        .and_then(|cl| cl.trim().parse::<u64>().ok())
}

/// Total from `Content-Range: bytes 0-0/5678`; `*` means unknown
pub(crate) fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|range| range.to_str().ok())
        .and_then(|range| range.rsplit('/').next())
        .and_then(|total| total.trim().parse::<u64>().ok())
}

/// Content-Disposition first, then the final (post-redirect) URL
fn suggested_filename(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|cd| cd.to_str().ok())
        .and_then(parse_content_disposition)
        .and_then(|name| sanitize_filename(&name))
        .or_else(|| filename_from_url(response.url()))
}
