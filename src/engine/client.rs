//! HTTP client setup shared by the probe and the transfers

use std::{collections::HashMap, time::Duration};

use reqwest::{
    Client,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use tracing::warn;

/// Builds the client every request of the engine goes through.
///
/// Transfers rely on the read timeout rather than a total one, so a large body
/// may take as long as it needs while a stalled one still fails.
pub fn build_client(user_agent: &str, read_timeout: Duration) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    // Byte offsets must refer to the stored entity, not a compressed stream
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(read_timeout)
        .build()
}

/// Turn a job's stored cookie string and extra headers into request headers.
///
/// Entries that are not valid header names or values are skipped.
pub fn job_headers(cookies: Option<&str>, extra: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in extra {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid request header"),
        }
    }

    if let Some(cookies) = cookies.filter(|c| !c.is_empty()) {
        match HeaderValue::from_str(cookies) {
            Ok(value) => {
                headers.insert(header::COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Skipping invalid cookie string"),
        }
    }

    headers
}
