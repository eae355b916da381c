//! `POST /download` submissions

use axum::{
    Json,
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use super::AppState;
use crate::engine::{JobRequest, parse_source_url};

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    /// Body isn't JSON, or carries no usable URL. Never reaches the engine.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Browser downloads are disabled")]
    InterceptionDisabled,
}

impl IntoResponse for ListenerError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::InterceptionDisabled => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
}

/// Validate a submission and hand it to the engine without waiting for it
pub async fn submit_download(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ListenerError> {
    if !state.engine.settings().intercept_browser {
        return Err(ListenerError::InterceptionDisabled);
    }

    let request: JobRequest = serde_json::from_slice(&body)
        .map_err(|e| ListenerError::MalformedRequest(e.to_string()))?;
    let url = parse_source_url(&request.url)
        .map_err(|e| ListenerError::MalformedRequest(e.to_string()))?;

    info!(url = %url, filename = ?request.filename, "Download submitted");
    let engine = state.engine.clone();
    tokio::spawn(
        async move {
            if let Err(e) = engine.add_job(request).await {
                warn!(error = %e, "Submitted download was not started");
            }
        }
        .instrument(info_span!("submit", url = %url)),
    );

    Ok(Json(SubmitResponse { success: true }))
}

/// CORS preflight; the headers come from the router's middleware
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}
