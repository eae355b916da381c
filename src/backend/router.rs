use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use tower_http::trace::TraceLayer;

use super::AppState;
use super::submit::{preflight, submit_download};

/// Create the control listener router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/download",
            post(submit_download)
                .options(preflight)
                .fallback(not_found),
        )
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Every response is readable from any origin
pub async fn cors(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
