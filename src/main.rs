mod backend;
mod config;
mod engine;

use std::collections::HashMap;

use backend::{AppState, router::create_router};
use engine::{DownloadStatus, Engine, JobId};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Log each job's status transitions as the engine publishes them
async fn log_status_changes(engine: Engine) {
    let mut jobs = engine.subscribe();
    let mut last: HashMap<JobId, DownloadStatus> = HashMap::new();
    while jobs.changed().await.is_ok() {
        let table = jobs.borrow_and_update().clone();
        for (id, download) in table.iter() {
            if last.insert(*id, download.status) == Some(download.status) {
                continue;
            }
            tracing::info!(
                id = %id,
                file = %download.filename,
                status = %download.status,
                progress = download.progress(),
                eta = ?download.eta(),
                total_speed = engine.global_speed(),
                "Download status changed"
            );
        }
        last.retain(|id, _| table.contains_key(id));
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetchd=info")),
        )
        .init();
    color_eyre::install()?;

    let config = config::config();
    let addr = config.listen_addr()?;
    let settings = config.settings();

    // create download directory
    if !settings.download_dir.exists() {
        tokio::fs::create_dir_all(&settings.download_dir).await?;
        tracing::info!(
            "Directory '{}' does not exist, creating...",
            settings.download_dir.display()
        );
    } else {
        tracing::debug!(
            "Directory '{}' already exists, skipping...",
            settings.download_dir.display()
        );
    }

    // The sender stays here; the engine only ever reads settings
    let (_settings_tx, settings_rx) = watch::channel(settings);
    let engine = Engine::start(config.engine_config.engine_options(), settings_rx).await?;

    tokio::spawn(log_status_changes(engine.clone()));

    let app = create_router(AppState {
        engine: engine.clone(),
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let unfinished = engine
        .snapshot()
        .iter()
        .filter(|download| !download.status.is_terminal())
        .count();
    if unfinished > 0 {
        tracing::warn!("Stopping with {} unfinished downloads", unfinished);
    }
    engine.shutdown().await;
    Ok(())
}
