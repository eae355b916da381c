use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};
use url::Url;

use super::actor::{Command, Core, NewJob};
use super::client::{build_client, job_headers};
use super::error::{EngineError, Result};
use super::models::{Download, JobId, JobTable, filename_from_url, sanitize_filename};
use super::probe::{FALLBACK_FILENAME, probe};
use super::sampler;
use super::settings::{EngineOptions, EngineSettings};

/// A download submission
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    /// Raw `Cookie` header value sent with every request of the job
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Parse a submitted URL, accepting only absolute http(s) URLs with a host
pub fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| EngineError::Metadata(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::Metadata(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(EngineError::Metadata(format!("{} has no host", raw)));
    }
    Ok(url)
}

struct Inner {
    commands: mpsc::Sender<Command>,
    client: Client,
    jobs: watch::Receiver<JobTable>,
    speed: watch::Receiver<f64>,
    settings: watch::Receiver<EngineSettings>,
    stop: CancellationToken,
}

/// Cloneable handle to a running download engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Spawn the engine actor and its speed sampler on the current runtime.
    pub async fn start(
        options: EngineOptions,
        settings: watch::Receiver<EngineSettings>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&options.temp_dir)
            .await
            .map_err(|e| EngineError::Setup(format!("temp dir {:?}: {}", options.temp_dir, e)))?;
        let client = build_client(&options.user_agent, options.transfer_timeout)
            .map_err(|e| EngineError::Setup(format!("HTTP client: {}", e)))?;

        let (commands, commands_rx) = mpsc::channel(64);
        let (core, events_rx) = Core::new(client.clone(), options, settings.clone());
        let jobs = core.subscribe();
        tokio::spawn(core.run(commands_rx, events_rx).instrument(info_span!("engine")));

        let stop = CancellationToken::new();
        let (speed_tx, speed) = watch::channel(0.0);
        sampler::spawn(jobs.clone(), speed_tx, stop.clone());

        info!("Download engine started");
        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                client,
                jobs,
                speed,
                settings,
                stop,
            }),
        })
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| EngineError::EngineClosed)
    }

    async fn ask(&self, command: impl FnOnce(oneshot::Sender<bool>) -> Command) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(command(reply)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Create a job, probe it and start it.
    ///
    /// Only a URL that can never be fetched is rejected. The job is visible as
    /// queued while the probe runs and downloading once this returns.
    pub async fn add_job(&self, request: JobRequest) -> Result<JobId> {
        let url = parse_source_url(&request.url)?;
        let id = JobId::new();
        let requested = request.filename.as_deref().and_then(sanitize_filename);
        let filename = requested
            .clone()
            .or_else(|| filename_from_url(&url))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
        let download_dir = self.inner.settings.borrow().download_dir.clone();
        let headers = job_headers(request.cookies.as_deref(), &request.headers);

        self.send(Command::Add(NewJob {
            download: Download::new(id, url.clone(), filename.clone(), download_dir.join(&filename)),
            headers: headers.clone(),
            filename_fixed: requested.is_some(),
        }))
        .await?;

        let outcome = probe(&self.inner.client, &url, &headers).await;

        let (reply, rx) = oneshot::channel();
        self.send(Command::Probed { id, outcome, reply }).await?;
        rx.await.map_err(|_| EngineError::EngineClosed)??;
        debug!(id = %id, "Job submitted");
        Ok(id)
    }

    /// Returns whether the job was paused by this call
    pub async fn pause(&self, id: JobId) -> bool {
        self.ask(|reply| Command::Pause { id, reply }).await
    }

    /// Returns whether the job was resumed by this call
    pub async fn resume(&self, id: JobId) -> bool {
        self.ask(|reply| Command::Resume { id, reply }).await
    }

    /// Stop the job, delete its temp files and forget it
    pub async fn cancel(&self, id: JobId) -> bool {
        self.ask(|reply| Command::Cancel { id, reply }).await
    }

    pub fn get(&self, id: JobId) -> Option<Download> {
        self.inner.jobs.borrow().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Download> {
        self.inner.jobs.borrow().values().cloned().collect()
    }

    /// Receiver that sees every published job table
    pub fn subscribe(&self) -> watch::Receiver<JobTable> {
        self.inner.jobs.clone()
    }

    /// Rolling total throughput in bytes/sec
    pub fn global_speed(&self) -> f64 {
        *self.inner.speed.borrow()
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings.borrow().clone()
    }

    /// Stop the sampler and the actor. Running transfers are aborted and the
    /// temp files of unfinished jobs removed before this returns.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        if self.send(Command::Shutdown).await.is_err() {
            debug!("Engine already stopped");
        }
        // The actor drops its command receiver once it has cleaned up
        self.inner.commands.closed().await;
    }
}
