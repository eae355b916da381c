//! The engine actor
//!
//! One task owns every job record. Commands from [`Engine`](super::Engine)
//! handles and events from transfer tasks arrive on two channels and are
//! applied strictly one at a time; after each batch the job table is published
//! to observers as an immutable snapshot.

use chrono::Utc;
use reqwest::{Client, header::HeaderMap};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;

use super::assemble::{
    assemble_chunks, assembling_path, chunk_path, move_into_place, part_path, remove_if_exists,
};
use super::error::{EngineError, Result, TransferError};
use super::models::{Download, DownloadStatus, JobId, JobTable};
use super::plan::{Strategy, plan_chunks};
use super::probe::{ProbeOutcome, ProbeSource};
use super::settings::{EngineOptions, EngineSettings};
use super::transfer::{
    self, ContinuationToken, TransferEvent, TransferHandle, TransferRange, TransferSpec,
    TransferTag,
};

/// Queued transfer events applied before the table is republished
const EVENT_BATCH: usize = 256;
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// A submission that passed URL validation but hasn't been probed yet
#[derive(Debug)]
pub(crate) struct NewJob {
    pub download: Download,
    pub headers: HeaderMap,
    /// The caller named the file; the probe must not rename it
    pub filename_fixed: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    Add(NewJob),
    Probed {
        id: JobId,
        outcome: ProbeOutcome,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// What has to happen to the temp files once every byte is on disk
enum Assembly {
    Move(PathBuf),
    Chunks {
        parts: Vec<PathBuf>,
        staging: PathBuf,
    },
}

/// Engine-private state kept next to each public [`Download`]
#[derive(Debug)]
struct JobRecord {
    download: Download,
    /// Cookie and extra headers sent with every request of the job
    headers: HeaderMap,
    filename_fixed: bool,
    /// Decided once the probe answered
    strategy: Option<Strategy>,
    continuation: Option<ContinuationToken>,
    transfers: Vec<TransferHandle>,
    /// Single-stream resume waiting for the aborted transfer to report back
    resume_pending: bool,
    assembling: bool,
    started: bool,
}

impl JobRecord {
    fn new(job: NewJob) -> Self {
        Self {
            download: job.download,
            headers: job.headers,
            filename_fixed: job.filename_fixed,
            strategy: None,
            continuation: None,
            transfers: Vec::new(),
            resume_pending: false,
            assembling: false,
            started: false,
        }
    }

    fn has_transfer(&self, tag: TransferTag) -> bool {
        self.transfers.iter().any(|handle| handle.tag == tag)
    }

    fn drop_transfer(&mut self, tag: TransferTag) {
        self.transfers.retain(|handle| handle.tag != tag);
    }

    fn abort_all(&mut self) {
        for handle in self.transfers.drain(..) {
            handle.abort();
        }
    }

    fn clear_side_channel(&mut self) {
        self.abort_all();
        self.headers.clear();
        self.continuation = None;
        self.resume_pending = false;
        self.assembling = false;
    }

    fn temp_files(&self, temp_dir: &Path) -> Vec<PathBuf> {
        let id = self.download.id;
        let mut files = vec![part_path(temp_dir, id), assembling_path(temp_dir, id)];
        files.extend(
            self.download
                .chunks
                .iter()
                .map(|chunk| chunk_path(temp_dir, id, chunk.id)),
        );
        if let Some(token) = &self.continuation {
            files.push(token.partial.clone());
        }
        files
    }

    fn spec(&self, chunk: Option<usize>, path: PathBuf, range: TransferRange) -> TransferSpec {
        TransferSpec {
            tag: TransferTag {
                job: self.download.id,
                chunk,
            },
            url: self.download.source_url.clone(),
            headers: self.headers.clone(),
            path,
            range,
        }
    }

    /// Transfers that have to be spawned for the job to make progress.
    ///
    /// Consumes the continuation token of a single-stream job.
    fn pending_specs(&mut self, temp_dir: &Path) -> Vec<TransferSpec> {
        let id = self.download.id;
        match self.strategy {
            Some(Strategy::Single) => {
                if !self.transfers.is_empty() {
                    return Vec::new();
                }
                let (path, range) = match self.continuation.take() {
                    Some(token) => (
                        token.partial,
                        TransferRange::Open {
                            offset: token.offset,
                            validator: token.validator,
                        },
                    ),
                    None => (
                        part_path(temp_dir, id),
                        TransferRange::Open {
                            offset: self.download.downloaded_bytes,
                            validator: None,
                        },
                    ),
                };
                vec![self.spec(None, path, range)]
            }
            Some(Strategy::Chunked { .. }) => self
                .download
                .chunks
                .iter()
                .filter(|chunk| !chunk.is_complete)
                .filter(|chunk| {
                    !self.has_transfer(TransferTag {
                        job: id,
                        chunk: Some(chunk.id),
                    })
                })
                .map(|chunk| {
                    trace!(
                        id = %id,
                        chunk = chunk.id,
                        offset = chunk.resume_offset(),
                        "Chunk transfer pending"
                    );
                    self.spec(
                        Some(chunk.id),
                        chunk_path(temp_dir, id, chunk.id),
                        TransferRange::Span {
                            start: chunk.start_byte,
                            end: chunk.end_byte,
                            done: chunk.downloaded_bytes,
                        },
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

fn host_key(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

async fn remove_temp_files(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = remove_if_exists(file).await {
            warn!(path = ?file, error = %e, "Failed to remove temp file");
        }
    }
}

pub(crate) struct Core {
    client: Client,
    options: EngineOptions,
    settings: watch::Receiver<EngineSettings>,
    /// Connection permits shared by every job on the same host
    hosts: HashMap<String, Arc<Semaphore>>,
    jobs: BTreeMap<JobId, JobRecord>,
    events: mpsc::Sender<TransferEvent>,
    table: watch::Sender<JobTable>,
}

impl Core {
    pub(crate) fn new(
        client: Client,
        options: EngineOptions,
        settings: watch::Receiver<EngineSettings>,
    ) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (table, _) = watch::channel(JobTable::default());
        let core = Self {
            client,
            options,
            settings,
            hosts: HashMap::new(),
            jobs: BTreeMap::new(),
            events,
            table,
        };
        (core, events_rx)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobTable> {
        self.table.subscribe()
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<TransferEvent>,
    ) {
        debug!("Engine actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                    for _ in 0..EVENT_BATCH {
                        match events.try_recv() {
                            Ok(event) => self.handle_event(event).await,
                            Err(_) => break,
                        }
                    }
                }
            }
            self.publish();
        }
        self.shutdown().await;
        self.publish();
    }

    fn publish(&self) {
        let table: BTreeMap<JobId, Download> = self
            .jobs
            .iter()
            .map(|(id, record)| (*id, record.download.clone()))
            .collect();
        self.table.send_replace(Arc::new(table));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(job) => self.add(job),
            Command::Probed { id, outcome, reply } => {
                let _ = reply.send(self.probed(id, outcome));
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.pause(id));
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.resume(id));
            }
            Command::Cancel { id, reply } => {
                let changed = self.cancel(id).await;
                let _ = reply.send(changed);
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                tag,
                cumulative,
                expected_total,
            } => self.progress(tag, cumulative, expected_total),
            TransferEvent::Restarted { tag } => {
                if let Some(record) = self.live_record(tag.job) {
                    debug!(id = %tag.job, "Server ignored the resume range, progress reset");
                    record.download.downloaded_bytes = 0;
                    record.continuation = None;
                }
            }
            TransferEvent::Completed { tag, bytes } => self.transfer_completed(tag, bytes),
            TransferEvent::Failed {
                tag,
                error,
                continuation,
            } => self.transfer_failed(tag, error, continuation).await,
            TransferEvent::Assembled { job, result } => self.assembled(job, result).await,
        }
    }

    /// Record an event may still change; finished and unknown jobs drop it
    fn live_record(&mut self, id: JobId) -> Option<&mut JobRecord> {
        match self.jobs.get_mut(&id) {
            Some(record) if !record.download.status.is_terminal() => Some(record),
            Some(_) => {
                trace!(id = %id, "Ignoring event for finished download");
                None
            }
            None => {
                debug!(id = %id, "Dropping event for unknown download");
                None
            }
        }
    }

    fn add(&mut self, job: NewJob) {
        let id = job.download.id;
        info!(id = %id, url = %job.download.source_url, "Download queued");
        self.jobs.insert(id, JobRecord::new(job));
    }

    fn probed(&mut self, id: JobId, outcome: ProbeOutcome) -> Result<()> {
        let settings = self.settings.borrow().clone();
        let record = self.jobs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        let metadata = outcome.metadata;

        if outcome.source == ProbeSource::Fallback {
            warn!(
                id = %id,
                "{}",
                EngineError::MetadataUnavailable(format!(
                    "assuming {} bytes with range support",
                    metadata.filesize
                ))
            );
        }

        if !record.filename_fixed {
            record.download.destination_path = settings.download_dir.join(&metadata.filename);
            record.download.filename = metadata.filename;
        }
        record.download.filesize = metadata.filesize;

        let mut strategy = self.options.policy.choose(
            record.download.source_url.host_str().unwrap_or_default(),
            metadata.filesize,
            metadata.supports_ranges,
            settings.min_chunked_size,
            settings.max_connections,
        );
        if let Strategy::Chunked { connections } = strategy {
            record.download.chunks = plan_chunks(metadata.filesize, connections);
            if record.download.chunks.is_empty() {
                strategy = Strategy::Single;
            }
        }
        debug!(
            id = %id,
            strategy = ?strategy,
            filesize = metadata.filesize,
            chunks = record.download.chunks.len(),
            "Strategy chosen"
        );
        record.strategy = Some(strategy);

        if record.download.status == DownloadStatus::Paused {
            debug!(id = %id, "Paused before the probe finished, not starting");
            return Ok(());
        }
        self.start(id);
        Ok(())
    }

    /// Spawn whatever transfers the job is missing and mark it downloading
    fn start(&mut self, id: JobId) {
        let Some(record) = self.jobs.get_mut(&id) else {
            return;
        };
        let specs = record.pending_specs(&self.options.temp_dir);
        if !record.started {
            record.started = true;
            record.download.started_at = Utc::now();
        }
        record.download.status = DownloadStatus::Downloading;

        let limit = self.options.max_connections_per_host;
        let permits = self
            .hosts
            .entry(host_key(&record.download.source_url))
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();

        info!(id = %id, transfers = specs.len(), "Starting download");
        for spec in specs {
            let handle = transfer::spawn(
                self.client.clone(),
                spec,
                permits.clone(),
                self.events.clone(),
            );
            record.transfers.push(handle);
        }
    }

    fn pause(&mut self, id: JobId) -> bool {
        let Some(record) = self.jobs.get_mut(&id) else {
            return false;
        };
        match record.download.status {
            DownloadStatus::Queued => {}
            DownloadStatus::Downloading if !record.assembling => match record.strategy {
                Some(Strategy::Single) => record.transfers.iter().for_each(TransferHandle::abort),
                _ => record
                    .transfers
                    .iter()
                    .filter(|handle| !handle.is_suspended())
                    .for_each(TransferHandle::suspend),
            },
            DownloadStatus::Paused if record.resume_pending => {
                debug!(id = %id, "Pending resume withdrawn");
                record.resume_pending = false;
                return true;
            }
            _ => return false,
        }
        record.download.status = DownloadStatus::Paused;
        info!(id = %id, "Download paused");
        true
    }

    fn resume(&mut self, id: JobId) -> bool {
        let Some(record) = self.jobs.get_mut(&id) else {
            return false;
        };
        if record.download.status != DownloadStatus::Paused || record.resume_pending {
            return false;
        }

        let strategy = record.strategy;
        match strategy {
            // Still probing; the probe result will start it
            None => record.download.status = DownloadStatus::Queued,
            Some(Strategy::Single) if !record.transfers.is_empty() => {
                debug!(id = %id, "Resume deferred until the aborted transfer reports back");
                record.resume_pending = true;
                return true;
            }
            Some(Strategy::Single) => self.start(id),
            Some(Strategy::Chunked { .. }) => {
                record.transfers.iter().for_each(TransferHandle::unsuspend);
                self.start(id);
            }
        }
        info!(id = %id, "Download resumed");
        true
    }

    async fn cancel(&mut self, id: JobId) -> bool {
        let Some(mut record) = self.jobs.remove(&id) else {
            return false;
        };
        record.abort_all();
        remove_temp_files(&record.temp_files(&self.options.temp_dir)).await;
        info!(id = %id, "Download cancelled");
        true
    }

    fn progress(&mut self, tag: TransferTag, cumulative: u64, expected_total: Option<u64>) {
        let Some(record) = self.live_record(tag.job) else {
            return;
        };
        let download = &mut record.download;
        match tag.chunk {
            Some(index) => {
                let Some(chunk) = download.chunks.get_mut(index) else {
                    warn!(id = %tag.job, chunk = index, "Dropping progress for unknown chunk");
                    return;
                };
                chunk.record_progress(cumulative);
                download.sum_chunks();
            }
            None if download.is_chunked() => {
                warn!(id = %tag.job, "Dropping single-stream progress for a chunked download");
                return;
            }
            None => {
                download.downloaded_bytes = download.downloaded_bytes.max(cumulative);
                if let Some(total) = expected_total {
                    download.filesize = total;
                }
            }
        }
        download.refresh_speed(Utc::now());
        trace!(
            id = %tag.job,
            chunk = ?tag.chunk,
            downloaded = download.downloaded_bytes,
            "Progress"
        );
    }

    fn transfer_completed(&mut self, tag: TransferTag, bytes: u64) {
        let temp_dir = self.options.temp_dir.clone();
        let Some(record) = self.live_record(tag.job) else {
            return;
        };
        record.drop_transfer(tag);

        let assembly = match tag.chunk {
            Some(index) => {
                let Some(chunk) = record.download.chunks.get_mut(index) else {
                    warn!(id = %tag.job, chunk = index, "Completion for unknown chunk");
                    return;
                };
                chunk.record_progress(bytes);
                chunk.is_complete = true;
                record.download.sum_chunks();
                debug!(id = %tag.job, chunk = index, bytes, "Chunk complete");

                if !record.download.chunks.iter().all(|chunk| chunk.is_complete) {
                    return;
                }
                Assembly::Chunks {
                    parts: record
                        .download
                        .chunks
                        .iter()
                        .map(|chunk| chunk_path(&temp_dir, tag.job, chunk.id))
                        .collect(),
                    staging: assembling_path(&temp_dir, tag.job),
                }
            }
            None => {
                record.download.downloaded_bytes = bytes;
                Assembly::Move(part_path(&temp_dir, tag.job))
            }
        };

        record.assembling = true;
        record.resume_pending = false;
        let destination = record.download.destination_path.clone();
        self.spawn_assembly(tag.job, assembly, destination);
    }

    fn spawn_assembly(&self, job: JobId, assembly: Assembly, destination: PathBuf) {
        let events = self.events.clone();
        tokio::spawn(
            async move {
                let result = match assembly {
                    Assembly::Move(part) => move_into_place(&part, &destination).await,
                    Assembly::Chunks { parts, staging } => {
                        assemble_chunks(&parts, &staging, &destination).await
                    }
                };
                if events
                    .send(TransferEvent::Assembled { job, result })
                    .await
                    .is_err()
                {
                    trace!("Engine gone before assembly finished");
                }
            }
            .instrument(info_span!("assemble", id = %job)),
        );
    }

    async fn transfer_failed(
        &mut self,
        tag: TransferTag,
        error: TransferError,
        continuation: Option<ContinuationToken>,
    ) {
        let Some(record) = self.live_record(tag.job) else {
            return;
        };
        record.drop_transfer(tag);

        if error.is_cancellation() && record.download.status == DownloadStatus::Paused {
            debug!(id = %tag.job, chunk = ?tag.chunk, "{}", EngineError::ExpectedCancellation);
            if tag.chunk.is_none() {
                record.continuation = continuation;
                if record.resume_pending {
                    record.resume_pending = false;
                    self.start(tag.job);
                    info!(id = %tag.job, "Download resumed");
                }
            }
            return;
        }

        let message = if error.is_cancellation() {
            EngineError::TransferFailed("transfer cancelled while the download was active".into())
        } else {
            EngineError::TransferFailed(error.to_string())
        };
        self.fail(tag.job, message.to_string()).await;
    }

    async fn assembled(&mut self, job: JobId, result: io::Result<u64>) {
        let Some(record) = self.live_record(job) else {
            return;
        };
        match result {
            Ok(bytes) => {
                record.clear_side_channel();
                let download = &mut record.download;
                let now = Utc::now();
                download.status = DownloadStatus::Completed;
                download.completed_at = Some(now);
                download.filesize = bytes;
                download.downloaded_bytes = bytes;
                for chunk in &mut download.chunks {
                    chunk.downloaded_bytes = chunk.len();
                    chunk.is_complete = true;
                }
                download.refresh_speed(now);
                info!(
                    id = %job,
                    bytes,
                    path = ?download.destination_path,
                    "Download complete"
                );
            }
            Err(e) => self.fail(job, EngineError::ReassemblyFailed(e).to_string()).await,
        }
    }

    /// Mark a job failed, stop its siblings and drop its temp files
    async fn fail(&mut self, id: JobId, message: String) {
        let Some(record) = self.jobs.get_mut(&id) else {
            return;
        };
        error!(id = %id, error = %message, "Download failed");
        let files = record.temp_files(&self.options.temp_dir);
        record.clear_side_channel();
        record.download.status = DownloadStatus::Failed;
        record.download.error_message = Some(message);
        remove_temp_files(&files).await;
    }

    async fn shutdown(&mut self) {
        let mut files = Vec::new();
        for record in self.jobs.values_mut() {
            record.abort_all();
            if !record.download.status.is_terminal() {
                files.extend(record.temp_files(&self.options.temp_dir));
            }
        }
        remove_temp_files(&files).await;
        info!(jobs = self.jobs.len(), "Engine stopped");
    }
}
