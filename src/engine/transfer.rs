//! Range transfers
//!
//! Each transfer is one spawned task fetching either the whole entity
//! (single-stream) or the inclusive span of a chunk into its own temp file. Tasks
//! never touch the job table: they report [`TransferEvent`]s tagged with the job
//! and chunk they belong to, and the engine actor applies them.
//!
//! Two controls reach a running task through its [`TransferHandle`]:
//! - the cancel token aborts it (pause of a single stream, cancel, failure)
//! - the suspend gate freezes it between body frames while keeping the response,
//!   and with it the connection, open (pause of a chunked job)

use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, header, header::HeaderMap};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::{Semaphore, mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace};
use url::Url;

use super::assemble::remove_if_exists;
use super::error::TransferError;
use super::models::JobId;
use super::plan::range_header;
use super::probe::content_range_total;

/// Routes an event back to its job and, for chunked jobs, its chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTag {
    pub job: JobId,
    pub chunk: Option<usize>,
}

/// Resumable state captured when a single-stream transfer is aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    /// Bytes safely on disk in `partial`
    pub offset: u64,
    /// `ETag` or `Last-Modified` of the entity, sent back as `If-Range`
    pub validator: Option<String>,
    pub partial: PathBuf,
}

#[derive(Debug)]
pub enum TransferEvent {
    /// Cumulative bytes written for the tagged transfer
    Progress {
        tag: TransferTag,
        cumulative: u64,
        /// Entity size as announced by the server (single-stream only)
        expected_total: Option<u64>,
    },
    /// The server ignored a resume request and the file starts over
    Restarted { tag: TransferTag },
    Completed { tag: TransferTag, bytes: u64 },
    Failed {
        tag: TransferTag,
        error: TransferError,
        continuation: Option<ContinuationToken>,
    },
    /// Final move or chunk reassembly finished
    Assembled {
        job: JobId,
        result: io::Result<u64>,
    },
}

/// Which part of the entity a transfer fetches
#[derive(Debug, Clone)]
pub enum TransferRange {
    /// The whole entity, resuming after `offset` bytes already on disk
    Open {
        offset: u64,
        validator: Option<String>,
    },
    /// Inclusive `[start, end]`, of which `done` bytes are already on disk
    Span { start: u64, end: u64, done: u64 },
}

#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub tag: TransferTag,
    pub url: Url,
    pub headers: HeaderMap,
    pub path: PathBuf,
    pub range: TransferRange,
}

/// Controls for a running transfer task
#[derive(Debug)]
pub struct TransferHandle {
    pub tag: TransferTag,
    cancel: CancellationToken,
    gate: watch::Sender<bool>,
}

impl TransferHandle {
    /// Freeze the transfer in place; the response stays open
    pub fn suspend(&self) {
        self.gate.send_replace(true);
    }

    pub fn unsuspend(&self) {
        self.gate.send_replace(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.gate.borrow()
    }

    /// Abort the transfer; it reports a cancellation-class failure
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Error plus whatever the transfer could preserve for a later resume
#[derive(Debug)]
struct Stopped {
    error: TransferError,
    continuation: Option<ContinuationToken>,
}

impl From<TransferError> for Stopped {
    fn from(error: TransferError) -> Self {
        Self {
            error,
            continuation: None,
        }
    }
}

impl From<io::Error> for Stopped {
    fn from(error: io::Error) -> Self {
        TransferError::Io(error).into()
    }
}

impl From<reqwest::Error> for Stopped {
    fn from(error: reqwest::Error) -> Self {
        TransferError::Request(error).into()
    }
}

/// Start a transfer task. It waits for a connection permit of its host first.
pub fn spawn(
    client: Client,
    spec: TransferSpec,
    permits: Arc<Semaphore>,
    events: mpsc::Sender<TransferEvent>,
) -> TransferHandle {
    let cancel = CancellationToken::new();
    let (gate, gate_rx) = watch::channel(false);
    let tag = spec.tag;

    let span = info_span!("transfer", id = %tag.job, chunk = ?tag.chunk);
    let task_cancel = cancel.clone();
    tokio::spawn(
        async move {
            let result = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(Stopped::from(TransferError::Cancelled)),
                permit = permits.acquire_owned() => match permit {
                    Ok(_permit) => {
                        let mut transfer = Transfer {
                            client,
                            spec,
                            gate: gate_rx,
                            cancel: task_cancel,
                            events: events.clone(),
                        };
                        transfer.run().await
                    }
                    Err(_) => Err(Stopped::from(TransferError::Cancelled)),
                },
            };

            let event = match result {
                Ok(bytes) => {
                    debug!(bytes = bytes, "Transfer finished");
                    TransferEvent::Completed { tag, bytes }
                }
                Err(stopped) => {
                    debug!(error = %stopped.error, "Transfer stopped");
                    TransferEvent::Failed {
                        tag,
                        error: stopped.error,
                        continuation: stopped.continuation,
                    }
                }
            };
            if events.send(event).await.is_err() {
                trace!("Engine gone, dropping final transfer event");
            }
        }
        .instrument(span),
    );

    TransferHandle { tag, cancel, gate }
}

struct Transfer {
    client: Client,
    spec: TransferSpec,
    gate: watch::Receiver<bool>,
    cancel: CancellationToken,
    events: mpsc::Sender<TransferEvent>,
}

impl Transfer {
    async fn run(&mut self) -> Result<u64, Stopped> {
        // Aborted while the permit was being handed over: leave no file behind
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }
        match self.spec.range.clone() {
            TransferRange::Open { offset, validator } => self.run_open(offset, validator).await,
            TransferRange::Span { start, end, done } => self.run_span(start, end, done).await,
        }
    }

    /// Open the temp file, then look at the cancel token again.
    ///
    /// The engine aborts before it deletes temp files, so a file created after
    /// the abort would outlive the job. An empty one is removed; bytes kept
    /// from an earlier run stay resumable.
    async fn open_checked(&self, keep: u64) -> Result<(File, u64), Stopped> {
        let (file, kept) = open_part(&self.spec.path, keep).await?;
        if !self.cancel.is_cancelled() {
            return Ok((file, kept));
        }
        drop(file);

        if kept == 0 {
            remove_if_exists(&self.spec.path).await?;
            return Err(TransferError::Cancelled.into());
        }
        let continuation = match &self.spec.range {
            TransferRange::Open { validator, .. } => Some(ContinuationToken {
                offset: kept,
                validator: validator.clone(),
                partial: self.spec.path.clone(),
            }),
            TransferRange::Span { .. } => None,
        };
        Err(Stopped {
            error: TransferError::Cancelled,
            continuation,
        })
    }

    async fn report(&self, event: TransferEvent) -> Result<(), TransferError> {
        // A closed channel means the engine shut down: stop like a cancel
        self.events
            .send(event)
            .await
            .map_err(|_| TransferError::Cancelled)
    }

    async fn send(&self, range: Option<String>, validator: Option<&str>) -> Result<Response, TransferError> {
        let mut request = self
            .client
            .get(self.spec.url.clone())
            .headers(self.spec.headers.clone());
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        if let Some(validator) = validator {
            request = request.header(header::IF_RANGE, validator);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }

    /// Block while the suspend gate is closed. Returns whether it had to wait.
    async fn wait_while_suspended(&mut self, writer: &mut BufWriter<File>) -> Result<bool, TransferError> {
        let suspended = *self.gate.borrow_and_update();
        if !suspended {
            return Ok(false);
        }
        writer.flush().await?;
        trace!("Transfer suspended");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        return Err(TransferError::Cancelled);
                    }
                    let suspended = *self.gate.borrow_and_update();
                    if !suspended {
                        trace!("Transfer unsuspended");
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Chunk transfer: `206` only, exact length, reconnect once after a
    /// suspension if the held connection went stale.
    async fn run_span(&mut self, start: u64, end: u64, done: u64) -> Result<u64, Stopped> {
        let len = end - start + 1;
        let (file, kept) = self.open_checked(done.min(len)).await?;
        let mut writer = BufWriter::new(file);
        let mut done = kept;
        let tag = self.spec.tag;

        'request: while done < len {
            let mut stale_retry = self.wait_while_suspended(&mut writer).await?;

            let response = self
                .send(Some(range_header(start + done, Some(end))), None)
                .await?;
            let status = response.status();
            if status != StatusCode::PARTIAL_CONTENT {
                return Err(if status.is_success() {
                    TransferError::RangeIgnored(status).into()
                } else {
                    TransferError::Status(status).into()
                });
            }
            trace!(offset = start + done, "Range response");

            let mut stream = response.bytes_stream();
            loop {
                if self.wait_while_suspended(&mut writer).await? {
                    stale_retry = true;
                }

                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        writer.flush().await?;
                        return Err(TransferError::Cancelled.into());
                    }
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(bytes)) => {
                        let take = (bytes.len() as u64).min(len - done) as usize;
                        writer.write_all(&bytes[..take]).await?;
                        done += take as u64;
                        stale_retry = false;
                        self.report(TransferEvent::Progress {
                            tag,
                            cumulative: done,
                            expected_total: None,
                        })
                        .await?;
                        if done == len {
                            break 'request;
                        }
                    }
                    Some(Err(e)) if stale_retry => {
                        debug!(error = %e, offset = start + done, "Stale connection after suspend, reconnecting");
                        writer.flush().await?;
                        continue 'request;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(TransferError::ShortBody {
                            expected: len,
                            received: done,
                        }
                        .into());
                    }
                }
            }
        }

        writer.flush().await?;
        writer.into_inner().shutdown().await?;
        Ok(done)
    }

    /// Single-stream transfer, resuming after `offset` bytes when possible.
    async fn run_open(&mut self, offset: u64, validator: Option<String>) -> Result<u64, Stopped> {
        let (mut file, kept) = self.open_checked(offset).await?;
        let tag = self.spec.tag;

        let range = (kept > 0).then(|| range_header(kept, None));
        let response = self
            .send(range, validator.as_deref().filter(|_| kept > 0))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status(status).into());
        }

        let resumable = status == StatusCode::PARTIAL_CONTENT
            || response
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let validator = response
            .headers()
            .get(header::ETAG)
            .or_else(|| response.headers().get(header::LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut written = kept;
        if kept > 0 && status != StatusCode::PARTIAL_CONTENT {
            debug!(offset = kept, "Server ignored resume range, starting over");
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            written = 0;
            self.report(TransferEvent::Restarted { tag }).await?;
        }

        let expected_total = if status == StatusCode::PARTIAL_CONTENT {
            content_range_total(&response)
                .or_else(|| response.content_length().map(|len| len + written))
        } else {
            response.content_length()
        };

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    writer.flush().await?;
                    let continuation = (resumable && written > 0).then(|| ContinuationToken {
                        offset: written,
                        validator: validator.clone(),
                        partial: self.spec.path.clone(),
                    });
                    return Err(Stopped {
                        error: TransferError::Cancelled,
                        continuation,
                    });
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    writer.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                    self.report(TransferEvent::Progress {
                        tag,
                        cumulative: written,
                        expected_total,
                    })
                    .await?;
                }
                Some(Err(e)) => {
                    writer.flush().await?;
                    return Err(e.into());
                }
                None => break,
            }
        }

        if let Some(expected) = expected_total {
            if written < expected {
                return Err(TransferError::ShortBody {
                    expected,
                    received: written,
                }
                .into());
            }
        }

        writer.flush().await?;
        writer.into_inner().shutdown().await?;
        Ok(written)
    }
}

/// Open a temp file keeping at most `keep` existing bytes, positioned at its end.
///
/// `keep == 0` truncates any stale file of the same name.
async fn open_part(path: &Path, keep: u64) -> io::Result<(File, u64)> {
    if keep == 0 {
        return Ok((File::create(path).await?, 0));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    let kept = keep.min(file.metadata().await?.len());
    file.set_len(kept).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok((file, kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_server::{ServerOptions, serve};
    use std::time::Duration;
    use tempfile::tempdir;
    use ulid::Ulid;

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn client() -> Client {
        crate::engine::client::build_client("fetchd-test", Duration::from_secs(10)).unwrap()
    }

    async fn final_event(rx: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        loop {
            match rx.recv().await.expect("transfer dropped its channel") {
                TransferEvent::Progress { .. } | TransferEvent::Restarted { .. } => continue,
                other => return other,
            }
        }
    }

    fn transfer(path: PathBuf, range: TransferRange, cancel: CancellationToken) -> Transfer {
        let (_gate, gate) = watch::channel(false);
        let (events, _) = mpsc::channel(1);
        Transfer {
            client: client(),
            spec: TransferSpec {
                tag: TransferTag {
                    job: Ulid::new(),
                    chunk: None,
                },
                url: Url::parse("http://127.0.0.1:9/file.bin").unwrap(),
                headers: HeaderMap::new(),
                path,
                range,
            },
            gate,
            cancel,
            events,
        }
    }

    #[tokio::test]
    async fn test_abort_during_open_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c3");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transfer = transfer(
            path.clone(),
            TransferRange::Span {
                start: 0,
                end: 99,
                done: 0,
            },
            cancel,
        );

        let stopped = transfer.open_checked(0).await.unwrap_err();
        assert!(stopped.error.is_cancellation());
        assert!(stopped.continuation.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_abort_during_open_keeps_resumable_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.part");
        tokio::fs::write(&path, [1u8; 300]).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transfer = transfer(
            path.clone(),
            TransferRange::Open {
                offset: 300,
                validator: Some("\"v1\"".into()),
            },
            cancel,
        );

        let stopped = transfer.open_checked(300).await.unwrap_err();
        assert!(stopped.error.is_cancellation());
        assert_eq!(
            stopped.continuation,
            Some(ContinuationToken {
                offset: 300,
                validator: Some("\"v1\"".into()),
                partial: path.clone(),
            })
        );
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 300);
    }

    #[tokio::test]
    async fn test_span_writes_exact_range() {
        let data = body(10_000);
        let server = serve(data.clone(), ServerOptions::default()).await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1");
        let (tx, mut rx) = mpsc::channel(64);
        let tag = TransferTag {
            job: Ulid::new(),
            chunk: Some(1),
        };

        spawn(
            client(),
            TransferSpec {
                tag,
                url: server.url("/file.bin"),
                headers: HeaderMap::new(),
                path: path.clone(),
                range: TransferRange::Span {
                    start: 2_500,
                    end: 4_999,
                    done: 0,
                },
            },
            Arc::new(Semaphore::new(1)),
            tx,
        );

        match final_event(&mut rx).await {
            TransferEvent::Completed { tag: t, bytes } => {
                assert_eq!(t, tag);
                assert_eq!(bytes, 2_500);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, data[2_500..5_000]);
    }

    #[tokio::test]
    async fn test_span_resumes_after_existing_bytes() {
        let data = body(1_000);
        let server = serve(data.clone(), ServerOptions::default()).await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("c0");
        tokio::fs::write(&path, &data[..300]).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);

        spawn(
            client(),
            TransferSpec {
                tag: TransferTag {
                    job: Ulid::new(),
                    chunk: Some(0),
                },
                url: server.url("/file.bin"),
                headers: HeaderMap::new(),
                path: path.clone(),
                range: TransferRange::Span {
                    start: 0,
                    end: 999,
                    done: 300,
                },
            },
            Arc::new(Semaphore::new(1)),
            tx,
        );

        assert!(matches!(
            final_event(&mut rx).await,
            TransferEvent::Completed { bytes: 1_000, .. }
        ));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_span_rejects_ignored_range() {
        let server = serve(
            body(1_000),
            ServerOptions {
                ranges: false,
                ..Default::default()
            },
        )
        .await;
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);

        spawn(
            client(),
            TransferSpec {
                tag: TransferTag {
                    job: Ulid::new(),
                    chunk: Some(0),
                },
                url: server.url("/file.bin"),
                headers: HeaderMap::new(),
                path: dir.path().join("c0"),
                range: TransferRange::Span {
                    start: 0,
                    end: 499,
                    done: 0,
                },
            },
            Arc::new(Semaphore::new(1)),
            tx,
        );

        match final_event(&mut rx).await {
            TransferEvent::Failed { error, .. } => {
                assert!(matches!(error, TransferError::RangeIgnored(StatusCode::OK)));
                assert!(!error.is_cancellation());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_yields_continuation_token() {
        let server = serve(
            body(200_000),
            ServerOptions {
                frame: 1_000,
                frame_delay: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.part");
        let (tx, mut rx) = mpsc::channel(1024);

        let handle = spawn(
            client(),
            TransferSpec {
                tag: TransferTag {
                    job: Ulid::new(),
                    chunk: None,
                },
                url: server.url("/file.bin"),
                headers: HeaderMap::new(),
                path: path.clone(),
                range: TransferRange::Open {
                    offset: 0,
                    validator: None,
                },
            },
            Arc::new(Semaphore::new(1)),
            tx,
        );

        // Let some bytes arrive, then abort
        loop {
            if let Some(TransferEvent::Progress { cumulative, .. }) = rx.recv().await {
                if cumulative >= 5_000 {
                    break;
                }
            }
        }
        handle.abort();

        match final_event(&mut rx).await {
            TransferEvent::Failed {
                error,
                continuation: Some(token),
                ..
            } => {
                assert!(error.is_cancellation());
                assert!(token.offset >= 5_000);
                assert_eq!(token.partial, path);
                let on_disk = tokio::fs::metadata(&path).await.unwrap().len();
                assert_eq!(on_disk, token.offset);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspended_span_holds_position() {
        let data = body(100_000);
        let server = serve(
            data.clone(),
            ServerOptions {
                frame: 1_000,
                frame_delay: Duration::from_millis(2),
                ..Default::default()
            },
        )
        .await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("c0");
        let (tx, mut rx) = mpsc::channel(1024);

        let handle = spawn(
            client(),
            TransferSpec {
                tag: TransferTag {
                    job: Ulid::new(),
                    chunk: Some(0),
                },
                url: server.url("/file.bin"),
                headers: HeaderMap::new(),
                path: path.clone(),
                range: TransferRange::Span {
                    start: 0,
                    end: 99_999,
                    done: 0,
                },
            },
            Arc::new(Semaphore::new(1)),
            tx,
        );

        let mut at_suspend = 0;
        while let Some(TransferEvent::Progress { cumulative, .. }) = rx.recv().await {
            if cumulative >= 10_000 {
                at_suspend = cumulative;
                break;
            }
        }
        handle.suspend();
        assert!(handle.is_suspended());

        // Drain whatever was in flight, then confirm nothing more arrives
        let mut last = at_suspend;
        while let Ok(Some(TransferEvent::Progress { cumulative, .. })) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            last = cumulative;
        }
        assert!(last >= at_suspend);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );

        handle.unsuspend();
        assert!(matches!(
            final_event(&mut rx).await,
            TransferEvent::Completed { bytes: 100_000, .. }
        ));
        assert_eq!(server.gets(), 1, "suspension must not reconnect");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    }
}
