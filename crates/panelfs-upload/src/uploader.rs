//! Client coordinator for chunked uploads.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use panelfs_core::EngineConfig;
use panelfs_ops::{ConflictStrategy, ThroughputWindow};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, UploadError};
use crate::progress::{percentage, ProgressCallback, RetryInfo, UploadPhase, UploadProgress};
use crate::protocol::BeginUpload;
use crate::retry::RetryPolicy;
use crate::session::{ChunkSession, ChunkState, ChunkStatus};
use crate::transport::UploadTransport;

const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of one file in a batch.
#[derive(Debug)]
pub struct FileOutcome {
    pub source: PathBuf,
    pub result: Result<PathBuf>,
}

/// Uploads local files to a chunk store in fixed-size chunks.
///
/// Every file gets its own session; chunks of a file are sent with bounded
/// concurrency and retried with exponential backoff. Cancelling the token
/// stops new chunk requests; requests already in flight finish.
pub struct ChunkUploader {
    transport: Arc<dyn UploadTransport>,
    chunk_size: u64,
    max_concurrent: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl ChunkUploader {
    pub fn new(transport: Arc<dyn UploadTransport>) -> Self {
        Self {
            transport,
            chunk_size: 4 * 1024 * 1024,
            max_concurrent: 3,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn from_config(transport: Arc<dyn UploadTransport>, config: &EngineConfig) -> Self {
        Self::new(transport)
            .chunk_size(config.chunk_size)
            .max_concurrent(config.max_concurrent_chunks)
            .retry_policy(RetryPolicy::from_config(config))
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use `cancel` to stop the upload from outside.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Token that cancels this uploader.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload several files into `target_dir`.
    ///
    /// Conflicts are checked once for the whole batch. When any target name
    /// is taken and `strategy` is `None` the batch is aborted before anything
    /// is sent. Files succeed or fail independently of each other.
    pub async fn upload_batch(
        &self,
        files: &[PathBuf],
        target_dir: &Path,
        strategy: Option<ConflictStrategy>,
    ) -> Result<Vec<FileOutcome>> {
        let names = files
            .iter()
            .map(|f| file_name(f))
            .collect::<Result<Vec<_>>>()?;

        let report = self.transport.check_conflicts(target_dir, &names).await?;
        let strategy = match strategy {
            Some(strategy) => strategy,
            None if report.has_conflicts => {
                return Err(UploadError::ConflictUnresolved(
                    report.conflicts.into_iter().map(|c| c.file_name).collect(),
                ));
            }
            None => ConflictStrategy::Rename,
        };

        let mut outcomes = Vec::with_capacity(files.len());
        for source in files {
            let result = if self.cancel.is_cancelled() {
                Err(UploadError::Cancelled)
            } else {
                self.upload_file(source, target_dir, strategy).await
            };
            if let Err(err) = &result {
                warn!(source = %source.display(), error = %err, "upload failed");
            }
            outcomes.push(FileOutcome {
                source: source.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    /// Upload one file into `target_dir`, resolving a name clash with
    /// `strategy` when the chunks are assembled.
    ///
    /// Re-running an interrupted upload of the same unchanged file resumes
    /// its session and skips the chunks the server already holds.
    pub async fn upload_file(
        &self,
        source: &Path,
        target_dir: &Path,
        strategy: ConflictStrategy,
    ) -> Result<PathBuf> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|e| UploadError::io(source, e))?;
        if !metadata.is_file() {
            return Err(UploadError::Invalid(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        let name = file_name(source)?;
        let file_id = session_id(source, target_dir, &metadata);
        let session = ChunkSession::new(file_id, name, metadata.len(), self.chunk_size, strategy)?;

        let upload = Arc::new(FileUpload {
            transport: Arc::clone(&self.transport),
            source: source.to_path_buf(),
            retry: self.retry,
            cancel: self.cancel.child_token(),
            on_progress: self.on_progress.clone(),
            state: Mutex::new(UploadState {
                session,
                window: ThroughputWindow::default(),
                resumed: 0,
                sent: 0,
            }),
        });

        upload.emit(UploadPhase::Preparing, |_| {});
        match Arc::clone(&upload).run(target_dir, self.max_concurrent).await {
            Ok(path) => {
                upload.emit(UploadPhase::Completed, |_| {});
                Ok(path)
            }
            Err(err) => {
                if matches!(err, UploadError::Cancelled) {
                    let file_id = upload.file_id();
                    if let Err(cleanup) = self.transport.cancel(&file_id).await {
                        debug!(file_id = %file_id, error = %cleanup, "failed to discard cancelled session");
                    }
                }
                let message = err.to_string();
                upload.emit(UploadPhase::Error, |p| p.error = Some(message));
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ChunkUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkUploader")
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

struct UploadState {
    session: ChunkSession,
    /// Bytes sent in this run, for speed and ETA.
    window: ThroughputWindow,
    /// Bytes the server already held when the session was resumed.
    resumed: u64,
    sent: u64,
}

struct FileUpload {
    transport: Arc<dyn UploadTransport>,
    source: PathBuf,
    retry: RetryPolicy,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
    state: Mutex<UploadState>,
}

impl FileUpload {
    fn file_id(&self) -> String {
        self.state.lock().session.file_id.clone()
    }

    async fn run(self: Arc<Self>, target_dir: &Path, max_concurrent: usize) -> Result<PathBuf> {
        let request = {
            let state = self.state.lock();
            BeginUpload {
                file_id: state.session.file_id.clone(),
                file_name: state.session.file_name.clone(),
                total_size: state.session.total_size,
                chunk_size: state.session.chunk_size,
                target_dir: target_dir.to_path_buf(),
            }
        };
        let info = self.transport.begin(&request).await?;

        let pending = {
            let mut state = self.state.lock();
            if info.total_chunks != state.session.total_chunks {
                return Err(UploadError::Invalid(format!(
                    "server expects {} chunks, client has {}",
                    info.total_chunks, state.session.total_chunks
                )));
            }
            state.session.mark_received(&info.received);
            state.resumed = state.session.uploaded_bytes();
            state.session.pending_indices()
        };
        info!(
            file_id = %request.file_id,
            file_name = %request.file_name,
            total_chunks = info.total_chunks,
            resumed = info.received.len(),
            "uploading"
        );
        self.emit(UploadPhase::Uploading, |_| {});

        Arc::clone(&self).send_all(pending, max_concurrent).await?;
        self.merge(&request.file_id).await
    }

    /// Send `pending` chunks with at most `max_concurrent` in flight.
    async fn send_all(self: Arc<Self>, pending: Vec<u32>, max_concurrent: usize) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut tasks = JoinSet::new();
        let mut failure: Option<UploadError> = None;

        for index in pending {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = tasks.try_join_next() {
                self.settle(joined, &mut failure);
            }
            if failure.is_some() || self.cancel.is_cancelled() {
                break;
            }

            let upload = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                upload.send_chunk(index).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut failure);
        }

        match failure {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => Err(UploadError::Cancelled),
            None => Ok(()),
        }
    }

    /// Record a finished chunk task; the first real failure stops dispatch.
    fn settle(
        &self,
        joined: std::result::Result<Result<()>, tokio::task::JoinError>,
        failure: &mut Option<UploadError>,
    ) {
        let err = match joined {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(join) => UploadError::io(&self.source, std::io::Error::other(join)),
        };
        self.cancel.cancel();
        match failure {
            Some(UploadError::Cancelled) | None => *failure = Some(err),
            Some(_) => {}
        }
    }

    async fn send_chunk(&self, index: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let (offset, len) = self.state.lock().session.span(index);
        let data = self.read_chunk(offset, len).await?;
        let checksum = blake3::hash(&data).to_hex().to_string();
        let file_id = self.file_id();

        loop {
            self.update_chunk(index, |chunk| {
                chunk.status = ChunkStatus::Uploading;
                chunk.uploaded_bytes = 0;
            });
            self.emit(UploadPhase::Uploading, |_| {});

            match self
                .transport
                .send_chunk(&file_id, index, data.clone(), &checksum)
                .await
            {
                Ok(()) => {
                    {
                        let mut state = self.state.lock();
                        if let Some(chunk) = state.session.chunk_mut(index) {
                            chunk.status = ChunkStatus::Completed;
                            chunk.uploaded_bytes = chunk.size;
                            chunk.error = None;
                        }
                        state.sent += len;
                        let sent = state.sent;
                        state.window.record(sent);
                    }
                    debug!(file_id = %file_id, index, "chunk acknowledged");
                    self.emit(UploadPhase::Uploading, |_| {});
                    return Ok(());
                }
                Err(err) => {
                    let retries = self
                        .state
                        .lock()
                        .session
                        .chunk(index)
                        .map_or(0, |c| c.retry_count);

                    if !(err.is_retryable() && self.retry.allows(retries)) {
                        let message = err.to_string();
                        self.update_chunk(index, |chunk| {
                            chunk.status = ChunkStatus::Error;
                            chunk.error = Some(message);
                        });
                        return Err(if err.is_retryable() {
                            UploadError::RetriesExhausted {
                                index,
                                retries,
                                source: Box::new(err),
                            }
                        } else {
                            err
                        });
                    }

                    let retry_count = retries + 1;
                    let message = err.to_string();
                    self.update_chunk(index, |chunk| {
                        chunk.status = ChunkStatus::Retrying;
                        chunk.retry_count = retry_count;
                        chunk.uploaded_bytes = 0;
                        chunk.error = Some(message);
                    });
                    let delay = self.retry.delay(retry_count);
                    warn!(
                        file_id = %file_id,
                        index,
                        retry = retry_count,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk failed, retrying"
                    );
                    let max_retries = self.retry.max_retries;
                    self.emit(UploadPhase::Uploading, |p| {
                        p.retry = Some(RetryInfo {
                            index,
                            retry_count,
                            max_retries,
                        })
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn read_chunk(&self, offset: u64, len: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.source)
            .await
            .map_err(|e| UploadError::io(&self.source, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| UploadError::io(&self.source, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| UploadError::io(&self.source, e))?;
        Ok(Bytes::from(buf))
    }

    /// Ask the server to assemble the file, reporting its merge progress.
    async fn merge(&self, file_id: &str) -> Result<PathBuf> {
        self.emit(UploadPhase::Merging, |p| p.merge_progress = Some(0));

        let strategy = self.state.lock().session.conflict_strategy;
        let finalize = self.transport.finalize(file_id, strategy);
        tokio::pin!(finalize);
        let mut ticker = tokio::time::interval(MERGE_POLL_INTERVAL);
        ticker.tick().await;

        let path = loop {
            tokio::select! {
                result = &mut finalize => break result?,
                _ = ticker.tick() => {
                    if let Ok(status) = self.transport.status(file_id).await {
                        self.emit(UploadPhase::Merging, |p| {
                            p.merge_progress = Some(status.merge_progress)
                        });
                    }
                }
            }
        };

        self.emit(UploadPhase::Merging, |p| p.merge_progress = Some(100));
        Ok(path)
    }

    fn update_chunk(&self, index: u32, f: impl FnOnce(&mut ChunkState)) {
        if let Some(chunk) = self.state.lock().session.chunk_mut(index) {
            f(chunk);
        }
    }

    /// Deliver a snapshot to the callback. The state lock is held while the
    /// callback runs so events from concurrent chunks arrive in order.
    fn emit(&self, phase: UploadPhase, extra: impl FnOnce(&mut UploadProgress)) {
        let Some(callback) = &self.on_progress else {
            return;
        };
        let state = self.state.lock();
        let session = &state.session;
        let uploaded = session.uploaded_bytes();
        let remaining_run = session.total_size.saturating_sub(state.resumed);
        let mut progress = UploadProgress {
            file_id: session.file_id.clone(),
            file_name: session.file_name.clone(),
            phase,
            uploaded_bytes: uploaded,
            total_size: session.total_size,
            uploaded_chunks: session.completed_chunks(),
            total_chunks: session.total_chunks,
            percentage: percentage(uploaded, session.total_size, phase),
            speed: state.window.speed(),
            eta_secs: state.window.eta(remaining_run).map(|d| d.as_secs()),
            chunks: session.chunks.clone(),
            merge_progress: None,
            retry: None,
            error: None,
        };
        extra(&mut progress);
        callback(&progress);
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| UploadError::Invalid(format!("{} has no usable file name", path.display())))
}

/// Stable id for uploading `source` into `target_dir`; changes when the file
/// does.
fn session_id(source: &Path, target_dir: &Path, metadata: &std::fs::Metadata) -> String {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());

    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_os_str().as_encoded_bytes());
    hasher.update(&[0]);
    hasher.update(target_dir.as_os_str().as_encoded_bytes());
    hasher.update(&metadata.len().to_le_bytes());
    hasher.update(&modified.to_le_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_stable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::metadata(&path).unwrap();

        let id = session_id(&path, Path::new("/srv/game"), &meta);
        assert_eq!(id.len(), 32);
        assert_eq!(id, session_id(&path, Path::new("/srv/game"), &meta));
        assert_ne!(id, session_id(&path, Path::new("/srv/other"), &meta));
    }

    #[test]
    fn test_file_name_required() {
        assert!(file_name(Path::new("/")).is_err());
        assert_eq!(file_name(Path::new("/tmp/x.zip")).unwrap(), "x.zip");
    }
}
