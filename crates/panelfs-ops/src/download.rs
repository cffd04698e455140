//! Download streamer.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use panelfs_core::{ErrorCode, TaskFailure, TaskId, TaskPayload, TaskRegistry, TaskStatus};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ExecError;
use crate::progress::ProgressTracker;

/// Body stream for a download task.
///
/// Opening the stream moves the task to running; reaching EOF completes it.
/// Dropping the stream before EOF (client disconnect) fails the task with
/// "download interrupted".
pub struct DownloadStream {
    inner: ReaderStream<File>,
    registry: Arc<TaskRegistry>,
    id: TaskId,
    cancel: CancellationToken,
    path: PathBuf,
    size: u64,
    progress: ProgressTracker,
    settled: bool,
}

impl DownloadStream {
    pub(crate) async fn open(
        registry: Arc<TaskRegistry>,
        id: TaskId,
        chunk_size: usize,
    ) -> Result<Self, ExecError> {
        let record = registry.get(id)?;
        let TaskPayload::Download(payload) = &record.payload else {
            return Err(ExecError::NotDownload(id));
        };
        if record.status != TaskStatus::Pending {
            return Err(ExecError::AlreadyStarted {
                id,
                status: record.status,
            });
        }

        let cancel = registry.start(id)?;
        let file = match File::open(&payload.path).await {
            Ok(file) => file,
            Err(err) => {
                let failure = TaskFailure::io(&payload.path, &err);
                registry.fail(id, failure.clone());
                return Err(ExecError::Failed(failure));
            }
        };
        info!(task_id = %id, path = %payload.path.display(), size = payload.size, "download started");

        Ok(Self {
            inner: ReaderStream::with_capacity(file, chunk_size),
            registry,
            id,
            cancel,
            path: payload.path.clone(),
            size: payload.size,
            progress: ProgressTracker::new(1, payload.size),
            settled: false,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name for the `Content-Disposition` header.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    }

    /// Size resolved when the task was created.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn settle_completed(&mut self) {
        if !self.settled {
            self.settled = true;
            self.registry.complete(self.id);
        }
    }

    fn settle_failed(&mut self, failure: TaskFailure) {
        if !self.settled {
            self.settled = true;
            self.registry.fail(self.id, failure);
        }
    }
}

impl Stream for DownloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.cancel.is_cancelled() {
            this.settled = true;
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.progress.add_bytes(chunk.len() as u64);
                if let Some(pct) = this.progress.take_report() {
                    this.registry
                        .update_progress(this.id, pct, format!("Sending {}", this.file_name()));
                }
                // The peer may stop polling once the advertised length is sent.
                if this.size > 0 && this.progress.bytes_processed >= this.size {
                    this.settle_completed();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let failure = TaskFailure::io(&this.path, &err);
                this.settle_failed(failure);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.settle_completed();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        let failure =
            TaskFailure::new(ErrorCode::TransientIo, "download interrupted").at(&self.path);
        self.settle_failed(failure);
    }
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("settled", &self.settled)
            .finish()
    }
}
