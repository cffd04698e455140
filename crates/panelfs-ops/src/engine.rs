//! Task dispatcher.

use std::path::Path;
use std::sync::Arc;

use panelfs_core::{
    EngineConfig, ErrorCode, RegistryError, TaskError, TaskFailure, TaskId, TaskKind,
    TaskPayload, TaskRecord, TaskRegistry,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{run_compress, run_extract};
use crate::context::TaskContext;
use crate::copy::run_copy;
use crate::download::DownloadStream;
use crate::error::ExecError;
use crate::move_op::run_move;

/// Validates requests, mints task records and runs their executors.
#[derive(Debug, Clone)]
pub struct TaskEngine {
    registry: Arc<TaskRegistry>,
    config: Arc<EngineConfig>,
}

impl TaskEngine {
    pub fn new(registry: Arc<TaskRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `payload`, create a pending record and start its executor.
    ///
    /// Only validation errors are returned; everything that goes wrong once
    /// the task exists is written to its record. Download tasks stay pending
    /// until their content is fetched.
    pub async fn submit(&self, kind: TaskKind, payload: TaskPayload) -> Result<TaskId, RegistryError> {
        if payload.kind() != kind {
            return Err(TaskError::PayloadMismatch {
                expected: kind,
                found: payload.kind(),
            }
            .into());
        }
        let payload = preflight(payload).await?;
        let id = self.registry.create(kind, payload.clone())?;

        if kind != TaskKind::Download {
            let registry = Arc::clone(&self.registry);
            let buffer_size = self.config.copy_buffer_size;
            tokio::spawn(execute(registry, id, payload, buffer_size));
        }
        Ok(id)
    }

    /// Request cancellation of a task.
    pub fn cancel(&self, id: TaskId) -> Result<bool, RegistryError> {
        self.registry.cancel(id)
    }

    /// Start streaming a pending download task.
    pub async fn open_download(&self, id: TaskId) -> Result<DownloadStream, ExecError> {
        DownloadStream::open(Arc::clone(&self.registry), id, self.config.copy_buffer_size).await
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, id: TaskId) -> Result<TaskRecord, RegistryError> {
        let mut events = self.registry.subscribe();
        loop {
            let record = self.registry.get(id)?;
            if record.is_terminal() {
                return Ok(record);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.id == id && event.is_terminal() => return Ok(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.registry.get(id),
                }
            }
        }
    }

    /// Periodically drop finished records older than the retention window.
    pub fn spawn_janitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let every = self.config.janitor_interval();
        let retention = self.config.finished_task_retention();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.prune_finished(retention);
                        if removed > 0 {
                            info!(removed, "pruned finished tasks");
                        }
                    }
                }
            }
        })
    }
}

async fn execute(registry: Arc<TaskRegistry>, id: TaskId, payload: TaskPayload, buffer_size: usize) {
    let cancel = match registry.start(id) {
        Ok(token) => token,
        Err(err) => {
            debug!(task_id = %id, error = %err, "task not started");
            return;
        }
    };
    let ctx = TaskContext::new(id, Arc::clone(&registry), cancel);

    let result = match &payload {
        TaskPayload::Copy(p) => run_copy(&ctx, p, buffer_size).await,
        TaskPayload::Move(p) => run_move(&ctx, p, buffer_size).await,
        TaskPayload::Compress(p) => run_compress(&ctx, p).await,
        TaskPayload::Extract(p) => run_extract(&ctx, p).await,
        TaskPayload::Download(_) => return,
    };

    match result {
        Ok(()) => {
            registry.complete(id);
        }
        Err(ExecError::Cancelled) => {
            let _ = registry.cancel(id);
        }
        Err(ExecError::Failed(failure)) => {
            registry.fail(id, failure);
        }
        Err(other) => {
            registry.fail(id, TaskFailure::new(ErrorCode::Fatal, other.to_string()));
        }
    }
}

/// Filesystem checks that must pass before a task is created.
async fn preflight(mut payload: TaskPayload) -> Result<TaskPayload, TaskError> {
    payload.validate()?;

    match &mut payload {
        TaskPayload::Copy(p) | TaskPayload::Move(p) => {
            for source in &p.sources {
                require_exists(source).await?;
                if p.destination.starts_with(source) {
                    return Err(TaskError::InvalidPath {
                        path: p.destination.clone(),
                        reason: "destination is inside a source",
                    });
                }
            }
            if let Ok(metadata) = tokio::fs::metadata(&p.destination).await {
                if !metadata.is_dir() {
                    return Err(TaskError::InvalidPath {
                        path: p.destination.clone(),
                        reason: "destination is not a directory",
                    });
                }
            }
        }
        TaskPayload::Compress(p) => {
            for source in &p.sources {
                require_exists(source).await?;
            }
        }
        TaskPayload::Extract(p) => {
            require_file(&p.archive).await?;
        }
        TaskPayload::Download(p) => {
            p.size = require_file(&p.path).await?;
        }
    }
    Ok(payload)
}

async fn require_exists(path: &Path) -> Result<(), TaskError> {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|_| ())
        .map_err(|_| TaskError::NotFound {
            path: path.to_path_buf(),
        })
}

async fn require_file(path: &Path) -> Result<u64, TaskError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| TaskError::NotFound {
            path: path.to_path_buf(),
        })?;
    if !metadata.is_file() {
        return Err(TaskError::InvalidPath {
            path: path.to_path_buf(),
            reason: "not a regular file",
        });
    }
    Ok(metadata.len())
}
