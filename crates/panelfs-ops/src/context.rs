//! Handle passed to every executor.

use std::io;
use std::path::Path;
use std::sync::Arc;

use panelfs_core::{TaskId, TaskRegistry};
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::progress::ProgressTracker;

/// The running task's id, registry handle and cancellation token.
///
/// Cheap to clone; blocking executors take a clone onto the blocking pool.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    registry: Arc<TaskRegistry>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(id: TaskId, registry: Arc<TaskRegistry>, cancel: CancellationToken) -> Self {
        Self {
            id,
            registry,
            cancel,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Write progress and message to the record.
    pub fn report(&self, progress: u8, message: impl Into<String>) {
        self.registry.update_progress(self.id, progress, message);
    }

    /// Write the tracker's percentage if it moved since the last publish.
    pub fn publish(&self, tracker: &mut ProgressTracker, message: impl FnOnce() -> String) {
        if let Some(pct) = tracker.take_report() {
            self.report(pct, message());
        }
    }

    /// Map an I/O error at `path`, preferring cancellation when it was
    /// requested (reads abort with an error once the token fires).
    pub fn io_error(&self, path: &Path, err: &io::Error) -> ExecError {
        if self.is_cancelled() {
            ExecError::Cancelled
        } else {
            ExecError::io(path, err)
        }
    }
}
