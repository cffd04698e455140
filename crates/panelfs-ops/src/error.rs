//! Executor and dispatcher errors.

use std::io;
use std::path::{Path, PathBuf};

use panelfs_core::{ErrorCode, RegistryError, TaskFailure, TaskId, TaskStatus};
use thiserror::Error;

/// Outcome of an executor or engine call that did not succeed.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The task's cancellation token fired.
    #[error("Task was cancelled")]
    Cancelled,

    /// The task failed; the payload is written to the record.
    #[error("{0}")]
    Failed(TaskFailure),

    /// A registry lookup or transition was rejected.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Content was requested for a task that does not stream any.
    #[error("Task {0} is not a download")]
    NotDownload(TaskId),

    /// Content was requested for a download that already started.
    #[error("Download {id} is already {status}")]
    AlreadyStarted { id: TaskId, status: TaskStatus },
}

impl ExecError {
    /// Failure from an I/O error at `path`.
    pub fn io(path: &Path, err: &io::Error) -> Self {
        Self::Failed(TaskFailure::io(path, err))
    }

    /// Failure with an explicit code.
    pub fn failed(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Failed(TaskFailure::new(code, detail))
    }

    /// Attach the completed/pending split to a failure.
    pub fn with_partial(self, completed: &[PathBuf], pending: &[PathBuf]) -> Self {
        match self {
            Self::Failed(failure) => {
                Self::Failed(failure.with_partial(completed.to_vec(), pending.to_vec()))
            }
            other => other,
        }
    }

    /// Taxonomy code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed(failure) => failure.code,
            _ => ErrorCode::Validation,
        }
    }
}

impl From<TaskFailure> for ExecError {
    fn from(failure: TaskFailure) -> Self {
        Self::Failed(failure)
    }
}
