//! Error taxonomy shared by the registry and the executors.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::task::{TaskId, TaskKind, TaskStatus};

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    /// Bad input, rejected before a task exists.
    Validation,
    /// Network interruption or temporary contention; safe to retry.
    TransientIo,
    /// The request cannot be carried out as asked (e.g. unsupported format).
    Structural,
    /// Permission denied, disk full, source vanished.
    Fatal,
}

impl ErrorCode {
    /// Classify an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        use io::ErrorKind::*;

        match err.kind() {
            Interrupted | TimedOut | WouldBlock | ConnectionReset | ConnectionAborted
            | BrokenPipe | UnexpectedEof | ResourceBusy => Self::TransientIo,
            Unsupported | InvalidData => Self::Structural,
            _ => Self::Fatal,
        }
    }

    /// Whether an automatic retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo)
    }
}

/// Error payload stored in a failed task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub code: ErrorCode,
    pub detail: String,
    /// The path that caused the failure, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Top-level entries fully processed before the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed: Vec<PathBuf>,
    /// Top-level entries left untouched or only partially processed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PathBuf>,
}

impl TaskFailure {
    /// Create a failure without path context.
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            path: None,
            completed: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Create a failure from an I/O error at `path`.
    pub fn io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self::new(ErrorCode::from_io(err), err.to_string()).at(path)
    }

    /// Attach the offending path.
    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the completed/pending split of a partially applied operation.
    pub fn with_partial(mut self, completed: Vec<PathBuf>, pending: Vec<PathBuf>) -> Self {
        self.completed = completed;
        self.pending = pending;
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.detail)?,
            None => write!(f, "{}", self.detail)?,
        }
        if !self.completed.is_empty() || !self.pending.is_empty() {
            let total = self.completed.len() + self.pending.len();
            write!(
                f,
                " ({} of {} entries completed, {} left in place)",
                self.completed.len(),
                total,
                self.pending.len()
            )?;
        }
        Ok(())
    }
}

/// Validation errors, rejected synchronously before a task is created.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Unknown task type name.
    #[error("Invalid task type: {0}")]
    InvalidKind(String),

    /// The payload belongs to a different task type.
    #[error("Payload for {found} does not match task type {expected}")]
    PayloadMismatch { expected: TaskKind, found: TaskKind },

    /// A path is malformed or not allowed.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },

    /// A required payload field is missing or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A referenced path does not exist.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Any other malformed payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl TaskError {
    /// Taxonomy code; always validation.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Validation
    }
}

/// Errors returned by registry queries and mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No task with this id.
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// The task must be terminal for this request.
    #[error("Task {id} is still {status}")]
    NotTerminal { id: TaskId, status: TaskStatus },

    /// The task cannot be started from its current state.
    #[error("Task {id} cannot start from {status}")]
    NotPending { id: TaskId, status: TaskStatus },

    /// The create request failed validation.
    #[error(transparent)]
    Invalid(#[from] TaskError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(ErrorCode::from_io(&denied), ErrorCode::Fatal);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ErrorCode::from_io(&reset), ErrorCode::TransientIo);
        assert!(ErrorCode::TransientIo.is_retryable());
    }

    #[test]
    fn test_failure_message_reports_partial_progress() {
        let failure = TaskFailure::new(ErrorCode::Fatal, "No space left on device")
            .at("/srv/b")
            .with_partial(vec![PathBuf::from("/srv/a")], vec![PathBuf::from("/srv/b")]);

        let message = failure.to_string();
        assert!(message.starts_with("/srv/b: No space left"));
        assert!(message.contains("1 of 2 entries completed"));
    }

    #[test]
    fn test_failure_serializes_camel_case() {
        let failure = TaskFailure::new(ErrorCode::TransientIo, "reset");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["code"], "transient_io");
        assert!(json.get("completed").is_none());
    }
}
