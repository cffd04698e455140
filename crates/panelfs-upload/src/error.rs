//! Upload error types.

use std::io;
use std::path::PathBuf;

use panelfs_core::{ErrorCode, TaskError};
use thiserror::Error;

/// Errors raised by the chunk store and the upload coordinator.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Bad session parameters, file id or target path.
    #[error("Invalid upload request: {0}")]
    Invalid(String),

    /// Path validation failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// No session with this id.
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    /// A finalize is already assembling this session.
    #[error("Upload session {0} is being merged")]
    Merging(String),

    /// Chunk index beyond the end of the file.
    #[error("Chunk {index} is out of range (session has {total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },

    /// Chunk body shorter or longer than its slot.
    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLength { index: u32, expected: u64, actual: u64 },

    /// Chunk body does not match the checksum sent with it.
    #[error("Checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    /// Finalize called before every chunk arrived.
    #[error("Upload incomplete, missing chunks: {missing:?}")]
    Incomplete { missing: Vec<u32> },

    /// Conflicts exist and no strategy was chosen.
    #[error("Target already contains: {}", .0.join(", "))]
    ConflictUnresolved(Vec<String>),

    /// Local filesystem error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Request never got a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("Server responded {status}: {message}")]
    Server {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },

    /// A chunk kept failing past the retry cap.
    #[error("Chunk {index} failed after {retries} retries: {source}")]
    RetriesExhausted {
        index: u32,
        retries: u32,
        #[source]
        source: Box<UploadError>,
    },

    /// The upload was cancelled.
    #[error("Upload cancelled")]
    Cancelled,
}

impl UploadError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_)
            | Self::Task(_)
            | Self::ChunkOutOfRange { .. }
            | Self::ConflictUnresolved(_) => ErrorCode::Validation,
            Self::SessionNotFound(_) | Self::Incomplete { .. } => ErrorCode::Structural,
            Self::Merging(_) | Self::ChunkLength { .. } | Self::ChecksumMismatch { .. } => {
                ErrorCode::TransientIo
            }
            Self::Io { source, .. } => ErrorCode::from_io(source),
            Self::Http(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
                    ErrorCode::TransientIo
                } else {
                    ErrorCode::Fatal
                }
            }
            Self::Server { status, code, .. } => match code {
                Some(code) => *code,
                None if *status >= 500 || *status == 408 || *status == 429 => {
                    ErrorCode::TransientIo
                }
                None => ErrorCode::Fatal,
            },
            Self::RetriesExhausted { source, .. } => source.code(),
            Self::Cancelled => ErrorCode::Fatal,
        }
    }

    /// Whether sending the same chunk again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
