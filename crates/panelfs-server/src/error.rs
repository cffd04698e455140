//! API error type and its HTTP mapping.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use panelfs_core::{ErrorCode, RegistryError, TaskError};
use panelfs_ops::ExecError;
use panelfs_upload::UploadError;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Everything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request body, query or path parameter.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

fn registry_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::NotTerminal { .. } | RegistryError::NotPending { .. } => StatusCode::CONFLICT,
        RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
    }
}

impl ApiError {
    /// HTTP status and taxonomy code for this error.
    pub fn classify(&self) -> (StatusCode, ErrorCode) {
        match self {
            Self::BadRequest(_) | Self::Task(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
            Self::Registry(err) => (registry_status(err), ErrorCode::Validation),
            Self::Exec(err) => match err {
                ExecError::Registry(inner) => (registry_status(inner), ErrorCode::Validation),
                ExecError::NotDownload(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
                ExecError::AlreadyStarted { .. } | ExecError::Cancelled => {
                    (StatusCode::CONFLICT, ErrorCode::Validation)
                }
                ExecError::Failed(failure) => (StatusCode::INTERNAL_SERVER_ERROR, failure.code),
            },
            Self::Upload(err) => {
                let status = match err {
                    UploadError::Invalid(_)
                    | UploadError::Task(_)
                    | UploadError::ChunkOutOfRange { .. }
                    | UploadError::ChunkLength { .. }
                    | UploadError::ChecksumMismatch { .. }
                    | UploadError::ConflictUnresolved(_) => StatusCode::BAD_REQUEST,
                    UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    UploadError::Incomplete { .. } | UploadError::Merging(_) => {
                        StatusCode::CONFLICT
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(error = %self, %code, "request failed");
        } else {
            tracing::debug!(error = %self, %code, "request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelfs_core::TaskId;

    #[test]
    fn test_classification() {
        let (status, code) = ApiError::Registry(RegistryError::NotFound(TaskId::new())).classify();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, ErrorCode::Validation);

        let (status, code) = ApiError::Upload(UploadError::Incomplete { missing: vec![1] }).classify();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, ErrorCode::Structural);

        let (status, code) = ApiError::Upload(UploadError::ChecksumMismatch { index: 0 }).classify();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, ErrorCode::TransientIo);
    }
}
