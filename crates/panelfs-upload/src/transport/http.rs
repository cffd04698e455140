use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use panelfs_core::ErrorCode;
use panelfs_ops::{ConflictReport, ConflictStrategy};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::Deserialize;

use super::UploadTransport;
use crate::error::{Result, UploadError};
use crate::protocol::{
    BeginUpload, ConflictCheckRequest, FinalizeRequest, FinalizeResponse, SessionInfo,
    UploadStatus, CHUNK_CHECKSUM_HEADER,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<ErrorCode>,
    message: String,
}

/// Talks to a panelfs server over its HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: String,
}

impl HttpTransport {
    /// `base` is the server origin, e.g. `http://127.0.0.1:8089`.
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base, path)
    }

    /// Turn a non-2xx response into [`UploadError::Server`].
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (None, text),
        };
        Err(UploadError::Server {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn check_conflicts(&self, target_dir: &Path, names: &[String]) -> Result<ConflictReport> {
        let body = ConflictCheckRequest {
            target_path: target_dir.to_path_buf(),
            file_names: names.to_vec(),
        };
        let response = self
            .client
            .post(self.url("/uploads/conflicts"))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn begin(&self, request: &BeginUpload) -> Result<SessionInfo> {
        let response = self
            .client
            .post(self.url("/uploads"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_chunk(&self, file_id: &str, index: u32, data: Bytes, checksum: &str) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/uploads/{file_id}/chunks/{index}")))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_CHECKSUM_HEADER, checksum)
            .body(data)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn finalize(&self, file_id: &str, strategy: ConflictStrategy) -> Result<PathBuf> {
        let response = self
            .client
            .post(self.url(&format!("/uploads/{file_id}/finalize")))
            .json(&FinalizeRequest {
                conflict_strategy: strategy,
            })
            .send()
            .await?;
        let body: FinalizeResponse = Self::check(response).await?.json().await?;
        Ok(body.path)
    }

    async fn status(&self, file_id: &str) -> Result<UploadStatus> {
        let response = self
            .client
            .get(self.url(&format!("/uploads/{file_id}")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn cancel(&self, file_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/uploads/{file_id}")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
