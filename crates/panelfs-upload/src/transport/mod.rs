//! How the uploader reaches the chunk store.

mod http;
mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use panelfs_ops::{ConflictReport, ConflictStrategy};

use crate::error::Result;
use crate::protocol::{BeginUpload, SessionInfo, UploadStatus};

pub use http::HttpTransport;
pub use local::LocalTransport;

/// Operations the uploader needs from the server side.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Which of `names` already exist in `target_dir`.
    async fn check_conflicts(&self, target_dir: &Path, names: &[String]) -> Result<ConflictReport>;

    /// Create or resume a session.
    async fn begin(&self, request: &BeginUpload) -> Result<SessionInfo>;

    /// Send one chunk with its hex BLAKE3 checksum.
    async fn send_chunk(&self, file_id: &str, index: u32, data: Bytes, checksum: &str) -> Result<()>;

    /// Assemble the file; returns where it was written.
    async fn finalize(&self, file_id: &str, strategy: ConflictStrategy) -> Result<PathBuf>;

    async fn status(&self, file_id: &str) -> Result<UploadStatus>;

    async fn cancel(&self, file_id: &str) -> Result<()>;
}
