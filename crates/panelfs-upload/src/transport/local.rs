use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use panelfs_ops::{check_conflicts, ConflictReport, ConflictStrategy};

use super::UploadTransport;
use crate::error::Result;
use crate::protocol::{BeginUpload, SessionInfo, UploadStatus};
use crate::store::ChunkStore;

/// Talks to a [`ChunkStore`] in the same process.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: Arc<ChunkStore>,
}

impl LocalTransport {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn check_conflicts(&self, target_dir: &Path, names: &[String]) -> Result<ConflictReport> {
        Ok(check_conflicts(target_dir, names).await?)
    }

    async fn begin(&self, request: &BeginUpload) -> Result<SessionInfo> {
        self.store.begin(request).await
    }

    async fn send_chunk(&self, file_id: &str, index: u32, data: Bytes, checksum: &str) -> Result<()> {
        self.store.put_chunk(file_id, index, data, Some(checksum)).await
    }

    async fn finalize(&self, file_id: &str, strategy: ConflictStrategy) -> Result<PathBuf> {
        self.store.finalize(file_id, strategy).await
    }

    async fn status(&self, file_id: &str) -> Result<UploadStatus> {
        self.store.status(file_id)
    }

    async fn cancel(&self, file_id: &str) -> Result<()> {
        self.store.cancel(file_id).await.map(|_| ())
    }
}
