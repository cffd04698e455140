//! Client-side upload session state.

use panelfs_ops::ConflictStrategy;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::{Result, UploadError};

/// Most chunks a single upload may be split into.
pub const MAX_CHUNKS: u32 = 1 << 20;

/// Number of chunks needed for `total_size` bytes.
///
/// Fails when `chunk_size` is zero or the split would exceed [`MAX_CHUNKS`].
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        return Err(UploadError::Invalid("chunk size must be positive".into()));
    }
    u32::try_from(total_size.div_ceil(chunk_size))
        .ok()
        .filter(|count| *count <= MAX_CHUNKS)
        .ok_or_else(|| {
            UploadError::Invalid(format!(
                "{total_size} bytes in {chunk_size} byte chunks exceeds {MAX_CHUNKS} chunks"
            ))
        })
}

/// Byte offset and length of chunk `index`.
pub fn chunk_span(total_size: u64, chunk_size: u64, index: u32) -> (u64, u64) {
    let offset = u64::from(index) * chunk_size;
    let len = total_size.saturating_sub(offset).min(chunk_size);
    (offset, len)
}

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Retrying,
}

/// Progress of one chunk, surfaced in every progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkState {
    pub index: u32,
    pub size: u64,
    pub status: ChunkStatus,
    pub uploaded_bytes: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkState {
    fn new(index: u32, size: u64) -> Self {
        Self {
            index,
            size,
            status: ChunkStatus::Pending,
            uploaded_bytes: 0,
            retry_count: 0,
            error: None,
        }
    }
}

/// One file being uploaded in chunks.
///
/// The conflict strategy is fixed when the session is created and never
/// changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSession {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub chunks: Vec<ChunkState>,
    pub conflict_strategy: ConflictStrategy,
}

impl ChunkSession {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        total_size: u64,
        chunk_size: u64,
        conflict_strategy: ConflictStrategy,
    ) -> Result<Self> {
        let total_chunks = chunk_count(total_size, chunk_size)?;
        let chunks = (0..total_chunks)
            .map(|index| ChunkState::new(index, chunk_span(total_size, chunk_size, index).1))
            .collect();

        Ok(Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            total_size,
            chunk_size,
            total_chunks,
            chunks,
            conflict_strategy,
        })
    }

    /// Byte offset and length of chunk `index`.
    pub fn span(&self, index: u32) -> (u64, u64) {
        chunk_span(self.total_size, self.chunk_size, index)
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkState> {
        self.chunks.get(index as usize)
    }

    pub fn chunk_mut(&mut self, index: u32) -> Option<&mut ChunkState> {
        self.chunks.get_mut(index as usize)
    }

    /// Mark chunks the server already holds as completed.
    pub fn mark_received(&mut self, indices: &[u32]) {
        for &index in indices {
            if let Some(chunk) = self.chunk_mut(index) {
                chunk.status = ChunkStatus::Completed;
                chunk.uploaded_bytes = chunk.size;
            }
        }
    }

    /// Indices still to be sent, in order.
    pub fn pending_indices(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .map(|c| c.index)
            .collect()
    }

    /// Sum of the sizes of completed chunks.
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.size)
            .sum()
    }

    pub fn completed_chunks(&self) -> u32 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }
}
