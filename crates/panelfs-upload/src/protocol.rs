//! Request and response bodies shared by the store, the transports and the
//! HTTP API.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use panelfs_ops::ConflictStrategy;
use serde::{Deserialize, Serialize};

/// Header carrying the hex BLAKE3 digest of a chunk body.
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

/// Checksum value meaning "not computed".
pub const SKIP_CHECKSUM: &str = "skip";

/// Create or resume an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUpload {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub target_dir: PathBuf,
}

/// Answer to [`BeginUpload`]: the chunks the server already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub file_id: String,
    pub total_chunks: u32,
    pub received: Vec<u32>,
}

/// Server view of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub received: Vec<u32>,
    pub merging: bool,
    /// Assembly progress, 0-100.
    pub merge_progress: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub conflict_strategy: ConflictStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheckRequest {
    pub target_path: PathBuf,
    pub file_names: Vec<String>,
}
