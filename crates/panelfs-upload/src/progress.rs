//! Progress events emitted while uploading.

use std::sync::Arc;

use panelfs_ops::{format_eta, format_speed};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::session::ChunkState;

/// Stage of a single file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UploadPhase {
    Preparing,
    Uploading,
    Merging,
    Completed,
    Error,
}

/// The most recent retry, attached to the event that announces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub index: u32,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Snapshot of one file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub file_id: String,
    pub file_name: String,
    pub phase: UploadPhase,
    pub uploaded_bytes: u64,
    pub total_size: u64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    /// 0-100; only 100 once the phase is `completed`.
    pub percentage: u8,
    /// Bytes per second over the sample window.
    pub speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    pub chunks: Vec<ChunkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadProgress {
    /// One-line summary for terminals.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} [{}] {}% ({}/{} chunks) {}",
            self.file_name,
            self.phase,
            self.percentage,
            self.uploaded_chunks,
            self.total_chunks,
            format_speed(self.speed)
        );
        if let Some(secs) = self.eta_secs {
            line.push_str(&format!(", {} left", format_eta(std::time::Duration::from_secs(secs))));
        }
        if let Some(merge) = self.merge_progress {
            line.push_str(&format!(", merging {merge}%"));
        }
        if let Some(retry) = &self.retry {
            line.push_str(&format!(
                ", chunk {} retry {}/{}",
                retry.index, retry.retry_count, retry.max_retries
            ));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(": {error}"));
        }
        line
    }
}

/// Receives every progress event of an upload.
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

/// Byte percentage, held at 99 until the upload completes.
pub(crate) fn percentage(uploaded: u64, total: u64, phase: UploadPhase) -> u8 {
    if phase == UploadPhase::Completed {
        return 100;
    }
    if total == 0 {
        return 0;
    }
    ((uploaded as u128 * 100 / total as u128) as u8).min(99)
}
