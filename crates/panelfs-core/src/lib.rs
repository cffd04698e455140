//! Core types for panelfs.
//!
//! This crate provides the task record data model, the in-memory task
//! registry that owns every record, the error taxonomy shared by executors
//! and the engine configuration.

mod config;
mod error;
mod path;
mod registry;
mod task;

pub use config::{ConfigError, EngineConfig, EngineConfigBuilder};
pub use error::{ErrorCode, RegistryError, TaskError, TaskFailure};
pub use path::{validate_file_name, validate_path};
pub use registry::{TaskFilter, TaskRegistry};
pub use task::{
    ArchiveFormat, CompressPayload, DownloadPayload, ExtractPayload, TaskId, TaskKind,
    TaskPayload, TaskRecord, TaskStatus, TransferPayload, DEFAULT_COMPRESSION_LEVEL,
};

/// Capacity of the registry's broadcast channel for record snapshots.
pub const TASK_EVENT_CHANNEL_SIZE: usize = 256;
