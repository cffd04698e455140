//! Task executors for panelfs.
//!
//! This crate provides the copy/move, compress/extract and download
//! executors, the conflict resolver and the progress/ETA calculator.
//! [`TaskEngine`] ties them to the task registry: it validates a request,
//! creates the record and runs the executor in the background.

mod archive;
mod conflict;
mod context;
mod copy;
mod download;
mod engine;
mod error;
mod move_op;
mod progress;
mod walk;

pub use conflict::{
    auto_rename_path, check_conflicts, ConflictReport, ConflictStrategy,
    FileConflict,
};
pub use context::TaskContext;
pub use download::DownloadStream;
pub use engine::TaskEngine;
pub use error::ExecError;
pub use progress::{
    format_eta, format_speed, ProgressTracker, ThroughputWindow, DEFAULT_WINDOW_SAMPLES,
};
