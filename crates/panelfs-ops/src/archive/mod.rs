//! Compress/extract executor.
//!
//! Archive codecs are blocking, so both directions run on the blocking pool
//! and poll the task's cancellation token between entries and inside every
//! read.

mod compress;
mod extract;

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use panelfs_core::{CompressPayload, ErrorCode, ExtractPayload};

use crate::context::TaskContext;
use crate::error::ExecError;
use crate::progress::ProgressTracker;

pub(crate) use compress::compress_blocking;
pub(crate) use extract::extract_blocking;

/// Build the archive described by `payload`.
pub(crate) async fn run_compress(
    ctx: &TaskContext,
    payload: &CompressPayload,
) -> Result<(), ExecError> {
    let ctx = ctx.clone();
    let payload = payload.clone();
    tokio::task::spawn_blocking(move || compress_blocking(&ctx, &payload))
        .await
        .map_err(|e| ExecError::failed(ErrorCode::Fatal, format!("Compress task failed: {e}")))?
}

/// Unpack the archive described by `payload`.
pub(crate) async fn run_extract(
    ctx: &TaskContext,
    payload: &ExtractPayload,
) -> Result<(), ExecError> {
    let ctx = ctx.clone();
    let payload = payload.clone();
    tokio::task::spawn_blocking(move || extract_blocking(&ctx, &payload))
        .await
        .map_err(|e| ExecError::failed(ErrorCode::Fatal, format!("Extract task failed: {e}")))?
}

/// Reader that counts consumed bytes into a tracker, publishes progress and
/// aborts once the task is cancelled.
pub(crate) struct ProgressReader<'a, R> {
    inner: R,
    ctx: &'a TaskContext,
    tracker: &'a mut ProgressTracker,
    label: String,
    range: (u8, u8),
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(
        inner: R,
        ctx: &'a TaskContext,
        tracker: &'a mut ProgressTracker,
        label: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            ctx,
            tracker,
            label: label.into(),
            range: (0, 100),
        }
    }

    /// Map the tracker's 0-100 onto `start..=end` of the task's progress.
    pub fn with_range(mut self, start: u8, end: u8) -> Self {
        self.range = (start, end.max(start));
        self
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.ctx.is_cancelled() {
            return Err(io::Error::other("task cancelled"));
        }

        let n = self.inner.read(buf)?;
        self.tracker.add_bytes(n as u64);
        if let Some(pct) = self.tracker.take_report() {
            let (start, end) = self.range;
            let scaled = start as u32 + pct as u32 * (end - start) as u32 / 100;
            self.ctx.report(scaled as u8, self.label.clone());
        }
        Ok(n)
    }
}

/// Relative path of an archive entry, or `None` when it is absolute, climbs
/// with `..` or is empty.
pub(crate) fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Archive entry name for a relative path, using `/` separators.
pub(crate) fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
