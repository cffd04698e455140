//! Move executor: rename when possible, copy-then-delete otherwise.

use std::io;

use panelfs_core::TransferPayload;
use tokio::fs;
use tracing::debug;

use crate::context::TaskContext;
use crate::copy::{copy_source, ensure_dir};
use crate::error::ExecError;
use crate::progress::ProgressTracker;
use crate::walk::{plan_sources, SourcePlan};

/// Move every source into the destination directory.
///
/// A failure aborts the remaining entries; entries already moved stay at
/// the destination and the rest stay at their source.
pub(crate) async fn run_move(
    ctx: &TaskContext,
    payload: &TransferPayload,
    buffer_size: usize,
) -> Result<(), ExecError> {
    ctx.report(0, "Scanning sources");
    let plan = plan_sources(ctx, payload.sources.clone()).await?;
    ensure_dir(&payload.destination).await?;

    let mut progress = ProgressTracker::new(plan.total_files, plan.total_bytes);
    for (i, source) in plan.sources.iter().enumerate() {
        ctx.check()?;
        ctx.report(
            progress.percentage(),
            format!("Moving {}", source.name.display()),
        );

        if let Err(err) = move_source(ctx, source, payload, &mut progress, buffer_size).await {
            let (completed, pending) = plan.split_at(i);
            return Err(err.with_partial(&completed, &pending));
        }
    }

    Ok(())
}

async fn move_source(
    ctx: &TaskContext,
    source: &SourcePlan,
    payload: &TransferPayload,
    progress: &mut ProgressTracker,
    buffer_size: usize,
) -> Result<(), ExecError> {
    let target = payload.destination.join(&source.name);

    match fs::rename(&source.root, &target).await {
        Ok(()) => {
            progress.add_bytes(source.bytes);
            progress.files_completed += source.files;
            ctx.publish(progress, || format!("Moved {}", source.name.display()));
            debug!(task_id = %ctx.id(), path = %source.root.display(), "renamed");
            return Ok(());
        }
        Err(err) if needs_copy(&err) => {
            debug!(
                task_id = %ctx.id(),
                path = %source.root.display(),
                error = %err,
                "rename not possible, copying"
            );
        }
        Err(err) => return Err(ExecError::io(&source.root, &err)),
    }

    copy_source(ctx, source, &payload.destination, progress, buffer_size, "Moving").await?;
    ctx.check()?;

    let removed = if source.is_dir() {
        fs::remove_dir_all(&source.root).await
    } else {
        fs::remove_file(&source.root).await
    };
    removed.map_err(|e| ExecError::io(&source.root, &e))?;
    debug!(task_id = %ctx.id(), path = %source.root.display(), "moved");
    Ok(())
}

/// Rename failures that copy-then-delete can work around.
fn needs_copy(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        err.kind(),
        CrossesDevices | DirectoryNotEmpty | AlreadyExists | IsADirectory | NotADirectory
    )
}
