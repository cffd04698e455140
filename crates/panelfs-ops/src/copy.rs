//! Streaming copy executor.

use std::path::Path;

use panelfs_core::TransferPayload;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::context::TaskContext;
use crate::error::ExecError;
use crate::progress::ProgressTracker;
use crate::walk::{plan_sources, EntryKind, SourcePlan, WalkEntry};

/// Copy every source into the destination directory.
///
/// Entries are processed in order; the first failure aborts the rest and
/// leaves already copied entries in place.
pub(crate) async fn run_copy(
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
            format!("Copying {}", source.name.display()),
        );

        if let Err(err) =
            copy_source(ctx, source, &payload.destination, &mut progress, buffer_size, "Copying")
                .await
        {
            let (completed, pending) = plan.split_at(i);
            return Err(err.with_partial(&completed, &pending));
        }
        debug!(task_id = %ctx.id(), path = %source.root.display(), "copied");
    }

    Ok(())
}

/// Recreate `source` under `destination`, overwriting existing entries.
pub(crate) async fn copy_source(
    ctx: &TaskContext,
    source: &SourcePlan,
    destination: &Path,
    progress: &mut ProgressTracker,
    buffer_size: usize,
    verb: &str,
) -> Result<(), ExecError> {
    for entry in &source.entries {
        ctx.check()?;
        let target = destination.join(&entry.relative);

        match entry.kind {
            EntryKind::Dir => prepare_dir(&target).await?,
            EntryKind::File => {
                copy_file(ctx, entry, &target, progress, buffer_size, verb).await?;
                progress.complete_file();
            }
            EntryKind::Symlink => {
                copy_symlink(&entry.path, &target).await?;
                progress.complete_file();
            }
        }
        ctx.publish(progress, || format!("{verb} {}", entry.relative.display()));
    }
    Ok(())
}

async fn copy_file(
    ctx: &TaskContext,
    entry: &WalkEntry,
    target: &Path,
    progress: &mut ProgressTracker,
    buffer_size: usize,
    verb: &str,
) -> Result<(), ExecError> {
    if fs::symlink_metadata(target)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
    {
        fs::remove_dir_all(target)
            .await
            .map_err(|e| ExecError::io(target, &e))?;
    }

    let mut reader = File::open(&entry.path)
        .await
        .map_err(|e| ExecError::io(&entry.path, &e))?;
    let mut writer = File::create(target)
        .await
        .map_err(|e| ExecError::io(target, &e))?;
    let mut buf = vec![0u8; buffer_size];

    loop {
        if ctx.is_cancelled() {
            drop(writer);
            // Partial file; completed files stay.
            let _ = fs::remove_file(target).await;
            return Err(ExecError::Cancelled);
        }

        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ExecError::io(&entry.path, &e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| ExecError::io(target, &e))?;

        progress.add_bytes(n as u64);
        ctx.publish(progress, || format!("{verb} {}", entry.relative.display()));
    }
    writer.flush().await.map_err(|e| ExecError::io(target, &e))?;

    if let Ok(metadata) = fs::metadata(&entry.path).await {
        let _ = fs::set_permissions(target, metadata.permissions()).await;
    }
    Ok(())
}

/// Make `path` a directory, replacing a non-directory in the way.
async fn prepare_dir(path: &Path) -> Result<(), ExecError> {
    if let Ok(metadata) = fs::symlink_metadata(path).await {
        if metadata.is_dir() {
            return Ok(());
        }
        fs::remove_file(path)
            .await
            .map_err(|e| ExecError::io(path, &e))?;
    }
    fs::create_dir_all(path)
        .await
        .map_err(|e| ExecError::io(path, &e))
}

/// Create the destination directory if needed.
pub(crate) async fn ensure_dir(path: &Path) -> Result<(), ExecError> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| ExecError::io(path, &e))
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<(), ExecError> {
    let link = fs::read_link(from)
        .await
        .map_err(|e| ExecError::io(from, &e))?;
    if let Ok(metadata) = fs::symlink_metadata(to).await {
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(to).await
        } else {
            fs::remove_file(to).await
        };
        removed.map_err(|e| ExecError::io(to, &e))?;
    }
    fs::symlink(&link, to)
        .await
        .map_err(|e| ExecError::io(to, &e))
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, _to: &Path) -> Result<(), ExecError> {
    tracing::warn!(path = %from.display(), "symbolic links are not copied on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use panelfs_core::{TaskKind, TaskPayload, TaskRegistry};

    use super::*;

    #[tokio::test]
    async fn test_copy_tree_overwrites_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let world = dir.path().join("world");
        std::fs::create_dir_all(world.join("data")).unwrap();
        std::fs::write(world.join("level.dat"), vec![7u8; 10_000]).unwrap();
        std::fs::write(world.join("data/raids.dat"), b"raids").unwrap();

        let dest = dir.path().join("backup");
        std::fs::create_dir_all(dest.join("world")).unwrap();
        std::fs::write(dest.join("world/level.dat"), b"stale").unwrap();

        let payload = TransferPayload {
            sources: vec![world.clone()],
            destination: dest.clone(),
        };
        let registry = Arc::new(TaskRegistry::new());
        let id = registry
            .create(TaskKind::Copy, TaskPayload::Copy(payload.clone()))
            .unwrap();
        let token = registry.start(id).unwrap();
        let ctx = TaskContext::new(id, Arc::clone(&registry), token);

        run_copy(&ctx, &payload, 1024).await.unwrap();

        assert_eq!(std::fs::read(dest.join("world/level.dat")).unwrap(), vec![7u8; 10_000]);
        assert_eq!(std::fs::read(dest.join("world/data/raids.dat")).unwrap(), b"raids");
        assert!(world.join("level.dat").exists());
        assert_eq!(registry.get(id).unwrap().progress, 99);
    }

    #[tokio::test]
    async fn test_copy_cancelled_before_first_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let payload = TransferPayload {
            sources: vec![dir.path().join("a.txt")],
            destination: dir.path().join("out"),
        };
        let registry = Arc::new(TaskRegistry::new());
        let id = registry
            .create(TaskKind::Copy, TaskPayload::Copy(payload.clone()))
            .unwrap();
        let token = registry.start(id).unwrap();
        token.cancel();
        let ctx = TaskContext::new(id, registry, token);

        assert!(matches!(
            run_copy(&ctx, &payload, 1024).await,
            Err(ExecError::Cancelled)
        ));
        assert!(!dir.path().join("out/a.txt").exists());
    }
}
