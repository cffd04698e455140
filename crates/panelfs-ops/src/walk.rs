//! Up-front walk of task sources.

use std::fs;
use std::path::{Path, PathBuf};

use panelfs_core::{ErrorCode, TaskFailure};

use crate::context::TaskContext;
use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// One filesystem entry under a source.
#[derive(Debug, Clone)]
pub(crate) struct WalkEntry {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the source's parent, starting with the source name.
    pub relative: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
}

/// A top-level source and everything beneath it, parents before children.
#[derive(Debug, Clone)]
pub(crate) struct SourcePlan {
    pub root: PathBuf,
    pub name: PathBuf,
    pub entries: Vec<WalkEntry>,
    pub bytes: u64,
    pub files: usize,
}

impl SourcePlan {
    pub fn is_dir(&self) -> bool {
        self.entries
            .first()
            .is_some_and(|entry| entry.kind == EntryKind::Dir)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TransferPlan {
    pub sources: Vec<SourcePlan>,
    pub total_bytes: u64,
    pub total_files: usize,
}

impl TransferPlan {
    /// Roots before index `at`, and the rest.
    pub fn split_at(&self, at: usize) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let roots = self.sources.iter().map(|source| source.root.clone());
        let (done, left): (Vec<_>, Vec<_>) = roots.enumerate().partition(|(i, _)| *i < at);
        (
            done.into_iter().map(|(_, root)| root).collect(),
            left.into_iter().map(|(_, root)| root).collect(),
        )
    }
}

/// Walk `sources` on the blocking pool.
pub(crate) async fn plan_sources(
    ctx: &TaskContext,
    sources: Vec<PathBuf>,
) -> Result<TransferPlan, ExecError> {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || walk_sources(&ctx, &sources))
        .await
        .map_err(|e| ExecError::failed(ErrorCode::Fatal, format!("Walk task failed: {e}")))?
}

pub(crate) fn walk_sources(ctx: &TaskContext, sources: &[PathBuf]) -> Result<TransferPlan, ExecError> {
    let mut plan = TransferPlan::default();

    for root in sources {
        let name = root.file_name().map(PathBuf::from).ok_or_else(|| {
            ExecError::from(
                TaskFailure::new(ErrorCode::Structural, "source has no file name").at(root),
            )
        })?;

        let mut source = SourcePlan {
            root: root.clone(),
            name: name.clone(),
            entries: Vec::new(),
            bytes: 0,
            files: 0,
        };
        walk_entry(ctx, root, name, &mut source)?;

        plan.total_bytes += source.bytes;
        plan.total_files += source.files;
        plan.sources.push(source);
    }

    Ok(plan)
}

fn walk_entry(
    ctx: &TaskContext,
    path: &Path,
    relative: PathBuf,
    source: &mut SourcePlan,
) -> Result<(), ExecError> {
    ctx.check()?;
    let metadata = fs::symlink_metadata(path).map_err(|e| ExecError::io(path, &e))?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        source.entries.push(WalkEntry {
            path: path.to_path_buf(),
            relative: relative.clone(),
            kind: EntryKind::Dir,
            size: 0,
        });

        let mut children = fs::read_dir(path)
            .map_err(|e| ExecError::io(path, &e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExecError::io(path, &e))?;
        children.sort();

        for child in children {
            let Some(child_name) = child.file_name() else {
                continue;
            };
            let child_relative = relative.join(child_name);
            walk_entry(ctx, &child, child_relative, source)?;
        }
    } else {
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };
        let size = if kind == EntryKind::File { metadata.len() } else { 0 };
        source.entries.push(WalkEntry {
            path: path.to_path_buf(),
            relative,
            kind,
            size,
        });
        source.bytes += size;
        source.files += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use panelfs_core::{TaskId, TaskRegistry};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn context() -> TaskContext {
        TaskContext::new(TaskId::new(), Arc::new(TaskRegistry::new()), CancellationToken::new())
    }

    #[test]
    fn test_walk_orders_parents_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let world = dir.path().join("world");
        fs::create_dir_all(world.join("region")).unwrap();
        fs::write(world.join("level.dat"), b"12345").unwrap();
        fs::write(world.join("region/r.0.0.mca"), b"abc").unwrap();
        fs::write(dir.path().join("server.jar"), b"jar").unwrap();

        let plan = walk_sources(&context(), &[world.clone(), dir.path().join("server.jar")]).unwrap();

        assert_eq!(plan.total_bytes, 11);
        assert_eq!(plan.total_files, 3);
        let relatives: Vec<_> = plan.sources[0]
            .entries
            .iter()
            .map(|entry| entry.relative.clone())
            .collect();
        assert_eq!(
            relatives,
            vec![
                PathBuf::from("world"),
                PathBuf::from("world/level.dat"),
                PathBuf::from("world/region"),
                PathBuf::from("world/region/r.0.0.mca"),
            ]
        );
        assert!(plan.sources[0].is_dir());
        assert!(!plan.sources[1].is_dir());

        let (done, left) = plan.split_at(1);
        assert_eq!(done, vec![world]);
        assert_eq!(left, vec![dir.path().join("server.jar")]);
    }

    #[test]
    fn test_walk_missing_source_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = walk_sources(&context(), &[dir.path().join("gone")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Fatal);
    }
}
