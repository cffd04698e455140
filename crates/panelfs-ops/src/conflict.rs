//! Conflict detection and resolution for uploads.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use panelfs_core::{validate_file_name, validate_path, TaskError};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a write into an occupied target is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConflictStrategy {
    /// Overwrite the existing file.
    #[strum(serialize = "replace", serialize = "overwrite", to_string = "replace")]
    Replace,
    /// Write under a free numeric-suffixed name (e.g. "file (1).txt").
    Rename,
}

/// One candidate name that already exists in the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConflict {
    pub file_name: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_modified: Option<DateTime<Utc>>,
}

/// Result of a conflict check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub conflicts: Vec<FileConflict>,
}

/// Report which of `names` already exist in `target`.
///
/// Best effort: the answer can be stale by the time the write happens, so
/// the chosen [`ConflictStrategy`] is applied again at write time.
pub async fn check_conflicts<S: AsRef<str>>(
    target: &Path,
    names: &[S],
) -> Result<ConflictReport, TaskError> {
    validate_path(target)?;
    for name in names {
        validate_file_name(name.as_ref())?;
    }

    let mut conflicts = Vec::new();
    for name in names {
        let name = name.as_ref();
        let Ok(metadata) = tokio::fs::metadata(target.join(name)).await else {
            continue;
        };
        conflicts.push(FileConflict {
            file_name: name.to_string(),
            exists: true,
            existing_size: metadata.is_file().then(|| metadata.len()),
            existing_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    Ok(ConflictReport {
        has_conflicts: !conflicts.is_empty(),
        conflicts,
    })
}

/// Generate an auto-renamed path to avoid conflicts.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc.
pub fn auto_rename_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path.extension().and_then(|e| e.to_str());

    let with_suffix = |suffix: String| match extension {
        Some(ext) => parent.join(format!("{stem}{suffix}.{ext}")),
        None => parent.join(format!("{stem}{suffix}")),
    };

    for i in 1..1000 {
        let candidate = with_suffix(format!(" ({i})"));
        if !candidate.exists() {
            return candidate;
        }
    }

    // Fallback: use timestamp
    with_suffix(format!("_{}", Utc::now().timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_rename_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, b"x").unwrap();
        std::fs::write(dir.path().join("test (1).txt"), b"x").unwrap();

        assert_eq!(auto_rename_path(&path), dir.path().join("test (2).txt"));
    }

    #[test]
    fn test_auto_rename_no_extension() {
        let path = PathBuf::from("/tmp/panelfs-missing/testfile");
        assert_eq!(
            auto_rename_path(&path),
            PathBuf::from("/tmp/panelfs-missing/testfile (1)")
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Replace".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Replace);
        assert_eq!(ConflictStrategy::Rename.to_string(), "rename");
        assert!("skip".parse::<ConflictStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_check_conflicts() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let report = check_conflicts(dir.path(), &["a.txt", "b.txt"]).await.unwrap();
        assert!(report.has_conflicts);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].file_name, "a.txt");
        assert_eq!(report.conflicts[0].existing_size, Some(5));
    }

    #[tokio::test]
    async fn test_check_conflicts_rejects_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(check_conflicts(dir.path(), &["../etc"]).await.is_err());
    }
}
