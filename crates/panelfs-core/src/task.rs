//! Task record types.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::{TaskError, TaskFailure};
use crate::path::validate_path;

/// Compression level used when a request does not specify one.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Unique identifier of a task, stable for the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The family of operation a task performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskKind {
    Copy,
    Move,
    Compress,
    Extract,
    Download,
}

impl TaskKind {
    /// Parse a task type name, rejecting unknown names as a validation error.
    pub fn parse(name: &str) -> Result<Self, TaskError> {
        name.parse()
            .map_err(|_| TaskError::InvalidKind(name.to_string()))
    }
}

/// Lifecycle state of a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// Archive formats understood by the compress/extract executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    #[strum(to_string = "zip")]
    Zip,
    #[serde(rename = "tar")]
    #[strum(to_string = "tar")]
    Tar,
    #[serde(rename = "tar.gz", alias = "tgz")]
    #[strum(to_string = "tar.gz", serialize = "tgz")]
    TarGz,
    #[serde(rename = "tar.xz", alias = "txz")]
    #[strum(to_string = "tar.xz", serialize = "txz")]
    TarXz,
    #[serde(rename = "tar.bz2", alias = "tbz2")]
    #[strum(to_string = "tar.bz2", serialize = "tbz2")]
    TarBz2,
}

impl ArchiveFormat {
    /// Detect the format from a file name's extension, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();

        // Longest suffixes first so "x.tar.gz" is not taken for plain tar.
        const SUFFIXES: [(&str, ArchiveFormat); 8] = [
            (".tar.gz", ArchiveFormat::TarGz),
            (".tar.xz", ArchiveFormat::TarXz),
            (".tar.bz2", ArchiveFormat::TarBz2),
            (".tgz", ArchiveFormat::TarGz),
            (".txz", ArchiveFormat::TarXz),
            (".tbz2", ArchiveFormat::TarBz2),
            (".tar", ArchiveFormat::Tar),
            (".zip", ArchiveFormat::Zip),
        ];

        SUFFIXES
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix) && name.len() > suffix.len())
            .map(|(_, format)| *format)
    }

    /// Canonical file extension, without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::TarBz2 => "tar.bz2",
        }
    }

    /// Whether the format honors a compression level.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::Tar)
    }
}

/// Sources and destination of a copy or move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
}

/// Parameters of an archive creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressPayload {
    pub sources: Vec<PathBuf>,
    pub archive: PathBuf,
    pub format: ArchiveFormat,
    #[serde(default = "default_level")]
    pub level: u32,
}

fn default_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

/// Parameters of an archive extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractPayload {
    pub archive: PathBuf,
    pub destination: PathBuf,
}

/// A file to be streamed back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPayload {
    pub path: PathBuf,
    /// File size, resolved when the task is created.
    #[serde(default)]
    pub size: u64,
}

/// Operation-specific parameters of a task.
///
/// Serialized adjacently tagged, so a create request of the shape
/// `{"type": "copy", "payload": {...}}` deserializes directly into this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum TaskPayload {
    Copy(TransferPayload),
    Move(TransferPayload),
    Compress(CompressPayload),
    Extract(ExtractPayload),
    Download(DownloadPayload),
}

impl TaskPayload {
    /// The task kind this payload belongs to.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Copy(_) => TaskKind::Copy,
            Self::Move(_) => TaskKind::Move,
            Self::Compress(_) => TaskKind::Compress,
            Self::Extract(_) => TaskKind::Extract,
            Self::Download(_) => TaskKind::Download,
        }
    }

    /// Check the payload's shape without touching the filesystem.
    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            Self::Copy(p) | Self::Move(p) => {
                validate_sources(&p.sources)?;
                validate_path(&p.destination)?;
                if let Some(source) = p.sources.iter().find(|s| p.destination.starts_with(s)) {
                    return Err(TaskError::InvalidPath {
                        path: source.clone(),
                        reason: "destination is inside the source",
                    });
                }
                Ok(())
            }
            Self::Compress(p) => {
                validate_sources(&p.sources)?;
                validate_path(&p.archive)?;
                if p.level > 9 {
                    return Err(TaskError::InvalidPayload(format!(
                        "compression level {} is out of range 0-9",
                        p.level
                    )));
                }
                if let Some(source) = p.sources.iter().find(|s| p.archive.starts_with(s)) {
                    return Err(TaskError::InvalidPath {
                        path: source.clone(),
                        reason: "archive would be written inside a source",
                    });
                }
                Ok(())
            }
            Self::Extract(p) => {
                validate_path(&p.archive)?;
                validate_path(&p.destination)
            }
            Self::Download(p) => validate_path(&p.path),
        }
    }
}

fn validate_sources(sources: &[PathBuf]) -> Result<(), TaskError> {
    if sources.is_empty() {
        return Err(TaskError::MissingField("sources"));
    }
    sources.iter().try_for_each(|s| validate_path(s))
}

/// Observable state of one unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(flatten)]
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new pending record.
    pub fn new(payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            message: "Waiting to start".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The task kind.
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// Check if the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, returning false if the transition is not allowed.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == TaskStatus::Completed {
            self.progress = 100;
        }
        self.touch();
        true
    }

    /// Record progress. Progress never decreases and stays below 100 until
    /// the task completes.
    pub(crate) fn set_progress(&mut self, progress: u8, message: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.progress = self.progress.max(progress.min(99));
        self.message = message;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_archive_format_detection() {
        let cases = [
            ("world.zip", Some(ArchiveFormat::Zip)),
            ("backup.TAR.GZ", Some(ArchiveFormat::TarGz)),
            ("mods.tgz", Some(ArchiveFormat::TarGz)),
            ("save.tar.xz", Some(ArchiveFormat::TarXz)),
            ("save.txz", Some(ArchiveFormat::TarXz)),
            ("old.tar.bz2", Some(ArchiveFormat::TarBz2)),
            ("plain.tar", Some(ArchiveFormat::Tar)),
            ("notes.rar", None),
            (".zip", None),
        ];

        for (name, expected) in cases {
            assert_eq!(ArchiveFormat::from_path(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn test_archive_format_names() {
        assert_eq!(ArchiveFormat::TarGz.to_string(), "tar.gz");
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!("ZIP".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
    }

    #[test]
    fn test_progress_is_capped_until_completion() {
        let mut record = TaskRecord::new(TaskPayload::Download(DownloadPayload {
            path: PathBuf::from("/srv/a.log"),
            size: 10,
        }));
        assert!(record.transition(TaskStatus::Running));
        assert!(record.set_progress(100, "almost".into()));
        assert_eq!(record.progress, 99);

        assert!(record.set_progress(40, "stale".into()));
        assert_eq!(record.progress, 99);

        assert!(record.transition(TaskStatus::Completed));
        assert_eq!(record.progress, 100);
        assert!(!record.set_progress(10, "late".into()));
    }

    #[test]
    fn test_copy_into_itself_rejected() {
        let payload = TaskPayload::Copy(TransferPayload {
            sources: vec![PathBuf::from("/srv/world")],
            destination: PathBuf::from("/srv/world/backup"),
        });
        assert!(matches!(
            payload.validate(),
            Err(TaskError::InvalidPath { .. })
        ));
    }
}
