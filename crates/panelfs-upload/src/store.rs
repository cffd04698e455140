//! Server half of the chunked upload protocol.
//!
//! Each session keeps its chunks as `chunk_<index>` files under
//! `<chunk_dir>/<file_id>/`. Finalize assembles them in index order into a
//! hidden temporary file inside the target directory and renames it into
//! place, so a half-written target never becomes visible.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use panelfs_core::{validate_file_name, validate_path, EngineConfig};
use panelfs_ops::{auto_rename_path, ConflictStrategy};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, UploadError};
use crate::protocol::{BeginUpload, SessionInfo, UploadStatus, SKIP_CHECKSUM};
use crate::session::{chunk_count, chunk_span};

const CHUNK_PREFIX: &str = "chunk_";
const MAX_RENAME_ATTEMPTS: usize = 16;

#[derive(Debug)]
struct StoreSession {
    file_name: String,
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    target_dir: PathBuf,
    dir: PathBuf,
    received: BTreeSet<u32>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    merging: bool,
    merge_progress: u8,
}

impl StoreSession {
    fn expected_len(&self, index: u32) -> u64 {
        chunk_span(self.total_size, self.chunk_size, index).1
    }

    fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Upload sessions in flight on the server.
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
    sessions: DashMap<String, Arc<Mutex<StoreSession>>>,
}

impl ChunkStore {
    /// Create a store keeping chunks under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.chunk_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session, or resume one with the same id.
    ///
    /// Chunk files left on disk by an earlier session with this id are
    /// picked up when their length matches their slot.
    pub async fn begin(&self, request: &BeginUpload) -> Result<SessionInfo> {
        validate_file_name(&request.file_id)?;
        validate_file_name(&request.file_name)?;
        validate_path(&request.target_dir)?;
        let total_chunks = chunk_count(request.total_size, request.chunk_size)?;

        if let Some(session) = self.find(&request.file_id) {
            let mut session = session.lock();
            if session.total_size != request.total_size
                || session.chunk_size != request.chunk_size
                || session.file_name != request.file_name
                || session.target_dir != request.target_dir
            {
                return Err(UploadError::Invalid(format!(
                    "session {} was started with different parameters",
                    request.file_id
                )));
            }
            session.touch();
            debug!(file_id = %request.file_id, received = session.received.len(), "resuming upload");
            return Ok(SessionInfo {
                file_id: request.file_id.clone(),
                total_chunks: session.total_chunks,
                received: session.received.iter().copied().collect(),
            });
        }

        let dir = self.root.join(&request.file_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::io(&dir, e))?;

        let mut session = StoreSession {
            file_name: request.file_name.clone(),
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            total_chunks,
            target_dir: request.target_dir.clone(),
            dir: dir.clone(),
            received: BTreeSet::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
            merging: false,
            merge_progress: 0,
        };
        session.received = scan_chunks(&session).await;

        let info = SessionInfo {
            file_id: request.file_id.clone(),
            total_chunks: session.total_chunks,
            received: session.received.iter().copied().collect(),
        };
        info!(
            file_id = %request.file_id,
            file_name = %request.file_name,
            total_size = request.total_size,
            total_chunks = info.total_chunks,
            "upload session opened"
        );

        let session = Arc::new(Mutex::new(session));
        // A concurrent begin with the same id keeps whichever landed first.
        self.sessions
            .entry(request.file_id.clone())
            .or_insert(session);
        Ok(info)
    }

    /// Store chunk `index`, verifying its length and optional checksum.
    pub async fn put_chunk(
        &self,
        file_id: &str,
        index: u32,
        data: Bytes,
        checksum: Option<&str>,
    ) -> Result<()> {
        let session = self.get(file_id)?;
        let dir = {
            let mut session = session.lock();
            if session.merging {
                return Err(UploadError::Merging(file_id.to_string()));
            }
            if index >= session.total_chunks {
                return Err(UploadError::ChunkOutOfRange {
                    index,
                    total: session.total_chunks,
                });
            }
            let expected = session.expected_len(index);
            if data.len() as u64 != expected {
                return Err(UploadError::ChunkLength {
                    index,
                    expected,
                    actual: data.len() as u64,
                });
            }
            session.touch();
            session.dir.clone()
        };

        if let Some(expected) = checksum.filter(|c| !c.is_empty() && *c != SKIP_CHECKSUM) {
            let actual = blake3::hash(&data);
            if !actual.to_hex().eq_ignore_ascii_case(expected) {
                warn!(file_id, index, "chunk checksum mismatch");
                return Err(UploadError::ChecksumMismatch { index });
            }
        }

        let partial = dir.join(format!("{CHUNK_PREFIX}{index}.part"));
        let path = dir.join(format!("{CHUNK_PREFIX}{index}"));
        tokio::fs::write(&partial, &data)
            .await
            .map_err(|e| UploadError::io(&partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| UploadError::io(&path, e))?;

        let mut session = session.lock();
        session.received.insert(index);
        session.touch();
        debug!(file_id, index, received = session.received.len(), total = session.total_chunks, "chunk stored");
        Ok(())
    }

    /// Snapshot of a session, including merge progress.
    pub fn status(&self, file_id: &str) -> Result<UploadStatus> {
        let session = self.get(file_id)?;
        let session = session.lock();
        Ok(UploadStatus {
            file_id: file_id.to_string(),
            file_name: session.file_name.clone(),
            total_size: session.total_size,
            total_chunks: session.total_chunks,
            received: session.received.iter().copied().collect(),
            merging: session.merging,
            merge_progress: session.merge_progress,
            created_at: session.created_at,
        })
    }

    /// Assemble the chunks into the target file and close the session.
    ///
    /// Fails with [`UploadError::Incomplete`] without touching the target
    /// directory when any chunk is missing. The conflict strategy is applied
    /// against the directory as it is now, not as it was when the upload
    /// started.
    pub async fn finalize(&self, file_id: &str, strategy: ConflictStrategy) -> Result<PathBuf> {
        let session = self.get(file_id)?;
        let (target_dir, file_name, total_chunks, dir) = {
            let mut guard = session.lock();
            if guard.merging {
                return Err(UploadError::Merging(file_id.to_string()));
            }
            let missing = guard.missing();
            if !missing.is_empty() {
                return Err(UploadError::Incomplete { missing });
            }
            guard.merging = true;
            guard.merge_progress = 0;
            guard.touch();
            (
                guard.target_dir.clone(),
                guard.file_name.clone(),
                guard.total_chunks,
                guard.dir.clone(),
            )
        };

        info!(file_id, file_name = %file_name, total_chunks, "merging upload");
        let merging = Arc::clone(&session);
        let result = tokio::task::spawn_blocking(move || {
            assemble(&merging, &dir, total_chunks, &target_dir, &file_name, strategy)
        })
        .await
        .unwrap_or_else(|err| Err(UploadError::io(PathBuf::new(), io::Error::other(err))));

        match result {
            Ok(path) => {
                self.discard(file_id).await;
                info!(file_id, path = %path.display(), "upload complete");
                Ok(path)
            }
            Err(err) => {
                let mut guard = session.lock();
                guard.merging = false;
                guard.merge_progress = 0;
                warn!(file_id, error = %err, "merge failed");
                Err(err)
            }
        }
    }

    /// Drop a session and its chunk files.
    pub async fn cancel(&self, file_id: &str) -> Result<bool> {
        validate_file_name(file_id)?;
        let existed = self.sessions.contains_key(file_id);
        self.discard(file_id).await;
        if existed {
            info!(file_id, "upload cancelled");
        }
        Ok(existed)
    }

    /// Remove sessions idle for longer than `ttl`. Returns how many went.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value().lock();
                !session.merging && session.last_activity.elapsed() >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        for file_id in &expired {
            debug!(file_id = %file_id, "expiring idle upload");
            self.discard(file_id).await;
        }
        expired.len()
    }

    /// Periodically sweep idle sessions until `shutdown` fires.
    pub fn spawn_janitor(
        self: Arc<Self>,
        every: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired(ttl).await;
                        if removed > 0 {
                            info!(removed, "expired idle uploads");
                        }
                    }
                }
            }
        })
    }

    fn find(&self, file_id: &str) -> Option<Arc<Mutex<StoreSession>>> {
        self.sessions.get(file_id).map(|s| Arc::clone(s.value()))
    }

    fn get(&self, file_id: &str) -> Result<Arc<Mutex<StoreSession>>> {
        self.find(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))
    }

    async fn discard(&self, file_id: &str) {
        self.sessions.remove(file_id);
        let dir = self.root.join(file_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove chunk directory"),
        }
    }
}

/// Chunk files already on disk whose size matches their slot.
async fn scan_chunks(session: &StoreSession) -> BTreeSet<u32> {
    let mut found = BTreeSet::new();
    let Ok(mut entries) = tokio::fs::read_dir(&session.dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHUNK_PREFIX))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if index >= session.total_chunks {
            continue;
        }
        match entry.metadata().await {
            Ok(meta) if meta.len() == session.expected_len(index) => {
                found.insert(index);
            }
            _ => {}
        }
    }
    found
}

fn assemble(
    session: &Mutex<StoreSession>,
    dir: &Path,
    total_chunks: u32,
    target_dir: &Path,
    file_name: &str,
    strategy: ConflictStrategy,
) -> Result<PathBuf> {
    std::fs::create_dir_all(target_dir).map_err(|e| UploadError::io(target_dir, e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".panelfs-upload-")
        .tempfile_in(target_dir)
        .map_err(|e| UploadError::io(target_dir, e))?;
    let temp_path = temp.path().to_path_buf();

    {
        let mut out = BufWriter::new(temp.as_file_mut());
        for index in 0..total_chunks {
            let path = dir.join(format!("{CHUNK_PREFIX}{index}"));
            let mut chunk = File::open(&path).map_err(|e| UploadError::io(&path, e))?;
            io::copy(&mut chunk, &mut out).map_err(|e| UploadError::io(&path, e))?;
            session.lock().merge_progress = ((u64::from(index) + 1) * 100 / u64::from(total_chunks)) as u8;
        }
        out.flush().map_err(|e| UploadError::io(&temp_path, e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| UploadError::io(&temp_path, e))?;

    let target = persist_target(temp, &target_dir.join(file_name), strategy)?;
    session.lock().merge_progress = 100;
    Ok(target)
}

/// Rename `temp` onto `path`, or onto a free suffixed name under `Rename`.
///
/// The no-clobber rename is the existence check, so a file that appears at
/// a candidate name after the conflict check is never overwritten.
fn persist_target(temp: NamedTempFile, path: &Path, strategy: ConflictStrategy) -> Result<PathBuf> {
    if strategy == ConflictStrategy::Replace {
        temp.persist(path).map_err(|e| UploadError::io(path, e.error))?;
        return Ok(path.to_path_buf());
    }

    let mut temp = temp;
    let mut candidate = path.to_path_buf();
    for _ in 0..MAX_RENAME_ATTEMPTS {
        match temp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %candidate.display(), "target taken, trying next name");
                temp = err.file;
                candidate = auto_rename_path(path);
            }
            Err(err) => return Err(UploadError::io(&candidate, err.error)),
        }
    }
    Err(UploadError::io(
        &candidate,
        io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_request(target: &Path, size: u64, chunk: u64) -> BeginUpload {
        BeginUpload {
            file_id: "abc123".into(),
            file_name: "world.zip".into(),
            total_size: size,
            chunk_size: chunk,
            target_dir: target.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_put_chunk_checks_length_and_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        store.begin(&begin_request(dir.path(), 10, 4)).await.unwrap();

        let err = store
            .put_chunk("abc123", 0, Bytes::from_static(b"abc"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunkLength { expected: 4, actual: 3, .. }));

        let err = store
            .put_chunk("abc123", 3, Bytes::from_static(b"ab"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunkOutOfRange { total: 3, .. }));

        store
            .put_chunk("abc123", 2, Bytes::from_static(b"ij"), None)
            .await
            .unwrap();
        assert_eq!(store.status("abc123").unwrap().received, vec![2]);
    }

    #[tokio::test]
    async fn test_checksum_verified() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        store.begin(&begin_request(dir.path(), 4, 4)).await.unwrap();

        let data = Bytes::from_static(b"data");
        let good = blake3::hash(&data).to_hex().to_string();
        let err = store
            .put_chunk("abc123", 0, data.clone(), Some(&"0".repeat(64)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        store
            .put_chunk("abc123", 0, data.clone(), Some(&good.to_uppercase()))
            .await
            .unwrap();
        store
            .put_chunk("abc123", 0, data, Some(SKIP_CHECKSUM))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_begin_resumes_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks = dir.path().join("chunks");
        {
            let store = ChunkStore::new(&chunks);
            store.begin(&begin_request(dir.path(), 10, 4)).await.unwrap();
            store
                .put_chunk("abc123", 1, Bytes::from_static(b"efgh"), None)
                .await
                .unwrap();
        }
        std::fs::write(chunks.join("abc123/chunk_0"), b"short").unwrap();

        let store = ChunkStore::new(&chunks);
        let info = store.begin(&begin_request(dir.path(), 10, 4)).await.unwrap();
        assert_eq!(info.total_chunks, 3);
        assert_eq!(info.received, vec![1]);
    }

    #[tokio::test]
    async fn test_begin_rejects_changed_parameters() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        store.begin(&begin_request(dir.path(), 10, 4)).await.unwrap();
        assert!(store.begin(&begin_request(dir.path(), 12, 4)).await.is_err());

        let elsewhere = dir.path().join("elsewhere");
        let err = store.begin(&begin_request(&elsewhere, 10, 4)).await.unwrap_err();
        assert!(matches!(err, UploadError::Invalid(_)));
        assert_eq!(store.status("abc123").unwrap().total_chunks, 3);
    }

    #[tokio::test]
    async fn test_begin_rejects_chunk_count_overflow() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));

        let err = store.begin(&begin_request(dir.path(), 1 << 32, 1)).await.unwrap_err();
        assert!(matches!(err, UploadError::Invalid(_)));
        assert!(store.is_empty());
        assert!(matches!(
            store.finalize("abc123", ConflictStrategy::Rename).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    fn temp_with(dir: &Path, data: &[u8]) -> NamedTempFile {
        let mut temp = tempfile::Builder::new()
            .prefix(".panelfs-upload-")
            .tempfile_in(dir)
            .unwrap();
        temp.write_all(data).unwrap();
        temp
    }

    #[test]
    fn test_persist_never_clobbers_under_rename() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("world.zip");
        // Both names appear after any earlier conflict check.
        std::fs::write(&path, b"first").unwrap();
        std::fs::write(dir.path().join("world (1).zip"), b"second").unwrap();

        let landed = persist_target(temp_with(dir.path(), b"new"), &path, ConflictStrategy::Rename).unwrap();
        assert_eq!(landed, dir.path().join("world (2).zip"));
        assert_eq!(std::fs::read(&landed).unwrap(), b"new");
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join("world (1).zip")).unwrap(), b"second");
    }

    #[test]
    fn test_persist_overwrites_under_replace() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("world.zip");
        std::fs::write(&path, b"old").unwrap();

        let landed = persist_target(temp_with(dir.path(), b"new"), &path, ConflictStrategy::Replace).unwrap();
        assert_eq!(landed, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_finalize_renames_on_conflict() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("server");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("world.zip"), b"old").unwrap();

        let store = ChunkStore::new(dir.path().join("chunks"));
        store.begin(&begin_request(&target, 6, 4)).await.unwrap();
        store.put_chunk("abc123", 1, Bytes::from_static(b"ef"), None).await.unwrap();
        store.put_chunk("abc123", 0, Bytes::from_static(b"abcd"), None).await.unwrap();

        let path = store.finalize("abc123", ConflictStrategy::Rename).await.unwrap();
        assert_eq!(path, target.join("world (1).zip"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        assert_eq!(std::fs::read(target.join("world.zip")).unwrap(), b"old");
        assert!(store.is_empty());
        assert!(!dir.path().join("chunks/abc123").exists());
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_idle_sessions() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        store.begin(&begin_request(dir.path(), 10, 4)).await.unwrap();

        assert_eq!(store.sweep_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.sweep_expired(Duration::ZERO).await, 1);
        assert!(store.is_empty());
        assert!(!dir.path().join("chunks/abc123").exists());
    }
}
