use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use panelfs_core::{
    ArchiveFormat, CompressPayload, DownloadPayload, EngineConfig, ErrorCode, ExtractPayload,
    RegistryError, TaskError, TaskKind, TaskPayload, TaskRegistry, TaskStatus, TransferPayload,
};
use panelfs_ops::TaskEngine;
use tempfile::TempDir;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn engine_with_buffer(buffer: usize) -> TaskEngine {
    let config = EngineConfig::builder()
        .copy_buffer_size(buffer)
        .build()
        .unwrap();
    TaskEngine::new(Arc::new(TaskRegistry::new()), config)
}

fn engine() -> TaskEngine {
    engine_with_buffer(64 * 1024)
}

/// Two folders with nested files and distinct contents.
fn populate(root: &Path) {
    fs::create_dir_all(root.join("world/region")).unwrap();
    fs::create_dir_all(root.join("plugins/config")).unwrap();
    fs::create_dir_all(root.join("world/empty")).unwrap();
    fs::write(root.join("world/level.dat"), vec![1u8; 20_000]).unwrap();
    fs::write(
        root.join("world/region/r.0.0.mca"),
        (0..50_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>(),
    )
    .unwrap();
    fs::write(root.join("plugins/config/settings.yml"), b"motd: hello\n").unwrap();
    fs::write(root.join("plugins/empty.jar"), b"").unwrap();
}

fn assert_same_tree(expected: &Path, actual: &Path) {
    for entry in fs::read_dir(expected).unwrap() {
        let entry = entry.unwrap();
        let other = actual.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            assert!(other.is_dir(), "{} missing", other.display());
            assert_same_tree(&entry.path(), &other);
        } else {
            assert_eq!(
                fs::read(entry.path()).unwrap(),
                fs::read(&other).unwrap(),
                "{} differs",
                other.display()
            );
        }
    }
}

#[tokio::test]
async fn test_copy_task_completes() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let engine = engine();

    let payload = TaskPayload::Copy(TransferPayload {
        sources: vec![dir.path().join("world"), dir.path().join("plugins")],
        destination: dir.path().join("backup"),
    });
    let id = engine.submit(TaskKind::Copy, payload).await.unwrap();
    let record = engine.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_same_tree(&dir.path().join("world"), &dir.path().join("backup/world"));
    assert_same_tree(&dir.path().join("plugins"), &dir.path().join("backup/plugins"));
    assert!(dir.path().join("world/level.dat").exists());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let engine = engine_with_buffer(1024);
    let mut events = engine.registry().subscribe();

    let payload = TaskPayload::Copy(TransferPayload {
        sources: vec![dir.path().join("world")],
        destination: dir.path().join("backup"),
    });
    let id = engine.submit(TaskKind::Copy, payload).await.unwrap();
    engine.wait(id).await.unwrap();

    let mut last = 0u8;
    let mut named_level = false;
    loop {
        let record = match events.try_recv() {
            Ok(record) => record,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        if record.id != id {
            continue;
        }
        assert!(record.progress >= last, "{} < {}", record.progress, last);
        assert_eq!(record.progress == 100, record.status == TaskStatus::Completed);
        if record.status == TaskStatus::Running && record.progress > 0 {
            assert!(record.message.starts_with("Copying "), "{}", record.message);
            named_level |= record.message.ends_with("level.dat");
        }
        last = record.progress;
    }
    assert_eq!(last, 100);
    assert!(named_level);
}

#[tokio::test]
async fn test_submit_rejects_missing_source() {
    let dir = TempDir::new().unwrap();
    let engine = engine();

    let payload = TaskPayload::Move(TransferPayload {
        sources: vec![dir.path().join("nope")],
        destination: dir.path().join("dest"),
    });
    let err = engine.submit(TaskKind::Move, payload).await.unwrap_err();
    assert!(matches!(err, RegistryError::Invalid(TaskError::NotFound { .. })));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn test_submit_rejects_kind_mismatch() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let engine = engine();

    let payload = TaskPayload::Copy(TransferPayload {
        sources: vec![dir.path().join("world")],
        destination: dir.path().join("dest"),
    });
    let err = engine.submit(TaskKind::Extract, payload).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Invalid(TaskError::PayloadMismatch { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_move_keeps_relocated_entries_and_rerun_completes() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dest = dir.path().join("dest");
    fs::create_dir_all(src.join("big")).unwrap();
    fs::write(src.join("a.txt"), b"a").unwrap();
    let mut big = fs::File::create(src.join("big/data.bin")).unwrap();
    for _ in 0..64 {
        big.write_all(&[5u8; 256 * 1024]).unwrap();
    }
    drop(big);

    // A non-empty directory at the destination forces the copy-then-delete path.
    fs::create_dir_all(dest.join("big")).unwrap();
    fs::write(dest.join("big/other.txt"), b"other").unwrap();

    let engine = engine_with_buffer(4096);
    let mut events = engine.registry().subscribe();
    let payload = TaskPayload::Move(TransferPayload {
        sources: vec![src.join("a.txt"), src.join("big")],
        destination: dest.clone(),
    });
    let id = engine.submit(TaskKind::Move, payload).await.unwrap();

    loop {
        let record = match events.recv().await {
            Ok(record) => record,
            Err(RecvError::Lagged(_)) => continue,
            Err(err) => panic!("event channel closed: {err}"),
        };
        if record.id == id && record.status == TaskStatus::Running && record.progress >= 1 {
            engine.cancel(id).unwrap();
            break;
        }
        assert!(!record.is_terminal(), "finished before it could be cancelled");
    }
    let record = engine.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);

    // The executor stops at its next check and removes the partial file.
    for _ in 0..200 {
        if !dest.join("big/data.bin").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!dest.join("big/data.bin").exists());
    assert!(dest.join("a.txt").exists());
    assert!(!src.join("a.txt").exists());
    assert!(src.join("big/data.bin").exists());

    let rerun = TaskPayload::Move(TransferPayload {
        sources: vec![src.join("big")],
        destination: dest.clone(),
    });
    let id = engine.submit(TaskKind::Move, rerun).await.unwrap();
    let record = engine.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    assert!(!src.join("big").exists());
    assert_eq!(
        fs::metadata(dest.join("big/data.bin")).unwrap().len(),
        64 * 256 * 1024
    );
    assert!(dest.join("big/other.txt").exists());
}

async fn round_trip(format: ArchiveFormat, level: u32) {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input");
    populate(&input);
    let engine = engine();

    let archive = dir
        .path()
        .join("out")
        .join(format!("backup.{}", format.extension()));
    let compress = TaskPayload::Compress(CompressPayload {
        sources: vec![input.join("world"), input.join("plugins")],
        archive: archive.clone(),
        format,
        level,
    });
    let id = engine.submit(TaskKind::Compress, compress).await.unwrap();
    let record = engine.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed, "{:?}", record.error);
    assert!(archive.exists());

    let restored = dir.path().join("restored");
    let extract = TaskPayload::Extract(ExtractPayload {
        archive,
        destination: restored.clone(),
    });
    let id = engine.submit(TaskKind::Extract, extract).await.unwrap();
    let record = engine.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed, "{:?}", record.error);
    assert_eq!(record.progress, 100);

    assert_same_tree(&input, &restored);
    assert!(restored.join("world/empty").is_dir());
    let leftovers: Vec<_> = fs::read_dir(&restored)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "intermediate files left: {leftovers:?}");
}

#[tokio::test]
async fn test_zip_round_trip() {
    round_trip(ArchiveFormat::Zip, 6).await;
}

#[tokio::test]
async fn test_zip_stored_round_trip() {
    round_trip(ArchiveFormat::Zip, 0).await;
}

#[tokio::test]
async fn test_tar_round_trip() {
    round_trip(ArchiveFormat::Tar, 6).await;
}

#[tokio::test]
async fn test_tar_gz_round_trip() {
    round_trip(ArchiveFormat::TarGz, 9).await;
}

#[tokio::test]
async fn test_tar_xz_round_trip() {
    round_trip(ArchiveFormat::TarXz, 3).await;
}

#[tokio::test]
async fn test_tar_bz2_round_trip() {
    round_trip(ArchiveFormat::TarBz2, 6).await;
}

#[tokio::test]
async fn test_extract_unsupported_format_fails() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("mods.rar");
    fs::write(&archive, b"Rar!").unwrap();
    let engine = engine();

    let payload = TaskPayload::Extract(ExtractPayload {
        archive,
        destination: dir.path().join("out"),
    });
    let id = engine.submit(TaskKind::Extract, payload).await.unwrap();
    let record = engine.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.code, ErrorCode::Structural);
    assert!(error.detail.contains("unsupported archive format"));
}

#[tokio::test]
async fn test_extract_corrupt_archive_fails() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("broken.tar.gz");
    fs::write(&archive, b"definitely not gzip").unwrap();
    let engine = engine();

    let payload = TaskPayload::Extract(ExtractPayload {
        archive,
        destination: dir.path().join("out"),
    });
    let id = engine.submit(TaskKind::Extract, payload).await.unwrap();
    let record = engine.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_extract_skips_unsafe_entries() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("evil.tar");

    {
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());

        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_path("safe.txt").unwrap();
        header.set_cksum();
        builder.append(&header, &b"ok"[..]).unwrap();

        let mut header = tar::Header::new_old();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_path("passwd").unwrap();
        header.set_link_name("/etc/passwd").unwrap();
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();

        builder.finish().unwrap();
    }

    let out = dir.path().join("out");
    let engine = engine();
    let payload = TaskPayload::Extract(ExtractPayload {
        archive,
        destination: out.clone(),
    });
    let id = engine.submit(TaskKind::Extract, payload).await.unwrap();
    let record = engine.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Completed, "{:?}", record.error);
    assert_eq!(fs::read(out.join("safe.txt")).unwrap(), b"ok");
    assert!(!dir.path().join("escape.txt").exists());
    assert!(fs::symlink_metadata(out.join("passwd")).is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_zip_extract_replaces_existing_symlink() {
    let dir = TempDir::new().unwrap();
    let outside = dir.path().join("outside.yml");
    fs::write(&outside, b"untouched").unwrap();

    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    std::os::unix::fs::symlink(&outside, out.join("server.yml")).unwrap();

    let archive = dir.path().join("config.zip");
    {
        let mut zip = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
        zip.start_file("server.yml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"port: 25565\n").unwrap();
        zip.finish().unwrap();
    }

    let engine = engine();
    let payload = TaskPayload::Extract(ExtractPayload {
        archive,
        destination: out.clone(),
    });
    let id = engine.submit(TaskKind::Extract, payload).await.unwrap();
    let record = engine.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Completed, "{:?}", record.error);
    assert_eq!(fs::read(&outside).unwrap(), b"untouched");
    let written = out.join("server.yml");
    assert!(!fs::symlink_metadata(&written).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(&written).unwrap(), b"port: 25565\n");
}

#[tokio::test]
async fn test_download_streams_and_completes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("latest.log");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
    fs::write(&path, &content).unwrap();
    let engine = engine_with_buffer(8192);

    let payload = TaskPayload::Download(DownloadPayload { path, size: 0 });
    let id = engine.submit(TaskKind::Download, payload).await.unwrap();

    let record = engine.registry().get(id).unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    match record.payload {
        TaskPayload::Download(p) => assert_eq!(p.size, content.len() as u64),
        other => panic!("unexpected payload {other:?}"),
    }

    let mut stream = engine.open_download(id).await.unwrap();
    assert_eq!(stream.file_name(), "latest.log");
    let mut received = Vec::new();
    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    drop(stream);

    assert_eq!(received, content);
    let record = engine.registry().get(id).unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(engine.open_download(id).await.is_err());
}

#[tokio::test]
async fn test_download_interrupted_on_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("world.zip");
    fs::write(&path, vec![0u8; 100_000]).unwrap();
    let engine = engine_with_buffer(4096);

    let payload = TaskPayload::Download(DownloadPayload { path, size: 0 });
    let id = engine.submit(TaskKind::Download, payload).await.unwrap();

    let mut stream = engine.open_download(id).await.unwrap();
    stream.next().await.unwrap().unwrap();
    drop(stream);

    let record = engine.registry().get(id).unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.unwrap().detail, "download interrupted");
}

#[tokio::test]
async fn test_submit_rejects_copy_into_itself() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let engine = engine();

    let payload = TaskPayload::Copy(TransferPayload {
        sources: vec![dir.path().join("world")],
        destination: dir.path().join("world/region"),
    });
    let err = engine.submit(TaskKind::Copy, payload).await.unwrap_err();
    assert!(matches!(err, RegistryError::Invalid(TaskError::InvalidPath { .. })));
}
