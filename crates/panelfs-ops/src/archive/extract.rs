use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use panelfs_core::{ArchiveFormat, ErrorCode, ExtractPayload, TaskFailure};
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use super::compress::zip_error;
use super::{sanitize_entry_path, ProgressReader};
use crate::context::TaskContext;
use crate::error::ExecError;
use crate::progress::ProgressTracker;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Unpack `payload.archive` into `payload.destination`.
///
/// Links, absolute paths and entries climbing out with `..` are skipped;
/// every file written resolves inside the destination.
pub(crate) fn extract_blocking(
    ctx: &TaskContext,
    payload: &ExtractPayload,
) -> Result<(), ExecError> {
    let archive = payload.archive.as_path();
    let format = ArchiveFormat::from_path(archive).ok_or_else(|| {
        ExecError::from(
            TaskFailure::new(ErrorCode::Structural, "unsupported archive format").at(archive),
        )
    })?;

    fs::create_dir_all(&payload.destination)
        .map_err(|e| ExecError::io(&payload.destination, &e))?;
    let destination = payload
        .destination
        .canonicalize()
        .map_err(|e| ExecError::io(&payload.destination, &e))?;

    let file = File::open(archive).map_err(|e| ExecError::io(archive, &e))?;
    let size = file.metadata().map_err(|e| ExecError::io(archive, &e))?.len();
    let label = format!(
        "Extracting {}",
        archive.file_name().unwrap_or_default().to_string_lossy()
    );
    ctx.report(0, label.as_str());
    debug!(task_id = %ctx.id(), %format, "extracting");

    match format {
        ArchiveFormat::Zip => extract_zip(ctx, file, archive, &destination),
        ArchiveFormat::TarXz => extract_tar_xz(ctx, file, size, archive, &destination, &label),
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 => {
            let mut tracker = ProgressTracker::new(0, size);
            let reader = ProgressReader::new(BufReader::new(file), ctx, &mut tracker, label);
            match format {
                ArchiveFormat::TarGz => {
                    extract_tar(ctx, GzDecoder::new(reader), archive, &destination)
                }
                ArchiveFormat::TarBz2 => {
                    extract_tar(ctx, BzDecoder::new(reader), archive, &destination)
                }
                _ => extract_tar(ctx, reader, archive, &destination),
            }
        }
    }
}

/// Decompress to a hidden intermediate tar next to the output, then unpack
/// it. The intermediate is removed on every path out.
fn extract_tar_xz(
    ctx: &TaskContext,
    file: File,
    size: u64,
    archive: &Path,
    destination: &Path,
    label: &str,
) -> Result<(), ExecError> {
    let mut intermediate = tempfile::Builder::new()
        .prefix(".panelfs-")
        .suffix(".tar")
        .tempfile_in(destination)
        .map_err(|e| ExecError::io(destination, &e))?;

    {
        let mut tracker = ProgressTracker::new(0, size);
        let reader = ProgressReader::new(BufReader::new(file), ctx, &mut tracker, "Decompressing")
            .with_range(0, 50);
        let mut decoder = XzDecoder::new(reader);
        io::copy(&mut decoder, intermediate.as_file_mut())
            .map_err(|e| stream_error(ctx, archive, &e))?;
    }

    let tar_file = intermediate
        .reopen()
        .map_err(|e| ExecError::io(intermediate.path(), &e))?;
    let tar_size = tar_file
        .metadata()
        .map_err(|e| ExecError::io(intermediate.path(), &e))?
        .len();
    let mut tracker = ProgressTracker::new(0, tar_size);
    let reader = ProgressReader::new(BufReader::new(tar_file), ctx, &mut tracker, label)
        .with_range(50, 100);
    extract_tar(ctx, reader, archive, destination)
}

fn extract_tar<R: Read>(
    ctx: &TaskContext,
    reader: R,
    archive: &Path,
    destination: &Path,
) -> Result<(), ExecError> {
    let mut tar = tar::Archive::new(reader);
    let entries = tar.entries().map_err(|e| stream_error(ctx, archive, &e))?;

    for entry in entries {
        ctx.check()?;
        let mut entry = entry.map_err(|e| stream_error(ctx, archive, &e))?;
        let raw = entry
            .path()
            .map_err(|e| stream_error(ctx, archive, &e))?
            .into_owned();
        let kind = entry.header().entry_type();

        let Some(relative) = sanitize_entry_path(&raw) else {
            warn!(entry = %raw.display(), "skipping entry outside the destination");
            continue;
        };
        if kind.is_symlink() || kind.is_hard_link() {
            warn!(entry = %raw.display(), "skipping link entry");
            continue;
        }

        let target = destination.join(&relative);
        if kind.is_dir() {
            if prepare_parent(destination, &target)? {
                fs::create_dir_all(&target).map_err(|e| ExecError::io(&target, &e))?;
            }
            continue;
        }
        if !(kind.is_file() || kind.is_contiguous()) {
            debug!(entry = %raw.display(), "skipping special entry");
            continue;
        }

        if !prepare_parent(destination, &target)? {
            warn!(entry = %raw.display(), "skipping entry resolving outside the destination");
            continue;
        }
        entry
            .unpack(&target)
            .map_err(|e| ctx.io_error(&target, &e))?;
    }

    Ok(())
}

fn extract_zip(
    ctx: &TaskContext,
    file: File,
    archive: &Path,
    destination: &Path,
) -> Result<(), ExecError> {
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| zip_error(ctx, archive, e))?;
    let mut tracker = ProgressTracker::new(zip.len(), 0);

    for index in 0..zip.len() {
        ctx.check()?;
        let mut entry = zip.by_index(index).map_err(|e| zip_error(ctx, archive, e))?;
        let name = entry.name().to_string();

        let relative = entry
            .enclosed_name()
            .as_deref()
            .and_then(sanitize_entry_path);
        let is_link = entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK);

        match relative {
            None => warn!(entry = %name, "skipping entry outside the destination"),
            Some(_) if is_link => warn!(entry = %name, "skipping link entry"),
            Some(relative) => {
                let target = destination.join(relative);
                if entry.is_dir() {
                    if prepare_parent(destination, &target)? {
                        fs::create_dir_all(&target).map_err(|e| ExecError::io(&target, &e))?;
                    }
                } else if prepare_parent(destination, &target)? {
                    let mut out = create_entry_file(&target)?;
                    let label = format!("Extracting {name}");
                    let mut reader = ProgressReader::new(&mut entry, ctx, &mut tracker, label);
                    io::copy(&mut reader, &mut out).map_err(|e| ctx.io_error(&target, &e))?;
                    set_mode(&target, entry.unix_mode());
                } else {
                    warn!(entry = %name, "skipping entry resolving outside the destination");
                }
            }
        }

        tracker.complete_file();
        ctx.publish(&mut tracker, || format!("Extracting {name}"));
    }

    Ok(())
}

/// Create `target` for writing without following a link already there.
fn create_entry_file(target: &Path) -> Result<File, ExecError> {
    if fs::symlink_metadata(target).is_ok_and(|meta| meta.file_type().is_symlink()) {
        fs::remove_file(target).map_err(|e| ExecError::io(target, &e))?;
    }
    File::options()
        .write(true)
        .create_new(true)
        .open(target)
        .or_else(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => File::create(target),
            _ => Err(err),
        })
        .map_err(|e| ExecError::io(target, &e))
}

/// Create the parent of `target` and check it resolves inside
/// `destination` (already canonical).
fn prepare_parent(destination: &Path, target: &Path) -> Result<bool, ExecError> {
    let parent = target.parent().unwrap_or(destination);
    fs::create_dir_all(parent).map_err(|e| ExecError::io(parent, &e))?;
    let resolved = parent
        .canonicalize()
        .map_err(|e| ExecError::io(parent, &e))?;
    Ok(resolved.starts_with(destination))
}

/// Errors reading the archive stream are structural unless the disk itself
/// failed.
fn stream_error(ctx: &TaskContext, archive: &Path, err: &io::Error) -> ExecError {
    if ctx.is_cancelled() {
        return ExecError::Cancelled;
    }
    let code = match ErrorCode::from_io(err) {
        ErrorCode::Fatal if err.kind() == io::ErrorKind::Other => ErrorCode::Structural,
        ErrorCode::TransientIo if err.kind() == io::ErrorKind::UnexpectedEof => {
            ErrorCode::Structural
        }
        code => code,
    };
    TaskFailure::new(code, format!("corrupt or unreadable archive: {err}"))
        .at(archive)
        .into()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}
