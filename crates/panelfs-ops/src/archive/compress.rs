use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use panelfs_core::{ArchiveFormat, CompressPayload, ErrorCode, TaskFailure};
use tracing::{debug, warn};
use xz2::write::XzEncoder;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{entry_name, ProgressReader};
use crate::context::TaskContext;
use crate::error::ExecError;
use crate::progress::ProgressTracker;
use crate::walk::{walk_sources, EntryKind, TransferPlan, WalkEntry};

/// Write `payload.archive`. A writer error leaves the partial archive on
/// disk; cancellation removes it.
pub(crate) fn compress_blocking(
    ctx: &TaskContext,
    payload: &CompressPayload,
) -> Result<(), ExecError> {
    ctx.report(0, "Scanning sources");
    let plan = walk_sources(ctx, &payload.sources)?;

    let archive = payload.archive.as_path();
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent).map_err(|e| ExecError::io(parent, &e))?;
    }
    let file = File::create(archive).map_err(|e| ExecError::io(archive, &e))?;
    let writer = BufWriter::new(file);
    let mut tracker = ProgressTracker::new(plan.total_files, plan.total_bytes);
    let level = payload.level;

    debug!(
        task_id = %ctx.id(),
        format = %payload.format,
        level,
        bytes = plan.total_bytes,
        "compressing"
    );

    let result = match payload.format {
        ArchiveFormat::Zip => write_zip(ctx, writer, &plan, level, &mut tracker, archive),
        ArchiveFormat::Tar => write_tar(ctx, writer, &plan, &mut tracker, archive)
            .and_then(|w| finish(ctx, archive, w)),
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(writer, flate2::Compression::new(level));
            write_tar(ctx, encoder, &plan, &mut tracker, archive)
                .and_then(|encoder| encoder.finish().map_err(|e| ExecError::io(archive, &e)))
                .and_then(|w| finish(ctx, archive, w))
        }
        ArchiveFormat::TarXz => {
            let encoder = XzEncoder::new(writer, level);
            write_tar(ctx, encoder, &plan, &mut tracker, archive)
                .and_then(|encoder| encoder.finish().map_err(|e| ExecError::io(archive, &e)))
                .and_then(|w| finish(ctx, archive, w))
        }
        ArchiveFormat::TarBz2 => {
            let encoder = BzEncoder::new(writer, bzip2::Compression::new(level.clamp(1, 9)));
            write_tar(ctx, encoder, &plan, &mut tracker, archive)
                .and_then(|encoder| encoder.finish().map_err(|e| ExecError::io(archive, &e)))
                .and_then(|w| finish(ctx, archive, w))
        }
    };

    if matches!(result, Err(ExecError::Cancelled)) {
        let _ = fs::remove_file(archive);
    }
    result
}

fn finish<W: Write>(ctx: &TaskContext, archive: &Path, mut writer: W) -> Result<(), ExecError> {
    writer.flush().map_err(|e| ctx.io_error(archive, &e))
}

fn entries(plan: &TransferPlan) -> impl Iterator<Item = &WalkEntry> {
    plan.sources.iter().flat_map(|source| source.entries.iter())
}

fn write_tar<W: Write>(
    ctx: &TaskContext,
    writer: W,
    plan: &TransferPlan,
    tracker: &mut ProgressTracker,
    archive: &Path,
) -> Result<W, ExecError> {
    let mut builder = tar::Builder::new(writer);

    for entry in entries(plan) {
        ctx.check()?;
        let name = entry_name(&entry.relative);

        match entry.kind {
            EntryKind::Dir => builder
                .append_dir(&name, &entry.path)
                .map_err(|e| ctx.io_error(&entry.path, &e))?,
            EntryKind::File => {
                let file = File::open(&entry.path).map_err(|e| ctx.io_error(&entry.path, &e))?;
                let metadata = file.metadata().map_err(|e| ctx.io_error(&entry.path, &e))?;
                let mut header = tar::Header::new_gnu();
                header.set_metadata(&metadata);
                header.set_size(metadata.len());

                let label = format!("Compressing {name}");
                let reader = ProgressReader::new(file.take(metadata.len()), ctx, tracker, label);
                builder
                    .append_data(&mut header, &name, reader)
                    .map_err(|e| ctx.io_error(&entry.path, &e))?;
                tracker.complete_file();
            }
            EntryKind::Symlink => {
                warn!(path = %entry.path.display(), "symbolic link not archived");
                tracker.complete_file();
            }
        }
        ctx.publish(tracker, || format!("Compressing {name}"));
    }

    builder.into_inner().map_err(|e| ctx.io_error(archive, &e))
}

fn write_zip<W: Write + io::Seek>(
    ctx: &TaskContext,
    writer: W,
    plan: &TransferPlan,
    level: u32,
    tracker: &mut ProgressTracker,
    archive: &Path,
) -> Result<(), ExecError> {
    let base = if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(level)))
    };
    let mut zip = ZipWriter::new(writer);

    for entry in entries(plan) {
        ctx.check()?;
        let name = entry_name(&entry.relative);

        match entry.kind {
            EntryKind::Dir => zip
                .add_directory(name.as_str(), base)
                .map_err(|e| zip_error(ctx, archive, e))?,
            EntryKind::File => {
                let options = base.large_file(entry.size >= u64::from(u32::MAX));
                zip.start_file(name.as_str(), options)
                    .map_err(|e| zip_error(ctx, archive, e))?;

                let file = File::open(&entry.path).map_err(|e| ctx.io_error(&entry.path, &e))?;
                let label = format!("Compressing {name}");
                let mut reader = ProgressReader::new(file, ctx, tracker, label);
                io::copy(&mut reader, &mut zip).map_err(|e| ctx.io_error(&entry.path, &e))?;
                tracker.complete_file();
            }
            EntryKind::Symlink => {
                warn!(path = %entry.path.display(), "symbolic link not archived");
                tracker.complete_file();
            }
        }
        ctx.publish(tracker, || format!("Compressing {name}"));
    }

    let writer = zip.finish().map_err(|e| zip_error(ctx, archive, e))?;
    finish(ctx, archive, writer)
}

pub(super) fn zip_error(ctx: &TaskContext, archive: &Path, err: ZipError) -> ExecError {
    match err {
        ZipError::Io(e) => ctx.io_error(archive, &e),
        _ if ctx.is_cancelled() => ExecError::Cancelled,
        other => TaskFailure::new(ErrorCode::Structural, other.to_string())
            .at(archive)
            .into(),
    }
}
