//! panelfs - background file operations for a game server admin panel.
//!
//! Usage:
//!   panelfs serve                      Run the HTTP API
//!   panelfs copy SRC... DEST           Copy files or directories
//!   panelfs move SRC... DEST           Move files or directories
//!   panelfs compress SRC... ARCHIVE    Create a zip or tar archive
//!   panelfs extract ARCHIVE DEST       Unpack an archive
//!   panelfs upload FILE... --to DIR    Chunked upload to a running server
//!   panelfs --help                     Show help

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use panelfs_core::{
    ArchiveFormat, CompressPayload, EngineConfig, ExtractPayload, TaskKind, TaskPayload,
    TaskRegistry, TaskStatus, TransferPayload, DEFAULT_COMPRESSION_LEVEL,
};
use panelfs_ops::{ConflictStrategy, TaskEngine};
use panelfs_server::AppState;
use panelfs_upload::{ChunkUploader, HttpTransport, ProgressCallback, UploadPhase};

#[derive(Parser)]
#[command(
    name = "panelfs",
    version,
    about = "Background file operations and chunked uploads",
    long_about = "panelfs runs long file operations (copy, move, compress, extract, \
                  download) as tracked background tasks and accepts resumable \
                  chunked uploads.\n\n\
                  Run `panelfs serve` for the HTTP API, or use the other \
                  subcommands for one-shot local operations."
)]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API until interrupted
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Directory for upload chunk sessions
        #[arg(long)]
        chunk_dir: Option<PathBuf>,
    },

    /// Copy files or directories into a destination directory
    Copy {
        #[arg(required = true, num_args = 1..)]
        sources: Vec<PathBuf>,
        destination: PathBuf,
    },

    /// Move files or directories into a destination directory
    Move {
        #[arg(required = true, num_args = 1..)]
        sources: Vec<PathBuf>,
        destination: PathBuf,
    },

    /// Create an archive from files or directories
    Compress {
        #[arg(required = true, num_args = 1..)]
        sources: Vec<PathBuf>,
        /// Output archive; the format follows its extension
        archive: PathBuf,

        /// Compression level (0-9)
        #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: u32,
    },

    /// Extract an archive into a directory
    Extract { archive: PathBuf, destination: PathBuf },

    /// Upload files to a running panelfs server
    Upload {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,

        /// Target directory on the server
        #[arg(short, long)]
        to: PathBuf,

        /// Server origin
        #[arg(short, long, default_value = "http://127.0.0.1:8089")]
        server: String,

        /// How to resolve name clashes ("replace" or "rename")
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load_or_default(&config_path)
        .with_context(|| format!("Invalid config {}", config_path.display()))?;

    match cli.command {
        Command::Serve { bind, chunk_dir } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(chunk_dir) = chunk_dir {
                config.chunk_dir = chunk_dir;
            }
            run_serve(config).await?;
        }
        Command::Copy {
            sources,
            destination,
        } => {
            let payload = TaskPayload::Copy(TransferPayload {
                sources: absolute_all(&sources)?,
                destination: absolute(&destination)?,
            });
            run_task(config, TaskKind::Copy, payload).await?;
        }
        Command::Move {
            sources,
            destination,
        } => {
            let payload = TaskPayload::Move(TransferPayload {
                sources: absolute_all(&sources)?,
                destination: absolute(&destination)?,
            });
            run_task(config, TaskKind::Move, payload).await?;
        }
        Command::Compress {
            sources,
            archive,
            level,
        } => {
            let format = ArchiveFormat::from_path(&archive)
                .ok_or_else(|| eyre!("Unsupported archive format: {}", archive.display()))?;
            let payload = TaskPayload::Compress(CompressPayload {
                sources: absolute_all(&sources)?,
                archive: absolute(&archive)?,
                format,
                level,
            });
            run_task(config, TaskKind::Compress, payload).await?;
        }
        Command::Extract {
            archive,
            destination,
        } => {
            let payload = TaskPayload::Extract(ExtractPayload {
                archive: absolute(&archive)?,
                destination: absolute(&destination)?,
            });
            run_task(config, TaskKind::Extract, payload).await?;
        }
        Command::Upload {
            files,
            to,
            server,
            strategy,
        } => {
            run_upload(&config, files, to, &server, strategy).await?;
        }
    }

    Ok(())
}

/// Serve the API until ctrl-c.
async fn run_serve(config: EngineConfig) -> Result<()> {
    let bind = config.bind;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        signal.cancel();
    });

    panelfs_server::serve(AppState::new(config), bind, shutdown)
        .await
        .with_context(|| format!("Failed to serve on {bind}"))
}

/// Run one task in-process and print its progress until it finishes.
async fn run_task(config: EngineConfig, kind: TaskKind, payload: TaskPayload) -> Result<()> {
    let engine = TaskEngine::new(Arc::new(TaskRegistry::new()), config);
    let mut events = engine.registry().subscribe();

    let id = engine.submit(kind, payload).await?;

    let cancel = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel.cancel(id);
        }
    });

    let printer = tokio::spawn(async move {
        let mut last = None;
        loop {
            match events.recv().await {
                Ok(record) if record.id == id => {
                    if last != Some((record.progress, record.message.clone())) {
                        eprintln!("{:>3}% {}", record.progress, record.message);
                        last = Some((record.progress, record.message.clone()));
                    }
                    if record.is_terminal() {
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let record = engine.wait(id).await?;
    let _ = printer.await;

    match record.status {
        TaskStatus::Completed => {
            eprintln!("{kind} completed");
            Ok(())
        }
        TaskStatus::Cancelled => bail!("{kind} cancelled"),
        _ => {
            let detail = record
                .error
                .map(|failure| serde_json::to_string_pretty(&failure))
                .transpose()?
                .unwrap_or_else(|| record.message.clone());
            bail!("{kind} failed: {detail}")
        }
    }
}

/// Upload `files` into `target` on the server at `server`.
async fn run_upload(
    config: &EngineConfig,
    files: Vec<PathBuf>,
    target: PathBuf,
    server: &str,
    strategy: Option<ConflictStrategy>,
) -> Result<()> {
    let transport = Arc::new(HttpTransport::new(server)?);
    let on_progress: ProgressCallback = Arc::new(|progress| {
        if progress.retry.is_some()
            || matches!(progress.phase, UploadPhase::Completed | UploadPhase::Error)
            || progress.uploaded_chunks % 8 == 0
        {
            eprintln!("{}", progress.summary());
        }
    });
    let uploader = ChunkUploader::from_config(transport, config).on_progress(on_progress);

    let cancel = uploader.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcomes = uploader.upload_batch(&files, &target, strategy).await?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(path) => println!("{} -> {}", outcome.source.display(), path.display()),
            Err(err) => {
                failed += 1;
                println!("{} failed: {err}", outcome.source.display());
            }
        }
    }

    let total: u64 = files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();
    eprintln!(
        "{} of {} file(s) uploaded ({})",
        outcomes.len() - failed,
        outcomes.len(),
        format_size(total)
    );

    if failed > 0 {
        bail!("{failed} upload(s) failed");
    }
    Ok(())
}

/// Task paths must be absolute and free of `.`/`..` components.
fn absolute(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))?;
    Ok(normalize(&path))
}

/// Resolve `.` and `..` lexically; `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn absolute_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| absolute(p)).collect()
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_parent_components() {
        assert_eq!(normalize(Path::new("/srv/mc/../backups/./world")), PathBuf::from("/srv/backups/world"));
        assert_eq!(normalize(Path::new("/../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_relative_parent_argument_passes_validation() {
        let path = absolute(Path::new("../x")).unwrap();
        assert!(path.is_absolute());
        panelfs_core::validate_path(&path).unwrap();
    }
}
