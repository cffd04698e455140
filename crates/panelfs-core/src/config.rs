//! Engine configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the task engine, upload store and HTTP server.
///
/// Fields left unset on the builder, or missing from a config file, take
/// their value from [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(default, setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Address the HTTP API listens on.
    pub bind: SocketAddr,

    /// Buffer size for streaming file copies.
    pub copy_buffer_size: usize,

    /// Directory holding in-flight upload chunks.
    pub chunk_dir: PathBuf,

    /// Size of one upload chunk in bytes.
    pub chunk_size: u64,

    /// Maximum chunk requests in flight per file.
    pub max_concurrent_chunks: usize,

    /// Retries allowed per chunk before the file fails.
    pub max_chunk_retries: u32,

    /// First retry delay in milliseconds; doubles on each retry.
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Idle time after which an unfinished upload session is discarded.
    pub upload_session_ttl_secs: u64,

    /// How often expired upload sessions and finished tasks are swept.
    pub janitor_interval_secs: u64,

    /// How long terminal task records stay queryable.
    pub finished_task_retention_secs: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8089))
}

fn default_chunk_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("panelfs")
        .join("chunks")
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.copy_buffer_size == Some(0) {
            return Err("copy_buffer_size must be positive".to_string());
        }
        if self.chunk_size == Some(0) {
            return Err("chunk_size must be positive".to_string());
        }
        if self.max_concurrent_chunks == Some(0) {
            return Err("max_concurrent_chunks must be at least 1".to_string());
        }
        if let Some(ref dir) = self.chunk_dir {
            if dir.as_os_str().is_empty() {
                return Err("chunk_dir cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("panelfs")
            .join("config.toml")
    }

    /// Load a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Load the file at `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.copy_buffer_size == 0 || self.chunk_size == 0 || self.max_concurrent_chunks == 0 {
            return Err(ConfigError::Invalid(
                "buffer size, chunk size and chunk concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn upload_session_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_session_ttl_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn finished_task_retention(&self) -> Duration {
        Duration::from_secs(self.finished_task_retention_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            copy_buffer_size: 256 * 1024,
            chunk_dir: default_chunk_dir(),
            chunk_size: 4 * 1024 * 1024,
            max_concurrent_chunks: 3,
            max_chunk_retries: 5,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 30_000,
            upload_session_ttl_secs: 24 * 60 * 60,
            janitor_interval_secs: 60 * 60,
            finished_task_retention_secs: 24 * 60 * 60,
        }
    }
}
