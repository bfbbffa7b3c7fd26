//! Configuration loading traits and types.
//!
//! Peers and bindings load a [`TransactConfig`] from a TOML file. Every field
//! has a default, so an empty file (or no file at all) is a valid setup.
//!
//! # Usage
//!
//! ```rust,no_run
//! use transact_common::config::{ConfigError, ConfigLoader, TransactConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = TransactConfig::load(Path::new("transact.toml"))?;
//!     config.validate()?;
//!     println!("arena: {} bytes", config.arena_size_bytes);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    BLOCK_SIZE, DEFAULT_ARENA_SIZE, DEFAULT_LIVENESS_POLL_MS, DEFAULT_SHM_DIR, MIN_ARENA_BLOCKS,
    SHM_MAX_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, every handoff and allocation.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// Open/close and peer lifecycle events.
    #[default]
    Info,
    /// Peer death and recoverable anomalies.
    Warn,
    /// Unrecoverable conditions only.
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Runtime configuration shared by both peers of a channel.
///
/// # TOML Example
///
/// ```toml
/// log_level = "debug"
/// shm_dir = "/dev/shm"
/// handshake_token = 0xC0FFEE00
/// arena_size_bytes = 65536
/// liveness_poll_ms = 50
/// open_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactConfig {
    /// Logging verbosity level.
    pub log_level: LogLevel,

    /// Directory holding session and arena files created from bare names.
    pub shm_dir: PathBuf,

    /// Token both peers must agree on during the handshake.
    /// The role-selector bit is ignored.
    pub handshake_token: u64,

    /// Arena size in bytes. Must be a multiple of the block size.
    pub arena_size_bytes: usize,

    /// How often a blocked peer checks that its partner process is alive.
    pub liveness_poll_ms: u64,

    /// Upper bound for the waits performed by `open`. Unbounded when absent.
    pub open_timeout_ms: Option<u64>,
}

impl Default for TransactConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            handshake_token: 0,
            arena_size_bytes: DEFAULT_ARENA_SIZE,
            liveness_poll_ms: DEFAULT_LIVENESS_POLL_MS,
            open_timeout_ms: None,
        }
    }
}

impl TransactConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `arena_size_bytes` is not a multiple of the block size
    /// - the arena holds fewer than two blocks or exceeds `SHM_MAX_SIZE`
    /// - `liveness_poll_ms` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_size_bytes % BLOCK_SIZE != 0 {
            return Err(ConfigError::ValidationError(format!(
                "arena_size_bytes ({}) must be a multiple of {BLOCK_SIZE}",
                self.arena_size_bytes
            )));
        }
        if self.arena_size_bytes / BLOCK_SIZE < MIN_ARENA_BLOCKS {
            return Err(ConfigError::ValidationError(format!(
                "arena_size_bytes ({}) must hold at least {MIN_ARENA_BLOCKS} blocks",
                self.arena_size_bytes
            )));
        }
        if self.arena_size_bytes > SHM_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "arena_size_bytes ({}) exceeds {SHM_MAX_SIZE}",
                self.arena_size_bytes
            )));
        }
        if self.liveness_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "liveness_poll_ms cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Liveness probe interval as a `Duration`.
    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }

    /// Open timeout as a `Duration`, if one is configured.
    pub fn open_timeout(&self) -> Option<Duration> {
        self.open_timeout_ms.map(Duration::from_millis)
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration file");

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
