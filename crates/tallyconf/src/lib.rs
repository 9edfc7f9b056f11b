//! Configuration loading for the tally runtime.
//!
//! Kept dependency-light so every tally crate can import it without cycles.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tally/config.toml` (system)
//! 2. `~/.config/tally/config.toml` (user)
//! 3. `./tally.toml` (local override)
//! 4. Environment variables (`TALLY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/tally"
//!
//! [replication]
//! persistence_interval_ms = 100
//! predeclare_buffer = 1024
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;

pub use loader::discover_config_files;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Filesystem paths for tally state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for the durable replicant store.
    /// Default: ~/.local/share/tally
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tally"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tally"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Tunables for the replication core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Coalescing window for durable-store writes, in milliseconds.
    #[serde(default = "ReplicationConfig::default_persistence_interval_ms")]
    pub persistence_interval_ms: u64,

    /// How many inbound frames to hold for a replicant that has not been
    /// declared on this side yet. Oldest frames are dropped past the cap.
    #[serde(default = "ReplicationConfig::default_predeclare_buffer")]
    pub predeclare_buffer: usize,

    /// Queue depth at which a warning is logged for a single turn.
    #[serde(default = "ReplicationConfig::default_queue_warn_depth")]
    pub queue_warn_depth: usize,
}

impl ReplicationConfig {
    fn default_persistence_interval_ms() -> u64 {
        100
    }

    fn default_predeclare_buffer() -> usize {
        1024
    }

    fn default_queue_warn_depth() -> usize {
        8192
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            persistence_interval_ms: Self::default_persistence_interval_ms(),
            predeclare_buffer: Self::default_predeclare_buffer(),
            queue_warn_depth: Self::default_queue_warn_depth(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Complete tally configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TallyConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl TallyConfig {
    /// Load configuration from all standard sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/tally/config.toml`
    /// 3. `~/.config/tally/config.toml`
    /// 4. `./tally.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, optionally pinning the local override file.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = TallyConfig::default();
        for file in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &file)?;
        }
        loader::apply_env(&mut config);
        Ok(config)
    }
}
