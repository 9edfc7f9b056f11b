//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, TallyConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tally/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tally/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tally.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Overlay one TOML file onto the config.
pub fn apply_file(config: &mut TallyConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("state_dir").and_then(|v| v.as_str()) {
            config.paths.state_dir = expand_path(v);
        }
    }

    if let Some(replication) = table.get("replication").and_then(|v| v.as_table()) {
        if let Some(v) = replication
            .get("persistence_interval_ms")
            .and_then(|v| v.as_integer())
        {
            config.replication.persistence_interval_ms = v as u64;
        }
        if let Some(v) = replication
            .get("predeclare_buffer")
            .and_then(|v| v.as_integer())
        {
            config.replication.predeclare_buffer = v as usize;
        }
        if let Some(v) = replication
            .get("queue_warn_depth")
            .and_then(|v| v.as_integer())
        {
            config.replication.queue_warn_depth = v as usize;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    Ok(())
}

/// Apply `TALLY_*` environment variable overrides.
pub fn apply_env(config: &mut TallyConfig) {
    if let Ok(v) = env::var("TALLY_STATE_DIR") {
        config.paths.state_dir = expand_path(&v);
    }
    if let Ok(v) = env::var("TALLY_PERSISTENCE_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.replication.persistence_interval_ms = ms;
        }
    }
    if let Ok(v) = env::var("TALLY_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(raw)
}
