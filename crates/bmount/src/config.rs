//! Configuration file support for the bmount CLI.
//!
//! Settings are read from `config.toml` in `$BMOUNT_CONFIG_DIR` when set,
//! otherwise from `~/.config/bmount/config.toml` (XDG standard) or the
//! platform's equivalent. A missing file yields the defaults.
//!
//! # Example configuration
//!
//! ```toml
//! [helper]
//! path = "/usr/local/bin/rclone"
//! config_file = "/home/alice/.config/rclone/rclone.conf"
//!
//! [mount]
//! base_dir = "/home/alice/buckets"
//! readiness_timeout = "45s"
//!
//! [naming]
//! prefix = "haio"
//!
//! [autostart]
//! elevation = "sudo"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bmount_core::Settings;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "BMOUNT_CONFIG_DIR";

/// Load settings from the default path, or return defaults if not found.
pub fn load() -> Result<Settings> {
    load_from(&config_path()?)
}

/// Load and validate settings from `path`.
pub fn load_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let settings: Settings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    settings
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(settings)
}

/// Get the path to the configuration file.
pub fn config_path() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir).join("config.toml"));
    }

    let base_dirs = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(base_dirs.config_dir().join("bmount").join("config.toml"))
}
