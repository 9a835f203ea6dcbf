//! Runtime settings for the lifecycle manager.
//!
//! Every field has a default, so an empty (or missing) settings file yields a
//! working configuration. Durations are written in humantime form (`30s`,
//! `500ms`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bucket::Naming;
use crate::error::MountError;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Mount helper location and inputs
    pub helper: HelperSettings,
    /// Mount targets and timing
    pub mount: MountSettings,
    /// OS-visible naming
    pub naming: Naming,
    /// Auto-mount registration
    pub autostart: AutostartSettings,
}

/// Where the helper lives and what it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperSettings {
    /// Explicit helper binary; searched for when unset
    pub path: Option<PathBuf>,
    /// Helper config file (remote definitions), passed verbatim
    pub config_file: Option<PathBuf>,
    /// VFS cache directory, passed verbatim
    pub cache_dir: Option<PathBuf>,
    /// How long `--version` may take before the helper counts as missing
    #[serde(with = "humantime_serde")]
    pub version_timeout: Duration,
    /// How long a daemonizing helper may take to fork into the background
    #[serde(with = "humantime_serde")]
    pub launch_timeout: Duration,
    /// Require `/dev/fuse` before mounting (POSIX)
    pub check_fuse_device: bool,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            path: None,
            config_file: None,
            cache_dir: None,
            version_timeout: Duration::from_secs(5),
            launch_timeout: Duration::from_secs(30),
            check_fuse_device: true,
        }
    }
}

/// Target pool and timing knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountSettings {
    /// Parent of the per-bucket directories; the home directory when unset
    pub base_dir: Option<PathBuf>,
    /// Upper bound for readiness polling after launching the helper
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    /// Fixed interval between readiness probes
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Timeout for a single listing probe of a target
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Timeout for each unmount ladder step
    #[serde(with = "humantime_serde")]
    pub unmount_step_timeout: Duration,
    /// Highest numeric suffix tried for alternative directories (`-2`..)
    pub max_suffix: u32,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            readiness_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            unmount_step_timeout: Duration::from_secs(10),
            max_suffix: 9,
        }
    }
}

/// Which privilege escalation tool may be used for service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationKind {
    /// Never elevate; fail with an elevation-required error instead
    #[default]
    None,
    /// `sudo` (POSIX) or an elevated PowerShell (Windows)
    Sudo,
    /// `pkexec` (POSIX) or an elevated PowerShell (Windows)
    Pkexec,
}

/// Auto-mount registration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutostartSettings {
    /// Directory holding systemd unit files
    pub unit_dir: PathBuf,
    /// Default elevation policy
    pub elevation: ElevationKind,
    /// Timeout for each service-manager command
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for AutostartSettings {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            elevation: ElevationKind::None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Concrete directories after defaults are filled in from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    /// Parent of POSIX mount directories
    pub base_dir: PathBuf,
    /// Helper config file
    pub config_file: PathBuf,
    /// Helper cache directory
    pub cache_dir: PathBuf,
}

impl Settings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), MountError> {
        if self.naming.prefix.is_empty() {
            return Err(MountError::Config("naming.prefix must not be empty".into()));
        }
        if self.mount.poll_interval.is_zero() {
            return Err(MountError::Config(
                "mount.poll_interval must be greater than zero".into(),
            ));
        }
        if self.mount.readiness_timeout < self.mount.poll_interval {
            return Err(MountError::Config(
                "mount.readiness_timeout must be at least mount.poll_interval".into(),
            ));
        }
        Ok(())
    }

    /// Fill unset paths with the per-user conventional locations.
    pub fn resolve_paths(&self) -> Result<ResolvedPaths, MountError> {
        let base = directories::BaseDirs::new();
        let home = || {
            base.as_ref()
                .map(|b| b.home_dir().to_path_buf())
                .ok_or_else(|| MountError::Config("cannot determine home directory".into()))
        };

        let base_dir = match &self.mount.base_dir {
            Some(dir) => dir.clone(),
            None => home()?,
        };

        let config_file = match &self.helper.config_file {
            Some(file) => file.clone(),
            None => base
                .as_ref()
                .map(|b| b.config_dir().join("rclone").join("rclone.conf"))
                .ok_or_else(|| MountError::Config("cannot determine config directory".into()))?,
        };

        let cache_dir = match &self.helper.cache_dir {
            Some(dir) => dir.clone(),
            None => {
                let cache = base
                    .as_ref()
                    .map(|b| b.cache_dir().join("rclone"))
                    .ok_or_else(|| MountError::Config("cannot determine cache directory".into()))?;
                if cfg!(windows) { cache.join("cache") } else { cache }
            }
        };

        Ok(ResolvedPaths {
            base_dir,
            config_file,
            cache_dir,
        })
    }
}
