//! Building and launching the external mount helper (rclone).
//!
//! The flag set is fixed: every mount gets the same caching and reliability
//! behaviour regardless of who asked for it.
//!
//! # Launch modes
//!
//! - **Daemonizing** (POSIX): the helper forks into the background once the
//!   mount is set up; the launch command returns and readiness is polled.
//! - **Foreground** (Windows): the helper blocks for the lifetime of the
//!   mount, so it is spawned detached and watched from a thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::{BucketKey, Credential, Naming};
use crate::config::{ResolvedPaths, Settings};
use crate::error::MountError;
use crate::platform::PlatformKind;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError, SpawnedProcess};
use crate::target::MountTarget;

/// Caching and reliability flags passed on every mount.
pub const RELIABILITY_FLAGS: &[&str] = &[
    "--dir-cache-time",
    "10s",
    "--poll-interval",
    "1m",
    "--vfs-cache-mode",
    "full",
    "--vfs-cache-max-age",
    "24h",
    "--vfs-write-back",
    "10s",
    "--vfs-read-wait",
    "20ms",
    "--buffer-size",
    "32M",
    "--attr-timeout",
    "1m",
];

/// Number of log lines quoted in launch failures.
const LOG_TAIL_LINES: usize = 20;

/// How the helper process behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Forks itself into the background (`--daemon`)
    Daemonizing,
    /// Blocks in the foreground for the lifetime of the mount
    Foreground,
}

/// Helper location and the per-user inputs handed to it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperConfig {
    /// Helper executable
    pub binary: PathBuf,
    /// Helper config file with the remote definitions
    pub config_file: PathBuf,
    /// VFS cache and log directory
    pub cache_dir: PathBuf,
    /// Budget for `--version`
    pub version_timeout: Duration,
    /// Budget for a daemonizing launch to return
    pub launch_timeout: Duration,
    /// FUSE device that must exist on POSIX; `None` skips the check
    pub fuse_device: Option<PathBuf>,
}

impl HelperConfig {
    /// Build from settings, discovering the helper binary if needed.
    pub fn from_settings(settings: &Settings, paths: &ResolvedPaths, platform: PlatformKind) -> Self {
        let binary = discover_helper(settings.helper.path.as_deref(), platform)
            .unwrap_or_else(|| PathBuf::from(platform.helper_file_name()));
        Self {
            binary,
            config_file: paths.config_file.clone(),
            cache_dir: paths.cache_dir.clone(),
            version_timeout: settings.helper.version_timeout,
            launch_timeout: settings.helper.launch_timeout,
            fuse_device: (platform == PlatformKind::Posix && settings.helper.check_fuse_device)
                .then(|| PathBuf::from("/dev/fuse")),
        }
    }
}

/// Look for the helper binary.
///
/// Order: explicit path, next to the running executable, each `PATH` entry,
/// then the conventional install locations.
pub fn discover_helper(explicit: Option<&Path>, platform: PlatformKind) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }

    let file_name = platform.helper_file_name();
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(file_name)));
    let on_path: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(file_name))
                .collect()
        })
        .unwrap_or_default();

    sibling
        .into_iter()
        .chain(on_path)
        .chain(conventional_locations(platform))
        .find(|p| p.is_file())
}

fn conventional_locations(platform: PlatformKind) -> Vec<PathBuf> {
    let home = directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf());
    match platform {
        PlatformKind::Posix => {
            let mut paths = vec![
                PathBuf::from("/usr/local/bin/rclone"),
                PathBuf::from("/usr/bin/rclone"),
                PathBuf::from("/snap/bin/rclone"),
            ];
            paths.extend(home.map(|h| h.join(".local/bin/rclone")));
            paths
        }
        PlatformKind::Windows => {
            let mut paths = vec![
                PathBuf::from(r"C:\Program Files\rclone\rclone.exe"),
                PathBuf::from(r"C:\Program Files (x86)\rclone\rclone.exe"),
            ];
            paths.extend(home.map(|h| h.join("rclone").join("rclone.exe")));
            paths
        }
    }
}

/// A started helper.
#[derive(Debug)]
pub struct LaunchedHelper {
    /// The foreground process, when the helper does not daemonize
    pub process: Option<SpawnedProcess>,
}

impl LaunchedHelper {
    /// PID of the foreground helper.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// `Some(code)` if a foreground helper has already exited.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        self.process.as_ref().and_then(SpawnedProcess::exit_status)
    }
}

/// Builds and runs helper commands.
pub struct MountHelperInvoker {
    runner: Arc<dyn CommandRunner>,
    config: HelperConfig,
    platform: PlatformKind,
    naming: Naming,
}

impl MountHelperInvoker {
    /// Create an invoker.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: HelperConfig,
        platform: PlatformKind,
        naming: Naming,
    ) -> Self {
        Self {
            runner,
            config,
            platform,
            naming,
        }
    }

    /// Helper configuration in use.
    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Process name the helper runs under (`rclone`).
    pub fn process_name(&self) -> String {
        self.config
            .binary
            .file_stem()
            .map_or_else(|| "rclone".to_string(), |s| s.to_string_lossy().into_owned())
    }

    /// How this platform's helper is launched.
    pub fn launch_mode(&self) -> LaunchMode {
        match self.platform {
            PlatformKind::Posix => LaunchMode::Daemonizing,
            PlatformKind::Windows => LaunchMode::Foreground,
        }
    }

    /// Helper log file for a bucket.
    pub fn log_file(&self, key: &BucketKey) -> PathBuf {
        self.config.cache_dir.join(self.naming.log_file_name(key))
    }

    /// Arguments after the binary for a persistent (service-managed) mount.
    ///
    /// Same as an interactive mount, minus `--daemon`: service managers
    /// supervise the foreground process themselves.
    pub fn service_args(&self, key: &BucketKey, target: &MountTarget) -> Vec<String> {
        let mut args = vec![
            "mount".to_string(),
            self.naming.remote_spec(key),
            target.helper_arg(),
        ];
        args.extend(RELIABILITY_FLAGS.iter().map(|s| (*s).to_string()));
        args.extend([
            "--cache-dir".to_string(),
            self.config.cache_dir.to_string_lossy().into_owned(),
            "--config".to_string(),
            self.config.config_file.to_string_lossy().into_owned(),
        ]);
        match self.platform {
            PlatformKind::Posix => args.push("--allow-non-empty".to_string()),
            PlatformKind::Windows => args.extend([
                "--network-mode".to_string(),
                "--volname".to_string(),
                self.naming.volume_label(key),
            ]),
        }
        args
    }

    /// Full argument list for an interactive mount.
    pub fn mount_args(&self, key: &BucketKey, target: &MountTarget) -> Vec<String> {
        let mut args = self.service_args(key, target);
        args.extend([
            "--log-file".to_string(),
            self.log_file(key).to_string_lossy().into_owned(),
        ]);
        if self.launch_mode() == LaunchMode::Daemonizing {
            args.push("--daemon".to_string());
        }
        args
    }

    /// The mount command, with credentials in its environment only.
    pub fn mount_command(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        credential: &Credential,
    ) -> CommandSpec {
        CommandSpec::new(&self.config.binary)
            .args(self.mount_args(key, target))
            .envs(credential.env())
            .timeout(self.config.launch_timeout)
    }

    /// Verify the helper answers and the platform can mount.
    pub fn check_prerequisites(&self) -> Result<(), MountError> {
        let version = CommandSpec::new(&self.config.binary)
            .arg("--version")
            .timeout(self.config.version_timeout);
        match self.runner.run(&version) {
            Ok(out) if out.success() => {
                let first = out.stdout.lines().next().unwrap_or_default();
                tracing::debug!("Helper: {}", first);
            }
            Ok(out) => {
                return Err(MountError::PrerequisiteMissing(format!(
                    "{} --version failed ({}): {}",
                    self.config.binary.display(),
                    out.status_text(),
                    out.diagnostics()
                )));
            }
            Err(RunError::NotFound(_)) => {
                return Err(MountError::PrerequisiteMissing(
                    "rclone is not installed or not found in PATH".to_string(),
                ));
            }
            Err(RunError::TimedOut { .. }) => {
                return Err(MountError::PrerequisiteMissing(
                    "rclone is not responding".to_string(),
                ));
            }
            Err(e) => return Err(MountError::PrerequisiteMissing(e.to_string())),
        }

        match self.platform {
            PlatformKind::Posix => self.check_fuse(),
            PlatformKind::Windows => self.check_winfsp(),
        }
    }

    fn check_fuse(&self) -> Result<(), MountError> {
        if let Some(device) = &self.config.fuse_device
            && !device.exists()
        {
            return Err(MountError::PrerequisiteMissing(format!(
                "FUSE device {} is missing (is the fuse module loaded?)",
                device.display()
            )));
        }

        let has_fusermount = ["fusermount", "fusermount3"].iter().any(|tool| {
            let spec = CommandSpec::new(tool).arg("-V");
            !matches!(self.runner.run(&spec), Err(RunError::NotFound(_)))
        });
        if !has_fusermount {
            return Err(MountError::PrerequisiteMissing(
                "FUSE is not installed (install the fuse3 package)".to_string(),
            ));
        }
        Ok(())
    }

    fn check_winfsp(&self) -> Result<(), MountError> {
        let installed = [r"HKLM\SOFTWARE\WinFsp", r"HKLM\SOFTWARE\WOW6432Node\WinFsp"]
            .iter()
            .any(|key| {
                let spec = CommandSpec::new("reg").args(["query", key]);
                self.runner.run(&spec).is_ok_and(|out| out.success())
            });
        if !installed {
            return Err(MountError::PrerequisiteMissing(
                "WinFsp is not installed (download from https://winfsp.dev/rel/)".to_string(),
            ));
        }
        Ok(())
    }

    /// Start the helper for `key` on `target`.
    ///
    /// Returns once the helper has daemonized (or been spawned); the mount
    /// is not necessarily ready yet. A daemonizing launch waits at most the
    /// launch timeout and never past `deadline`.
    pub fn launch(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        credential: &Credential,
        deadline: Instant,
    ) -> Result<LaunchedHelper, MountError> {
        if let Err(e) = std::fs::create_dir_all(&self.config.cache_dir) {
            tracing::warn!(
                "Cannot create cache dir {}: {}",
                self.config.cache_dir.display(),
                e
            );
        }

        let budget = deadline.saturating_duration_since(Instant::now());
        let spec = self
            .mount_command(key, target, credential)
            .timeout(self.config.launch_timeout.min(budget));
        tracing::info!(bucket = %key, target = %target, "Launching helper: {}", spec.display());

        match self.launch_mode() {
            LaunchMode::Daemonizing => {
                // The daemonized child inherits stdio; capturing would wait on it forever
                let spec = spec.without_capture();
                match self.runner.run(&spec) {
                    Ok(out) if out.success() => Ok(LaunchedHelper { process: None }),
                    Ok(out) => Err(self.launch_failure(key, target, &out)),
                    Err(RunError::NotFound(name)) => Err(MountError::PrerequisiteMissing(
                        format!("{name} is not installed"),
                    )),
                    Err(RunError::TimedOut { timeout, .. }) => Err(MountError::MountTimeout {
                        bucket: key.bucket.clone(),
                        target: target.clone(),
                        timeout,
                    }),
                    Err(e) => Err(MountError::HelperFailed {
                        status: "not started".to_string(),
                        stderr: e.to_string(),
                    }),
                }
            }
            LaunchMode::Foreground => match self.runner.spawn_detached(&spec) {
                Ok(process) => {
                    tracing::debug!("Helper running as PID {}", process.pid);
                    Ok(LaunchedHelper {
                        process: Some(process),
                    })
                }
                Err(RunError::NotFound(name)) => Err(MountError::PrerequisiteMissing(format!(
                    "{name} is not installed"
                ))),
                Err(e) => Err(MountError::HelperFailed {
                    status: "not started".to_string(),
                    stderr: e.to_string(),
                }),
            },
        }
    }

    /// Turn a failed helper exit into an error, quoting its log.
    pub fn launch_failure(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        out: &CommandOutput,
    ) -> MountError {
        let mut diagnostics = out.diagnostics().to_string();
        if diagnostics.is_empty() {
            diagnostics = self.log_tail(key);
        }
        classify_helper_failure(target, &out.status_text(), &diagnostics)
    }

    /// Last lines of the helper log for `key`.
    pub fn log_tail(&self, key: &BucketKey) -> String {
        let Ok(contents) = std::fs::read_to_string(self.log_file(key)) else {
            return String::new();
        };
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Map helper diagnostics to the error taxonomy.
///
/// Messages saying the target is taken become [`MountError::TargetConflict`]
/// so the caller can retry elsewhere.
pub fn classify_helper_failure(target: &MountTarget, status: &str, diagnostics: &str) -> MountError {
    let lower = diagnostics.to_lowercase();
    let conflict = [
        "already mounted",
        "already in use",
        "mountpoint is not empty",
        "directory already mounted",
        "device or resource busy",
        "cannot find a free drive",
    ];
    if conflict.iter().any(|m| lower.contains(m)) {
        return MountError::TargetConflict {
            target: Some(target.clone()),
            reason: diagnostics.lines().last().unwrap_or(diagnostics).trim().to_string(),
        };
    }
    if lower.contains("fusermount: exec") || (lower.contains("winfsp") && lower.contains("not")) {
        return MountError::PrerequisiteMissing(diagnostics.trim().to_string());
    }
    MountError::HelperFailed {
        status: status.to_string(),
        stderr: diagnostics.trim().to_string(),
    }
}
