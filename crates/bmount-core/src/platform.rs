//! Platform selection and the host services the manager is built from.
//!
//! The platform is decided once, when the manager is assembled. Everything
//! platform-specific (target pool, probe, launch mode, unmount ladder,
//! service backend) is chosen there; nothing branches on the OS afterwards.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::probe::{PosixProbe, SystemProbe, WindowsProbe};
use crate::process::{CommandRunner, SystemRunner};
use crate::processes::{ProcessTable, SystemProcesses};

/// Which family of mount mechanics applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// FUSE mounts on directories, systemd auto-mount
    Posix,
    /// WinFsp drive letters, Task Scheduler auto-mount
    Windows,
}

impl PlatformKind {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            PlatformKind::Windows
        } else {
            PlatformKind::Posix
        }
    }

    /// File name of the helper executable.
    pub fn helper_file_name(self) -> &'static str {
        match self {
            PlatformKind::Posix => "rclone",
            PlatformKind::Windows => "rclone.exe",
        }
    }
}

/// Creating and removing mount-point directories.
///
/// Only directory targets are ever touched; drive letters need no
/// preparation.
pub trait TargetDirs: Send + Sync {
    /// Create the directory and its parents.
    fn create(&self, dir: &Path) -> io::Result<()>;

    /// Remove the directory if it is empty. Returns whether it was removed.
    fn remove_if_empty(&self, dir: &Path) -> io::Result<bool>;
}

/// Mount-point directories on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDirs;

impl TargetDirs for LocalDirs {
    fn create(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }

    fn remove_if_empty(&self, dir: &Path) -> io::Result<bool> {
        match std::fs::remove_dir(dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// The OS-facing services a manager runs on.
#[derive(Clone)]
pub struct HostServices {
    /// Command execution
    pub runner: Arc<dyn CommandRunner>,
    /// Live mount state
    pub probe: Arc<dyn SystemProbe>,
    /// Process enumeration and termination
    pub processes: Arc<dyn ProcessTable>,
    /// Mount-point directories
    pub dirs: Arc<dyn TargetDirs>,
}

impl HostServices {
    /// Services backed by the real host.
    pub fn system(platform: PlatformKind) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let probe: Arc<dyn SystemProbe> = match platform {
            PlatformKind::Posix => Arc::new(PosixProbe::new(runner.clone())),
            PlatformKind::Windows => Arc::new(WindowsProbe::new(runner.clone())),
        };
        Self {
            processes: Arc::new(SystemProcesses::new(runner.clone())),
            probe,
            runner,
            dirs: Arc::new(LocalDirs),
        }
    }

    /// Every service from one object (a simulated host in tests).
    pub fn shared<T>(host: Arc<T>) -> Self
    where
        T: CommandRunner + SystemProbe + ProcessTable + TargetDirs + 'static,
    {
        Self {
            runner: host.clone(),
            probe: host.clone(),
            processes: host.clone(),
            dirs: host,
        }
    }
}

/// Login name of the calling user, written into service definitions.
#[cfg(unix)]
pub fn current_os_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
}

/// Login name of the calling user, written into service definitions.
#[cfg(not(unix))]
pub fn current_os_user() -> Option<String> {
    std::env::var("USERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_helper_file_names() {
        assert_eq!(PlatformKind::Posix.helper_file_name(), "rclone");
        assert_eq!(PlatformKind::Windows.helper_file_name(), "rclone.exe");
    }

    #[test]
    fn test_local_dirs_remove_only_empty() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("haio-a-b");
        LocalDirs.create(&dir).unwrap();
        std::fs::write(dir.join("keep"), b"x").unwrap();

        assert!(!LocalDirs.remove_if_empty(&dir).unwrap());
        std::fs::remove_file(dir.join("keep")).unwrap();
        assert!(LocalDirs.remove_if_empty(&dir).unwrap());
        assert!(!LocalDirs.remove_if_empty(&dir).unwrap());
    }
}
