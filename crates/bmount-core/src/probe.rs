//! Side-effect-free queries against the live OS mount state.
//!
//! Nothing here is cached: every call re-reads the mount table, the volume
//! information or the directory, so several manager instances (or a restart)
//! never disagree about what is mounted.
//!
//! Filesystem probes run on a bounded pool of helper threads with a
//! timeout, because any operation on a dead FUSE mount can block
//! indefinitely.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bounded_pool::BOUNDED_FS_POOL;
use crate::mount_table::{self, SystemMount};
use crate::process::{CommandRunner, CommandSpec};
use crate::target::{MountTarget, assignable_drive_letters};

/// Timeout for reading the mount table or querying volume information.
pub const TABLE_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of trying to list a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// The listing succeeded
    Readable {
        /// No entries were returned
        empty: bool,
    },
    /// Nothing exists at the target
    Missing,
    /// The target exists but listing failed
    Failed(String),
    /// Listing did not return in time
    TimedOut,
}

/// A mounted volume and its identity marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Where it is mounted
    pub target: MountTarget,
    /// Identity marker (fsname or volume label), if readable
    pub identity: Option<String>,
}

/// Read-only view of the OS mount state.
pub trait SystemProbe: Send + Sync {
    /// Whether something occupies the target (directory or drive exists,
    /// including dead mounts whose root can no longer be stat'ed).
    fn exists(&self, target: &MountTarget) -> bool;

    /// Whether the OS reports a mount at exactly this target.
    fn is_mount_point(&self, target: &MountTarget) -> bool;

    /// Identity marker of the mount at this target, `None` if nothing is
    /// mounted or the marker cannot be read.
    fn identity(&self, target: &MountTarget) -> Option<String>;

    /// Every mounted volume the probe can see.
    fn mounted(&self) -> Vec<MountedVolume>;

    /// Try to list the target within `timeout`.
    fn list(&self, target: &MountTarget, timeout: Duration) -> Listing;
}

/// List a directory on a pooled helper thread.
///
/// A hung thread is left behind when the mount is wedged; the kernel will
/// release it once the mount is detached.
pub fn list_with_timeout(path: &Path, timeout: Duration) -> Listing {
    let path = path.to_path_buf();
    let result = BOUNDED_FS_POOL.run_with_timeout(timeout, move || {
        let mut entries = std::fs::read_dir(&path)?;
        match entries.next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e),
        }
    });

    match result {
        Ok(empty) => Listing::Readable { empty },
        Err(e) if e.kind() == ErrorKind::NotFound => Listing::Missing,
        Err(e) if e.kind() == ErrorKind::TimedOut => Listing::TimedOut,
        Err(e) => Listing::Failed(e.to_string()),
    }
}

/// Check path presence on a pooled helper thread.
///
/// Errors other than `NotFound` (e.g. "transport endpoint is not
/// connected") mean something is there.
pub fn path_present(path: &Path, timeout: Duration) -> bool {
    let path = path.to_path_buf();
    match BOUNDED_FS_POOL.run_with_timeout(timeout, move || std::fs::symlink_metadata(&path)) {
        Ok(_) => true,
        // A stat that hangs is a wedged mount, which is present
        Err(e) => e.kind() != ErrorKind::NotFound,
    }
}

/// Where a [`PosixProbe`] reads the mount table from.
#[derive(Debug, Clone)]
pub enum MountTableSource {
    /// A file in `/proc/mounts` format
    File(PathBuf),
    /// Output of the `mount` command
    MountCommand,
}

impl Default for MountTableSource {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            MountTableSource::File(PathBuf::from("/proc/mounts"))
        } else {
            MountTableSource::MountCommand
        }
    }
}

/// Probe for directory targets backed by the system mount table.
pub struct PosixProbe {
    runner: Arc<dyn CommandRunner>,
    source: MountTableSource,
}

impl PosixProbe {
    /// Probe using the platform's default mount table source.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_source(runner, MountTableSource::default())
    }

    /// Probe using an explicit mount table source.
    pub fn with_source(runner: Arc<dyn CommandRunner>, source: MountTableSource) -> Self {
        Self { runner, source }
    }

    /// Current mount table; empty if it cannot be read.
    pub fn system_mounts(&self) -> Vec<SystemMount> {
        match &self.source {
            MountTableSource::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => mount_table::parse_proc_mounts(&contents),
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            MountTableSource::MountCommand => {
                // `mount` can block on ghost mounts; the runner kills it on timeout
                let spec = CommandSpec::new("mount").timeout(TABLE_QUERY_TIMEOUT);
                match self.runner.run(&spec) {
                    Ok(out) if out.success() => mount_table::parse_mount_output(&out.stdout),
                    Ok(out) => {
                        tracing::warn!("mount exited with {}", out.status_text());
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::warn!("Mount table unavailable: {}", e);
                        Vec::new()
                    }
                }
            }
        }
    }

    fn entry_for(&self, path: &Path) -> Option<SystemMount> {
        // Later entries shadow earlier ones at the same mount point
        self.system_mounts()
            .into_iter()
            .rev()
            .find(|m| m.mountpoint == path)
    }
}

impl SystemProbe for PosixProbe {
    fn exists(&self, target: &MountTarget) -> bool {
        match target.as_dir() {
            Some(dir) => path_present(dir, TABLE_QUERY_TIMEOUT) || self.is_mount_point(target),
            None => false,
        }
    }

    fn is_mount_point(&self, target: &MountTarget) -> bool {
        target
            .as_dir()
            .is_some_and(|dir| self.entry_for(dir).is_some())
    }

    fn identity(&self, target: &MountTarget) -> Option<String> {
        self.entry_for(target.as_dir()?).map(|m| m.fsname)
    }

    fn mounted(&self) -> Vec<MountedVolume> {
        self.system_mounts()
            .into_iter()
            .filter(SystemMount::is_fuse)
            .map(|m| MountedVolume {
                target: MountTarget::Directory(m.mountpoint),
                identity: Some(m.fsname),
            })
            .collect()
    }

    fn list(&self, target: &MountTarget, timeout: Duration) -> Listing {
        match target.as_dir() {
            Some(dir) => list_with_timeout(dir, timeout),
            None => Listing::Missing,
        }
    }
}

/// How a [`WindowsProbe`] reads volume labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeInfoSource {
    /// `GetVolumeInformationW`
    Native,
    /// Parse `cmd /C vol X:`; used only where the native call is unavailable
    VolCommand,
}

/// Probe for drive-letter targets.
///
/// Volume labels come from the native volume-information API. The `vol`
/// command is a fallback for builds where that API cannot be called, never a
/// second opinion: a wrong label claims the wrong bucket.
pub struct WindowsProbe {
    runner: Arc<dyn CommandRunner>,
    source: VolumeInfoSource,
}

impl WindowsProbe {
    /// Probe using the best available label source for this build.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let source = if cfg!(windows) {
            VolumeInfoSource::Native
        } else {
            VolumeInfoSource::VolCommand
        };
        Self { runner, source }
    }

    /// Label source in use.
    pub fn source(&self) -> VolumeInfoSource {
        self.source
    }

    fn label_from_vol(&self, letter: char) -> Option<String> {
        let spec = CommandSpec::new("cmd")
            .args(["/C", "vol", &format!("{letter}:")])
            .timeout(TABLE_QUERY_TIMEOUT);
        let out = self.runner.run(&spec).ok()?;
        if !out.success() {
            return None;
        }
        parse_vol_label(&out.stdout)
    }
}

impl SystemProbe for WindowsProbe {
    fn exists(&self, target: &MountTarget) -> bool {
        match target {
            MountTarget::Drive(letter) => drive_present(*letter)
                .unwrap_or_else(|| path_present(&target.probe_path(), TABLE_QUERY_TIMEOUT)),
            MountTarget::Directory(_) => false,
        }
    }

    fn is_mount_point(&self, target: &MountTarget) -> bool {
        self.exists(target)
    }

    fn identity(&self, target: &MountTarget) -> Option<String> {
        let MountTarget::Drive(letter) = target else {
            return None;
        };
        match self.source {
            VolumeInfoSource::Native => native_volume_label(*letter),
            VolumeInfoSource::VolCommand => self.label_from_vol(*letter),
        }
    }

    fn mounted(&self) -> Vec<MountedVolume> {
        assignable_drive_letters()
            .into_iter()
            .filter(|t| self.exists(t))
            .map(|target| MountedVolume {
                identity: self.identity(&target),
                target,
            })
            .collect()
    }

    fn list(&self, target: &MountTarget, timeout: Duration) -> Listing {
        match target {
            MountTarget::Drive(_) => list_with_timeout(&target.probe_path(), timeout),
            MountTarget::Directory(_) => Listing::Missing,
        }
    }
}

/// Extract the label from `vol` output (`Volume in drive Z is LABEL`).
///
/// Returns `None` for unlabeled volumes (`Volume in drive Z has no label.`).
pub fn parse_vol_label(stdout: &str) -> Option<String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Volume in drive"))?;
    let (_, label) = line.split_once(" is ")?;
    let label = label.trim();
    (!label.is_empty()).then(|| label.to_string())
}

#[cfg(windows)]
fn drive_present(letter: char) -> Option<bool> {
    use windows::Win32::Storage::FileSystem::GetLogicalDrives;

    let index = u32::from(letter.to_ascii_uppercase()).checked_sub(u32::from('A'))?;
    // SAFETY: GetLogicalDrives takes no arguments and returns a bitmask.
    let mask = unsafe { GetLogicalDrives() };
    if mask == 0 {
        return None;
    }
    Some(mask & (1 << index) != 0)
}

#[cfg(not(windows))]
fn drive_present(_letter: char) -> Option<bool> {
    None
}

#[cfg(windows)]
fn native_volume_label(letter: char) -> Option<String> {
    use windows::Win32::Storage::FileSystem::GetVolumeInformationW;
    use windows::core::PCWSTR;

    let root: Vec<u16> = format!("{letter}:\\")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut label = [0u16; 261];

    // SAFETY: `root` is NUL-terminated and outlives the call; `label` is a
    // writable buffer whose length is passed via the slice.
    let result = unsafe {
        GetVolumeInformationW(
            PCWSTR(root.as_ptr()),
            Some(&mut label),
            None,
            None,
            None,
            None,
        )
    };
    if let Err(e) = result {
        tracing::debug!("GetVolumeInformationW({}:) failed: {}", letter, e);
        return None;
    }

    let len = label.iter().position(|&c| c == 0).unwrap_or(label.len());
    let label = String::from_utf16_lossy(&label[..len]);
    (!label.is_empty()).then_some(label)
}

#[cfg(not(windows))]
fn native_volume_label(_letter: char) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemRunner;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_list_empty_and_non_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            list_with_timeout(dir.path(), Duration::from_secs(1)),
            Listing::Readable { empty: true }
        );

        fs::write(dir.path().join("file"), b"x").unwrap();
        assert_eq!(
            list_with_timeout(dir.path(), Duration::from_secs(1)),
            Listing::Readable { empty: false }
        );
    }

    #[test]
    fn test_list_missing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            list_with_timeout(&dir.path().join("nope"), Duration::from_secs(1)),
            Listing::Missing
        );
        assert!(!path_present(&dir.path().join("nope"), Duration::from_secs(1)));
        assert!(path_present(dir.path(), Duration::from_secs(1)));
    }

    #[test]
    fn test_posix_probe_reads_table_file() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("mounts");
        let mountpoint = dir.path().join("haio-alice-photos");
        fs::create_dir(&mountpoint).unwrap();
        fs::write(
            &table,
            format!(
                "haio_alice:photos {} fuse.rclone rw 0 0\n",
                mountpoint.display()
            ),
        )
        .unwrap();

        let probe = PosixProbe::with_source(
            Arc::new(SystemRunner::new()),
            MountTableSource::File(table),
        );
        let target = MountTarget::Directory(mountpoint);

        assert!(probe.is_mount_point(&target));
        assert_eq!(probe.identity(&target).as_deref(), Some("haio_alice:photos"));
        assert_eq!(probe.mounted().len(), 1);

        let other = MountTarget::Directory(dir.path().join("elsewhere"));
        assert!(!probe.is_mount_point(&other));
        assert!(!probe.exists(&other));
        assert_eq!(probe.identity(&other), None);
    }

    #[test]
    fn test_parse_vol_label() {
        let labeled = "\r\n Volume in drive Z is haio-alice-photos\r\n Volume Serial Number is 1234-ABCD\r\n";
        assert_eq!(parse_vol_label(labeled).as_deref(), Some("haio-alice-photos"));

        let unlabeled = " Volume in drive D has no label.\r\n";
        assert_eq!(parse_vol_label(unlabeled), None);
    }
}
