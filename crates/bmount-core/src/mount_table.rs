//! POSIX mount table parsing.
//!
//! The helper reports its remote spec (`haio_alice:photos`) as the
//! filesystem name, which makes the mount table the identity source for
//! directory targets.
//!
//! # Platform Differences
//!
//! - **Linux**: `/proc/mounts`, octal-escaped paths
//! - **macOS/BSD**: output of `mount`, `{fsname} on {path} ({fstype}, ...)`

use std::path::PathBuf;

/// One row of the system mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMount {
    /// Mount point path
    pub mountpoint: PathBuf,
    /// Filesystem type (`fuse.rclone`, `macfuse`, ...)
    pub fstype: String,
    /// Filesystem name / device (the helper's remote spec for our mounts)
    pub fsname: String,
}

impl SystemMount {
    /// Whether this is a FUSE-backed mount.
    pub fn is_fuse(&self) -> bool {
        let fstype = self.fstype.to_lowercase();
        fstype == "fuse"
            || fstype.starts_with("fuse.")
            || fstype == "fuseblk"
            || fstype == "macfuse"
            || fstype == "osxfuse"
    }
}

/// Parse the contents of `/proc/mounts` (or `/etc/mtab`).
///
/// Format: `{device} {mountpoint} {fstype} {options} {dump} {pass}`
pub fn parse_proc_mounts(contents: &str) -> Vec<SystemMount> {
    contents.lines().filter_map(parse_proc_mount_line).collect()
}

fn parse_proc_mount_line(line: &str) -> Option<SystemMount> {
    let mut parts = line.split_whitespace();
    let fsname = unescape_mount_path(parts.next()?);
    let mountpoint = PathBuf::from(unescape_mount_path(parts.next()?));
    let fstype = parts.next()?.to_string();

    Some(SystemMount {
        mountpoint,
        fstype,
        fsname,
    })
}

/// Parse BSD-style `mount` output.
///
/// Format: `{fsname} on {mountpoint} ({fstype}, {options...})`
pub fn parse_mount_output(stdout: &str) -> Vec<SystemMount> {
    stdout.lines().filter_map(parse_mount_output_line).collect()
}

fn parse_mount_output_line(line: &str) -> Option<SystemMount> {
    let on_idx = line.find(" on ")?;
    let fsname = line[..on_idx].to_string();

    let rest = &line[on_idx + 4..];
    // Paths may contain " (", so split on the last one
    let paren_idx = rest.rfind(" (")?;
    let mountpoint = PathBuf::from(&rest[..paren_idx]);

    let opts = rest[paren_idx + 2..].trim_end_matches(')');
    let fstype = opts.split(',').next()?.trim().to_string();

    Some(SystemMount {
        mountpoint,
        fstype,
        fsname,
    })
}

/// Undo the octal escapes `/proc/mounts` applies to whitespace and
/// backslashes (`\040` space, `\011` tab, `\012` newline, `\134` backslash).
pub fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
