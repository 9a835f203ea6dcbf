//! Mount targets: the local resource a bucket is mounted onto.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::platform::PlatformKind;

/// Drive letters never handed out (floppy and system drives).
pub const RESERVED_DRIVE_LETTERS: &[char] = &['A', 'B', 'C'];

/// A platform-specific mount location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountTarget {
    /// A directory (POSIX)
    Directory(PathBuf),
    /// A single drive letter, stored upper-case (Windows)
    Drive(char),
}

impl MountTarget {
    /// Build a drive target, normalizing the letter.
    ///
    /// Returns `None` for anything that is not an ASCII letter.
    pub fn drive(letter: char) -> Option<Self> {
        letter
            .is_ascii_alphabetic()
            .then(|| MountTarget::Drive(letter.to_ascii_uppercase()))
    }

    /// Parse user input such as `Z`, `Z:`, `z:\` or a directory path.
    ///
    /// Drive letters only exist on Windows; elsewhere every input is a
    /// directory, so a directory named `z` stays one.
    pub fn parse(input: &str, platform: PlatformKind) -> Self {
        if platform == PlatformKind::Posix {
            return MountTarget::Directory(PathBuf::from(input));
        }
        let trimmed = input.trim_end_matches(['\\', '/']);
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(letter), None, None) | (Some(letter), Some(':'), None)
                if letter.is_ascii_alphabetic() =>
            {
                MountTarget::Drive(letter.to_ascii_uppercase())
            }
            _ => MountTarget::Directory(PathBuf::from(input)),
        }
    }

    /// Path used for filesystem probes (`Z:\` for drives).
    pub fn probe_path(&self) -> PathBuf {
        match self {
            MountTarget::Directory(path) => path.clone(),
            MountTarget::Drive(letter) => PathBuf::from(format!("{letter}:\\")),
        }
    }

    /// Argument form handed to the helper and to unmount commands (`Z:` for drives).
    pub fn helper_arg(&self) -> String {
        match self {
            MountTarget::Directory(path) => path.to_string_lossy().into_owned(),
            MountTarget::Drive(letter) => format!("{letter}:"),
        }
    }

    /// The directory, if this is a directory target.
    pub fn as_dir(&self) -> Option<&Path> {
        match self {
            MountTarget::Directory(path) => Some(path),
            MountTarget::Drive(_) => None,
        }
    }

    /// Whether this target is a drive letter.
    pub fn is_drive(&self) -> bool {
        matches!(self, MountTarget::Drive(_))
    }
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountTarget::Directory(path) => write!(f, "{}", path.display()),
            MountTarget::Drive(letter) => write!(f, "{letter}:"),
        }
    }
}

/// All drive letters eligible for allocation, in ascending order.
pub fn assignable_drive_letters() -> Vec<MountTarget> {
    ('A'..='Z')
        .filter(|c| !RESERVED_DRIVE_LETTERS.contains(c))
        .map(MountTarget::Drive)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drive_forms() {
        assert_eq!(MountTarget::parse("z", PlatformKind::Windows), MountTarget::Drive('Z'));
        assert_eq!(MountTarget::parse("Z:", PlatformKind::Windows), MountTarget::Drive('Z'));
        assert_eq!(MountTarget::parse("Z:\\", PlatformKind::Windows), MountTarget::Drive('Z'));
    }

    #[test]
    fn test_parse_directory() {
        assert_eq!(
            MountTarget::parse("/home/alice/haio-alice-photos", PlatformKind::Posix),
            MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-photos"))
        );
        // Two-letter names are directories, not drives
        assert_eq!(
            MountTarget::parse("zz", PlatformKind::Windows),
            MountTarget::Directory(PathBuf::from("zz"))
        );
    }

    #[test]
    fn test_single_letter_is_a_directory_on_posix() {
        for input in ["z", "Z:"] {
            assert_eq!(
                MountTarget::parse(input, PlatformKind::Posix),
                MountTarget::Directory(PathBuf::from(input))
            );
        }
    }

    #[test]
    fn test_display_and_helper_arg() {
        let drive = MountTarget::Drive('Q');
        assert_eq!(drive.to_string(), "Q:");
        assert_eq!(drive.helper_arg(), "Q:");
        assert_eq!(drive.probe_path(), PathBuf::from("Q:\\"));
    }

    #[test]
    fn test_assignable_letters_skip_reserved() {
        let letters = assignable_drive_letters();
        assert_eq!(letters.first(), Some(&MountTarget::Drive('D')));
        assert_eq!(letters.last(), Some(&MountTarget::Drive('Z')));
        assert_eq!(letters.len(), 23);
    }

    #[test]
    fn test_drive_constructor_rejects_non_letters() {
        assert_eq!(MountTarget::drive('e'), Some(MountTarget::Drive('E')));
        assert_eq!(MountTarget::drive('1'), None);
    }
}
