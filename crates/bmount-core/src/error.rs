//! Error types for mount lifecycle operations.
//!
//! Every failure crosses the library boundary as a [`MountError`]. The first
//! five variants are the operational taxonomy callers are expected to branch
//! on; the rest describe input and plumbing failures.

use std::time::Duration;

use thiserror::Error;

use crate::target::MountTarget;

/// Errors returned by mount, unmount and auto-mount operations.
#[derive(Error, Debug)]
pub enum MountError {
    /// The helper tool or the platform mounting subsystem is absent.
    ///
    /// Fatal to the operation and never retried.
    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// The target is already in legitimate use by something else, or no
    /// free target is left in the pool.
    #[error("{}", describe_conflict(.target.as_ref(), .reason))]
    TargetConflict {
        /// The contested target, if one was chosen
        target: Option<MountTarget>,
        /// What occupies it
        reason: String,
    },

    /// The helper ran but the target never passed an access probe.
    #[error("Mount of '{bucket}' at {target} was not ready after {}s", .timeout.as_secs())]
    MountTimeout {
        /// Bucket being mounted
        bucket: String,
        /// Target that was polled
        target: MountTarget,
        /// How long readiness was awaited
        timeout: Duration,
    },

    /// Every unmount strategy failed. The mount is left as it was.
    #[error("{target} is busy. Close applications using it and try again.{}", describe_holders(.holders))]
    UnmountBusy {
        /// The busy target
        target: MountTarget,
        /// Names of processes seen holding the target open
        holders: Vec<String>,
    },

    /// Creating or removing the auto-mount record failed.
    #[error("Auto-mount registration '{service}' failed: {reason}")]
    ServiceRegistrationFailed {
        /// Unit or task name
        service: String,
        /// Why the OS refused
        reason: ServiceFailure,
    },

    /// The helper process exited with an error before the mount came up.
    #[error("Mount helper exited with {status}: {stderr}")]
    HelperFailed {
        /// Exit status description
        status: String,
        /// Captured diagnostics
        stderr: String,
    },

    /// The bucket or user name cannot be turned into a target. Carries the
    /// full description.
    #[error("{0}")]
    InvalidBucket(String),

    /// Settings could not be loaded or are inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local filesystem failure while preparing or cleaning a target.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons an auto-mount registration can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceFailure {
    /// The OS refused for lack of privilege and no elevation was requested.
    #[error("administrator rights are required; retry with elevation")]
    ElevationRequired,

    /// Elevation was requested but declined or the password was wrong.
    #[error("elevation was declined")]
    ElevationDeclined,

    /// A service-manager command failed.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Its diagnostics
        stderr: String,
    },

    /// The operation reported success but the OS shows a different state.
    #[error("service manager reports enabled={observed} after the change")]
    StateMismatch {
        /// What the re-query returned
        observed: bool,
    },

    /// This host has no supported service manager.
    #[error("auto-mount is not supported on this system")]
    Unsupported,
}

impl MountError {
    /// Stable numeric code for this error kind.
    ///
    /// Codes are part of the public contract and do not change between
    /// releases.
    pub fn code(&self) -> u8 {
        match self {
            MountError::PrerequisiteMissing(_) => 10,
            MountError::TargetConflict { .. } => 11,
            MountError::MountTimeout { .. } => 12,
            MountError::UnmountBusy { .. } => 13,
            MountError::ServiceRegistrationFailed { .. } => 14,
            MountError::HelperFailed { .. } => 15,
            MountError::InvalidBucket(_) => 16,
            MountError::Config(_) => 17,
            MountError::Io(_) => 18,
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MountError::TargetConflict { .. }
                | MountError::MountTimeout { .. }
                | MountError::UnmountBusy { .. }
                | MountError::HelperFailed { .. }
        )
    }

    pub(crate) fn service(service: impl Into<String>, reason: ServiceFailure) -> Self {
        MountError::ServiceRegistrationFailed {
            service: service.into(),
            reason,
        }
    }
}

fn describe_conflict(target: Option<&MountTarget>, reason: &str) -> String {
    match target {
        Some(target) => format!("Mount target {target} is in use: {reason}"),
        None => format!("No mount target available: {reason}"),
    }
}

fn describe_holders(holders: &[String]) -> String {
    if holders.is_empty() {
        String::new()
    } else {
        format!(" In use by: {}", holders.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            MountError::PrerequisiteMissing("rclone".into()),
            MountError::TargetConflict {
                target: None,
                reason: "pool exhausted".into(),
            },
            MountError::MountTimeout {
                bucket: "b".into(),
                target: MountTarget::Drive('Z'),
                timeout: Duration::from_secs(1),
            },
            MountError::UnmountBusy {
                target: MountTarget::Drive('Z'),
                holders: vec![],
            },
            MountError::service("x", ServiceFailure::Unsupported),
            MountError::HelperFailed {
                status: "exit 1".into(),
                stderr: String::new(),
            },
            MountError::InvalidBucket("..".into()),
            MountError::Config("bad".into()),
            MountError::Io(std::io::Error::other("boom")),
        ];

        let mut codes: Vec<u8> = errors.iter().map(MountError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_unmount_busy_message_is_actionable() {
        let err = MountError::UnmountBusy {
            target: MountTarget::Directory(PathBuf::from("/home/a/haio-a-logs")),
            holders: vec!["vim".into(), "bash".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Close applications using it"));
        assert!(msg.contains("vim, bash"));
    }

    #[test]
    fn test_conflict_without_target() {
        let err = MountError::TargetConflict {
            target: None,
            reason: "all drive letters are taken".into(),
        };
        assert_eq!(
            err.to_string(),
            "No mount target available: all drive letters are taken"
        );
    }
}
