//! Target health classification.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::probe::{Listing, SystemProbe};
use crate::target::MountTarget;

/// Health of a mount target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    /// Nothing exists at the target
    Absent,
    /// A plain directory, nothing mounted on it
    Unmounted,
    /// Mounted and a listing succeeds
    Healthy,
    /// Mounted at the OS level but listing fails (helper died without
    /// cleaning up)
    Stale,
}

impl TargetHealth {
    /// Whether a stale entry must be detached before reusing the target.
    pub fn needs_cleanup(self) -> bool {
        self == TargetHealth::Stale
    }
}

/// Errors that only a dead FUSE connection produces.
const DEAD_CONNECTION_MARKERS: &[&str] = &[
    "transport endpoint is not connected",
    "socket is not connected",
    "software caused connection abort",
    "the network path was not found",
    "the specified network name is no longer available",
];

/// Classifies targets by probing them.
pub struct StaleMountDetector {
    probe: Arc<dyn SystemProbe>,
    timeout: Duration,
}

impl StaleMountDetector {
    /// Create a detector whose listings give up after `timeout`.
    pub fn new(probe: Arc<dyn SystemProbe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    /// Classify a target from the live OS state.
    pub fn classify(&self, target: &MountTarget) -> TargetHealth {
        let mounted = self.probe.is_mount_point(target);
        if !mounted && !self.probe.exists(target) {
            return TargetHealth::Absent;
        }

        let health = match self.probe.list(target, self.timeout) {
            Listing::Readable { .. } if mounted => TargetHealth::Healthy,
            Listing::Readable { .. } => TargetHealth::Unmounted,
            Listing::Missing if mounted => TargetHealth::Stale,
            Listing::Missing => TargetHealth::Absent,
            Listing::TimedOut if mounted => TargetHealth::Stale,
            Listing::Failed(ref reason) if mounted || is_dead_connection(reason) => {
                TargetHealth::Stale
            }
            // A directory we cannot read but nothing is mounted on
            Listing::Failed(_) | Listing::TimedOut => TargetHealth::Unmounted,
        };

        if health == TargetHealth::Stale {
            tracing::warn!("Stale mount detected at {}", target);
        }
        health
    }
}

/// Whether an error message comes from a dead FUSE/network connection.
pub fn is_dead_connection(message: &str) -> bool {
    let lower = message.to_lowercase();
    DEAD_CONNECTION_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::path::PathBuf;

    fn detector(host: &Arc<FakeHost>) -> StaleMountDetector {
        StaleMountDetector::new(host.clone(), Duration::from_millis(100))
    }

    #[test]
    fn test_absent() {
        let host = Arc::new(FakeHost::posix());
        let target = MountTarget::Directory(PathBuf::from("/home/a/haio-a-x"));
        assert_eq!(detector(&host).classify(&target), TargetHealth::Absent);
    }

    #[test]
    fn test_plain_directory_is_unmounted() {
        let host = Arc::new(FakeHost::posix());
        host.add_directory("/home/a/haio-a-x", &[]);
        let target = MountTarget::Directory(PathBuf::from("/home/a/haio-a-x"));
        assert_eq!(detector(&host).classify(&target), TargetHealth::Unmounted);
    }

    #[test]
    fn test_live_mount_is_healthy_and_dead_is_stale() {
        let host = Arc::new(FakeHost::posix());
        let target = MountTarget::Directory(PathBuf::from("/home/a/haio-a-x"));
        host.add_foreign_volume(target.clone(), Some("haio_a:x"));
        assert_eq!(detector(&host).classify(&target), TargetHealth::Healthy);

        host.make_stale(&target);
        assert_eq!(detector(&host).classify(&target), TargetHealth::Stale);
        assert!(TargetHealth::Stale.needs_cleanup());
    }

    #[test]
    fn test_dead_connection_markers() {
        assert!(is_dead_connection(
            "Transport endpoint is not connected (os error 107)"
        ));
        assert!(!is_dead_connection("Permission denied (os error 13)"));
    }
}
