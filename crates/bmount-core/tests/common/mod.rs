//! Shared harness for manager scenario tests.
//!
//! Builds a [`MountLifecycleManager`] over a [`FakeHost`] with short
//! timeouts, a throwaway cache directory (the simulated helper writes its log
//! there) and a throwaway systemd unit directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bmount_core::testing::FakeHost;
use bmount_core::{
    BucketKey, HostServices, MountLifecycleManager, MountTarget, PlatformKind, Settings,
};
use tempfile::TempDir;

/// Home directory the POSIX pool lives under.
pub const HOME: &str = "/home/alice";

pub struct Harness {
    pub host: Arc<FakeHost>,
    pub manager: Arc<MountLifecycleManager>,
    pub tmp: TempDir,
}

impl Harness {
    pub fn posix() -> Self {
        Self::build(PlatformKind::Posix, |_| {})
    }

    pub fn windows() -> Self {
        Self::build(PlatformKind::Windows, |_| {})
    }

    /// A harness whose settings were adjusted by `tweak`.
    pub fn build(platform: PlatformKind, tweak: impl FnOnce(&mut Settings)) -> Self {
        let host = Arc::new(match platform {
            PlatformKind::Posix => FakeHost::posix(),
            PlatformKind::Windows => FakeHost::windows(),
        });
        let tmp = TempDir::new().expect("temp dir");

        let mut settings = Settings::default();
        settings.mount.base_dir = Some(PathBuf::from(HOME));
        settings.mount.readiness_timeout = Duration::from_millis(300);
        settings.mount.poll_interval = Duration::from_millis(10);
        settings.mount.probe_timeout = Duration::from_millis(50);
        settings.mount.unmount_step_timeout = Duration::from_millis(200);
        // Never pick up a real rclone from PATH
        settings.helper.path = Some(tmp.path().join("not-installed").join("rclone"));
        settings.helper.config_file = Some(tmp.path().join("rclone.conf"));
        settings.helper.cache_dir = Some(tmp.path().join("cache"));
        settings.helper.check_fuse_device = false;
        settings.autostart.unit_dir = tmp.path().join("units");
        std::fs::create_dir_all(&settings.autostart.unit_dir).expect("unit dir");
        tweak(&mut settings);

        let manager =
            MountLifecycleManager::for_platform(platform, &settings, HostServices::shared(host.clone()))
                .expect("manager");

        Self {
            host,
            manager: Arc::new(manager),
            tmp,
        }
    }

    pub fn unit_file(&self, bucket: &str) -> PathBuf {
        self.tmp
            .path()
            .join("units")
            .join(format!("haio-alice-{bucket}.service"))
    }
}

pub fn key(bucket: &str) -> BucketKey {
    BucketKey::new("alice", bucket).expect("valid bucket")
}

/// Conventional POSIX directory of a bucket.
pub fn home_dir(bucket: &str) -> MountTarget {
    MountTarget::Directory(PathBuf::from(format!("{HOME}/haio-alice-{bucket}")))
}
