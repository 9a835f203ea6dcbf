#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::file_serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A throwaway config directory whose settings keep every path inside it.
struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        let env = Self {
            dir: TempDir::new().expect("Failed to create config dir"),
        };
        let base = env.base_dir();
        std::fs::create_dir_all(&base).expect("Failed to create base dir");
        env.write_config(&format!(
            r#"
[helper]
path = "{root}/not-installed/rclone"
config_file = "{root}/rclone.conf"
cache_dir = "{root}/cache"
check_fuse_device = false

[mount]
base_dir = "{base}"
readiness_timeout = "1s"
poll_interval = "50ms"

[autostart]
unit_dir = "{root}/units"
"#,
            root = toml_path(env.dir.path()),
            base = toml_path(&base),
        ));
        env
    }

    fn base_dir(&self) -> PathBuf {
        self.dir.path().join("buckets")
    }

    fn write_config(&self, content: &str) {
        std::fs::write(self.dir.path().join("config.toml"), content)
            .expect("Failed to write config");
    }

    fn bmount(&self) -> Command {
        let mut cmd = bmount();
        cmd.env("BMOUNT_CONFIG_DIR", self.dir.path());
        cmd
    }
}

fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\")
}

fn bmount() -> Command {
    let mut cmd = Command::cargo_bin("bmount").unwrap();
    cmd.env_remove("BMOUNT_USER");
    cmd.env_remove("RUST_LOG");
    cmd
}

// ============================================================================
// Basic CLI tests
// ============================================================================

#[test]
fn test_help() {
    bmount()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Mount object-storage buckets as local filesystems",
        ))
        .stdout(predicate::str::contains("mount"))
        .stdout(predicate::str::contains("unmount"))
        .stdout(predicate::str::contains("auto-mount"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("BMOUNT_CRED_"));
}

#[test]
fn test_login_entry_point_is_hidden() {
    bmount()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("auto-mount-run").not());

    bmount()
        .args(["auto-mount-run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--target"));
}

#[test]
fn test_version() {
    bmount()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bmount"));
}

#[test]
fn test_mount_requires_user() {
    bmount()
        .args(["mount", "photos"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--user"));
}

#[test]
fn test_auto_mount_rejects_unknown_elevation() {
    bmount()
        .args(["auto-mount", "enable", "--user", "alice", "photos", "--elevate", "runas"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("sudo"));
}

// ============================================================================
// Exit codes
// ============================================================================

#[test]
fn test_invalid_bucket_exit_code() {
    let env = TestEnv::new();
    env.bmount()
        .args(["target", "--user", "alice", ".."])
        .assert()
        .failure()
        .code(16)
        .stderr(predicate::str::contains("Invalid bucket name '..'"));
}

#[test]
fn test_user_with_dash_is_rejected() {
    let env = TestEnv::new();
    env.bmount()
        .args(["target", "--user", "alice-x", "photos"])
        .assert()
        .failure()
        .code(16)
        .stderr(predicate::str::contains("Invalid user name 'alice-x'"));
}

#[test]
fn test_bucket_with_separator_is_rejected_before_mounting() {
    let env = TestEnv::new();
    env.bmount()
        .args(["mount", "--user", "alice", "photos/2024"])
        .assert()
        .failure()
        .code(16);
}

#[test]
fn test_quiet_suppresses_error_message() {
    let env = TestEnv::new();
    env.bmount()
        .args(["-q", "target", "--user", "alice", ".."])
        .assert()
        .failure()
        .code(16)
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_malformed_config_exit_code() {
    let env = TestEnv::new();
    env.write_config("[mount\nbase_dir = ");
    env.bmount()
        .args(["status", "--user", "alice"])
        .assert()
        .failure()
        .code(17)
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_unknown_config_key_exit_code() {
    let env = TestEnv::new();
    env.write_config("[mount]\nbase_directory = \"/srv\"\n");
    env.bmount()
        .args(["status", "--user", "alice"])
        .assert()
        .failure()
        .code(17)
        .stderr(predicate::str::contains("base_directory"));
}

#[test]
fn test_inconsistent_config_exit_code() {
    let env = TestEnv::new();
    env.write_config("[mount]\npoll_interval = \"0s\"\n");
    env.bmount()
        .args(["status", "--user", "alice"])
        .assert()
        .failure()
        .code(17)
        .stderr(predicate::str::contains("poll_interval"));
}

// ============================================================================
// Commands against the live host (nothing is mounted)
// ============================================================================

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_target_prints_conventional_directory() {
    let env = TestEnv::new();
    let expected = env.base_dir().join("haio-alice-photos");
    env.bmount()
        .args(["target", "--user", "alice", "photos"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.display().to_string()));
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_target_skips_populated_directory() {
    let env = TestEnv::new();
    let occupied = env.base_dir().join("haio-alice-photos");
    std::fs::create_dir_all(&occupied).unwrap();
    std::fs::write(occupied.join("notes.txt"), "mine").unwrap();

    env.bmount()
        .args(["target", "--user", "alice", "photos"])
        .assert()
        .success()
        .stdout(predicate::str::contains("haio-alice-photos-2"));
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_unmount_never_mounted_succeeds() {
    let env = TestEnv::new();
    env.bmount()
        .args(["unmount", "--user", "alice", "photos"])
        .assert()
        .success()
        .stderr(predicate::str::contains("photos is not mounted"));
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_status_json_for_unmounted_bucket() {
    let env = TestEnv::new();
    let output = env
        .bmount()
        .args(["status", "--user", "alice", "photos", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let statuses: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(statuses[0]["key"]["bucket"], "photos");
    assert_eq!(statuses[0]["state"], "unmounted");
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_status_without_buckets_lists_nothing() {
    let env = TestEnv::new();
    env.bmount()
        .args(["status", "--user", "alice"])
        .assert()
        .success()
        .stderr(predicate::str::contains("No buckets of alice are mounted"));
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_cleanup_with_nothing_stale() {
    let env = TestEnv::new();
    env.bmount()
        .args(["cleanup", "--user", "alice"])
        .assert()
        .success()
        .stderr(predicate::str::contains("No stale mounts found"));
}

#[test]
#[file_serial]
#[cfg(target_os = "linux")]
fn test_mount_without_helper_is_prerequisite_error() {
    if ["/usr/local/bin/rclone", "/usr/bin/rclone"]
        .iter()
        .any(|p| Path::new(p).exists())
    {
        eprintln!("rclone is installed on this host, skipping");
        return;
    }
    let env = TestEnv::new();
    // Only a PATH without rclone, so the configured missing path is final
    let empty_path = env.dir.path().join("empty-path");
    std::fs::create_dir_all(&empty_path).unwrap();

    env.bmount()
        .env("PATH", &empty_path)
        .args(["mount", "--user", "alice", "photos"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("Prerequisite missing"));
    assert!(!env.base_dir().join("haio-alice-photos").exists());
}
