//! Mount lifecycle scenarios against a simulated host.
//!
//! Each test stages the host (mounted volumes, stale entries, busy holders,
//! missing tools), drives the manager and checks both the returned result and
//! what was actually done to the host.
//!
//! Run: `cargo nextest run -p bmount-core --test lifecycle`

mod common;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use bmount_core::testing::{BusyMode, HelperMode};
use bmount_core::target::assignable_drive_letters;
use bmount_core::{
    Credential, Detach, MountError, MountState, MountTarget, PlatformKind, SystemProbe,
};
use common::{Harness, home_dir, key};

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn test_unmount_never_mounted_is_noop() {
    for harness in [Harness::posix(), Harness::windows()] {
        let outcome = harness.manager.unmount(&key("photos")).unwrap();
        assert!(outcome.is_none());
        assert!(harness.host.terminated().is_empty());
        assert_eq!(
            harness.manager.status(&key("photos")).state,
            MountState::Unmounted
        );
    }
}

#[test]
fn test_double_mount_invokes_helper_once() {
    for harness in [Harness::posix(), Harness::windows()] {
        let first = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
        let second = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();

        assert_eq!(first, second);
        assert_eq!(harness.host.helper_invocations(), 1);
        assert_eq!(harness.host.running_helpers().len(), 1);
    }
}

#[test]
fn test_mount_adopts_mount_left_by_previous_run() {
    let harness = Harness::windows();
    harness
        .host
        .add_helper_volume(&MountTarget::Drive('R'), "haio-alice-photos", 900);

    let target = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
    assert_eq!(target, MountTarget::Drive('R'));
    assert_eq!(harness.host.helper_invocations(), 0);
    assert!(harness.manager.is_mounted(&key("photos")));
}

// =============================================================================
// Health
// =============================================================================

#[test]
fn test_stale_mount_reports_not_mounted() {
    let harness = Harness::posix();
    let target = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
    assert!(harness.manager.is_mounted(&key("photos")));

    harness.host.make_stale(&target);
    assert!(!harness.manager.is_mounted(&key("photos")));
    // Never cached: still false on the next call
    assert!(!harness.manager.is_mounted(&key("photos")));
    assert_eq!(harness.manager.status(&key("photos")).state, MountState::Stale);
}

#[test]
fn test_foreign_mount_with_matching_path_is_not_ours() {
    let harness = Harness::posix();
    harness
        .host
        .add_foreign_volume(home_dir("photos"), Some("nas:/export/photos"));

    assert!(!harness.manager.is_mounted(&key("photos")));
    let target = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
    assert_eq!(
        target,
        MountTarget::Directory(format!("{}/haio-alice-photos-2", common::HOME).into())
    );
}

// =============================================================================
// Readiness timeout
// =============================================================================

#[test]
fn test_helper_never_ready_times_out() {
    for harness in [Harness::posix(), Harness::windows()] {
        harness.host.set_helper_mode(HelperMode::NeverReady);

        let err = harness
            .manager
            .mount(&key("archive"), &Credential::none())
            .unwrap_err();
        assert!(matches!(err, MountError::MountTimeout { ref bucket, .. } if bucket == "archive"));
        assert!(err.is_retryable());
        assert!(!harness.manager.is_mounted(&key("archive")));

        // The abandoned helper is not left running
        assert!(harness.host.running_helpers().is_empty());
        let status = harness.manager.status(&key("archive"));
        assert_eq!(status.state, MountState::Unmounted);
        assert!(status.last_error.is_some());
    }
}

#[test]
fn test_hanging_daemon_launch_is_cleaned_up() {
    let harness = Harness::posix();
    harness.host.set_helper_mode(HelperMode::LaunchHangs);

    let err = harness
        .manager
        .mount(&key("archive"), &Credential::none())
        .unwrap_err();
    // The launch wait is capped by the readiness budget, not the 30s default
    assert!(matches!(
        err,
        MountError::MountTimeout { timeout, .. } if timeout <= Duration::from_millis(300)
    ));
    assert_eq!(harness.host.helper_invocations(), 1);
    assert!(harness.host.running_helpers().is_empty());
    assert_eq!(harness.host.terminated().len(), 1);
    assert!(!harness.manager.is_mounted(&key("archive")));
    assert!(!harness.host.has_directory("/home/alice/haio-alice-archive"));
}

#[test]
fn test_timeout_removes_created_directory() {
    let harness = Harness::posix();
    harness.host.set_helper_mode(HelperMode::NeverReady);

    harness
        .manager
        .mount(&key("archive"), &Credential::none())
        .unwrap_err();
    assert!(!harness.host.has_directory("/home/alice/haio-alice-archive"));
}

// =============================================================================
// Unmount ladder
// =============================================================================

#[test]
fn test_lazy_unmount_succeeds_when_plain_steps_fail() {
    let harness = Harness::posix();
    let target = harness.manager.mount(&key("logs"), &Credential::none()).unwrap();
    // An editor, not a file manager: the second step must not close it
    harness
        .host
        .set_busy(&target, BusyMode::HeldBy(vec![(777, "vim".into())]));

    let outcome = harness.manager.unmount(&key("logs")).unwrap().unwrap();
    assert_eq!(outcome.step, "lazy");
    assert_eq!(outcome.detach, Detach::Deferred);
    assert!(!harness.manager.is_mounted(&key("logs")));
    assert!(!harness.host.terminated().contains(&777));
}

#[test]
fn test_file_manager_is_closed_and_unmount_retried() {
    let harness = Harness::posix();
    let target = harness.manager.mount(&key("logs"), &Credential::none()).unwrap();
    harness
        .host
        .set_busy(&target, BusyMode::HeldBy(vec![(501, "nautilus".into())]));

    let outcome = harness.manager.unmount(&key("logs")).unwrap().unwrap();
    assert_eq!(outcome.step, "close-holders");
    assert_eq!(outcome.detach, Detach::Immediate);
    assert_eq!(harness.host.terminated(), vec![501]);
}

#[test]
fn test_unmount_busy_leaves_mount_in_place() {
    let harness = Harness::posix();
    let target = harness.manager.mount(&key("logs"), &Credential::none()).unwrap();
    harness
        .host
        .set_busy(&target, BusyMode::Stuck(vec![(42, "bash".into())]));

    let err = harness.manager.unmount(&key("logs")).unwrap_err();
    match &err {
        MountError::UnmountBusy { target: t, holders } => {
            assert_eq!(t, &target);
            assert_eq!(holders, &vec!["bash".to_string()]);
        }
        other => panic!("expected UnmountBusy, got {other:?}"),
    }
    assert!(err.to_string().contains("Close applications using it"));

    assert!(harness.manager.is_mounted(&key("logs")));
    let status = harness.manager.status(&key("logs"));
    assert_eq!(status.state, MountState::Mounted);
    assert!(harness.host.has_directory("/home/alice/haio-alice-logs"));
}

#[test]
fn test_windows_terminates_only_the_bound_helper() {
    let harness = Harness::windows();
    let photos = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
    let logs = harness.manager.mount(&key("logs"), &Credential::none()).unwrap();
    harness
        .host
        .set_busy(&logs, BusyMode::Stuck(vec![(300, "explorer".into())]));

    let outcome = harness.manager.unmount(&key("logs")).unwrap().unwrap();
    assert_eq!(outcome.step, "terminate-bound-helper");
    assert!(!harness.manager.is_mounted(&key("logs")));
    assert!(harness.manager.is_mounted(&key("photos")));
    assert_eq!(harness.host.terminated().len(), 1);
    assert_ne!(photos, logs);
}

// =============================================================================
// Target conflicts
// =============================================================================

#[test]
fn test_conflict_is_retried_once_on_another_target() {
    let harness = Harness::posix();
    harness.host.fail_with_conflict(1);

    let target = harness.manager.mount(&key("photos"), &Credential::none()).unwrap();
    assert_eq!(
        target,
        MountTarget::Directory(format!("{}/haio-alice-photos-2", common::HOME).into())
    );
    assert_eq!(harness.host.helper_invocations(), 2);
    // The directory of the failed attempt is cleaned up
    assert!(!harness.host.has_directory("/home/alice/haio-alice-photos"));
}

#[test]
fn test_second_conflict_is_surfaced() {
    let harness = Harness::windows();
    harness.host.fail_with_conflict(2);

    let err = harness
        .manager
        .mount(&key("photos"), &Credential::none())
        .unwrap_err();
    assert!(matches!(err, MountError::TargetConflict { target: Some(_), .. }));
    assert_eq!(harness.host.helper_invocations(), 2);
}

#[test]
fn test_concurrent_mounts_with_one_free_drive() {
    let harness = Harness::windows();
    let free = MountTarget::Drive('K');
    for target in assignable_drive_letters() {
        if target != free {
            harness.host.add_foreign_volume(target, Some("OTHER"));
        }
    }

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|bucket| {
                let manager = &harness.manager;
                s.spawn(move || manager.mount(&key(bucket), &Credential::none()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let successes: Vec<&MountTarget> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(successes, vec![&free]);
    assert!(results.iter().any(|r| matches!(r, Err(MountError::TargetConflict { .. }))));
    assert_eq!(harness.host.running_helpers().len(), 1);
}

#[test]
fn test_distinct_buckets_get_distinct_drives() {
    let harness = Harness::windows();
    let buckets = ["a", "b", "c", "d", "e"];

    let targets: HashSet<MountTarget> = thread::scope(|s| {
        let handles: Vec<_> = buckets
            .iter()
            .map(|bucket| {
                let manager = &harness.manager;
                s.spawn(move || manager.mount(&key(bucket), &Credential::none()).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(targets.len(), buckets.len());
}

// =============================================================================
// Prerequisites
// =============================================================================

#[test]
fn test_missing_helper_is_prerequisite_error() {
    for harness in [Harness::posix(), Harness::windows()] {
        harness.host.remove_helper();
        let err = harness
            .manager
            .mount(&key("photos"), &Credential::none())
            .unwrap_err();
        assert!(matches!(err, MountError::PrerequisiteMissing(_)));
        assert!(!err.is_retryable());
        assert_eq!(harness.host.helper_invocations(), 0);
    }
}

#[test]
fn test_missing_mount_support_is_prerequisite_error() {
    for platform in [PlatformKind::Posix, PlatformKind::Windows] {
        let harness = Harness::build(platform, |_| {});
        harness.host.remove_mount_support();
        let err = harness
            .manager
            .mount(&key("photos"), &Credential::none())
            .unwrap_err();
        assert!(matches!(err, MountError::PrerequisiteMissing(_)), "{platform:?}: {err}");
        assert_eq!(err.code(), 10);
    }
}

// =============================================================================
// Housekeeping
// =============================================================================

#[test]
fn test_cleanup_detaches_stale_and_removes_directory() {
    let harness = Harness::posix();
    let target = harness.manager.mount(&key("logs"), &Credential::none()).unwrap();
    harness.host.make_stale(&target);

    let report = harness.manager.cleanup_stale("alice");
    assert_eq!(report.cleaned, vec![target.clone()]);
    assert!(!harness.host.is_mount_point(&target));
    assert!(!harness.host.has_directory("/home/alice/haio-alice-logs"));
    assert_eq!(harness.manager.status(&key("logs")).state, MountState::Unmounted);
}

#[test]
fn test_credentials_reach_helper_environment_only() {
    let harness = Harness::posix();
    let credential = Credential::from_env_pairs([("RCLONE_CONFIG_PASS", "s3cret")]);
    harness.manager.mount(&key("photos"), &credential).unwrap();

    assert!(harness.host.commands().iter().all(|c| !c.contains("s3cret")));
}
