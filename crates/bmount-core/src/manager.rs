//! The mount lifecycle orchestrator.
//!
//! [`MountLifecycleManager`] owns one session per (user, bucket) and
//! sequences the allocator, helper, detector, unmount ladder and service
//! manager. Every decision is re-derived from the live OS state; the session
//! only records what this process last did.
//!
//! # Locking
//!
//! Each bucket has its own operation lock, held for the whole of a mount,
//! unmount or auto-mount change. Buckets never wait on each other except
//! while a target is being allocated: the reservation set is locked across
//! allocation so two buckets cannot claim the same free target.
//!
//! # States
//!
//! ```text
//! Unmounted -> Mounting -> Mounted -> Unmounting -> Unmounted
//!                             |            |
//!                           Stale        Busy -> Mounted
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::allocator::{Allocation, IdentityKind, MountTargetAllocator, TargetPool};
use crate::autostart::{
    AutoMountRecord, AutoMountService, AutoMountServiceManager, Elevation, ScheduledTasks,
    SystemdUnits,
};
use crate::bucket::{BucketKey, Credential};
use crate::config::Settings;
use crate::detector::{StaleMountDetector, TargetHealth};
use crate::error::MountError;
use crate::helper::{HelperConfig, LaunchedHelper, MountHelperInvoker};
use crate::platform::{HostServices, PlatformKind, TargetDirs, current_os_user};
use crate::probe::{Listing, SystemProbe};
use crate::process::CommandOutput;
use crate::processes::ProcessTable;
use crate::recovery::{BusyUnmountRecovery, UnmountOutcome};
use crate::target::MountTarget;

/// Lifecycle state of a bucket's mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountState {
    /// Nothing mounted
    #[default]
    Unmounted,
    /// Helper launched, waiting for the target to answer
    Mounting,
    /// Target answered an access probe
    Mounted,
    /// Mounted at the OS level but no longer answering
    Stale,
    /// Unmount ladder running
    Unmounting,
    /// Every unmount step failed
    Busy,
}

/// Snapshot of a bucket for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountStatus {
    /// The bucket
    pub key: BucketKey,
    /// Current state
    pub state: MountState,
    /// Target the bucket is (or was being) mounted on
    pub target: Option<MountTarget>,
    /// Live health of that target; `None` while an operation is in flight
    pub health: Option<TargetHealth>,
    /// Message of the last failed operation
    pub last_error: Option<String>,
}

/// Outcome of [`MountLifecycleManager::cleanup_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Stale targets that were detached
    pub cleaned: Vec<MountTarget>,
    /// Stale targets that could not be detached, with the reason
    pub failed: Vec<(MountTarget, String)>,
    /// Stale targets skipped because their bucket had an operation running
    pub skipped: Vec<MountTarget>,
}

/// Readiness polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountTiming {
    /// Give up waiting for the target after this long
    pub readiness_timeout: Duration,
    /// Pause between readiness probes
    pub poll_interval: Duration,
    /// Timeout of one listing probe
    pub probe_timeout: Duration,
}

#[derive(Debug, Default)]
struct MountSession {
    state: MountState,
    target: Option<MountTarget>,
    last_error: Option<String>,
}

impl MountSession {
    fn transition(&mut self, key: &BucketKey, next: MountState) {
        if self.state != next {
            tracing::info!(bucket = %key, "{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn settle(&mut self, key: &BucketKey, next: MountState, target: Option<MountTarget>) {
        self.transition(key, next);
        self.target = target;
    }
}

#[derive(Debug, Default)]
struct BucketSlot {
    /// Serializes mutating operations on one bucket
    op: Mutex<()>,
    session: Mutex<MountSession>,
}

/// A target claimed by an operation in flight. Released on drop.
struct Reservation<'a> {
    reserved: &'a Mutex<HashSet<MountTarget>>,
    allocation: Allocation,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.allocation.target);
    }
}

/// Mounts, unmounts and registers buckets for one host.
pub struct MountLifecycleManager {
    platform: PlatformKind,
    allocator: MountTargetAllocator,
    helper: Arc<MountHelperInvoker>,
    detector: StaleMountDetector,
    recovery: BusyUnmountRecovery,
    autostart: AutoMountServiceManager,
    probe: Arc<dyn SystemProbe>,
    processes: Arc<dyn ProcessTable>,
    dirs: Arc<dyn TargetDirs>,
    timing: MountTiming,
    slots: DashMap<BucketKey, Arc<BucketSlot>>,
    reserved: Mutex<HashSet<MountTarget>>,
}

impl MountLifecycleManager {
    /// Manager for the platform this binary runs on, backed by the real host.
    pub fn system(settings: &Settings) -> Result<Self, MountError> {
        let platform = PlatformKind::current();
        Self::for_platform(platform, settings, HostServices::system(platform))
    }

    /// Assemble the component set for `platform` over `host`.
    pub fn for_platform(
        platform: PlatformKind,
        settings: &Settings,
        host: HostServices,
    ) -> Result<Self, MountError> {
        settings.validate()?;
        let paths = settings.resolve_paths()?;
        let naming = settings.naming.clone();

        let helper = Arc::new(MountHelperInvoker::new(
            host.runner.clone(),
            HelperConfig::from_settings(settings, &paths, platform),
            platform,
            naming.clone(),
        ));

        let (pool, identity, steps) = match platform {
            PlatformKind::Posix => (
                TargetPool::Directories {
                    base_dir: paths.base_dir.clone(),
                    max_suffix: settings.mount.max_suffix,
                },
                IdentityKind::RemoteSpec,
                BusyUnmountRecovery::posix_steps(),
            ),
            PlatformKind::Windows => (
                TargetPool::DriveLetters,
                IdentityKind::VolumeLabel,
                BusyUnmountRecovery::windows_steps(&helper.process_name()),
            ),
        };

        let backend: Box<dyn AutoMountService> = match platform {
            PlatformKind::Posix => {
                let os_user = current_os_user().ok_or_else(|| {
                    MountError::Config("cannot determine the login name for service units".into())
                })?;
                Box::new(SystemdUnits::new(
                    host.runner.clone(),
                    helper.clone(),
                    naming.clone(),
                    settings.autostart.unit_dir.clone(),
                    os_user,
                    settings.autostart.command_timeout,
                ))
            }
            PlatformKind::Windows => Box::new(ScheduledTasks::new(
                host.runner.clone(),
                naming.clone(),
                std::env::current_exe()?,
                ScheduledTasks::current_user_id(),
                settings.autostart.command_timeout,
            )),
        };

        tracing::debug!(
            platform = ?platform,
            helper = %helper.config().binary.display(),
            "Assembled mount manager"
        );

        Ok(Self {
            platform,
            allocator: MountTargetAllocator::new(host.probe.clone(), pool, identity, naming),
            detector: StaleMountDetector::new(host.probe.clone(), settings.mount.probe_timeout),
            recovery: BusyUnmountRecovery::new(
                steps,
                host.runner.clone(),
                host.processes.clone(),
                host.probe.clone(),
                settings.mount.unmount_step_timeout,
            ),
            autostart: AutoMountServiceManager::new(backend),
            helper,
            probe: host.probe,
            processes: host.processes,
            dirs: host.dirs,
            timing: MountTiming {
                readiness_timeout: settings.mount.readiness_timeout,
                poll_interval: settings.mount.poll_interval,
                probe_timeout: settings.mount.probe_timeout,
            },
            slots: DashMap::new(),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    /// Platform this manager was built for.
    pub fn platform(&self) -> PlatformKind {
        self.platform
    }

    /// The allocator, for previewing targets.
    pub fn allocator(&self) -> &MountTargetAllocator {
        &self.allocator
    }

    fn slot(&self, key: &BucketKey) -> Arc<BucketSlot> {
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Whether the mount at `target` carries this bucket's identity marker.
    fn holds_bucket(&self, key: &BucketKey, target: &MountTarget) -> bool {
        self.probe.identity(target).as_deref() == Some(self.allocator.expected_identity(key).as_str())
    }

    fn is_healthy_for(&self, key: &BucketKey, target: &MountTarget) -> bool {
        self.detector.classify(target) == TargetHealth::Healthy && self.holds_bucket(key, target)
    }

    /// Mount `key`, returning its target.
    ///
    /// Succeeds without invoking the helper when the bucket is already
    /// mounted and its target answers.
    pub fn mount(&self, key: &BucketKey, credential: &Credential) -> Result<MountTarget, MountError> {
        self.mount_preferring(key, credential, None)
    }

    /// Mount `key`, using `preferred` when it is free or already holds the
    /// bucket.
    ///
    /// Used by the login task, which records the target it was registered
    /// with.
    #[tracing::instrument(level = "info", skip(self, credential), fields(bucket = %key))]
    pub fn mount_preferring(
        &self,
        key: &BucketKey,
        credential: &Credential,
        preferred: Option<&MountTarget>,
    ) -> Result<MountTarget, MountError> {
        let slot = self.slot(key);
        let _op = slot.op.lock();

        let session_target = slot.session.lock().target.clone();
        let already = session_target
            .into_iter()
            .chain(self.allocator.find_existing(key))
            .find(|t| self.is_healthy_for(key, t));
        if let Some(target) = already {
            tracing::debug!("{} is already mounted at {}", key, target);
            let mut session = slot.session.lock();
            session.settle(key, MountState::Mounted, Some(target.clone()));
            session.last_error = None;
            return Ok(target);
        }

        {
            let mut session = slot.session.lock();
            if session.state != MountState::Unmounted {
                tracing::info!("{} is no longer mounted at its last target", key);
                session.settle(key, MountState::Unmounted, None);
            }
        }

        let result = self
            .helper
            .check_prerequisites()
            .and_then(|()| self.mount_with_retry(key, credential, preferred, &slot));

        let mut session = slot.session.lock();
        match &result {
            Ok(target) => {
                session.settle(key, MountState::Mounted, Some(target.clone()));
                session.last_error = None;
                tracing::info!("Mounted {} at {}", key, target);
            }
            Err(e) => {
                session.settle(key, MountState::Unmounted, None);
                session.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// One retry on a conflicting target, excluding the target that failed.
    fn mount_with_retry(
        &self,
        key: &BucketKey,
        credential: &Credential,
        preferred: Option<&MountTarget>,
        slot: &BucketSlot,
    ) -> Result<MountTarget, MountError> {
        let mut excluded = HashSet::new();
        match self.mount_attempt(key, credential, preferred, &excluded, slot) {
            Err(MountError::TargetConflict {
                target: Some(target),
                reason,
            }) => {
                tracing::warn!("{} is in use ({}), retrying on another target", target, reason);
                excluded.insert(target);
                self.mount_attempt(key, credential, preferred, &excluded, slot)
            }
            other => other,
        }
    }

    fn mount_attempt(
        &self,
        key: &BucketKey,
        credential: &Credential,
        preferred: Option<&MountTarget>,
        excluded: &HashSet<MountTarget>,
        slot: &BucketSlot,
    ) -> Result<MountTarget, MountError> {
        let reservation = self.reserve(key, preferred, excluded)?;
        let target = reservation.allocation.target.clone();
        slot.session
            .lock()
            .settle(key, MountState::Mounting, Some(target.clone()));

        let result = self.mount_on(key, credential, &target);
        if result.is_err() {
            slot.session.lock().settle(key, MountState::Unmounted, None);
        }
        result.map(|()| target)
    }

    fn mount_on(
        &self,
        key: &BucketKey,
        credential: &Credential,
        target: &MountTarget,
    ) -> Result<(), MountError> {
        match self.detector.classify(target) {
            TargetHealth::Healthy if self.holds_bucket(key, target) => {
                tracing::info!("Adopting existing mount of {} at {}", key, target);
                return Ok(());
            }
            TargetHealth::Healthy => {
                return Err(MountError::TargetConflict {
                    target: Some(target.clone()),
                    reason: "another filesystem is mounted there".to_string(),
                });
            }
            TargetHealth::Stale => self.clear_stale(key, target)?,
            TargetHealth::Absent | TargetHealth::Unmounted => {}
        }

        self.prepare_target(target)?;

        let deadline = Instant::now() + self.timing.readiness_timeout;
        let launched = match self.helper.launch(key, target, credential, deadline) {
            Ok(launched) => launched,
            Err(e) => {
                // A daemonizing launch may have forked before failing
                self.abandon_helper(target, &LaunchedHelper { process: None });
                self.release_dir(key, target);
                return Err(e);
            }
        };

        self.await_ready(key, target, &launched, deadline).inspect_err(|_| {
            self.release_dir(key, target);
        })
    }

    /// Claim a target for `key`, holding the reservation set while deciding.
    fn reserve(
        &self,
        key: &BucketKey,
        preferred: Option<&MountTarget>,
        excluded: &HashSet<MountTarget>,
    ) -> Result<Reservation<'_>, MountError> {
        let mut reserved = self.reserved.lock();

        let hinted = preferred
            .filter(|t| !reserved.contains(*t) && !excluded.contains(*t))
            .filter(|t| self.allocator.in_pool(key, t))
            .and_then(|t| {
                if self.holds_bucket(key, t) {
                    Some(Allocation {
                        target: t.clone(),
                        adopted: true,
                    })
                } else if self.allocator.is_free(t) {
                    Some(Allocation {
                        target: t.clone(),
                        adopted: false,
                    })
                } else {
                    None
                }
            });

        let allocation = match hinted {
            Some(allocation) => allocation,
            None => self.allocator.allocate(key, &reserved, excluded)?,
        };
        reserved.insert(allocation.target.clone());

        Ok(Reservation {
            reserved: &self.reserved,
            allocation,
        })
    }

    /// Detach a dead mount and remove its dangling directory.
    fn clear_stale(&self, key: &BucketKey, target: &MountTarget) -> Result<(), MountError> {
        tracing::warn!("Clearing stale mount at {} before mounting {}", target, key);
        let outcome = self.recovery.unmount(target)?;
        tracing::debug!("Stale mount cleared by '{}'", outcome.step);
        self.release_dir(key, target);
        Ok(())
    }

    /// Make sure a directory target exists and is empty.
    fn prepare_target(&self, target: &MountTarget) -> Result<(), MountError> {
        let Some(dir) = target.as_dir() else {
            return Ok(());
        };

        let conflict = |reason: String| MountError::TargetConflict {
            target: Some(target.clone()),
            reason,
        };
        match self.probe.list(target, self.timing.probe_timeout) {
            Listing::Missing => {
                tracing::debug!("Creating mount point {}", dir.display());
                self.dirs.create(dir)?;
                Ok(())
            }
            Listing::Readable { empty: true } => Ok(()),
            Listing::Readable { empty: false } => {
                Err(conflict("the directory is not empty".to_string()))
            }
            Listing::Failed(reason) => Err(conflict(reason)),
            Listing::TimedOut => Err(conflict("the directory does not respond".to_string())),
        }
    }

    /// Remove a mount-point directory this manager may have created.
    ///
    /// Only the bucket's own conventional directories are touched, and only
    /// when empty.
    fn release_dir(&self, key: &BucketKey, target: &MountTarget) {
        let Some(dir) = target.as_dir() else {
            return;
        };
        if !self.allocator.candidates(key).contains(target) {
            return;
        }
        match self.dirs.remove_if_empty(dir) {
            Ok(true) => tracing::debug!("Removed mount point {}", dir.display()),
            Ok(false) => {}
            Err(e) => tracing::debug!("Left mount point {} in place: {}", dir.display(), e),
        }
    }

    /// Poll until the target answers as this bucket, the helper exits, or
    /// the readiness timeout passes.
    fn await_ready(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        launched: &LaunchedHelper,
        deadline: Instant,
    ) -> Result<(), MountError> {
        let mut probes = 0u32;

        loop {
            probes += 1;
            if self.is_healthy_for(key, target) {
                tracing::debug!("{} ready after {} probe(s)", target, probes);
                return Ok(());
            }

            if let Some(status) = launched.exit_status() {
                let out = CommandOutput {
                    status,
                    stdout: String::new(),
                    stderr: String::new(),
                };
                return Err(self.helper.launch_failure(key, target, &out));
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "{} did not become ready within {:?}",
                    target,
                    self.timing.readiness_timeout
                );
                self.abandon_helper(target, launched);
                return Err(MountError::MountTimeout {
                    bucket: key.bucket.clone(),
                    target: target.clone(),
                    timeout: self.timing.readiness_timeout,
                });
            }

            std::thread::sleep(self.timing.poll_interval);
        }
    }

    /// Stop a helper that never made its mount ready.
    fn abandon_helper(&self, target: &MountTarget, launched: &LaunchedHelper) {
        let pids: Vec<u32> = match launched.pid() {
            Some(pid) => vec![pid],
            // Daemonized: find the one serving this target
            None => self
                .processes
                .find_by_name(&self.helper.process_name())
                .into_iter()
                .filter(|p| p.has_arg("mount") && p.has_arg(&target.helper_arg()))
                .map(|p| p.pid)
                .collect(),
        };

        for pid in pids {
            if self.processes.terminate(pid) {
                tracing::info!("Terminated unresponsive helper {} for {}", pid, target);
            }
        }
    }

    /// Unmount `key`.
    ///
    /// Returns `None` when nothing was mounted. On failure the mount is left
    /// in place and the error names the processes holding it.
    #[tracing::instrument(level = "info", skip(self), fields(bucket = %key))]
    pub fn unmount(&self, key: &BucketKey) -> Result<Option<UnmountOutcome>, MountError> {
        let slot = self.slot(key);
        let _op = slot.op.lock();

        let session_target = slot.session.lock().target.clone();
        let target = session_target
            .filter(|t| self.probe.is_mount_point(t) && self.holds_bucket(key, t))
            .or_else(|| self.allocator.find_existing(key));

        let Some(target) = target else {
            tracing::debug!("{} is not mounted", key);
            let mut session = slot.session.lock();
            session.settle(key, MountState::Unmounted, None);
            session.last_error = None;
            return Ok(None);
        };

        slot.session
            .lock()
            .settle(key, MountState::Unmounting, Some(target.clone()));

        match self.recovery.unmount(&target) {
            Ok(outcome) => {
                self.release_dir(key, &target);
                let mut session = slot.session.lock();
                session.settle(key, MountState::Unmounted, None);
                session.last_error = None;
                tracing::info!("Unmounted {} from {} ({})", key, target, outcome.step);
                Ok(Some(outcome))
            }
            Err(e) => {
                let restored = if self.detector.classify(&target) == TargetHealth::Stale {
                    MountState::Stale
                } else {
                    MountState::Mounted
                };
                let mut session = slot.session.lock();
                session.transition(key, MountState::Busy);
                session.transition(key, restored);
                session.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Whether `key` is mounted and its target answers right now.
    ///
    /// Always probes; a mount-table entry that fails the access probe is
    /// reported as not mounted.
    pub fn is_mounted(&self, key: &BucketKey) -> bool {
        let slot = self.slot(key);
        let target = slot
            .session
            .lock()
            .target
            .clone()
            .or_else(|| self.allocator.find_existing(key));
        let Some(target) = target else {
            return false;
        };

        let health = self.detector.classify(&target);
        let mounted = health == TargetHealth::Healthy && self.holds_bucket(key, &target);

        // Leave the session alone while another operation owns it
        if let Some(_op) = slot.op.try_lock() {
            let mut session = slot.session.lock();
            match (mounted, health, session.state) {
                (true, _, MountState::Unmounted) => {
                    session.settle(key, MountState::Mounted, Some(target));
                }
                (false, TargetHealth::Stale, MountState::Mounted) => {
                    session.transition(key, MountState::Stale);
                }
                (false, TargetHealth::Absent | TargetHealth::Unmounted, _)
                    if session.state != MountState::Unmounted =>
                {
                    session.settle(key, MountState::Unmounted, None);
                }
                _ => {}
            }
        }
        mounted
    }

    /// State, target and live health of `key`.
    pub fn status(&self, key: &BucketKey) -> MountStatus {
        let slot = self.slot(key);
        let (state, target, last_error) = {
            let session = slot.session.lock();
            (session.state, session.target.clone(), session.last_error.clone())
        };

        if slot.op.is_locked() {
            return MountStatus {
                key: key.clone(),
                state,
                target,
                health: None,
                last_error,
            };
        }

        let target = target
            .filter(|t| self.probe.is_mount_point(t) && self.holds_bucket(key, t))
            .or_else(|| self.allocator.find_existing(key));
        let health = target.as_ref().map(|t| self.detector.classify(t));
        let state = match health {
            Some(TargetHealth::Healthy) => MountState::Mounted,
            Some(TargetHealth::Stale) => MountState::Stale,
            _ => MountState::Unmounted,
        };

        MountStatus {
            key: key.clone(),
            state,
            target: target.filter(|_| state != MountState::Unmounted),
            health,
            last_error,
        }
    }

    /// Register (`enabled`) or remove the auto-mount record for `key`.
    ///
    /// Does not mount or unmount. Returns the record as re-read from the OS
    /// after enabling.
    #[tracing::instrument(level = "info", skip(self, elevation), fields(bucket = %key))]
    pub fn set_auto_mount(
        &self,
        key: &BucketKey,
        enabled: bool,
        elevation: &Elevation,
    ) -> Result<Option<AutoMountRecord>, MountError> {
        let slot = self.slot(key);
        let _op = slot.op.lock();

        if !enabled {
            self.autostart.disable(key, elevation)?;
            return Ok(None);
        }

        let target = self.auto_mount_target(key, &slot)?;
        self.autostart.enable(key, &target, elevation).map(Some)
    }

    /// Target written into a new record: where the bucket is mounted now,
    /// else where an existing record points, else a fresh allocation.
    fn auto_mount_target(&self, key: &BucketKey, slot: &BucketSlot) -> Result<MountTarget, MountError> {
        let session_target = slot
            .session
            .lock()
            .target
            .clone()
            .filter(|t| self.holds_bucket(key, t));
        if let Some(target) = session_target.or_else(|| self.allocator.find_existing(key)) {
            return Ok(target);
        }
        if let Some(target) = self.autostart.record(key).ok().and_then(|r| r.target) {
            return Ok(target);
        }
        let reserved = self.reserved.lock().clone();
        Ok(self.allocator.allocate(key, &reserved, &HashSet::new())?.target)
    }

    /// Whether the OS has an enabled auto-mount record for `key`.
    ///
    /// A query failure counts as disabled; use
    /// [`auto_mount_record`](Self::auto_mount_record) for the reason.
    pub fn is_auto_mount_enabled(&self, key: &BucketKey) -> bool {
        match self.autostart.is_enabled(key) {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!("Cannot query auto-mount for {}: {}", key, e);
                false
            }
        }
    }

    /// The auto-mount record for `key`, re-read from the OS.
    pub fn auto_mount_record(&self, key: &BucketKey) -> Result<AutoMountRecord, MountError> {
        self.autostart.record(key)
    }

    /// Target a mount of `key` would use now, without mounting.
    pub fn preview_target(&self, key: &BucketKey) -> Result<Allocation, MountError> {
        let reserved = self.reserved.lock().clone();
        self.allocator.allocate(key, &reserved, &HashSet::new())
    }

    /// Drop the session for `key`. Returns whether one existed.
    ///
    /// A session with an operation in flight is kept.
    pub fn forget(&self, key: &BucketKey) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| !slot.op.is_locked())
            .is_some();
        if removed {
            tracing::debug!("Forgot session for {}", key);
        }
        removed
    }

    /// Drop sessions of `user` whose bucket is not in `live_buckets`.
    pub fn prune(&self, user: &str, live_buckets: &[String]) -> Vec<BucketKey> {
        let stale: Vec<BucketKey> = self
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.user == user && !live_buckets.contains(&k.bucket))
            .collect();
        stale.into_iter().filter(|k| self.forget(k)).collect()
    }

    /// Buckets of `user` with a mount visible in the OS, healthy or not.
    pub fn mounted_buckets(&self, user: &str) -> Vec<(BucketKey, MountTarget)> {
        let mut found: Vec<(BucketKey, MountTarget)> = self
            .probe
            .mounted()
            .into_iter()
            .filter(|v| self.allocator.in_user_pool(user, &v.target))
            .filter_map(|v| {
                let bucket = self
                    .allocator
                    .bucket_from_identity(user, v.identity.as_deref()?)?;
                let key = BucketKey::new(user, bucket).ok()?;
                Some((key, v.target))
            })
            .collect();
        found.sort();
        found
    }

    /// Detach every stale mount of `user` and remove its dangling directory.
    ///
    /// Healthy mounts and mounts not carrying one of the user's identity
    /// markers are never touched.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn cleanup_stale(&self, user: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        for (key, target) in self.mounted_buckets(user) {
            if self.detector.classify(&target) != TargetHealth::Stale {
                continue;
            }

            let slot = self.slot(&key);
            let Some(_op) = slot.op.try_lock() else {
                tracing::info!("Skipping {}: an operation on {} is running", target, key);
                report.skipped.push(target);
                continue;
            };

            match self.recovery.unmount(&target) {
                Ok(outcome) => {
                    tracing::info!("Cleaned stale mount {} ({})", target, outcome.step);
                    self.release_dir(&key, &target);
                    let mut session = slot.session.lock();
                    if session.target.as_ref().is_none_or(|t| *t == target) {
                        session.settle(&key, MountState::Unmounted, None);
                    }
                    report.cleaned.push(target);
                }
                Err(e) => {
                    tracing::warn!("Cannot clean stale mount {}: {}", target, e);
                    report.failed.push((target, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, HelperMode};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.mount.base_dir = Some(PathBuf::from("/home/alice"));
        settings.mount.readiness_timeout = Duration::from_millis(200);
        settings.mount.poll_interval = Duration::from_millis(10);
        settings.mount.probe_timeout = Duration::from_millis(50);
        settings.helper.path = Some(tmp.path().join("missing").join("rclone"));
        settings.helper.config_file = Some(tmp.path().join("rclone.conf"));
        settings.helper.cache_dir = Some(tmp.path().join("cache"));
        settings.helper.check_fuse_device = false;
        settings.autostart.unit_dir = tmp.path().join("units");
        settings
    }

    fn manager(host: &Arc<FakeHost>, platform: PlatformKind, tmp: &TempDir) -> MountLifecycleManager {
        MountLifecycleManager::for_platform(platform, &settings(tmp), HostServices::shared(host.clone()))
            .unwrap()
    }

    fn key(bucket: &str) -> BucketKey {
        BucketKey::new("alice", bucket).unwrap()
    }

    #[test]
    fn test_mount_creates_directory_and_reports_mounted() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        let manager = manager(&host, PlatformKind::Posix, &tmp);

        let target = manager.mount(&key("photos"), &Credential::none()).unwrap();
        assert_eq!(
            target,
            MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-photos"))
        );
        assert!(host.has_directory("/home/alice/haio-alice-photos"));
        assert!(manager.is_mounted(&key("photos")));

        let status = manager.status(&key("photos"));
        assert_eq!(status.state, MountState::Mounted);
        assert_eq!(status.health, Some(TargetHealth::Healthy));
    }

    #[test]
    fn test_unmount_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        let manager = manager(&host, PlatformKind::Posix, &tmp);

        manager.mount(&key("photos"), &Credential::none()).unwrap();
        let outcome = manager.unmount(&key("photos")).unwrap().unwrap();
        assert_eq!(outcome.step, "plain");
        assert!(!host.has_directory("/home/alice/haio-alice-photos"));
        assert_eq!(manager.status(&key("photos")).state, MountState::Unmounted);
    }

    #[test]
    fn test_populated_foreign_directory_is_never_mounted_over() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        host.add_directory("/home/alice/haio-alice-photos", &["thesis.tex"]);
        let manager = manager(&host, PlatformKind::Posix, &tmp);

        let target = manager.mount(&key("photos"), &Credential::none()).unwrap();
        assert_eq!(
            target,
            MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-photos-2"))
        );
    }

    #[test]
    fn test_helper_failure_is_reported_and_state_reset() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        host.set_helper_mode(HelperMode::Fail(
            "Failed to create file system: directory not found in remote".into(),
        ));
        let manager = manager(&host, PlatformKind::Posix, &tmp);

        let err = manager.mount(&key("photos"), &Credential::none()).unwrap_err();
        assert!(matches!(err, MountError::HelperFailed { .. }));
        let status = manager.status(&key("photos"));
        assert_eq!(status.state, MountState::Unmounted);
        assert!(status.last_error.is_some());
        assert!(!host.has_directory("/home/alice/haio-alice-photos"));
    }

    #[test]
    fn test_stale_mount_is_cleared_before_remounting() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        let manager = manager(&host, PlatformKind::Posix, &tmp);
        let target = manager.mount(&key("photos"), &Credential::none()).unwrap();

        host.make_stale(&target);
        assert!(!manager.is_mounted(&key("photos")));
        assert_eq!(manager.status(&key("photos")).state, MountState::Stale);

        let again = manager.mount(&key("photos"), &Credential::none()).unwrap();
        assert_eq!(again, target);
        assert!(manager.is_mounted(&key("photos")));
        assert_eq!(host.helper_invocations(), 2);
    }

    #[test]
    fn test_prune_forgets_removed_buckets() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        let manager = manager(&host, PlatformKind::Posix, &tmp);
        manager.status(&key("photos"));
        manager.status(&key("logs"));

        let pruned = manager.prune("alice", &["photos".to_string()]);
        assert_eq!(pruned, vec![key("logs")]);
        assert!(!manager.forget(&key("logs")));
        assert!(manager.forget(&key("photos")));
    }

    #[test]
    fn test_cleanup_leaves_healthy_and_foreign_mounts() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::posix());
        let manager = manager(&host, PlatformKind::Posix, &tmp);

        let photos = manager.mount(&key("photos"), &Credential::none()).unwrap();
        let logs = manager.mount(&key("logs"), &Credential::none()).unwrap();
        let foreign = MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-nfs"));
        host.add_foreign_volume(foreign.clone(), Some("nas:/export"));
        host.make_stale(&foreign);
        host.make_stale(&logs);

        let report = manager.cleanup_stale("alice");
        assert_eq!(report.cleaned, vec![logs.clone()]);
        assert!(report.failed.is_empty());
        assert!(manager.is_mounted(&key("photos")));
        assert!(host.is_mount_point(&photos));
        assert!(host.is_mount_point(&foreign));
        assert!(!host.is_mount_point(&logs));
    }

    #[test]
    fn test_mounted_buckets_by_identity() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::windows());
        host.add_foreign_volume(MountTarget::Drive('M'), Some("haio-alice-photos"));
        host.add_foreign_volume(MountTarget::Drive('N'), Some("haio-bob-photos"));
        host.add_foreign_volume(MountTarget::Drive('O'), Some("USB STICK"));
        let manager = manager(&host, PlatformKind::Windows, &tmp);

        assert_eq!(
            manager.mounted_buckets("alice"),
            vec![(key("photos"), MountTarget::Drive('M'))]
        );
    }

    #[test]
    fn test_preferred_target_is_used_when_free() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::windows());
        let manager = manager(&host, PlatformKind::Windows, &tmp);

        let target = manager
            .mount_preferring(&key("photos"), &Credential::none(), Some(&MountTarget::Drive('Q')))
            .unwrap();
        assert_eq!(target, MountTarget::Drive('Q'));
    }
}
