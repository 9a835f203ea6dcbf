//! Busy-unmount recovery.
//!
//! Unmounting is an ordered ladder of [`UnmountStrategy`] steps, tried one
//! after another until one leaves the target unmounted. Each step gets its
//! own timeout, and each step's success is verified against the live mount
//! state rather than trusted from an exit code.
//!
//! POSIX: plain unmount, close file managers holding the mount and retry,
//! lazy unmount. Windows: drop the network drive, then terminate the one
//! helper process bound to this drive letter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::MountError;
use crate::probe::SystemProbe;
use crate::process::{CommandRunner, CommandSpec, RunError};
use crate::processes::ProcessTable;
use crate::target::MountTarget;

/// File managers that routinely keep a browsed mount busy.
pub const KNOWN_FILE_MANAGERS: &[&str] = &[
    "nautilus",
    "nemo",
    "thunar",
    "dolphin",
    "caja",
    "pcmanfm",
    "pcmanfm-qt",
];

/// Poll interval while waiting for a target to disappear.
const VERIFY_POLL: Duration = Duration::from_millis(100);

/// How the detach completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Detach {
    /// The filesystem is gone
    Immediate,
    /// Hidden from the namespace now, released when the last reference drops
    Deferred,
}

/// Result of a successful ladder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnmountOutcome {
    /// Name of the step that succeeded
    pub step: &'static str,
    /// Whether the detach is complete
    pub detach: Detach,
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The target is no longer mounted
    Unmounted(Detach),
    /// The step did not help
    Failed(String),
}

/// Everything a step may touch.
pub struct UnmountContext<'a> {
    /// Target being unmounted
    pub target: &'a MountTarget,
    /// Command execution
    pub runner: &'a dyn CommandRunner,
    /// Process enumeration
    pub processes: &'a dyn ProcessTable,
    /// Live mount state
    pub probe: &'a dyn SystemProbe,
    /// Budget for this step
    pub timeout: Duration,
    /// Pause after killing processes before retrying
    pub settle: Duration,
}

impl UnmountContext<'_> {
    /// Whether the OS still reports a mount at the target.
    pub fn still_mounted(&self) -> bool {
        self.probe.is_mount_point(self.target)
    }

    /// Poll until the target is gone or `within` elapses.
    pub fn wait_unmounted(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.still_mounted() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(VERIFY_POLL.min(within));
        }
    }

    /// Deadline of a step starting now.
    pub fn step_deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Run commands in order until one leaves the target unmounted.
    ///
    /// All commands share `deadline`; once it passes the rest are skipped.
    pub fn run_until_unmounted(
        &self,
        commands: Vec<CommandSpec>,
        deadline: Instant,
    ) -> Result<(), String> {
        let mut failures = Vec::new();
        for spec in commands {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                failures.push(format!("step budget of {:?} used up", self.timeout));
                break;
            }
            let spec = spec.timeout(remaining);
            match self.runner.run(&spec) {
                Ok(out) if out.success() => {
                    if !self.still_mounted() {
                        return Ok(());
                    }
                    failures.push(format!("{} reported success but target is still mounted", spec.program_name()));
                }
                Ok(out) => failures.push(format!("{}: {}", spec.program_name(), out.diagnostics())),
                Err(RunError::NotFound(_)) => {}
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            failures.push("no unmount tool available".to_string());
        }
        Err(failures.join("; "))
    }
}

/// One rung of the unmount ladder.
pub trait UnmountStrategy: Send + Sync {
    /// Short stable name for logs and outcomes.
    fn name(&self) -> &'static str;

    /// Try to unmount.
    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult;
}

fn posix_plain_commands(target: &MountTarget) -> Vec<CommandSpec> {
    let path = target.helper_arg();
    vec![
        CommandSpec::new("fusermount").args(["-u", &path]),
        CommandSpec::new("fusermount3").args(["-u", &path]),
        CommandSpec::new("umount").arg(&path),
    ]
}

/// `fusermount -u`, `fusermount3 -u`, then `umount`.
pub struct PlainUnmount;

impl UnmountStrategy for PlainUnmount {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult {
        match ctx.run_until_unmounted(posix_plain_commands(ctx.target), ctx.step_deadline()) {
            Ok(()) => StepResult::Unmounted(Detach::Immediate),
            Err(reason) => StepResult::Failed(reason),
        }
    }
}

/// Close file managers holding the target, then retry a plain unmount.
///
/// Only processes whose name is in the list are touched; an editor with
/// unsaved work is left alone and reported instead.
pub struct CloseFileManagers {
    names: Vec<String>,
}

impl CloseFileManagers {
    /// Close any of `names`.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for CloseFileManagers {
    fn default() -> Self {
        Self::new(KNOWN_FILE_MANAGERS.iter().copied())
    }
}

impl UnmountStrategy for CloseFileManagers {
    fn name(&self) -> &'static str {
        "close-holders"
    }

    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult {
        let holders = ctx.processes.holders(ctx.target, ctx.timeout);
        let managers: Vec<_> = holders
            .iter()
            .filter(|p| self.names.iter().any(|n| n == &p.name))
            .collect();

        if managers.is_empty() {
            return StepResult::Failed("no file manager holds the target".to_string());
        }

        for process in &managers {
            tracing::info!("Closing {} (PID {}) holding {}", process.name, process.pid, ctx.target);
            if !ctx.processes.terminate(process.pid) {
                tracing::warn!(
                    "Could not close {} (PID {}) holding {}",
                    process.name,
                    process.pid,
                    ctx.target
                );
            }
        }
        std::thread::sleep(ctx.settle);

        match ctx.run_until_unmounted(posix_plain_commands(ctx.target), ctx.step_deadline()) {
            Ok(()) => StepResult::Unmounted(Detach::Immediate),
            Err(reason) => StepResult::Failed(reason),
        }
    }
}

/// `fusermount -uz`, `fusermount3 -uz`, then `umount -l`.
pub struct LazyUnmount;

impl UnmountStrategy for LazyUnmount {
    fn name(&self) -> &'static str {
        "lazy"
    }

    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult {
        let path = ctx.target.helper_arg();
        let commands = vec![
            CommandSpec::new("fusermount").args(["-uz", &path]),
            CommandSpec::new("fusermount3").args(["-uz", &path]),
            CommandSpec::new("umount").args(["-l", &path]),
        ];
        match ctx.run_until_unmounted(commands, ctx.step_deadline()) {
            Ok(()) => StepResult::Unmounted(Detach::Deferred),
            Err(reason) => StepResult::Failed(reason),
        }
    }
}

/// `net use X: /delete /y`: removes a network-mode drive.
pub struct RemoveNetworkDrive;

impl UnmountStrategy for RemoveNetworkDrive {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult {
        let spec = CommandSpec::new("net").args(["use", &ctx.target.helper_arg(), "/delete", "/y"]);
        match ctx.run_until_unmounted(vec![spec], ctx.step_deadline()) {
            Ok(()) => StepResult::Unmounted(Detach::Immediate),
            // The drive may linger briefly after the helper lets go
            Err(_) if ctx.wait_unmounted(ctx.timeout.min(Duration::from_secs(2))) => {
                StepResult::Unmounted(Detach::Immediate)
            }
            Err(reason) => StepResult::Failed(reason),
        }
    }
}

/// Terminate the helper serving exactly this drive letter.
///
/// Other helpers keep running: each one serves a different bucket.
pub struct TerminateBoundHelper {
    helper_name: String,
}

impl TerminateBoundHelper {
    /// Look for processes named `helper_name`.
    pub fn new(helper_name: impl Into<String>) -> Self {
        Self {
            helper_name: helper_name.into(),
        }
    }
}

impl UnmountStrategy for TerminateBoundHelper {
    fn name(&self) -> &'static str {
        "terminate-bound-helper"
    }

    fn attempt(&self, ctx: &UnmountContext<'_>) -> StepResult {
        let wanted = ctx.target.helper_arg();
        let bound: Vec<_> = ctx
            .processes
            .find_by_name(&self.helper_name)
            .into_iter()
            .filter(|p| p.has_arg("mount") && p.has_arg(&wanted))
            .collect();

        if bound.is_empty() {
            return StepResult::Failed(format!("no {} process serves {}", self.helper_name, wanted));
        }

        for process in &bound {
            tracing::info!("Terminating helper PID {} bound to {}", process.pid, wanted);
            if !ctx.processes.terminate(process.pid) {
                tracing::warn!("Could not terminate helper PID {} bound to {}", process.pid, wanted);
            }
        }

        if ctx.wait_unmounted(ctx.timeout) {
            StepResult::Unmounted(Detach::Immediate)
        } else {
            StepResult::Failed(format!("{wanted} still present after terminating its helper"))
        }
    }
}

/// Runs the unmount ladder.
pub struct BusyUnmountRecovery {
    steps: Vec<Box<dyn UnmountStrategy>>,
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessTable>,
    probe: Arc<dyn SystemProbe>,
    step_timeout: Duration,
    settle: Duration,
}

impl BusyUnmountRecovery {
    /// Build a ladder from explicit steps.
    pub fn new(
        steps: Vec<Box<dyn UnmountStrategy>>,
        runner: Arc<dyn CommandRunner>,
        processes: Arc<dyn ProcessTable>,
        probe: Arc<dyn SystemProbe>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            steps,
            runner,
            processes,
            probe,
            step_timeout,
            settle: Duration::from_secs(1),
        }
    }

    /// The POSIX ladder.
    pub fn posix_steps() -> Vec<Box<dyn UnmountStrategy>> {
        vec![
            Box::new(PlainUnmount),
            Box::new(CloseFileManagers::default()),
            Box::new(LazyUnmount),
        ]
    }

    /// The Windows ladder.
    pub fn windows_steps(helper_name: &str) -> Vec<Box<dyn UnmountStrategy>> {
        vec![
            Box::new(RemoveNetworkDrive),
            Box::new(TerminateBoundHelper::new(helper_name)),
        ]
    }

    /// Change the pause after closing processes.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Names of the steps, in order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Unmount `target`, escalating until a step succeeds.
    pub fn unmount(&self, target: &MountTarget) -> Result<UnmountOutcome, MountError> {
        let ctx = UnmountContext {
            target,
            runner: self.runner.as_ref(),
            processes: self.processes.as_ref(),
            probe: self.probe.as_ref(),
            timeout: self.step_timeout,
            settle: self.settle,
        };

        for step in &self.steps {
            tracing::debug!("Unmount step '{}' on {}", step.name(), target);
            match step.attempt(&ctx) {
                StepResult::Unmounted(detach) => {
                    if detach == Detach::Deferred {
                        tracing::warn!(
                            "{} detached lazily; it is released once open files close",
                            target
                        );
                    }
                    return Ok(UnmountOutcome {
                        step: step.name(),
                        detach,
                    });
                }
                StepResult::Failed(reason) => {
                    tracing::warn!("Unmount step '{}' failed for {}: {}", step.name(), target, reason);
                }
            }
        }

        let mut holders: Vec<String> = self
            .processes
            .holders(target, self.step_timeout)
            .into_iter()
            .map(|p| p.name)
            .filter(|n| !n.is_empty())
            .collect();
        holders.sort();
        holders.dedup();

        Err(MountError::UnmountBusy {
            target: target.clone(),
            holders,
        })
    }
}
