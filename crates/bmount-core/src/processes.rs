//! Process table queries: who holds a mount open, which helper serves
//! which target, and terminating a single process.
//!
//! Holder detection uses `lsof` (slow but thorough). Helper lookup reads the
//! native process table through `sysinfo`; on Windows, where command lines
//! of other processes can be unreadable, `wmic` is the secondary scan.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};

use crate::process::{CommandRunner, CommandSpec};
use crate::target::MountTarget;

/// A process seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Executable name without extension
    pub name: String,
    /// Command line, empty when it could not be read
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    /// Whether any argument equals `arg` (case-insensitive, Windows paths
    /// and drive letters are not case-sensitive).
    pub fn has_arg(&self, arg: &str) -> bool {
        self.cmdline.iter().any(|a| a.eq_ignore_ascii_case(arg))
    }
}

/// Process enumeration and termination.
pub trait ProcessTable: Send + Sync {
    /// Processes holding files open under the target.
    fn holders(&self, target: &MountTarget, timeout: Duration) -> Vec<ProcessInfo>;

    /// Processes whose executable name is `name` (case-insensitive,
    /// extension ignored), with command lines where readable.
    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo>;

    /// Ask a process to exit, then force it. Returns whether a signal was
    /// delivered.
    fn terminate(&self, pid: u32) -> bool;
}

/// Process table of the real host.
pub struct SystemProcesses {
    runner: Arc<dyn CommandRunner>,
}

impl SystemProcesses {
    /// Create a process table using `runner` for `lsof`/`wmic`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn scan_with_wmic(&self, name: &str) -> Vec<ProcessInfo> {
        let exe = format!("{name}.exe");
        let spec = CommandSpec::new("wmic").args([
            "process",
            "where",
            &format!("name='{exe}'"),
            "get",
            "ProcessId,CommandLine",
            "/format:csv",
        ]);
        match self.runner.run(&spec) {
            Ok(out) if out.success() => parse_wmic_csv(&out.stdout, name),
            Ok(out) => {
                tracing::debug!("wmic exited with {}", out.status_text());
                Vec::new()
            }
            Err(e) => {
                tracing::debug!("wmic unavailable: {}", e);
                Vec::new()
            }
        }
    }
}

impl ProcessTable for SystemProcesses {
    fn holders(&self, target: &MountTarget, timeout: Duration) -> Vec<ProcessInfo> {
        let Some(dir) = target.as_dir() else {
            return Vec::new();
        };

        // -F pc: machine-readable pid and command fields
        let spec = CommandSpec::new("lsof")
            .args(["-w", "-F", "pc", "+D"])
            .arg(dir)
            .timeout(timeout);
        match self.runner.run(&spec) {
            // lsof exits 1 when nothing holds the directory
            Ok(out) => parse_lsof_fields(&out.stdout),
            Err(e) => {
                tracing::debug!("Cannot list holders of {}: {}", target, e);
                Vec::new()
            }
        }
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        let found: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .filter(|(_, p)| executable_matches(&p.name().to_string_lossy(), name))
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: name.to_string(),
                cmdline: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect();

        if cfg!(windows) && found.iter().any(|p| p.cmdline.is_empty()) {
            tracing::debug!("Command lines unreadable for some {} processes, scanning with wmic", name);
            let scanned = self.scan_with_wmic(name);
            if !scanned.is_empty() {
                return scanned;
            }
        }

        found
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );

        let Some(process) = system.process(sys_pid) else {
            return false;
        };

        tracing::info!("Terminating PID {} ({})", pid, process.name().to_string_lossy());
        // SIGTERM first so the helper can flush its write-back cache
        match process.kill_with(Signal::Term) {
            Some(true) => true,
            _ => process.kill(),
        }
    }
}

/// Case-insensitive executable match ignoring a `.exe` suffix.
pub fn executable_matches(process_name: &str, wanted: &str) -> bool {
    let lower = process_name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".exe").unwrap_or(&lower);
    stem == wanted.to_ascii_lowercase()
}

/// Parse `lsof -F pc` output into one entry per process.
pub fn parse_lsof_fields(stdout: &str) -> Vec<ProcessInfo> {
    let mut result: Vec<ProcessInfo> = Vec::new();

    for line in stdout.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        match tag {
            'p' => {
                if let Ok(pid) = value.parse() {
                    result.push(ProcessInfo {
                        pid,
                        name: String::new(),
                        cmdline: Vec::new(),
                    });
                }
            }
            'c' => {
                if let Some(last) = result.last_mut() {
                    last.name = value.to_string();
                }
            }
            _ => {}
        }
    }

    result.dedup_by_key(|p| p.pid);
    result
}

/// Parse `wmic ... get ProcessId,CommandLine /format:csv`.
///
/// Columns are `Node,CommandLine,ProcessId`; the command line may itself
/// contain commas, so the PID is taken from the last column.
pub fn parse_wmic_csv(stdout: &str, name: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Node,"))
        .filter_map(|line| {
            let (rest, pid) = line.rsplit_once(',')?;
            let pid = pid.trim().parse().ok()?;
            let (_, cmdline) = rest.split_once(',')?;
            Some(ProcessInfo {
                pid,
                name: name.to_string(),
                cmdline: split_command_line(cmdline),
            })
        })
        .collect()
}

/// Split a Windows command line on whitespace, honoring double quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        args.push(current);
    }
    args
}
