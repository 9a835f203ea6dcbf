//! In-memory host simulator for lifecycle tests.
//!
//! [`FakeHost`] implements every OS-facing trait the manager is built from
//! ([`CommandRunner`], [`SystemProbe`], [`ProcessTable`], [`TargetDirs`])
//! over one shared state, so a test can stage mounts, stale entries, busy
//! holders and service-manager refusals, then observe exactly what the
//! manager did to the host.
//!
//! The commands it understands are the ones the library issues: `rclone`,
//! `fusermount`/`fusermount3`/`umount`, `net use`, `reg query`, `install`,
//! `rm`, `systemctl`, `schtasks`, plus the `sudo`/`pkexec`/`powershell`
//! elevation wrappers. Anything else is reported as not installed.
//!
//! # Usage
//!
//! ```ignore
//! use bmount_core::testing::{BusyMode, FakeHost};
//!
//! let host = Arc::new(FakeHost::posix());
//! host.set_busy(&target, BusyMode::HeldBy(vec![(501, "nautilus".into())]));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::platform::{PlatformKind, TargetDirs};
use crate::probe::{Listing, MountedVolume, SystemProbe};
use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError, SpawnedProcess};
use crate::processes::{ProcessInfo, ProcessTable};
use crate::target::MountTarget;

/// Message a dead FUSE connection produces.
const DEAD_CONNECTION: &str = "Transport endpoint is not connected (os error 107)";

/// How the simulated helper reacts to `mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperMode {
    /// The volume appears immediately
    Ready,
    /// The helper keeps running but the volume never appears
    NeverReady,
    /// A daemonizing launch forks the helper but never returns, so the
    /// caller sees its command time out; foreground launches act like
    /// `NeverReady`
    LaunchHangs,
    /// The helper exits with status 1 and this message
    Fail(String),
}

/// Why a mounted target refuses to unmount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyMode {
    /// Held open by these `(pid, name)` processes until they exit; a lazy
    /// unmount detaches anyway
    HeldBy(Vec<(u32, String)>),
    /// Held by these processes and nothing, not even a lazy unmount, helps
    Stuck(Vec<(u32, String)>),
}

impl BusyMode {
    fn holders(&self) -> &[(u32, String)] {
        match self {
            BusyMode::HeldBy(h) | BusyMode::Stuck(h) => h,
        }
    }
}

#[derive(Debug, Clone)]
struct Volume {
    identity: Option<String>,
    helper_pid: Option<u32>,
    stale: bool,
}

#[derive(Debug)]
struct State {
    platform: PlatformKind,
    directories: BTreeMap<PathBuf, Vec<String>>,
    volumes: BTreeMap<MountTarget, Volume>,
    busy: BTreeMap<MountTarget, BusyMode>,
    processes: BTreeMap<u32, ProcessInfo>,
    terminated: Vec<u32>,
    next_pid: u32,
    helper_mode: HelperMode,
    conflicts_remaining: usize,
    helper_installed: bool,
    mount_support: bool,
    helper_invocations: usize,
    require_root: bool,
    sudo_password: Option<String>,
    pkexec_allowed: bool,
    uac_accepted: bool,
    enabled_units: BTreeSet<String>,
    tasks: BTreeMap<String, String>,
    commands: Vec<String>,
}

/// A simulated host.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    /// A POSIX host with rclone and FUSE installed and nothing mounted.
    pub fn posix() -> Self {
        Self::new(PlatformKind::Posix)
    }

    /// A Windows host with rclone and WinFsp installed and no drives mapped.
    pub fn windows() -> Self {
        Self::new(PlatformKind::Windows)
    }

    fn new(platform: PlatformKind) -> Self {
        Self {
            state: Mutex::new(State {
                platform,
                directories: BTreeMap::new(),
                volumes: BTreeMap::new(),
                busy: BTreeMap::new(),
                processes: BTreeMap::new(),
                terminated: Vec::new(),
                next_pid: 4000,
                helper_mode: HelperMode::Ready,
                conflicts_remaining: 0,
                helper_installed: true,
                mount_support: true,
                helper_invocations: 0,
                require_root: false,
                sudo_password: None,
                pkexec_allowed: true,
                uac_accepted: true,
                enabled_units: BTreeSet::new(),
                tasks: BTreeMap::new(),
                commands: Vec::new(),
            }),
        }
    }

    /// Create a plain directory containing `entries`.
    pub fn add_directory(&self, path: &str, entries: &[&str]) {
        self.state.lock().directories.insert(
            PathBuf::from(path),
            entries.iter().map(|e| (*e).to_string()).collect(),
        );
    }

    /// Whether a directory exists.
    pub fn has_directory(&self, path: &str) -> bool {
        self.state.lock().directories.contains_key(Path::new(path))
    }

    /// Mount a volume not started by the manager.
    pub fn add_foreign_volume(&self, target: MountTarget, identity: Option<&str>) {
        self.state.lock().volumes.insert(
            target,
            Volume {
                identity: identity.map(str::to_string),
                helper_pid: None,
                stale: false,
            },
        );
    }

    /// Mount a volume served by a running helper with PID `pid`.
    pub fn add_helper_volume(&self, target: &MountTarget, identity: &str, pid: u32) {
        let mut state = self.state.lock();
        state.processes.insert(
            pid,
            ProcessInfo {
                pid,
                name: "rclone".to_string(),
                cmdline: vec![
                    "rclone".to_string(),
                    "mount".to_string(),
                    format!("remote:{identity}"),
                    target.helper_arg(),
                    "--volname".to_string(),
                    identity.to_string(),
                ],
            },
        );
        state.volumes.insert(
            target.clone(),
            Volume {
                identity: Some(identity.to_string()),
                helper_pid: Some(pid),
                stale: false,
            },
        );
    }

    /// Kill the helper behind a volume without unmounting it.
    pub fn make_stale(&self, target: &MountTarget) {
        let mut state = self.state.lock();
        let pid = state.volumes.get_mut(target).and_then(|v| {
            v.stale = true;
            v.helper_pid.take()
        });
        if let Some(pid) = pid {
            state.processes.remove(&pid);
        }
    }

    /// Make unmounting `target` fail as described by `mode`.
    pub fn set_busy(&self, target: &MountTarget, mode: BusyMode) {
        let mut state = self.state.lock();
        for (pid, name) in mode.holders() {
            state.processes.insert(
                *pid,
                ProcessInfo {
                    pid: *pid,
                    name: name.clone(),
                    cmdline: vec![name.clone()],
                },
            );
        }
        state.busy.insert(target.clone(), mode);
    }

    /// Change how the helper reacts to `mount`.
    pub fn set_helper_mode(&self, mode: HelperMode) {
        self.state.lock().helper_mode = mode;
    }

    /// Fail the next `count` mounts with a "mountpoint in use" message.
    pub fn fail_with_conflict(&self, count: usize) {
        self.state.lock().conflicts_remaining = count;
    }

    /// Uninstall the helper.
    pub fn remove_helper(&self) {
        self.state.lock().helper_installed = false;
    }

    /// Uninstall FUSE (POSIX) or WinFsp (Windows).
    pub fn remove_mount_support(&self) {
        self.state.lock().mount_support = false;
    }

    /// Make service-manager commands fail unless elevated.
    pub fn require_root(&self, required: bool) {
        self.state.lock().require_root = required;
    }

    /// Password `sudo -S` accepts; `sudo -n` fails while one is set.
    pub fn set_sudo_password(&self, password: Option<&str>) {
        self.state.lock().sudo_password = password.map(str::to_string);
    }

    /// Whether the polkit agent authorizes `pkexec`.
    pub fn allow_pkexec(&self, allowed: bool) {
        self.state.lock().pkexec_allowed = allowed;
    }

    /// Whether the user accepts UAC prompts.
    pub fn accept_uac(&self, accepted: bool) {
        self.state.lock().uac_accepted = accepted;
    }

    /// PIDs terminated through the process table, in order.
    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().terminated.clone()
    }

    /// Number of `rclone mount` invocations so far.
    pub fn helper_invocations(&self) -> usize {
        self.state.lock().helper_invocations
    }

    /// Running processes named `rclone`.
    pub fn running_helpers(&self) -> Vec<u32> {
        let state = self.state.lock();
        state
            .processes
            .values()
            .filter(|p| p.name == "rclone")
            .map(|p| p.pid)
            .collect()
    }

    /// Whether systemd has the unit enabled.
    pub fn unit_enabled(&self, unit: &str) -> bool {
        self.state.lock().enabled_units.contains(unit)
    }

    /// XML of a registered scheduled task.
    pub fn task_xml(&self, name: &str) -> Option<String> {
        self.state.lock().tasks.get(name).cloned()
    }

    /// Every command run so far, rendered.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }
}

impl State {
    fn spawn_process(&mut self, name: &str, cmdline: Vec<String>) -> u32 {
        self.next_pid += 1;
        let pid = self.next_pid;
        self.processes.insert(
            pid,
            ProcessInfo {
                pid,
                name: name.to_string(),
                cmdline,
            },
        );
        pid
    }

    fn live_holders(&self, target: &MountTarget) -> Vec<(u32, String)> {
        self.busy
            .get(target)
            .map(|mode| {
                mode.holders()
                    .iter()
                    .filter(|(pid, _)| self.processes.contains_key(pid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_stuck(&self, target: &MountTarget) -> bool {
        matches!(self.busy.get(target), Some(BusyMode::Stuck(_)))
    }

    fn detach(&mut self, target: &MountTarget) {
        if let Some(volume) = self.volumes.remove(target)
            && let Some(pid) = volume.helper_pid
        {
            // The helper exits once its mount is gone
            self.processes.remove(&pid);
        }
        self.busy.remove(target);
    }

    fn target_from_arg(&self, arg: &str) -> MountTarget {
        match self.platform {
            PlatformKind::Windows => MountTarget::parse(arg, PlatformKind::Windows),
            PlatformKind::Posix => MountTarget::Directory(PathBuf::from(arg)),
        }
    }

    fn run(&mut self, spec: &CommandSpec, elevated: bool) -> Result<CommandOutput, RunError> {
        let program = spec.program_name().to_lowercase();
        let args = spec.arg_strings();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match program.as_str() {
            "sudo" => self.sudo(spec, &args),
            "pkexec" => {
                if !self.pkexec_allowed {
                    return Ok(CommandOutput::failed(126, "Error executing command as another user: Request dismissed"));
                }
                self.run(&unwrap_command(spec, 0), true)
            }
            "powershell" => Ok(self.powershell(&args)),
            "rclone" => {
                let (out, pid) = self.rclone(&args)?;
                if pid.is_some() && self.helper_mode == HelperMode::LaunchHangs {
                    return Err(RunError::TimedOut {
                        command: spec.display(),
                        timeout: spec.timeout,
                    });
                }
                Ok(out)
            }
            "fusermount" | "fusermount3" => self.fusermount(&args),
            "umount" => Ok(self.umount(&args)),
            "net" => Ok(self.net_use(&args)),
            "reg" => Ok(if self.mount_support {
                CommandOutput::ok("HKEY_LOCAL_MACHINE\\SOFTWARE\\WinFsp\n")
            } else {
                CommandOutput::failed(1, "ERROR: The system was unable to find the specified registry key or value.")
            }),
            "install" => Ok(self.install(&args, elevated)),
            "rm" => Ok(self.rm(&args, elevated)),
            "systemctl" => Ok(self.systemctl(&args, elevated)),
            "schtasks" => Ok(self.schtasks(&args, elevated)),
            _ => Err(RunError::NotFound(spec.program_name())),
        }
    }

    fn sudo(&mut self, spec: &CommandSpec, args: &[&str]) -> Result<CommandOutput, RunError> {
        let mut skip = 0;
        let mut with_stdin = false;
        while let Some(flag) = args.get(skip) {
            match *flag {
                "-S" => with_stdin = true,
                "-n" => {}
                "-p" => skip += 1,
                _ => break,
            }
            skip += 1;
        }

        if let Some(expected) = &self.sudo_password {
            if !with_stdin {
                return Ok(CommandOutput::failed(1, "sudo: a password is required"));
            }
            let given = spec
                .stdin
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).trim_end().to_string());
            if given.as_deref() != Some(expected.as_str()) {
                return Ok(CommandOutput::failed(
                    1,
                    "Sorry, try again.\nsudo: 1 incorrect password attempt",
                ));
            }
        }
        self.run(&unwrap_command(spec, skip), true)
    }

    fn powershell(&mut self, args: &[&str]) -> CommandOutput {
        let script = args.last().copied().unwrap_or_default();
        if !self.uac_accepted {
            return CommandOutput::failed(
                1,
                "Start-Process : This command cannot be run due to the error: The operation was canceled by the user.",
            );
        }
        let Some(list) = script
            .split_once("-ArgumentList ")
            .and_then(|(_, rest)| rest.split_once(" -Verb").map(|(list, _)| list))
        else {
            return CommandOutput::failed(1, "unsupported script");
        };
        let inner: Vec<String> = list
            .split(',')
            .map(|a| a.trim().trim_matches('\'').replace("''", "'"))
            .collect();
        let inner: Vec<&str> = inner.iter().map(String::as_str).collect();
        self.schtasks(&inner, true)
    }

    /// Returns the output and, for a foreground launch, the helper PID.
    fn rclone(&mut self, args: &[&str]) -> Result<(CommandOutput, Option<u32>), RunError> {
        if !self.helper_installed {
            return Err(RunError::NotFound("rclone".to_string()));
        }
        match args.first() {
            Some(&"--version") => return Ok((CommandOutput::ok("rclone v1.66.0\n- os/version: test\n"), None)),
            Some(&"mount") => {}
            _ => return Ok((CommandOutput::failed(1, "unknown command"), None)),
        }

        self.helper_invocations += 1;
        let (Some(remote), Some(target_arg)) = (args.get(1), args.get(2)) else {
            return Ok((CommandOutput::failed(1, "usage: rclone mount remote:path /path/to/mountpoint"), None));
        };
        let target = self.target_from_arg(target_arg);

        let failure = if self.conflicts_remaining > 0 {
            self.conflicts_remaining -= 1;
            Some(format!("Fatal error: {target_arg}: already in use"))
        } else if self.volumes.contains_key(&target) {
            Some("Fatal error: directory already mounted".to_string())
        } else if target
            .as_dir()
            .is_some_and(|dir| !self.directories.contains_key(dir))
        {
            Some(format!("Fatal error: unable to mount: {target_arg}: no such file or directory"))
        } else if let HelperMode::Fail(message) = &self.helper_mode {
            Some(message.clone())
        } else {
            None
        };
        if let Some(message) = failure {
            // Foreground helpers only report through their log file
            if let Some(log) = args
                .iter()
                .position(|a| *a == "--log-file")
                .and_then(|i| args.get(i + 1))
            {
                let _ = std::fs::write(log, format!("{message}\n"));
            }
            return Ok((CommandOutput::failed(1, message), None));
        }

        let mut cmdline = vec!["rclone".to_string()];
        cmdline.extend(args.iter().map(|a| (*a).to_string()));
        let pid = self.spawn_process("rclone", cmdline);

        if self.helper_mode == HelperMode::Ready {
            let identity = match self.platform {
                PlatformKind::Posix => (*remote).to_string(),
                PlatformKind::Windows => args
                    .iter()
                    .position(|a| *a == "--volname")
                    .and_then(|i| args.get(i + 1))
                    .map_or_else(|| (*remote).to_string(), |l| (*l).to_string()),
            };
            self.volumes.insert(
                target,
                Volume {
                    identity: Some(identity),
                    helper_pid: Some(pid),
                    stale: false,
                },
            );
        }
        Ok((CommandOutput::ok(""), Some(pid)))
    }

    fn plain_unmount(&mut self, target: &MountTarget) -> CommandOutput {
        if !self.volumes.contains_key(target) {
            return CommandOutput::failed(1, format!("{target}: not mounted"));
        }
        if self.is_stuck(target) || !self.live_holders(target).is_empty() {
            return CommandOutput::failed(1, format!("failed to unmount {target}: Device or resource busy"));
        }
        self.detach(target);
        CommandOutput::ok("")
    }

    fn lazy_unmount(&mut self, target: &MountTarget) -> CommandOutput {
        if !self.volumes.contains_key(target) {
            return CommandOutput::failed(1, format!("{target}: not mounted"));
        }
        if self.is_stuck(target) {
            return CommandOutput::failed(1, format!("failed to unmount {target}: Device or resource busy"));
        }
        self.detach(target);
        CommandOutput::ok("")
    }

    fn fusermount(&mut self, args: &[&str]) -> Result<CommandOutput, RunError> {
        if !self.mount_support {
            return Err(RunError::NotFound("fusermount".to_string()));
        }
        Ok(match args {
            ["-V"] => CommandOutput::ok("fusermount3 version: 3.14.0"),
            ["-u", path] => {
                let target = self.target_from_arg(path);
                self.plain_unmount(&target)
            }
            ["-uz", path] => {
                let target = self.target_from_arg(path);
                self.lazy_unmount(&target)
            }
            _ => CommandOutput::failed(1, "fusermount: unknown option"),
        })
    }

    fn umount(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["-l", path] => {
                let target = self.target_from_arg(path);
                self.lazy_unmount(&target)
            }
            [path] => {
                let target = self.target_from_arg(path);
                self.plain_unmount(&target)
            }
            _ => CommandOutput::failed(1, "umount: bad usage"),
        }
    }

    fn net_use(&mut self, args: &[&str]) -> CommandOutput {
        let ["use", drive, "/delete", "/y"] = args else {
            return CommandOutput::failed(1, "The syntax of this command is:\nNET USE");
        };
        let target = MountTarget::parse(drive, PlatformKind::Windows);
        if !self.volumes.contains_key(&target) {
            return CommandOutput::failed(2, "The network connection could not be found.");
        }
        if self.is_stuck(&target) || !self.live_holders(&target).is_empty() {
            return CommandOutput::failed(
                2,
                "There are open files and/or incomplete directory searches pending on the connection.",
            );
        }
        self.detach(&target);
        CommandOutput::ok(format!("{drive} was deleted successfully."))
    }

    fn install(&mut self, args: &[&str], elevated: bool) -> CommandOutput {
        let [.., src, dest] = args else {
            return CommandOutput::failed(1, "install: missing file operand");
        };
        if self.require_root && !elevated {
            return CommandOutput::failed(1, format!("install: cannot create regular file '{dest}': Permission denied"));
        }
        match std::fs::copy(src, dest) {
            Ok(_) => CommandOutput::ok(""),
            Err(e) => CommandOutput::failed(1, format!("install: {e}")),
        }
    }

    fn rm(&mut self, args: &[&str], elevated: bool) -> CommandOutput {
        let Some(path) = args.last() else {
            return CommandOutput::failed(1, "rm: missing operand");
        };
        if self.require_root && !elevated {
            return CommandOutput::failed(1, format!("rm: cannot remove '{path}': Permission denied"));
        }
        match std::fs::remove_file(path) {
            Ok(()) => CommandOutput::ok(""),
            Err(e) if e.kind() == io::ErrorKind::NotFound => CommandOutput::ok(""),
            Err(e) => CommandOutput::failed(1, format!("rm: {e}")),
        }
    }

    fn systemctl(&mut self, args: &[&str], elevated: bool) -> CommandOutput {
        let mutating = matches!(args.first(), Some(&("daemon-reload" | "enable" | "disable")));
        if mutating && self.require_root && !elevated {
            return CommandOutput::failed(1, "Failed to reload daemon: Access denied");
        }
        match args {
            ["daemon-reload"] => CommandOutput::ok(""),
            ["enable", unit] => {
                self.enabled_units.insert((*unit).to_string());
                CommandOutput::ok(format!("Created symlink /etc/systemd/system/default.target.wants/{unit}"))
            }
            ["disable", unit] => {
                if self.enabled_units.remove(*unit) {
                    CommandOutput::ok(format!("Removed /etc/systemd/system/default.target.wants/{unit}."))
                } else {
                    CommandOutput::failed(1, format!("Failed to disable unit: Unit file {unit} does not exist."))
                }
            }
            ["is-enabled", unit] => {
                if self.enabled_units.contains(*unit) {
                    CommandOutput::ok("enabled\n")
                } else {
                    CommandOutput {
                        status: Some(1),
                        stdout: "disabled\n".to_string(),
                        stderr: String::new(),
                    }
                }
            }
            _ => CommandOutput::failed(1, "Unknown command verb"),
        }
    }

    fn schtasks(&mut self, args: &[&str], elevated: bool) -> CommandOutput {
        const MISSING: &str = "ERROR: The system cannot find the file specified.";
        match args {
            ["/Create", "/TN", name, "/XML", path, "/F"] => {
                if self.require_root && !elevated {
                    return CommandOutput::failed(1, "ERROR: Access is denied.");
                }
                match std::fs::read(path) {
                    Ok(bytes) => {
                        self.tasks.insert((*name).to_string(), decode_utf16_bom(&bytes));
                        CommandOutput::ok(format!("SUCCESS: The scheduled task \"{name}\" has successfully been created."))
                    }
                    Err(e) => CommandOutput::failed(1, format!("ERROR: {e}")),
                }
            }
            ["/Delete", "/TN", name, "/F"] => {
                if self.require_root && !elevated && self.tasks.contains_key(*name) {
                    return CommandOutput::failed(1, "ERROR: Access is denied.");
                }
                if self.tasks.remove(*name).is_some() {
                    CommandOutput::ok(format!("SUCCESS: The scheduled task \"{name}\" was successfully deleted."))
                } else {
                    CommandOutput::failed(1, MISSING)
                }
            }
            ["/Query", "/TN", name, "/XML"] => match self.tasks.get(*name) {
                Some(xml) => CommandOutput::ok(xml.clone()),
                None => CommandOutput::failed(1, MISSING),
            },
            _ => CommandOutput::failed(1, "ERROR: Invalid syntax."),
        }
    }
}

/// The command wrapped by an elevation tool, after `skip` wrapper flags.
fn unwrap_command(spec: &CommandSpec, skip: usize) -> CommandSpec {
    let mut args = spec.args.iter().skip(skip);
    let Some(program) = args.next() else {
        return CommandSpec::new("");
    };
    let mut inner = CommandSpec::new(program)
        .args(args)
        .envs(&spec.env)
        .timeout(spec.timeout);
    inner.stdin.clone_from(&spec.stdin);
    inner
}

fn decode_utf16_bom(bytes: &[u8]) -> String {
    let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

impl CommandRunner for FakeHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let mut state = self.state.lock();
        state.commands.push(spec.display());
        state.run(spec, false)
    }

    fn spawn_detached(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RunError> {
        let mut state = self.state.lock();
        state.commands.push(spec.display());
        if spec.program_name().to_lowercase() != "rclone" {
            return Err(RunError::NotFound(spec.program_name()));
        }

        let args = spec.arg_strings();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let (out, pid) = state.rclone(&args)?;
        match pid {
            Some(pid) => Ok(SpawnedProcess::untracked(pid)),
            None => {
                // The helper exited right away; report it like a watcher would
                let (tx, rx) = mpsc::channel();
                let _ = tx.send(out.status);
                state.next_pid += 1;
                Ok(SpawnedProcess::new(state.next_pid, rx))
            }
        }
    }
}

impl SystemProbe for FakeHost {
    fn exists(&self, target: &MountTarget) -> bool {
        let state = self.state.lock();
        state.volumes.contains_key(target)
            || target
                .as_dir()
                .is_some_and(|dir| state.directories.contains_key(dir))
    }

    fn is_mount_point(&self, target: &MountTarget) -> bool {
        self.state.lock().volumes.contains_key(target)
    }

    fn identity(&self, target: &MountTarget) -> Option<String> {
        self.state
            .lock()
            .volumes
            .get(target)
            .and_then(|v| v.identity.clone())
    }

    fn mounted(&self) -> Vec<MountedVolume> {
        self.state
            .lock()
            .volumes
            .iter()
            .map(|(target, v)| MountedVolume {
                target: target.clone(),
                identity: v.identity.clone(),
            })
            .collect()
    }

    fn list(&self, target: &MountTarget, _timeout: Duration) -> Listing {
        let state = self.state.lock();
        if let Some(volume) = state.volumes.get(target) {
            return if volume.stale {
                Listing::Failed(DEAD_CONNECTION.to_string())
            } else {
                Listing::Readable { empty: false }
            };
        }
        match target.as_dir().and_then(|dir| state.directories.get(dir)) {
            Some(entries) => Listing::Readable {
                empty: entries.is_empty(),
            },
            None => Listing::Missing,
        }
    }
}

impl ProcessTable for FakeHost {
    fn holders(&self, target: &MountTarget, _timeout: Duration) -> Vec<ProcessInfo> {
        let state = self.state.lock();
        state
            .live_holders(target)
            .into_iter()
            .map(|(pid, name)| ProcessInfo {
                pid,
                cmdline: vec![name.clone()],
                name,
            })
            .collect()
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo> {
        self.state
            .lock()
            .processes
            .values()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        if state.processes.remove(&pid).is_none() {
            return false;
        }
        state.terminated.push(pid);

        let served: Vec<MountTarget> = state
            .volumes
            .iter()
            .filter(|(_, v)| v.helper_pid == Some(pid))
            .map(|(t, _)| t.clone())
            .collect();
        for target in served {
            match state.platform {
                // WinFsp removes the drive with its process
                PlatformKind::Windows => state.detach(&target),
                // The kernel keeps a dead FUSE entry
                PlatformKind::Posix => {
                    if let Some(volume) = state.volumes.get_mut(&target) {
                        volume.stale = true;
                        volume.helper_pid = None;
                    }
                }
            }
        }
        true
    }
}

impl TargetDirs for FakeHost {
    fn create(&self, dir: &Path) -> io::Result<()> {
        self.state
            .lock()
            .directories
            .entry(dir.to_path_buf())
            .or_default();
        Ok(())
    }

    fn remove_if_empty(&self, dir: &Path) -> io::Result<bool> {
        let mut state = self.state.lock();
        if state
            .volumes
            .contains_key(&MountTarget::Directory(dir.to_path_buf()))
        {
            return Err(io::Error::other("Device or resource busy"));
        }
        match state.directories.get(dir) {
            Some(entries) if entries.is_empty() => {
                state.directories.remove(dir);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemonized_mount_creates_volume() {
        let host = FakeHost::posix();
        host.add_directory("/home/a/haio-a-x", &[]);
        let spec = CommandSpec::new("rclone").args(["mount", "haio_a:x", "/home/a/haio-a-x", "--daemon"]);

        assert!(host.run(&spec).unwrap().success());
        let target = MountTarget::Directory(PathBuf::from("/home/a/haio-a-x"));
        assert_eq!(host.identity(&target).as_deref(), Some("haio_a:x"));
        assert_eq!(host.running_helpers().len(), 1);
    }

    #[test]
    fn test_hanging_launch_times_out_with_helper_left_running() {
        let host = FakeHost::posix();
        host.set_helper_mode(HelperMode::LaunchHangs);
        host.add_directory("/home/a/haio-a-x", &[]);
        let spec = CommandSpec::new("rclone")
            .args(["mount", "haio_a:x", "/home/a/haio-a-x", "--daemon"])
            .timeout(Duration::from_secs(3));

        let err = host.run(&spec).unwrap_err();
        assert!(matches!(err, RunError::TimedOut { timeout, .. } if timeout == Duration::from_secs(3)));
        assert_eq!(host.running_helpers().len(), 1);
        let target = MountTarget::Directory(PathBuf::from("/home/a/haio-a-x"));
        assert!(!host.is_mount_point(&target));
    }

    #[test]
    fn test_sudo_checks_password() {
        let host = FakeHost::posix();
        host.set_sudo_password(Some("pw"));
        host.require_root(true);

        let bad = CommandSpec::new("sudo").args(["-S", "-p", "", "systemctl", "daemon-reload"]).stdin("nope\n");
        assert!(host.run(&bad).unwrap().stderr.contains("incorrect password"));

        let good = CommandSpec::new("sudo").args(["-S", "-p", "", "systemctl", "daemon-reload"]).stdin("pw\n");
        assert!(host.run(&good).unwrap().success());

        let plain = CommandSpec::new("systemctl").arg("daemon-reload");
        assert!(host.run(&plain).unwrap().stderr.contains("Access denied"));
    }

    #[test]
    fn test_killing_posix_helper_leaves_stale_entry() {
        let host = FakeHost::posix();
        let target = MountTarget::Directory(PathBuf::from("/m"));
        host.add_helper_volume(&target, "haio_a:x", 77);

        assert!(host.terminate(77));
        assert!(host.is_mount_point(&target));
        assert!(matches!(host.list(&target, Duration::ZERO), Listing::Failed(_)));
    }

    #[test]
    fn test_unknown_program_is_not_found() {
        let host = FakeHost::windows();
        let err = host.run(&CommandSpec::new("mystery")).unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }
}
