//! External command execution.
//!
//! Every helper, unmount and service-manager command goes through a
//! [`CommandRunner`], so the lifecycle logic can be driven against a
//! simulated host in tests. [`SystemRunner`] is the real implementation.
//!
//! Commands always run with a timeout. A command that does not finish in
//! time is killed and reported as [`RunError::TimedOut`]; nothing waits
//! forever on a wedged FUSE mount.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Write};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;

/// Default timeout for short administrative commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A command to run, with its environment and timeout.
#[derive(Clone)]
pub struct CommandSpec {
    /// Program name or path
    pub program: OsString,
    /// Arguments
    pub args: Vec<OsString>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Bytes written to stdin, then stdin is closed
    pub stdin: Option<Vec<u8>>,
    /// Maximum run time
    pub timeout: Duration,
    /// Capture stdout/stderr. Disabled for helpers that daemonize, whose
    /// children would otherwise hold the pipes open.
    pub capture_output: bool,
}

impl CommandSpec {
    /// Start building a command.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            capture_output: true,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Add environment variables.
    #[must_use]
    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend_from_slice(env);
        self
    }

    /// Feed `input` on stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Discard stdout/stderr instead of capturing them.
    #[must_use]
    pub fn without_capture(mut self) -> Self {
        self.capture_output = false;
        self
    }

    /// Bare program name, e.g. `fusermount` for `/bin/fusermount`.
    pub fn program_name(&self) -> String {
        std::path::Path::new(&self.program)
            .file_stem()
            .unwrap_or(&self.program)
            .to_string_lossy()
            .into_owned()
    }

    /// Arguments as UTF-8 strings (lossy).
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Shell-like rendering for logs. Never includes stdin or env values.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.arg_strings());
        parts.join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field("timeout", &self.timeout)
            .field("has_stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub status: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short description of the exit status.
    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }

    /// stderr if present, else stdout, trimmed.
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl From<ExitStatus> for CommandOutput {
    fn from(status: ExitStatus) -> Self {
        Self {
            status: status.code(),
            ..Self::default()
        }
    }
}

/// Failures to run a command at all (as opposed to a non-zero exit).
#[derive(Error, Debug)]
pub enum RunError {
    /// The program does not exist on this host
    #[error("{0} is not installed")]
    NotFound(String),

    /// The program did not finish in time and was killed
    #[error("`{command}` timed out after {}ms", .timeout.as_millis())]
    TimedOut {
        /// Rendered command
        command: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Spawning or waiting failed
    #[error("failed to run `{command}`: {source}")]
    Io {
        /// Rendered command
        command: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// A long-lived process started in the background.
///
/// A watcher thread owns the child and reports its exit status, so callers
/// can stop waiting for readiness as soon as the helper dies.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Process ID
    pub pid: u32,
    exit: mpsc::Receiver<Option<i32>>,
}

impl SpawnedProcess {
    /// Wrap a PID and the receiving end of its exit notification.
    pub fn new(pid: u32, exit: mpsc::Receiver<Option<i32>>) -> Self {
        Self { pid, exit }
    }

    /// A process whose exit is never reported (still running as far as we know).
    pub fn untracked(pid: u32) -> Self {
        let (_tx, rx) = mpsc::channel();
        Self { pid, exit: rx }
    }

    /// `Some(code)` once the process has exited.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        self.exit.try_recv().ok()
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run to completion (or timeout) and collect output.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError>;

    /// Start a long-lived process detached from the caller.
    fn spawn_detached(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RunError>;
}

/// Runs commands on the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create the runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let rendered = spec.display();
        tracing::debug!(command = %rendered, timeout_ms = spec.timeout.as_millis() as u64, "Running command");

        let mut cmd = base_command(spec);
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if spec.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;

        if let Some(input) = &spec.stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            // A helper that exits before reading stdin is not an error here;
            // its exit status tells the real story.
            let _ = pipe.write_all(input);
        }

        let pid = child.id();
        let capture = spec.capture_output;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = if capture {
                child.wait_with_output().map(CommandOutput::from)
            } else {
                child.wait().map(CommandOutput::from)
            };
            let _ = tx.send(result);
        });

        match rx.recv_timeout(spec.timeout) {
            Ok(Ok(output)) => {
                tracing::debug!(command = %rendered, status = ?output.status, "Command finished");
                Ok(output)
            }
            Ok(Err(source)) => Err(RunError::Io {
                command: rendered,
                source,
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(command = %rendered, "Command timed out, killing PID {}", pid);
                kill_pid(pid);
                Err(RunError::TimedOut {
                    command: rendered,
                    timeout: spec.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RunError::Io {
                command: rendered,
                source: io::Error::other("command wait thread terminated unexpectedly"),
            }),
        }
    }

    fn spawn_detached(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RunError> {
        tracing::debug!(command = %spec.display(), "Spawning detached process");

        let mut cmd = base_command(spec);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        detach(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let code = child.wait().ok().and_then(|s| s.code());
            let _ = tx.send(code);
        });

        Ok(SpawnedProcess::new(pid, rx))
    }
}

fn base_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    hide_console(&mut cmd);
    cmd
}

fn spawn_error(spec: &CommandSpec, e: io::Error) -> RunError {
    if e.kind() == io::ErrorKind::NotFound {
        RunError::NotFound(spec.program_name())
    } else {
        RunError::Io {
            command: spec.display(),
            source: e,
        }
    }
}

/// Put the child in its own session so it outlives our terminal.
#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // setsid() creates a new session and process group with the child as
    // leader, detaching it from the controlling terminal.
    unsafe {
        command.pre_exec(|| match nix::unistd::setsid() {
            Ok(_) => Ok(()),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

#[cfg(windows)]
fn hide_console(command: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command) {}

/// Kill a process we started and gave up on.
#[cfg(unix)]
pub(crate) fn kill_pid(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
}

#[cfg(windows)]
pub(crate) fn kill_pid(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn kill_pid(_pid: u32) {}
