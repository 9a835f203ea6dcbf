//! Privilege escalation for service registration.
//!
//! Installing a system unit or some scheduled tasks needs administrator
//! rights. The caller decides up front whether elevation may be used; without
//! it, a refusal is reported as "elevation required" instead of prompting.

use std::fmt;

use crate::config::ElevationKind;
use crate::error::ServiceFailure;
use crate::process::{CommandOutput, CommandSpec};

/// How privileged commands are run.
#[derive(Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Run as-is (already privileged, or fail)
    Direct,
    /// Through `sudo`: `-S` with the password on stdin, or `-n` without one
    Sudo {
        /// Password fed to `sudo -S`
        password: Option<String>,
    },
    /// Through `pkexec` (polkit prompts on its own)
    Pkexec,
}

impl Elevation {
    /// Build from the configured kind and an optional password.
    pub fn from_kind(kind: ElevationKind, password: Option<String>) -> Self {
        match kind {
            ElevationKind::None => Elevation::Direct,
            ElevationKind::Sudo => Elevation::Sudo { password },
            ElevationKind::Pkexec => Elevation::Pkexec,
        }
    }

    /// Whether the caller agreed to elevate.
    pub fn permits_elevation(&self) -> bool {
        !matches!(self, Elevation::Direct)
    }

    /// Wrap a command so it runs with elevated rights.
    pub fn wrap(&self, spec: CommandSpec) -> CommandSpec {
        let (program, prefix): (&str, &[&str]) = match self {
            Elevation::Direct => return spec,
            Elevation::Sudo { password: Some(_) } => ("sudo", &["-S", "-p", ""]),
            Elevation::Sudo { password: None } => ("sudo", &["-n"]),
            Elevation::Pkexec => ("pkexec", &[]),
        };

        let mut wrapped = CommandSpec::new(program)
            .args(prefix)
            .arg(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .timeout(spec.timeout);
        if let Elevation::Sudo {
            password: Some(password),
        } = self
        {
            wrapped = wrapped.stdin(format!("{password}\n"));
        } else if let Some(stdin) = spec.stdin {
            wrapped = wrapped.stdin(stdin);
        }
        wrapped
    }

    /// Explain why a privileged command failed.
    pub fn classify_failure(&self, spec: &CommandSpec, out: &CommandOutput) -> ServiceFailure {
        let diagnostics = out.diagnostics();
        let lower = diagnostics.to_lowercase();

        match self {
            Elevation::Sudo { .. } if lower.contains("a password is required") => {
                return ServiceFailure::ElevationRequired;
            }
            Elevation::Sudo { .. }
                if lower.contains("incorrect password")
                    || lower.contains("sorry, try again")
                    || lower.contains("not in the sudoers") =>
            {
                return ServiceFailure::ElevationDeclined;
            }
            // pkexec: 126 dismissed, 127 not authorized
            Elevation::Pkexec if matches!(out.status, Some(126 | 127)) => {
                return ServiceFailure::ElevationDeclined;
            }
            _ => {}
        }

        if is_permission_error(&lower) {
            return if self.permits_elevation() {
                ServiceFailure::ElevationDeclined
            } else {
                ServiceFailure::ElevationRequired
            };
        }

        ServiceFailure::CommandFailed {
            command: spec.display(),
            stderr: diagnostics.to_string(),
        }
    }
}

/// Messages service managers print when the caller lacks privileges.
pub fn is_permission_error(lower: &str) -> bool {
    [
        "permission denied",
        "access denied",
        "access is denied",
        "interactive authentication required",
        "must be run as root",
        "operation not permitted",
    ]
    .iter()
    .any(|m| lower.contains(m))
}

impl fmt::Debug for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Elevation::Direct => f.write_str("Direct"),
            Elevation::Sudo { password } => f
                .debug_struct("Sudo")
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .finish(),
            Elevation::Pkexec => f.write_str("Pkexec"),
        }
    }
}
