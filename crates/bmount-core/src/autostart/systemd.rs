//! systemd unit registration (POSIX).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{AutoMountRecord, AutoMountService, Elevation};
use crate::bucket::{BucketKey, Naming};
use crate::error::ServiceFailure;
use crate::helper::MountHelperInvoker;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::target::MountTarget;

/// Environment variable in the unit holding the mount directory.
const MOUNT_DIR_VAR: &str = "MountDirectory";

/// systemd system units under a unit directory.
pub struct SystemdUnits {
    runner: Arc<dyn CommandRunner>,
    helper: Arc<MountHelperInvoker>,
    naming: Naming,
    unit_dir: PathBuf,
    os_user: String,
    timeout: Duration,
}

impl SystemdUnits {
    /// Manage units in `unit_dir` that run the helper as `os_user`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        helper: Arc<MountHelperInvoker>,
        naming: Naming,
        unit_dir: PathBuf,
        os_user: String,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            helper,
            naming,
            unit_dir,
            os_user,
            timeout,
        }
    }

    /// Path of the unit file for `key`.
    pub fn unit_path(&self, key: &BucketKey) -> PathBuf {
        self.unit_dir.join(self.naming.unit_name(key))
    }

    /// Run a command, possibly elevated, returning its output whatever the
    /// exit status. Only failure to run at all is an error.
    fn run_raw(
        &self,
        spec: CommandSpec,
        elevation: &Elevation,
    ) -> Result<(CommandSpec, CommandOutput), ServiceFailure> {
        let wrapped = elevation.wrap(spec.timeout(self.timeout));
        match self.runner.run(&wrapped) {
            Ok(out) => Ok((wrapped, out)),
            Err(RunError::NotFound(name)) if name == "systemctl" => Err(ServiceFailure::Unsupported),
            Err(e) => Err(ServiceFailure::CommandFailed {
                command: wrapped.display(),
                stderr: e.to_string(),
            }),
        }
    }

    fn run_checked(&self, spec: CommandSpec, elevation: &Elevation) -> Result<(), ServiceFailure> {
        let (wrapped, out) = self.run_raw(spec, elevation)?;
        if out.success() {
            Ok(())
        } else {
            Err(elevation.classify_failure(&wrapped, &out))
        }
    }

    fn write_unit(&self, dest: &Path, contents: &str, elevation: &Elevation) -> Result<(), ServiceFailure> {
        if !elevation.permits_elevation() {
            return std::fs::write(dest, contents).map_err(|e| io_failure(dest, &e));
        }

        // Stage in a temp file, then let the privileged side copy it in place
        let mut staged = tempfile::Builder::new()
            .prefix("bmount-unit-")
            .suffix(".service")
            .tempfile()
            .map_err(|e| io_failure(Path::new("temporary unit file"), &e))?;
        staged
            .write_all(contents.as_bytes())
            .and_then(|()| staged.flush())
            .map_err(|e| io_failure(staged.path(), &e))?;

        self.run_checked(
            CommandSpec::new("install")
                .args(["-m", "0644"])
                .arg(staged.path())
                .arg(dest),
            elevation,
        )
    }

    fn delete_unit(&self, path: &Path, elevation: &Elevation) -> Result<(), ServiceFailure> {
        if !elevation.permits_elevation() {
            return match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_failure(path, &e)),
            };
        }
        self.run_checked(CommandSpec::new("rm").arg("-f").arg(path), elevation)
    }

    fn is_enabled_in_systemd(&self, unit: &str) -> Result<bool, ServiceFailure> {
        let (_, out) = self.run_raw(
            CommandSpec::new("systemctl").args(["is-enabled", unit]),
            &Elevation::Direct,
        )?;
        Ok(out.success() && out.stdout.trim() == "enabled")
    }
}

impl AutoMountService for SystemdUnits {
    fn service_name(&self, key: &BucketKey) -> String {
        self.naming.unit_name(key)
    }

    fn install(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        elevation: &Elevation,
    ) -> Result<(), ServiceFailure> {
        let unit = self.naming.unit_name(key);
        let path = self.unit_path(key);
        let contents = render_unit(&self.naming, &self.helper, &self.os_user, key, target);

        self.write_unit(&path, &contents, elevation)?;
        tracing::debug!("Wrote {}", path.display());

        self.run_checked(CommandSpec::new("systemctl").arg("daemon-reload"), elevation)?;
        self.run_checked(CommandSpec::new("systemctl").args(["enable", &unit]), elevation)
    }

    fn remove(&self, key: &BucketKey, elevation: &Elevation) -> Result<(), ServiceFailure> {
        let unit = self.naming.unit_name(key);
        let path = self.unit_path(key);

        if !path.exists() && !self.is_enabled_in_systemd(&unit)? {
            tracing::debug!("{} already absent", unit);
            return Ok(());
        }

        let (wrapped, out) =
            self.run_raw(CommandSpec::new("systemctl").args(["disable", &unit]), elevation)?;
        if !out.success() {
            let lower = out.diagnostics().to_lowercase();
            let already_gone = lower.contains("not loaded")
                || lower.contains("does not exist")
                || lower.contains("no such file");
            if !already_gone {
                return Err(elevation.classify_failure(&wrapped, &out));
            }
        }

        self.delete_unit(&path, elevation)?;
        self.run_checked(CommandSpec::new("systemctl").arg("daemon-reload"), elevation)
    }

    fn query(&self, key: &BucketKey) -> Result<AutoMountRecord, ServiceFailure> {
        let unit = self.naming.unit_name(key);
        let path = self.unit_path(key);

        let (target, enabled) = match std::fs::read_to_string(&path) {
            Ok(contents) => (
                parse_mount_dir(&contents).map(MountTarget::Directory),
                self.is_enabled_in_systemd(&unit)?,
            ),
            Err(_) => (None, false),
        };

        Ok(AutoMountRecord {
            key: key.clone(),
            target,
            service_name: unit,
            enabled,
        })
    }
}

fn io_failure(path: &Path, e: &std::io::Error) -> ServiceFailure {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ServiceFailure::ElevationRequired
    } else {
        ServiceFailure::CommandFailed {
            command: format!("write {}", path.display()),
            stderr: e.to_string(),
        }
    }
}

/// Render the unit file for `key` mounted on `target`.
///
/// The helper runs in the foreground under systemd supervision, restarting
/// after failures once the network is up.
pub fn render_unit(
    naming: &Naming,
    helper: &MountHelperInvoker,
    os_user: &str,
    key: &BucketKey,
    target: &MountTarget,
) -> String {
    let config = helper.config();
    let exec_start = std::iter::once(config.binary.to_string_lossy().into_owned())
        .chain(helper.service_args(key, target))
        .map(|a| systemd_quote(&a))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "[Unit]\n\
         Description={prefix} bucket mount - {key}\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         Environment={mount_env}\n\
         Environment={cache_env}\n\
         Environment={config_env}\n\
         ExecStart={exec_start}\n\
         ExecStop=/bin/sh -c 'fusermount -u \"${{{var}}}\" || umount -l \"${{{var}}}\"'\n\
         Restart=always\n\
         RestartSec=10\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        prefix = naming.prefix,
        user = os_user,
        mount_env = systemd_quote(&format!("{MOUNT_DIR_VAR}={}", target.helper_arg())),
        cache_env = systemd_quote(&format!("CacheDirectory={}", config.cache_dir.display())),
        config_env = systemd_quote(&format!("HelperConfig={}", config.config_file.display())),
        var = MOUNT_DIR_VAR,
    )
}

/// Quote one word for a systemd command line or `Environment=` line.
///
/// `%` and `$` are doubled so systemd does not expand them.
pub fn systemd_quote(word: &str) -> String {
    let escaped = word.replace('%', "%%").replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if !needs_quotes {
        return escaped;
    }
    let inner = escaped.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{inner}\"")
}

fn parse_mount_dir(unit: &str) -> Option<PathBuf> {
    let prefix = format!("{MOUNT_DIR_VAR}=");
    unit.lines()
        .filter_map(|l| l.strip_prefix("Environment="))
        .map(|v| v.trim().trim_matches('"'))
        .find_map(|v| v.strip_prefix(prefix.as_str()))
        .map(|dir| PathBuf::from(dir.replace("\\\\", "\\").replace("$$", "$").replace("%%", "%")))
}
