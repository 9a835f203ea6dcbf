//! Task Scheduler registration (Windows).
//!
//! Each bucket gets a logon-triggered task that runs this program's
//! `auto-mount-run` entry point. The task definition is handed to `schtasks`
//! as XML, which is the only way to set the network and idle conditions.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{AutoMountRecord, AutoMountService, Elevation, is_permission_error};
use crate::bucket::{BucketKey, Naming};
use crate::error::ServiceFailure;
use crate::platform::PlatformKind;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::target::MountTarget;

/// Scheduled tasks for the current user.
pub struct ScheduledTasks {
    runner: Arc<dyn CommandRunner>,
    naming: Naming,
    executable: PathBuf,
    user_id: String,
    timeout: Duration,
}

impl ScheduledTasks {
    /// Register tasks that run `executable` at logon of `user_id`
    /// (`DOMAIN\user`).
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        naming: Naming,
        executable: PathBuf,
        user_id: String,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            naming,
            executable,
            user_id,
            timeout,
        }
    }

    /// `DOMAIN\user` of the calling user, from the environment.
    pub fn current_user_id() -> String {
        let user = std::env::var("USERNAME").unwrap_or_default();
        match std::env::var("USERDOMAIN") {
            Ok(domain) if !domain.is_empty() => format!("{domain}\\{user}"),
            _ => user,
        }
    }

    fn schtasks(&self, args: &[&str]) -> Result<CommandOutput, ServiceFailure> {
        let spec = CommandSpec::new("schtasks").args(args).timeout(self.timeout);
        self.runner.run(&spec).map_err(|e| match e {
            RunError::NotFound(_) => ServiceFailure::Unsupported,
            other => ServiceFailure::CommandFailed {
                command: spec.display(),
                stderr: other.to_string(),
            },
        })
    }

    /// Re-run `schtasks` with the same arguments from an elevated PowerShell.
    fn schtasks_elevated(&self, args: &[&str]) -> Result<(), ServiceFailure> {
        let arg_list = args
            .iter()
            .map(|a| format!("'{}'", a.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(",");
        let script = format!(
            "$p = Start-Process -FilePath schtasks -ArgumentList {arg_list} -Verb RunAs -Wait -PassThru -WindowStyle Hidden; exit $p.ExitCode"
        );
        let spec = CommandSpec::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .timeout(self.timeout);

        let out = self.runner.run(&spec).map_err(|e| ServiceFailure::CommandFailed {
            command: "powershell Start-Process schtasks -Verb RunAs".to_string(),
            stderr: e.to_string(),
        })?;
        if out.success() {
            return Ok(());
        }
        let lower = out.diagnostics().to_lowercase();
        if lower.contains("canceled by the user") || lower.contains("cancelled by the user") {
            return Err(ServiceFailure::ElevationDeclined);
        }
        Err(ServiceFailure::CommandFailed {
            command: "powershell Start-Process schtasks -Verb RunAs".to_string(),
            stderr: out.diagnostics().to_string(),
        })
    }
}

impl AutoMountService for ScheduledTasks {
    fn service_name(&self, key: &BucketKey) -> String {
        self.naming.task_name(key)
    }

    fn install(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        elevation: &Elevation,
    ) -> Result<(), ServiceFailure> {
        let name = self.naming.task_name(key);
        let xml = render_task_xml(&self.naming, &self.executable, &self.user_id, key, target);

        let mut file = tempfile::Builder::new()
            .prefix("bmount-task-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| ServiceFailure::CommandFailed {
                command: "create task definition".to_string(),
                stderr: e.to_string(),
            })?;
        file.write_all(&encode_utf16_bom(&xml))
            .and_then(|()| file.flush())
            .map_err(|e| ServiceFailure::CommandFailed {
                command: format!("write {}", file.path().display()),
                stderr: e.to_string(),
            })?;

        let xml_path = file.path().to_string_lossy().into_owned();
        // /F overwrites an existing task, so re-enabling never duplicates it
        let args = ["/Create", "/TN", name.as_str(), "/XML", xml_path.as_str(), "/F"];
        let out = self.schtasks(&args)?;
        if out.success() {
            return Ok(());
        }

        let lower = out.diagnostics().to_lowercase();
        if !is_permission_error(&lower) {
            return Err(ServiceFailure::CommandFailed {
                command: format!("schtasks /Create /TN {name}"),
                stderr: out.diagnostics().to_string(),
            });
        }
        if !elevation.permits_elevation() {
            return Err(ServiceFailure::ElevationRequired);
        }

        tracing::info!("Task creation needs administrator rights, requesting elevation");
        self.schtasks_elevated(&args)
    }

    fn remove(&self, key: &BucketKey, elevation: &Elevation) -> Result<(), ServiceFailure> {
        let name = self.naming.task_name(key);
        let args = ["/Delete", "/TN", name.as_str(), "/F"];
        let out = self.schtasks(&args)?;
        if out.success() || is_missing_task(&out) {
            return Ok(());
        }

        let lower = out.diagnostics().to_lowercase();
        if is_permission_error(&lower) {
            if !elevation.permits_elevation() {
                return Err(ServiceFailure::ElevationRequired);
            }
            return self.schtasks_elevated(&args);
        }
        Err(ServiceFailure::CommandFailed {
            command: format!("schtasks /Delete /TN {name}"),
            stderr: out.diagnostics().to_string(),
        })
    }

    fn query(&self, key: &BucketKey) -> Result<AutoMountRecord, ServiceFailure> {
        let name = self.naming.task_name(key);
        let out = self.schtasks(&["/Query", "/TN", name.as_str(), "/XML"])?;

        let (target, enabled) = if out.success() {
            (parse_task_target(&out.stdout), !out.stdout.contains("<Enabled>false</Enabled>"))
        } else if is_missing_task(&out) {
            (None, false)
        } else {
            return Err(ServiceFailure::CommandFailed {
                command: format!("schtasks /Query /TN {name}"),
                stderr: out.diagnostics().to_string(),
            });
        };

        Ok(AutoMountRecord {
            key: key.clone(),
            target,
            service_name: name,
            enabled,
        })
    }
}

fn is_missing_task(out: &CommandOutput) -> bool {
    let lower = out.diagnostics().to_lowercase();
    lower.contains("cannot find") || lower.contains("does not exist")
}

/// `schtasks /XML` expects UTF-16 with a byte order mark.
fn encode_utf16_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
    bytes
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Quote one command-line argument the way the Windows runtime parses it.
fn windows_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

/// Render the task definition for `key` mounted on `target`.
pub fn render_task_xml(
    naming: &Naming,
    executable: &std::path::Path,
    user_id: &str,
    key: &BucketKey,
    target: &MountTarget,
) -> String {
    let arguments = [
        "auto-mount-run".to_string(),
        "--user".to_string(),
        key.user.clone(),
        "--bucket".to_string(),
        key.bucket.clone(),
        "--target".to_string(),
        target.helper_arg(),
    ]
    .iter()
    .map(|a| windows_quote(a))
    .collect::<Vec<_>>()
    .join(" ");

    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>Mount {prefix} bucket {bucket} at logon</Description>
  </RegistrationInfo>
  <Triggers>
    <LogonTrigger>
      <Enabled>true</Enabled>
      <UserId>{user}</UserId>
    </LogonTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <UserId>{user}</UserId>
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <StartWhenAvailable>true</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>true</RunOnlyIfNetworkAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
      <Arguments>{arguments}</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
        prefix = xml_escape(&naming.prefix),
        bucket = xml_escape(&key.to_string()),
        user = xml_escape(user_id),
        command = xml_escape(&executable.to_string_lossy()),
        arguments = xml_escape(&arguments),
    )
}

/// Drive letter after `--target` in a task's `<Arguments>`.
fn parse_task_target(xml: &str) -> Option<MountTarget> {
    let start = xml.find("<Arguments>")? + "<Arguments>".len();
    let end = start + xml[start..].find("</Arguments>")?;
    let args = xml[start..end].replace("&quot;", "\"");
    let mut words = args.split_whitespace();
    words.find(|w| *w == "--target")?;
    words
        .next()
        .map(|t| MountTarget::parse(t.trim_matches('"'), PlatformKind::Windows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_render_task_xml() {
        let key = BucketKey::new("alice", "photos").unwrap();
        let xml = render_task_xml(
            &Naming::default(),
            Path::new(r"C:\Program Files\bmount\bmount.exe"),
            r"WORK\alice",
            &key,
            &MountTarget::Drive('M'),
        );

        assert!(xml.contains("<LogonTrigger>"));
        assert!(xml.contains(r"<UserId>WORK\alice</UserId>"));
        assert!(xml.contains("<LogonType>InteractiveToken</LogonType>"));
        assert!(xml.contains("<RunOnlyIfNetworkAvailable>true</RunOnlyIfNetworkAvailable>"));
        assert!(xml.contains("<ExecutionTimeLimit>PT0S</ExecutionTimeLimit>"));
        assert!(xml.contains(
            "<Arguments>auto-mount-run --user alice --bucket photos --target M:</Arguments>"
        ));
        assert_eq!(parse_task_target(&xml), Some(MountTarget::Drive('M')));
    }

    #[test]
    fn test_utf16_encoding_has_bom() {
        let bytes = encode_utf16_bom("<a/>");
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        assert_eq!(&bytes[2..4], &[b'<', 0]);
        assert_eq!(bytes.len(), 2 + 4 * 2);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(windows_quote("photos"), "photos");
        assert_eq!(windows_quote("my photos"), "\"my photos\"");
        assert_eq!(xml_escape("a&b<c>"), "a&amp;b&lt;c&gt;");
    }
}
