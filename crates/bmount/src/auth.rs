//! Secrets handed to the helper and to `sudo`.

use std::io::{self, IsTerminal, Write};

use anyhow::{Result, bail};
use bmount_core::{Credential, Elevation, ElevationKind};
use rpassword::read_password;

/// Prefix of environment variables forwarded to the helper.
pub const CREDENTIAL_ENV_PREFIX: &str = "BMOUNT_CRED_";

/// Environment variable holding the sudo password for non-interactive use.
pub const SUDO_PASSWORD_ENV: &str = "BMOUNT_SUDO_PASSWORD";

/// Helper credential from this process's environment.
pub fn helper_credential() -> Credential {
    credential_from_vars(std::env::vars())
}

/// Keep `BMOUNT_CRED_<NAME>` variables, renamed to `<NAME>`.
fn credential_from_vars<I>(vars: I) -> Credential
where
    I: IntoIterator<Item = (String, String)>,
{
    Credential::from_env_pairs(vars.into_iter().filter_map(|(name, value)| {
        let stripped = name.strip_prefix(CREDENTIAL_ENV_PREFIX)?;
        (!stripped.is_empty()).then(|| (stripped.to_string(), value))
    }))
}

/// Build the elevation policy, asking for the sudo password when needed.
///
/// The password comes from `BMOUNT_SUDO_PASSWORD`, or from a prompt when
/// stdin is a terminal. Without either, sudo runs non-interactively and
/// fails if it would need a password.
pub fn elevation(kind: ElevationKind) -> Result<Elevation> {
    let password = match kind {
        ElevationKind::Sudo => match std::env::var(SUDO_PASSWORD_ENV) {
            Ok(password) => Some(password),
            Err(_) if io::stdin().is_terminal() => Some(prompt_sudo_password()?),
            Err(_) => None,
        },
        ElevationKind::None | ElevationKind::Pkexec => None,
    };
    Ok(Elevation::from_kind(kind, password))
}

/// Prompt for the sudo password. Input is hidden and not echoed.
fn prompt_sudo_password() -> Result<String> {
    eprint!("[sudo] password: ");
    io::stderr().flush()?;

    let password = read_password()?;

    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_only_prefixed_variables_are_forwarded() {
        let credential = credential_from_vars(vars(&[
            ("BMOUNT_CRED_RCLONE_CONFIG_PASS", "s3cret"),
            ("BMOUNT_CRED_", "ignored"),
            ("HOME", "/home/alice"),
            ("RCLONE_CONFIG_PASS", "not-forwarded"),
        ]));
        assert_eq!(
            credential.env(),
            &[("RCLONE_CONFIG_PASS".to_string(), "s3cret".to_string())]
        );
    }

    #[test]
    fn test_no_variables_means_no_credential() {
        assert!(credential_from_vars(vars(&[("PATH", "/usr/bin")])).is_empty());
    }

    #[test]
    fn test_no_elevation_never_prompts() {
        assert_eq!(elevation(ElevationKind::None).unwrap(), Elevation::Direct);
        assert_eq!(elevation(ElevationKind::Pkexec).unwrap(), Elevation::Pkexec);
    }
}
