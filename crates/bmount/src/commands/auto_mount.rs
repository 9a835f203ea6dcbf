//! Auto-mount command - register, remove or inspect the OS record that
//! mounts a bucket at login (systemd unit or scheduled task).

use anyhow::Result;
use bmount_core::{ElevationKind, Settings};
use clap::{Args as ClapArgs, Subcommand, ValueEnum};
use tracing::instrument;

use super::BucketArgs;
use crate::{auth, output};

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Clone)]
pub enum Action {
    /// Mount the bucket at every login
    Enable(ToggleArgs),
    /// Stop mounting the bucket at login
    Disable(ToggleArgs),
    /// Show the registration as the OS reports it
    Status(StatusArgs),
}

#[derive(ClapArgs, Clone)]
pub struct ToggleArgs {
    #[command(flatten)]
    pub bucket: BucketArgs,

    /// How to obtain administrator rights if they are needed
    /// (default: `autostart.elevation` from the config file)
    #[arg(long, value_enum)]
    pub elevate: Option<Elevate>,
}

#[derive(ClapArgs, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub bucket: BucketArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Elevation choices on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Elevate {
    /// sudo, reading the password from BMOUNT_SUDO_PASSWORD or a prompt
    Sudo,
    /// pkexec (polkit asks on its own)
    Pkexec,
    /// Never elevate
    None,
}

impl From<Elevate> for ElevationKind {
    fn from(value: Elevate) -> Self {
        match value {
            Elevate::Sudo => ElevationKind::Sudo,
            Elevate::Pkexec => ElevationKind::Pkexec,
            Elevate::None => ElevationKind::None,
        }
    }
}

pub fn execute(args: &Args, settings: &Settings, quiet: bool) -> Result<()> {
    match &args.action {
        Action::Enable(toggle) => set(toggle, true, settings, quiet),
        Action::Disable(toggle) => set(toggle, false, settings, quiet),
        Action::Status(status) => show(status, settings),
    }
}

#[instrument(level = "info", name = "cmd::auto_mount", skip(args, settings, quiet), fields(user = %args.bucket.user, bucket = %args.bucket.bucket))]
fn set(args: &ToggleArgs, enabled: bool, settings: &Settings, quiet: bool) -> Result<()> {
    let key = args.bucket.key()?;
    let kind = args
        .elevate
        .map_or(settings.autostart.elevation, ElevationKind::from);
    let elevation = auth::elevation(kind)?;
    let manager = super::manager(settings)?;

    let record = manager.set_auto_mount(&key, enabled, &elevation)?;
    if quiet {
        return Ok(());
    }

    match record {
        Some(record) => eprintln!(
            "Auto-mount enabled for {} ({}, target {})",
            key.bucket,
            record.service_name,
            output::format_target(record.target.as_ref())
        ),
        None => eprintln!("Auto-mount disabled for {}", key.bucket),
    }
    Ok(())
}

fn show(args: &StatusArgs, settings: &Settings) -> Result<()> {
    let key = args.bucket.key()?;
    let manager = super::manager(settings)?;
    let record = manager.auto_mount_record(&key)?;

    if args.json {
        return output::print_json(&record);
    }

    println!(
        "{}: {} ({}, target {})",
        key.bucket,
        if record.enabled { "enabled" } else { "disabled" },
        record.service_name,
        output::format_target(record.target.as_ref())
    );
    Ok(())
}
