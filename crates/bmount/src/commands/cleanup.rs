//! Cleanup command - detach stale mounts of a user and remove their
//! directories. Healthy and foreign mounts are left alone.

use anyhow::{Result, bail};
use bmount_core::Settings;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::output;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Account whose mounts are scanned
    #[arg(long, env = "BMOUNT_USER")]
    pub user: String,

    /// Output the report in JSON format
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::cleanup", skip_all, fields(user = %args.user))]
pub fn execute(args: &Args, settings: &Settings, quiet: bool) -> Result<()> {
    let manager = super::manager(settings)?;
    let report = manager.cleanup_stale(&args.user);

    if args.json {
        output::print_json(&report)?;
    } else if !quiet {
        if report.cleaned.is_empty() && report.failed.is_empty() && report.skipped.is_empty() {
            eprintln!("No stale mounts found.");
        }
        for target in &report.cleaned {
            eprintln!("Cleaned stale mount: {target}");
        }
        for target in &report.skipped {
            eprintln!("Skipped {target}: an operation on it is in progress");
        }
        for (target, reason) in &report.failed {
            eprintln!("Failed to clean {target}: {reason}");
        }
    }

    if !report.failed.is_empty() {
        bail!("{} stale mount(s) could not be cleaned", report.failed.len());
    }
    Ok(())
}
