//! Status command - show session state and live health of buckets.

use anyhow::Result;
use bmount_core::{BucketKey, MountStatus, Settings};
use clap::Args as ClapArgs;
use comfy_table::Cell;
use tracing::instrument;

use crate::output;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Account the buckets belong to
    #[arg(long, env = "BMOUNT_USER")]
    pub user: String,

    /// Buckets to show (default: every bucket of the user that is mounted)
    #[arg(value_name = "BUCKET")]
    pub buckets: Vec<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::status", skip_all, fields(user = %args.user))]
pub fn execute(args: &Args, settings: &Settings) -> Result<()> {
    let keys = args
        .buckets
        .iter()
        .map(|bucket| BucketKey::new(args.user.as_str(), bucket.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let manager = super::manager(settings)?;

    let keys = if keys.is_empty() {
        manager
            .mounted_buckets(&args.user)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    } else {
        keys
    };
    let statuses: Vec<MountStatus> = keys.iter().map(|key| manager.status(key)).collect();

    if args.json {
        return output::print_json(&statuses);
    }

    if statuses.is_empty() {
        eprintln!("No buckets of {} are mounted.", args.user);
        return Ok(());
    }
    output_table(&statuses);
    Ok(())
}

fn output_table(statuses: &[MountStatus]) {
    let mut table = output::create_table();
    table.set_header(vec!["Bucket", "State", "Target", "Health", "Last error"]);

    for status in statuses {
        table.add_row(vec![
            Cell::new(&status.key.bucket),
            output::state_cell(status.state),
            Cell::new(output::format_target(status.target.as_ref())),
            Cell::new(output::health_label(status.health)),
            Cell::new(status.last_error.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
}
