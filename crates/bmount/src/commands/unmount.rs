//! Unmount command - unmount a bucket, escalating through the recovery
//! ladder when it is busy.

use anyhow::Result;
use bmount_core::{Detach, Settings};
use clap::Args as ClapArgs;
use tracing::instrument;

use super::BucketArgs;

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(flatten)]
    pub bucket: BucketArgs,
}

#[instrument(level = "info", name = "cmd::unmount", skip_all, fields(user = %args.bucket.user, bucket = %args.bucket.bucket))]
pub fn execute(args: &Args, settings: &Settings, quiet: bool) -> Result<()> {
    let key = args.bucket.key()?;
    let manager = super::manager(settings)?;

    let outcome = manager.unmount(&key)?;
    if quiet {
        return Ok(());
    }

    match outcome {
        None => eprintln!("{} is not mounted", key.bucket),
        Some(outcome) if outcome.detach == Detach::Deferred => eprintln!(
            "Detached {}; the filesystem is released once nothing uses it",
            key.bucket
        ),
        Some(outcome) => {
            tracing::debug!(step = outcome.step, "Unmount step succeeded");
            eprintln!("Unmounted {}", key.bucket);
        }
    }
    Ok(())
}
