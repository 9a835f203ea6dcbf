//! Mount command - mount a bucket and print where it landed.

use anyhow::Result;
use bmount_core::Settings;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::BucketArgs;
use crate::auth;

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(flatten)]
    pub bucket: BucketArgs,
}

#[instrument(level = "info", name = "cmd::mount", skip_all, fields(user = %args.bucket.user, bucket = %args.bucket.bucket))]
pub fn execute(args: &Args, settings: &Settings, quiet: bool) -> Result<()> {
    let key = args.bucket.key()?;
    let manager = super::manager(settings)?;

    let target = manager.mount(&key, &auth::helper_credential())?;

    if !quiet {
        eprintln!("Mounted {} at {}", key.bucket, target);
    }
    println!("{target}");
    Ok(())
}
