//! Target command - print the target a bucket would be mounted on, without
//! mounting it.

use anyhow::Result;
use bmount_core::Settings;
use clap::Args as ClapArgs;

use super::BucketArgs;

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(flatten)]
    pub bucket: BucketArgs,
}

pub fn execute(args: &Args, settings: &Settings, quiet: bool) -> Result<()> {
    let key = args.bucket.key()?;
    let manager = super::manager(settings)?;

    let allocation = manager.preview_target(&key)?;
    println!("{}", allocation.target);
    if allocation.adopted && !quiet {
        eprintln!("{} is already mounted there", key.bucket);
    }
    Ok(())
}
