//! Entry point run by the login task: mount one bucket, preferring the
//! target recorded when the task was registered.

use anyhow::Result;
use bmount_core::{BucketKey, MountTarget, Settings};
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::auth;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Account the bucket belongs to
    #[arg(long)]
    pub user: String,

    /// Bucket name
    #[arg(long)]
    pub bucket: String,

    /// Target recorded at registration (`Z:` or a directory)
    #[arg(long)]
    pub target: Option<String>,
}

#[instrument(level = "info", name = "cmd::auto_mount_run", skip_all, fields(user = %args.user, bucket = %args.bucket))]
pub fn execute(args: &Args, settings: &Settings) -> Result<()> {
    let key = BucketKey::new(args.user.as_str(), args.bucket.as_str())?;
    let manager = super::manager(settings)?;
    let preferred = args
        .target
        .as_deref()
        .map(|t| MountTarget::parse(t, manager.platform()));

    let target = manager.mount_preferring(&key, &auth::helper_credential(), preferred.as_ref())?;
    if preferred.as_ref().is_some_and(|p| p != &target) {
        tracing::warn!(%target, "Recorded target was unavailable, mounted elsewhere");
    }
    tracing::info!(%target, "Auto-mount complete");
    Ok(())
}
