pub mod auto_mount;
pub mod auto_mount_run;
pub mod cleanup;
pub mod mount;
pub mod status;
pub mod target;
pub mod unmount;

use anyhow::{Context, Result};
use bmount_core::{BucketKey, MountLifecycleManager, Settings};
use clap::Args as ClapArgs;

/// A bucket of a user account.
#[derive(ClapArgs, Clone, Debug)]
pub struct BucketArgs {
    /// Account the bucket belongs to
    #[arg(long, env = "BMOUNT_USER")]
    pub user: String,

    /// Bucket name
    #[arg(value_name = "BUCKET")]
    pub bucket: String,
}

impl BucketArgs {
    pub fn key(&self) -> Result<BucketKey> {
        Ok(BucketKey::new(self.user.as_str(), self.bucket.as_str())?)
    }
}

/// Build the manager for this host.
pub fn manager(settings: &Settings) -> Result<MountLifecycleManager> {
    MountLifecycleManager::system(settings).context("Failed to initialize mount manager")
}
