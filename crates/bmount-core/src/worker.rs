//! Background execution of manager operations.
//!
//! Mount and unmount block for up to the readiness timeout or the whole
//! unmount ladder. [`MountWorker`] runs them on a named thread and hands the
//! result back over a channel, so an interactive caller can keep servicing
//! its own loop and pick the result up when it arrives.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use crate::autostart::{AutoMountRecord, Elevation};
use crate::bucket::{BucketKey, Credential};
use crate::error::MountError;
use crate::manager::MountLifecycleManager;
use crate::recovery::UnmountOutcome;
use crate::target::MountTarget;

/// Runs manager operations off the calling thread.
#[derive(Clone)]
pub struct MountWorker {
    manager: Arc<MountLifecycleManager>,
}

impl MountWorker {
    /// Wrap a shared manager.
    pub fn new(manager: Arc<MountLifecycleManager>) -> Self {
        Self { manager }
    }

    /// The manager operations run against.
    pub fn manager(&self) -> &Arc<MountLifecycleManager> {
        &self.manager
    }

    /// Run `op` on a thread named `name`; its result arrives on the returned
    /// channel.
    ///
    /// If the operation panics the sender is dropped and `recv` fails.
    pub fn spawn<T, F>(&self, name: &str, op: F) -> Result<Receiver<T>, MountError>
    where
        T: Send + 'static,
        F: FnOnce(&MountLifecycleManager) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let manager = Arc::clone(&self.manager);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // The caller may have stopped listening
                let _ = tx.send(op(&manager));
            })?;
        Ok(rx)
    }

    /// Mount in the background.
    pub fn mount(
        &self,
        key: BucketKey,
        credential: Credential,
    ) -> Result<Receiver<Result<MountTarget, MountError>>, MountError> {
        let name = format!("mount-{}", key.bucket);
        self.spawn(&name, move |m| m.mount(&key, &credential))
    }

    /// Unmount in the background.
    pub fn unmount(
        &self,
        key: BucketKey,
    ) -> Result<Receiver<Result<Option<UnmountOutcome>, MountError>>, MountError> {
        let name = format!("unmount-{}", key.bucket);
        self.spawn(&name, move |m| m.unmount(&key))
    }

    /// Probe in the background.
    pub fn is_mounted(&self, key: BucketKey) -> Result<Receiver<bool>, MountError> {
        let name = format!("probe-{}", key.bucket);
        self.spawn(&name, move |m| m.is_mounted(&key))
    }

    /// Change the auto-mount record in the background.
    pub fn set_auto_mount(
        &self,
        key: BucketKey,
        enabled: bool,
        elevation: Elevation,
    ) -> Result<Receiver<Result<Option<AutoMountRecord>, MountError>>, MountError> {
        let name = format!("automount-{}", key.bucket);
        self.spawn(&name, move |m| m.set_auto_mount(&key, enabled, &elevation))
    }
}
