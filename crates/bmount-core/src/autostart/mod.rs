//! Persistent "mount at boot/login" registrations.
//!
//! The record lives only in the OS service manager (a systemd unit or a
//! scheduled task). Nothing is cached here: every query asks the OS, and
//! every change is verified by asking again.

mod elevation;
mod schtasks;
mod systemd;

use serde::Serialize;

pub use elevation::{Elevation, is_permission_error};
pub use schtasks::{ScheduledTasks, render_task_xml};
pub use systemd::{SystemdUnits, render_unit, systemd_quote};

use crate::bucket::BucketKey;
use crate::error::{MountError, ServiceFailure};
use crate::target::MountTarget;

/// An auto-mount registration as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoMountRecord {
    /// Bucket the record mounts
    pub key: BucketKey,
    /// Target written into the record, if one could be read back
    pub target: Option<MountTarget>,
    /// Unit or task name
    pub service_name: String,
    /// Whether the OS will act on it
    pub enabled: bool,
}

/// A platform's service manager.
pub trait AutoMountService: Send + Sync {
    /// Deterministic unit/task name for `key`.
    fn service_name(&self, key: &BucketKey) -> String;

    /// Create (or overwrite) and enable the registration.
    fn install(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        elevation: &Elevation,
    ) -> Result<(), ServiceFailure>;

    /// Disable and delete the registration. Absent counts as success.
    fn remove(&self, key: &BucketKey, elevation: &Elevation) -> Result<(), ServiceFailure>;

    /// Read the registration back from the OS.
    fn query(&self, key: &BucketKey) -> Result<AutoMountRecord, ServiceFailure>;
}

/// Enables, disables and queries auto-mount records, verifying each change.
pub struct AutoMountServiceManager {
    backend: Box<dyn AutoMountService>,
}

impl AutoMountServiceManager {
    /// Wrap a platform backend.
    pub fn new(backend: Box<dyn AutoMountService>) -> Self {
        Self { backend }
    }

    /// Register `key` to mount on `target` at boot/login.
    pub fn enable(
        &self,
        key: &BucketKey,
        target: &MountTarget,
        elevation: &Elevation,
    ) -> Result<AutoMountRecord, MountError> {
        let name = self.backend.service_name(key);
        tracing::info!(service = %name, "Enabling auto-mount for {} on {}", key, target);

        self.backend
            .install(key, target, elevation)
            .map_err(|reason| MountError::service(&name, reason))?;
        let record = self.verify(key, true)?;
        Ok(record)
    }

    /// Remove the registration for `key`.
    pub fn disable(&self, key: &BucketKey, elevation: &Elevation) -> Result<(), MountError> {
        let name = self.backend.service_name(key);
        tracing::info!(service = %name, "Disabling auto-mount for {}", key);

        self.backend
            .remove(key, elevation)
            .map_err(|reason| MountError::service(&name, reason))?;
        self.verify(key, false)?;
        Ok(())
    }

    /// Whether the OS currently has an enabled registration for `key`.
    pub fn is_enabled(&self, key: &BucketKey) -> Result<bool, MountError> {
        Ok(self.record(key)?.enabled)
    }

    /// Current registration for `key`.
    pub fn record(&self, key: &BucketKey) -> Result<AutoMountRecord, MountError> {
        self.backend
            .query(key)
            .map_err(|reason| MountError::service(self.backend.service_name(key), reason))
    }

    fn verify(&self, key: &BucketKey, expected: bool) -> Result<AutoMountRecord, MountError> {
        let record = self.record(key)?;
        if record.enabled != expected {
            tracing::warn!(
                service = %record.service_name,
                "Service manager reports enabled={} after the change",
                record.enabled
            );
            return Err(MountError::service(
                record.service_name,
                ServiceFailure::StateMismatch {
                    observed: record.enabled,
                },
            ));
        }
        Ok(record)
    }
}
