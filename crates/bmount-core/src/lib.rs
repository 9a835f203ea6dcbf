//! Mount lifecycle management for object-storage buckets mounted through
//! rclone.
//!
//! This crate mounts, unmounts, health-checks and registers for auto-mount
//! the buckets of a user account, on POSIX hosts (FUSE mounts on per-bucket
//! directories, systemd units) and on Windows (WinFsp drive letters,
//! logon-triggered scheduled tasks).
//!
//! # Components
//!
//! ## Orchestration
//!
//! - [`MountLifecycleManager`] - Per-bucket sessions, serialized operations,
//!   mount/unmount/probe/auto-mount entry points
//! - [`MountWorker`] - Runs manager operations on a background thread and
//!   returns the result over a channel
//! - [`MountError`] - Error taxonomy with stable numeric codes
//!
//! ## Mechanics
//!
//! - [`MountTargetAllocator`] - Chooses (or adopts) the directory or drive
//!   letter a bucket is mounted on
//! - [`MountHelperInvoker`] - Builds and launches the rclone command
//! - [`StaleMountDetector`] - Classifies a target as absent, healthy or stale
//! - [`BusyUnmountRecovery`] - Escalating unmount ladder
//! - [`AutoMountServiceManager`] - systemd unit / scheduled task records
//!
//! ## OS seams
//!
//! The OS is only reached through [`SystemProbe`], [`CommandRunner`],
//! [`ProcessTable`] and [`TargetDirs`]. [`testing::FakeHost`] implements all
//! four over in-memory state.
//!
//! # Why live queries?
//!
//! Mounts outlive this process: a helper started by a previous run (or by the
//! login task) keeps serving its target, and a crashed helper leaves a dead
//! entry behind. Every decision (is it mounted, which targets are free, is
//! auto-mount enabled) is therefore re-derived from the OS at call time
//! rather than from what this process remembers.
//!
//! # Example
//!
//! ```no_run
//! use bmount_core::{BucketKey, Credential, MountLifecycleManager, Settings};
//!
//! let manager = MountLifecycleManager::system(&Settings::default())?;
//! let key = BucketKey::new("alice", "photos")?;
//!
//! let target = manager.mount(&key, &Credential::none())?;
//! println!("mounted at {target}");
//! assert!(manager.is_mounted(&key));
//!
//! manager.unmount(&key)?;
//! # Ok::<(), bmount_core::MountError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod autostart;
mod bounded_pool;
pub mod bucket;
pub mod config;
pub mod detector;
mod error;
pub mod helper;
pub mod manager;
mod mount_table;
pub mod platform;
pub mod probe;
pub mod process;
pub mod processes;
pub mod recovery;
pub mod target;
pub mod worker;

// Orchestration exports
pub use error::{MountError, ServiceFailure};
pub use manager::{CleanupReport, MountLifecycleManager, MountState, MountStatus, MountTiming};
pub use worker::MountWorker;

// Component exports
pub use allocator::{Allocation, IdentityKind, MountTargetAllocator, TargetPool};
pub use autostart::{AutoMountRecord, AutoMountService, AutoMountServiceManager, Elevation};
pub use bounded_pool::{BOUNDED_FS_POOL, BoundedFsPool, MAX_LEAKED_THREADS};
pub use detector::{StaleMountDetector, TargetHealth};
pub use helper::{HelperConfig, LaunchMode, MountHelperInvoker};
pub use recovery::{BusyUnmountRecovery, Detach, UnmountOutcome, UnmountStrategy};

// Data and seam exports
pub use bucket::{Bucket, BucketKey, Credential, Naming};
pub use config::{ElevationKind, Settings};
pub use mount_table::SystemMount;
pub use platform::{HostServices, PlatformKind, TargetDirs};
pub use probe::{Listing, SystemProbe};
pub use process::{CommandOutput, CommandRunner, CommandSpec, RunError};
pub use processes::{ProcessInfo, ProcessTable};
pub use target::MountTarget;

/// Testing utilities for lifecycle tests.
///
/// Provides [`testing::FakeHost`], a simulated host that stages mounts,
/// stale entries, busy holders and service-manager refusals, and records
/// what was done to it.
pub mod testing;
