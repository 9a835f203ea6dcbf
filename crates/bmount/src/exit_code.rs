//! Exit codes for the CLI.
//!
//! Codes below 10 follow common Unix conventions. Library failures exit with
//! their stable [`MountError::code`](bmount_core::MountError::code):
//!
//! | Code | Meaning |
//! |------|---------|
//! | 10 | Prerequisite missing (rclone, FUSE, WinFsp) |
//! | 11 | Target conflict |
//! | 12 | Mount timed out |
//! | 13 | Unmount busy |
//! | 14 | Auto-mount registration failed |
//! | 15 | Helper exited with an error |
//! | 16 | Invalid bucket name |
//! | 17 | Configuration error |
//! | 18 | Local I/O error |

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Permission denied outside of a library operation
pub const PERMISSION_DENIED: u8 = 5;

/// Operation cancelled or interrupted
pub const CANCELLED: u8 = 8;

/// Config file could not be parsed; shares the library's configuration code
pub const CONFIG_INVALID: u8 = 17;
