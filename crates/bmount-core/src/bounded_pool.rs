//! Bounded thread pool for timeout-wrapped filesystem probes.
//!
//! A stat or `read_dir` on a dead FUSE mount can block in the kernel forever.
//! Probes therefore run on a helper thread and the caller stops waiting after
//! a timeout, but the thread itself cannot be killed and stays behind. This
//! pool counts those threads and refuses new probes once too many are stuck,
//! so a host with several wedged mounts cannot exhaust the process.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, mpsc};
use std::time::Duration;

/// Maximum threads that may be stuck before probes are rejected.
pub const MAX_LEAKED_THREADS: usize = 32;

/// Probe threads alive right now, stuck ones included.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// One counted probe thread; released when the thread finishes or unwinds.
struct ProbeSlot;

impl ProbeSlot {
    fn acquire() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::AcqRel);
        ProbeSlot
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs blocking probes with a timeout, refusing work once too many probe
/// threads are wedged.
#[derive(Debug, Clone)]
pub struct BoundedFsPool {
    limit: usize,
}

impl Default for BoundedFsPool {
    fn default() -> Self {
        Self::new(MAX_LEAKED_THREADS)
    }
}

impl BoundedFsPool {
    /// Pool that refuses probes once `limit` threads are in flight.
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Run `op` on a probe thread and wait at most `timeout` for it.
    ///
    /// `ErrorKind::TimedOut` means the wait expired and the thread was left
    /// behind; `ErrorKind::ResourceBusy` means the pool is saturated and `op`
    /// never ran.
    pub fn run_with_timeout<T, F>(&self, timeout: Duration, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        if self.is_exhausted() {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!(
                    "{} filesystem probes are stuck on dead mounts; run `bmount cleanup`",
                    self.in_flight()
                ),
            ));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let slot = ProbeSlot::acquire();
        std::thread::Builder::new()
            .name("fs-probe".into())
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(op());
            })?;

        rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    limit = self.limit,
                    ?timeout,
                    "Filesystem probe timed out, leaving its thread behind"
                );
                io::Error::new(io::ErrorKind::TimedOut, "filesystem probe timed out")
            }
            mpsc::RecvTimeoutError::Disconnected => io::Error::other("filesystem probe panicked"),
        })?
    }

    /// Probe threads currently alive.
    pub fn in_flight(&self) -> usize {
        IN_FLIGHT.load(Ordering::Acquire)
    }

    /// Whether new probes are being rejected.
    pub fn is_exhausted(&self) -> bool {
        self.in_flight() >= self.limit
    }
}

/// Pool shared by every probe in the process.
pub static BOUNDED_FS_POOL: LazyLock<BoundedFsPool> = LazyLock::new(BoundedFsPool::default);
