//! Cooperative cancellation shared between a controller and a worker thread.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cloneable stop signal. All clones observe the same flag.
///
/// Workers poll [`is_cancelled`](Self::is_cancelled) at iteration boundaries
/// or park in [`wait_timeout`](Self::wait_timeout), which returns early as
/// soon as [`cancel`](Self::cancel) is called from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.inner.signal.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block for up to `timeout`. Returns `true` if the token was cancelled
    /// before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !*cancelled {
                    if self.inner.signal.wait_until(&mut cancelled, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*cancelled {
                    self.inner.signal.wait(&mut cancelled);
                }
            }
        }
        *cancelled
    }
}
