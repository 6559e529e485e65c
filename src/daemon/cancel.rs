//! Cooperative cancellation shared between threads.
//!
//! Cancellation is advisory: holders check the token at their own checkpoints
//! or block on [`CancelToken::wait_timeout`]. Nothing is interrupted.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Clonable cancel handle; all clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block until cancelled or `timeout` elapses; returns whether cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            self.inner.cond.wait_while_for(&mut cancelled, |c| !*c, timeout);
        }
        *cancelled
    }
}
