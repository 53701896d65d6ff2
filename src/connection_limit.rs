//! Connection Limiting
//!
//! Caps concurrent WebSocket connections so a flood of sockets cannot
//! exhaust the process. Slots are RAII guards: dropping the guard frees
//! the slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection limiter that tracks and enforces the socket cap.
#[derive(Clone)]
pub struct ConnectionLimiter {
    inner: Arc<ConnectionLimiterInner>,
}

struct ConnectionLimiterInner {
    /// Current number of active connections.
    active: AtomicUsize,
    /// Maximum allowed connections.
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            inner: Arc::new(ConnectionLimiterInner {
                active: AtomicUsize::new(0),
                max_connections,
            }),
        }
    }

    /// Tries to acquire a connection slot.
    ///
    /// Returns `Some(ConnectionGuard)` if successful, `None` if at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let cap = self.inner.max_connections;
        let acquired = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < cap {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok();

        acquired.then(|| ConnectionGuard {
            inner: self.inner.clone(),
        })
    }

    /// Returns the current number of active connections.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// RAII guard that releases the connection slot on drop.
pub struct ConnectionGuard {
    inner: Arc<ConnectionLimiterInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
