//! Observer connection bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REFUSED_TOTAL, WS_CONNECTIONS_TOTAL};

/// Counts open observers against a limit.
#[derive(Debug)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    max: usize,
}

impl ConnectionTracker {
    /// Tracker allowing `max` concurrent observers.
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve a slot. `None` when the limit is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let acquired = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok();
        if !acquired {
            counter!(WS_CONNECTIONS_REFUSED_TOTAL).increment(1);
            return None;
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        Some(ConnectionGuard {
            tracker: Arc::clone(self),
        })
    }

    /// Open observers.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.tracker.active.fetch_sub(1, Ordering::AcqRel);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// When the client last proved it was alive.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record a Pong or any inbound frame.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last sign of life.
    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
