//! Connection limits.
//!
//! # Responsibilities
//! - Bound the number of concurrently open connections
//! - Reject over-limit accepts before any connection state is allocated
//! - Release each connection's slot exactly once, however many teardown
//!   paths ask for it
//!
//! # Design Decisions
//! - Optimistic increment then roll back on overflow; no lock on the accept path
//! - The slot travels with the connection as a lease, released on drop as a
//!   backstop

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct LimiterInner {
    max: usize,
    current: AtomicUsize,
}

/// Bounded counter of open connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    inner: Arc<LimiterInner>,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                max,
                current: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<LimiterLease> {
        let current = self.inner.current.fetch_add(1, Ordering::AcqRel) + 1;
        if current > self.inner.max {
            self.inner.current.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(LimiterLease {
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Slots currently held.
    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    pub fn available(&self) -> usize {
        self.inner.max.saturating_sub(self.current())
    }
}

/// One acquired slot.
///
/// `release` may be called from any number of teardown paths, concurrently or
/// repeatedly; the counter is decremented exactly once.
#[derive(Debug)]
pub struct LimiterLease {
    inner: Arc<LimiterInner>,
    released: AtomicBool,
}

impl LimiterLease {
    /// Give the slot back. Returns `true` for the call that actually did.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.current.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for LimiterLease {
    fn drop(&mut self) {
        self.release();
    }
}
