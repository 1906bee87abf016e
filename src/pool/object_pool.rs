//! Generic bounded object pool.
//!
//! # Responsibilities
//! - Hand out previously returned instances (reset) before constructing new ones
//! - Store returned instances up to a fixed capacity, discard the rest
//! - Reject an instance that is returned while it is already pooled
//!
//! # Design Decisions
//! - Storage is a lock-free `ArrayQueue`, so the capacity bound is enforced by
//!   the queue itself and a full queue means "discard"
//! - Instances travel in `Pooled<T>` handles that carry a process-unique id and
//!   the "currently pooled" marker; handles are cheap to clone so that one
//!   instance can be shared by several readers
//! - An instance is only handed out again once no clone of its handle is left
//!   outside the pool

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::observability::metrics;

/// Ids are unique across every pool in the process.
static ENTRY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A type that can be recycled through an [`ObjectPool`].
pub trait Poolable: Send + Sync + 'static {
    /// Bring the instance back to its freshly constructed state.
    fn reset(&mut self);
}

/// Error returned by [`ObjectPool::give_back`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The instance is already sitting in a pool.
    #[error("instance {id} returned to pool `{pool}` while already pooled")]
    AlreadyPooled { pool: &'static str, id: u64 },
}

/// Where a returned instance ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Stored for reuse.
    Stored,
    /// The pool was at capacity; the instance was dropped.
    Discarded,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
    pub discarded: u64,
    pub rejected: u64,
}

struct Slot<T> {
    id: u64,
    pooled: AtomicBool,
    value: T,
}

/// Handle to a rented instance.
///
/// Clones share the same instance. Mutable access is only available while
/// the handle is the sole owner.
pub struct Pooled<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Pooled<T> {
    /// Process-unique identity of the underlying instance.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Whether the instance is currently stored in a pool.
    pub fn is_pooled(&self) -> bool {
        self.slot.pooled.load(Ordering::Acquire)
    }

    /// Whether this handle is the only reference to the instance.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.slot) == 1
    }

    /// Mutable access, only when no other handle shares the instance.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.slot).map(|slot| &mut slot.value)
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }
}

impl<T> Clone for Pooled<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.slot.id)
            .field("pooled", &self.is_pooled())
            .field("value", &self.slot.value)
            .finish()
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolInner<T> {
    name: &'static str,
    available: ArrayQueue<Arc<Slot<T>>>,
    factory: Factory<T>,
    hits: AtomicU64,
    misses: AtomicU64,
    stored: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
}

/// A bounded cache of reusable instances.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool holding at most `capacity` idle instances.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new<F>(name: &'static str, capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        assert!(capacity > 0, "pool capacity must be greater than 0");

        Self {
            inner: Arc::new(PoolInner {
                name,
                available: ArrayQueue::new(capacity),
                factory: Box::new(factory),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                stored: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Take an instance out of the pool, constructing one on a miss.
    ///
    /// The returned handle is always the sole owner of its instance.
    pub fn rent(&self) -> Pooled<T> {
        while let Some(mut slot) = self.inner.available.pop() {
            match Arc::get_mut(&mut slot) {
                Some(entry) => {
                    entry.value.reset();
                    entry.pooled.store(false, Ordering::Release);
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_pool_rent(self.inner.name, true);
                    return Pooled { slot };
                }
                None => {
                    // Someone returned a handle while keeping a clone of it.
                    tracing::error!(
                        pool = self.inner.name,
                        id = slot.id,
                        "Pooled instance still referenced, dropping it"
                    );
                }
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_rent(self.inner.name, false);
        Pooled {
            slot: Arc::new(Slot {
                id: ENTRY_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                pooled: AtomicBool::new(false),
                value: (self.inner.factory)(),
            }),
        }
    }

    /// Hand an instance back to the pool.
    pub fn give_back(&self, item: Pooled<T>) -> Result<ReturnOutcome, PoolError> {
        if item.slot.pooled.swap(true, Ordering::AcqRel) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_pool_return(self.inner.name, "rejected");
            tracing::error!(
                pool = self.inner.name,
                id = item.slot.id,
                "Instance returned while already pooled"
            );
            return Err(PoolError::AlreadyPooled {
                pool: self.inner.name,
                id: item.slot.id,
            });
        }

        match self.inner.available.push(item.slot) {
            Ok(()) => {
                self.inner.stored.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_return(self.inner.name, "stored");
                Ok(ReturnOutcome::Stored)
            }
            Err(_full) => {
                // The marker stays set so a late second return is still caught.
                self.inner.discarded.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_return(self.inner.name, "discarded");
                Ok(ReturnOutcome::Discarded)
            }
        }
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Maximum number of idle instances.
    pub fn capacity(&self) -> usize {
        self.inner.available.capacity()
    }

    /// Number of idle instances currently stored.
    pub fn idle_count(&self) -> usize {
        self.inner.available.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            stored: self.inner.stored.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.available.capacity())
            .field("idle", &self.inner.available.len())
            .finish()
    }
}
