//! Object pools for frame buffers and points
//!
//! A [`Pool`] hands out recycled values to avoid allocation churn on the
//! decode hot path. Values are reset before they go back on the shelf, so a
//! reused `Point` or byte buffer never leaks data from a previous frame.
//!
//! The shelf is a bounded crossbeam channel: `get` is a `try_recv` that
//! falls back to `T::default()`, `put` is a `try_send` that drops the value
//! when the shelf is full.
//!
//! Use [`Pool::guard`] where a value has several exit paths; the returned
//! [`Pooled`] puts the value back on drop. Frame buffers travel through the
//! source queue as `Pooled<Vec<u8>>`, so a buffer comes back whether it is
//! decoded, rejected by a stopped worker or left queued at shutdown.

use crate::types::Point;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Values that can be cleared for reuse
pub trait Reset {
    fn reset(&mut self);
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reset for Point {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Counters for pool monitoring
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Values served from the shelf
    pub hits: AtomicU64,
    /// Values freshly allocated because the shelf was empty
    pub misses: AtomicU64,
    /// Values returned to the shelf
    pub returns: AtomicU64,
    /// Values dropped because the shelf was full
    pub drops: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub drops: u64,
}

impl PoolSnapshot {
    /// Fraction of `get` calls served without allocating (1.0 when idle)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A bounded pool of reusable values
pub struct Pool<T> {
    shelf_tx: Sender<T>,
    shelf_rx: Receiver<T>,
    metrics: PoolMetrics,
}

impl<T: Reset + Default> Pool<T> {
    /// Create a pool that keeps at most `capacity` idle values
    pub fn new(capacity: usize) -> Self {
        let (shelf_tx, shelf_rx) = bounded(capacity.max(1));
        Self {
            shelf_tx,
            shelf_rx,
            metrics: PoolMetrics::default(),
        }
    }

    /// Take a value from the pool, allocating if none is idle
    pub fn get(&self) -> T {
        match self.shelf_rx.try_recv() {
            Ok(value) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                value
            }
            Err(_) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Reset a value and return it to the pool
    pub fn put(&self, mut value: T) {
        value.reset();
        if self.shelf_tx.try_send(value).is_ok() {
            self.metrics.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take a value wrapped in a guard that returns it on drop
    pub fn guard(self: &Arc<Self>) -> Pooled<T> {
        Pooled {
            value: self.get(),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle values on the shelf
    pub fn idle(&self) -> usize {
        self.shelf_rx.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            returns: self.metrics.returns.load(Ordering::Relaxed),
            drops: self.metrics.drops.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.shelf_rx.len())
            .field("capacity", &self.shelf_rx.capacity())
            .finish()
    }
}

/// A pooled value that returns itself to its pool when dropped
pub struct Pooled<T: Reset + Default> {
    value: T,
    pool: Arc<Pool<T>>,
}

impl<T: Reset + Default + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: Reset + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Reset + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Reset + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.value));
    }
}
