//! Pluggable memory regions.
//!
//! Every table, pool and buffer is built with a [`Memf`] handle and charges
//! the storage it holds against it. Two regions exist:
//!
//! - [`HeapRegion`]: unbounded, only keeps accounting
//! - [`SharedSegment`]: fixed capacity sized at startup; a reservation that
//!   does not fit fails with [`StateError::ResourceExhausted`] instead of
//!   growing the segment
//!
//! Allocation failure is therefore an ordinary error the caller can act on,
//! typically by evicting old values.

use crate::error::{Result, StateError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocator interface passed to each table at construction.
pub trait MemoryRegion: Send + Sync {
    /// Account for `bytes` more; fails if the region cannot hold them.
    fn reserve(&self, bytes: usize) -> Result<()>;

    /// Return `bytes` previously reserved.
    fn release(&self, bytes: usize);

    /// Bytes currently reserved
    fn used(&self) -> usize;

    /// Total capacity, `None` when unbounded
    fn capacity(&self) -> Option<usize>;

    /// Number of failed reservations
    fn failures(&self) -> u64 {
        0
    }
}

/// Shared handle to a memory region.
pub type Memf = Arc<dyn MemoryRegion>;

/// Whether two handles account against the same region.
pub fn same_region(a: &Memf, b: &Memf) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Convenience constructor for an unbounded heap region.
pub fn heap() -> Memf {
    Arc::new(HeapRegion::default())
}

/// Process heap. Never refuses a reservation.
#[derive(Debug, Default)]
pub struct HeapRegion {
    used: AtomicUsize,
}

impl MemoryRegion for HeapRegion {
    fn reserve(&self, bytes: usize) -> Result<()> {
        self.used.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Fixed-size segment.
#[derive(Debug)]
pub struct SharedSegment {
    capacity: usize,
    used: AtomicUsize,
    failures: AtomicU64,
}

impl SharedSegment {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl MemoryRegion for SharedSegment {
    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.capacity {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(StateError::ResourceExhausted {
                    requested: bytes,
                    available: self.capacity - current.min(self.capacity),
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
