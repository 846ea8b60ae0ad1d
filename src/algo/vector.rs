//! Growable vector that charges its capacity against a memory region.

use crate::error::Result;
use crate::memory::Memf;
use std::ops::Deref;

const MIN_ALLOC: usize = 8;

/// Growable array with accounted capacity.
///
/// Reads go through `Deref<Target = [T]>`; every operation that may grow the
/// storage returns a `Result` because the backing region may be exhausted.
pub struct Vector<T> {
    values: Vec<T>,
    /// Slots charged against `memf`
    alloc: usize,
    memf: Memf,
}

impl<T> Vector<T> {
    pub fn new(memf: Memf) -> Self {
        Self {
            values: Vec::new(),
            alloc: 0,
            memf,
        }
    }

    pub fn with_capacity(memf: Memf, capacity: usize) -> Result<Self> {
        let mut vector = Self::new(memf);
        vector.reserve(capacity)?;
        Ok(vector)
    }

    /// Makes room for `additional` more values, growing by half when needed.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let need = self.values.len() + additional;
        if need <= self.alloc {
            return Ok(());
        }
        let new_alloc = need.max(self.alloc + self.alloc / 2).max(MIN_ALLOC);
        self.memf
            .reserve((new_alloc - self.alloc) * std::mem::size_of::<T>())?;
        self.values.reserve_exact(new_alloc - self.values.len());
        self.alloc = new_alloc;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.reserve(1)?;
        self.values.push(value);
        Ok(())
    }

    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<()>
    where
        T: Clone,
    {
        self.reserve(values.len())?;
        self.values.extend_from_slice(values);
        Ok(())
    }

    /// Removes the value at `idx`, shifting the rest.
    pub fn remove(&mut self, idx: usize) -> T {
        self.values.remove(idx)
    }

    pub fn pop(&mut self) -> Option<T> {
        self.values.pop()
    }

    /// Drops all values, keeping the allocation.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn sort(&mut self)
    where
        T: Ord,
    {
        self.values.sort_unstable();
    }

    pub fn dedup(&mut self)
    where
        T: PartialEq,
    {
        self.values.dedup();
    }

    /// Sort followed by dedup, leaving a set-like vector.
    pub fn sort_dedup(&mut self)
    where
        T: Ord,
    {
        self.sort();
        self.dedup();
    }

    /// Removes `value` from a sorted vector. Returns whether it was present.
    pub fn remove_sorted(&mut self, value: &T) -> bool
    where
        T: Ord,
    {
        match self.values.binary_search(value) {
            Ok(idx) => {
                self.values.remove(idx);
                true
            }
            Err(_) => false,
        }
    }
}

impl<T> Deref for Vector<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.values
    }
}

impl<T> Drop for Vector<T> {
    fn drop(&mut self) {
        self.memf.release(self.alloc * std::mem::size_of::<T>());
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.values.iter()).finish()
    }
}
