//! Reference-counted interning pools for strings and blobs.
//!
//! Equal content is stored once; each [`Pooled`] handle stands for one
//! reference. Handles are not `Clone`: a new reference is taken with
//! [`InternPool::copy`] and returned with [`InternPool::free`], which removes
//! the content when its count reaches zero. A single mutex guards each pool.

use super::hashset::{HashSet, Keyed};
use crate::error::Result;
use crate::memory::Memf;
use parking_lot::Mutex;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

/// One counted reference to pooled content.
pub struct Pooled<B: ?Sized>(Arc<B>);

impl<B: ?Sized> Pooled<B> {
    /// Identity of the pooled content, stable while any reference is held.
    pub fn id(&self) -> u64 {
        Arc::as_ptr(&self.0) as *const () as usize as u64
    }
}

impl<B: ?Sized> Deref for Pooled<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.0
    }
}

impl<B: ?Sized + std::fmt::Debug> std::fmt::Debug for Pooled<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (*self.0).fmt(f)
    }
}

pub type PooledStr = Pooled<str>;
pub type PooledBin = Pooled<[u8]>;

struct PoolEntry<B: ?Sized> {
    data: Arc<B>,
    refcount: u32,
}

impl<B: ?Sized + Hash + Eq> Keyed for PoolEntry<B> {
    type Key = B;

    fn key(&self) -> &B {
        &self.data
    }
}

pub struct InternPool<B: ?Sized + Hash + Eq> {
    entries: Mutex<HashSet<PoolEntry<B>>>,
    memf: Memf,
}

pub type StrPool = InternPool<str>;
pub type BinPool = InternPool<[u8]>;

impl<B> InternPool<B>
where
    B: ?Sized + Hash + Eq,
    for<'a> Arc<B>: From<&'a B>,
{
    pub fn new(memf: Memf) -> Self {
        Self {
            entries: Mutex::new(HashSet::new(memf.clone())),
            memf,
        }
    }

    /// Interns `data`, creating it with count 1 or taking one more reference.
    pub fn add(&self, data: &B) -> Result<Pooled<B>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(data) {
            entry.refcount += 1;
            return Ok(Pooled(entry.data.clone()));
        }

        let bytes = std::mem::size_of_val(data);
        self.memf.reserve(bytes)?;
        let arc: Arc<B> = Arc::from(data);
        let inserted = entries.insert(PoolEntry {
            data: arc.clone(),
            refcount: 1,
        });
        if let Err(e) = inserted {
            self.memf.release(bytes);
            return Err(e);
        }
        Ok(Pooled(arc))
    }

    /// Takes another reference to already pooled content.
    pub fn copy(&self, pooled: &Pooled<B>) -> Result<Pooled<B>> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&*pooled.0) {
                entry.refcount += 1;
                return Ok(Pooled(entry.data.clone()));
            }
        }
        self.add(&pooled.0)
    }

    /// Returns one reference; the content is dropped when none remain.
    pub fn free(&self, pooled: Pooled<B>) {
        let mut entries = self.entries.lock();
        let last = match entries.get_mut(&*pooled.0) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if last {
            entries.remove(&*pooled.0);
            self.memf.release(std::mem::size_of_val(&*pooled.0));
        }
    }

    /// Swaps `old` for `new`, keeping the reference when content is unchanged.
    pub fn replace(&self, old: Option<Pooled<B>>, new: Option<&B>) -> Result<Option<Pooled<B>>> {
        match (old, new) {
            (Some(old), Some(new)) if &*old == new => Ok(Some(old)),
            (old, new) => {
                if let Some(old) = old {
                    self.free(old);
                }
                new.map(|data| self.add(data)).transpose()
            }
        }
    }

    /// Identity of `data` if it is pooled, without taking a reference.
    pub fn lookup(&self, data: &B) -> Option<u64> {
        self.entries
            .lock()
            .get(data)
            .map(|entry| Arc::as_ptr(&entry.data) as *const () as usize as u64)
    }

    /// References currently held on `data`.
    pub fn refcount(&self, data: &B) -> u32 {
        self.entries
            .lock()
            .get(data)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    /// Number of distinct pooled values
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap;

    #[test]
    fn test_add_dedups_and_counts() {
        let pool = StrPool::new(heap());
        let a = pool.add("timeout").unwrap();
        let b = pool.add("timeout").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(pool.refcount("timeout"), 2);
        assert_eq!(pool.len(), 1);

        pool.free(a);
        assert_eq!(pool.refcount("timeout"), 1);
        pool.free(b);
        assert_eq!(pool.refcount("timeout"), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_replace_same_content_keeps_reference() {
        let pool = StrPool::new(heap());
        let err = pool.add("refused").unwrap();
        let err = pool.replace(Some(err), Some("refused")).unwrap();
        assert_eq!(pool.refcount("refused"), 1);

        let err = pool.replace(err, Some("reset")).unwrap();
        assert_eq!(pool.refcount("refused"), 0);
        assert_eq!(err.as_deref(), Some("reset"));

        assert!(pool.replace(err, None).unwrap().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_copy_and_binary_pool() {
        let pool = BinPool::new(heap());
        let key = pool.add(&[10u8, 0, 0, 1][..]).unwrap();
        let copy = pool.copy(&key).unwrap();
        assert_eq!(pool.refcount(&[10u8, 0, 0, 1][..]), 2);
        assert_eq!(pool.lookup(&[10u8, 0, 0, 1][..]), Some(key.id()));
        pool.free(key);
        pool.free(copy);
        assert_eq!(pool.lookup(&[10u8, 0, 0, 1][..]), None);
    }

    #[test]
    fn test_memory_accounting() {
        let memf = heap();
        let pool = StrPool::new(memf.clone());
        let s = pool.add("0123456789").unwrap();
        assert!(memf.used() >= 10);
        pool.free(s);
        drop(pool);
        assert_eq!(memf.used(), 0);
    }
}
