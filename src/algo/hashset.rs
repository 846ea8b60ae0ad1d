//! Keyed hash set with chained buckets over an entry slab.
//!
//! Entries live in a slab of slots; each bucket holds the index of the first
//! slot of its chain and slots link to the next one. Removed slots go on a
//! free list and are reused before the slab grows. The hash of every entry is
//! stored next to it, so rehashing on growth never touches the keys.
//!
//! Storage (buckets and slots) is charged against the set's memory region.

use crate::error::Result;
use crate::memory::Memf;
use ahash::RandomState;
use std::hash::Hash;

const NIL: u32 = u32::MAX;
const MIN_BUCKETS: usize = 16;

/// Entry stored in a [`HashSet`], identified by a key it carries.
pub trait Keyed {
    type Key: Hash + Eq + ?Sized;

    fn key(&self) -> &Self::Key;
}

struct Slot<T> {
    hash: u64,
    /// Next slot in the bucket chain, or in the free list when vacant
    next: u32,
    entry: Option<T>,
}

/// Hash set of keyed entries.
pub struct HashSet<T: Keyed> {
    buckets: Vec<u32>,
    slots: Vec<Slot<T>>,
    free: u32,
    len: usize,
    hasher: RandomState,
    memf: Memf,
    charged: usize,
}

fn new_hasher() -> RandomState {
    // Fixed seeds in tests for deterministic behavior
    #[cfg(test)]
    let hasher = RandomState::with_seeds(
        0xbb8c484891ec6c86,
        0x0522a25ae9c769f9,
        0xeed2797b9571bc75,
        0x4feb29c1fbbd59d0,
    );
    #[cfg(not(test))]
    let hasher = RandomState::new();
    hasher
}

impl<T: Keyed> HashSet<T> {
    /// Empty set; nothing is allocated until the first insert.
    pub fn new(memf: Memf) -> Self {
        Self {
            buckets: Vec::new(),
            slots: Vec::new(),
            free: NIL,
            len: 0,
            hasher: new_hasher(),
            memf,
            charged: 0,
        }
    }

    pub fn with_capacity(memf: Memf, capacity: usize) -> Result<Self> {
        let mut set = Self::new(memf);
        set.rehash(buckets_for(capacity))?;
        Ok(set)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn hash_key(&self, key: &T::Key) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: &T::Key) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = self.hash_key(key);
        let mut idx = self.buckets[self.bucket_of(hash)];
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if slot.hash == hash {
                if let Some(entry) = &slot.entry {
                    if entry.key() == key {
                        return Some(idx as usize);
                    }
                }
            }
            idx = slot.next;
        }
        None
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.find(key)
            .and_then(|idx| self.slots[idx].entry.as_ref())
    }

    pub fn get_mut(&mut self, key: &T::Key) -> Option<&mut T> {
        match self.find(key) {
            Some(idx) => self.slots[idx].entry.as_mut(),
            None => None,
        }
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.find(key).is_some()
    }

    /// Inserts `entry`, replacing and returning an entry with the same key.
    pub fn insert(&mut self, entry: T) -> Result<Option<T>> {
        if let Some(idx) = self.find(entry.key()) {
            return Ok(self.slots[idx].entry.replace(entry));
        }

        if (self.len + 1) * 4 > self.buckets.len() * 3 {
            let target = (self.buckets.len() * 2).max(MIN_BUCKETS);
            self.rehash(target)?;
        }

        let hash = self.hash_key(entry.key());
        let bucket = self.bucket_of(hash);
        let head = self.buckets[bucket];

        let idx = if self.free != NIL {
            let idx = self.free;
            let slot = &mut self.slots[idx as usize];
            self.free = slot.next;
            *slot = Slot {
                hash,
                next: head,
                entry: Some(entry),
            };
            idx
        } else {
            self.charge(std::mem::size_of::<Slot<T>>())?;
            self.slots.push(Slot {
                hash,
                next: head,
                entry: Some(entry),
            });
            (self.slots.len() - 1) as u32
        };

        self.buckets[bucket] = idx;
        self.len += 1;
        Ok(None)
    }

    pub fn remove(&mut self, key: &T::Key) -> Option<T> {
        let idx = self.find(key)?;
        self.unlink(idx)
    }

    /// Keeps only entries for which `keep` returns true. Returns the removed ones.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        for idx in 0..self.slots.len() {
            let drop_it = match &self.slots[idx].entry {
                Some(entry) => !keep(entry),
                None => false,
            };
            if drop_it {
                if let Some(entry) = self.unlink(idx) {
                    removed.push(entry);
                }
            }
        }
        removed
    }

    /// Removes every entry, releasing all storage.
    pub fn drain(&mut self) -> Vec<T> {
        let entries: Vec<T> = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.entry)
            .collect();
        self.buckets = Vec::new();
        self.free = NIL;
        self.len = 0;
        self.memf.release(self.charged);
        self.charged = 0;
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.entry.as_mut())
    }

    fn unlink(&mut self, idx: usize) -> Option<T> {
        let hash = self.slots[idx].hash;
        let bucket = self.bucket_of(hash);
        let next = self.slots[idx].next;

        if self.buckets[bucket] == idx as u32 {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while cur != NIL {
                if self.slots[cur as usize].next == idx as u32 {
                    self.slots[cur as usize].next = next;
                    break;
                }
                cur = self.slots[cur as usize].next;
            }
        }

        let slot = &mut self.slots[idx];
        let entry = slot.entry.take();
        slot.next = self.free;
        self.free = idx as u32;
        self.len -= 1;
        entry
    }

    fn charge(&mut self, bytes: usize) -> Result<()> {
        self.memf.reserve(bytes)?;
        self.charged += bytes;
        Ok(())
    }

    fn rehash(&mut self, num_buckets: usize) -> Result<()> {
        let old = self.buckets.len() * std::mem::size_of::<u32>();
        let new = num_buckets * std::mem::size_of::<u32>();
        if new > old {
            self.charge(new - old)?;
        }

        self.buckets = vec![NIL; num_buckets];
        for idx in 0..self.slots.len() {
            if self.slots[idx].entry.is_some() {
                let bucket = self.bucket_of(self.slots[idx].hash);
                self.slots[idx].next = self.buckets[bucket];
                self.buckets[bucket] = idx as u32;
            }
        }
        Ok(())
    }
}

fn buckets_for(capacity: usize) -> usize {
    (capacity * 4 / 3 + 1).next_power_of_two().max(MIN_BUCKETS)
}

impl<T: Keyed> Drop for HashSet<T> {
    fn drop(&mut self) {
        self.memf.release(self.charged);
    }
}
