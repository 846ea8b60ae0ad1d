//! Sharded element hash: id-keyed elements with per-element locks.
//!
//! Every table has one read/write meta lock guarding which ids exist and one
//! mutex per element guarding its payload. Element callbacks run while the
//! meta lock is read-held and the element lock is held, so different ids are
//! processed in parallel and one id has at most one writer at a time.
//!
//! # Lock order
//! Meta lock first, element lock second. A callback must never call back into
//! the same table: a waiting writer would block the nested read.
//!
//! # Create on miss
//! `Unlocked -> ReadLocked -> (miss) -> WriteLocked -> ReadLocked`.
//! The read lock is released fully before the write lock is taken, so another
//! thread may create the same id in between; the write-locked step looks the
//! id up again and reuses the element it finds. A newly created element is
//! locked before the write lock is downgraded.
//!
//! # Deletion
//! A callback requests removal with [`Element::mark_for_deletion`]. The
//! element lock and read lock are released, the write lock is taken and the
//! mark is checked again before the payload is released. Every `process` call
//! clears the mark before running its callback, so an element that was used
//! again in the meantime survives.

use crate::algo::hashset::{HashSet, Keyed};
use crate::error::{Result, StateError};
use crate::memory::{same_region, Memf};
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ================================================================================================
// FLAGS
// ================================================================================================

/// Processing and element flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ElemFlags(u8);

impl ElemFlags {
    pub const NONE: ElemFlags = ElemFlags(0);
    /// Fail instead of creating an absent element
    pub const DO_NOT_CREATE: ElemFlags = ElemFlags(0x01);
    /// Element asked to be removed after its callback
    pub const DELETE: ElemFlags = ElemFlags(0x02);
    /// Hold the meta lock in write mode for the whole iteration
    pub const ITER_WRLOCK: ElemFlags = ElemFlags(0x04);
    /// Iteration never mutates the table, deletion marks are ignored
    pub const READ_ONLY: ElemFlags = ElemFlags(0x08);

    #[inline]
    pub fn contains(self, other: ElemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn insert(&mut self, other: ElemFlags) {
        self.0 |= other.0;
    }

    #[inline]
    fn remove(&mut self, other: ElemFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for ElemFlags {
    type Output = ElemFlags;

    fn bitor(self, rhs: ElemFlags) -> ElemFlags {
        ElemFlags(self.0 | rhs.0)
    }
}

// ================================================================================================
// ELEMENTS
// ================================================================================================

/// Payload lifecycle hooks.
pub trait ElemPayload: Sized + Send + 'static {
    /// Shared state the hooks need (pools, configuration)
    type Context: Send + Sync;

    /// Builds the payload for a new element.
    fn create(id: u64, memf: &Memf, ctx: &Self::Context) -> Result<Self>;

    /// Releases resources held outside the payload itself before it is dropped.
    fn release(&mut self, _id: u64, _memf: &Memf, _ctx: &Self::Context) {}
}

/// One id-keyed entry, seen by callbacks while locked.
#[derive(Debug)]
pub struct Element<P> {
    id: u64,
    flags: ElemFlags,
    data: P,
}

impl<P> Element<P> {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn data(&self) -> &P {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut P {
        &mut self.data
    }

    /// Requests removal once the current callback returns.
    pub fn mark_for_deletion(&mut self) {
        self.flags.insert(ElemFlags::DELETE);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.flags.contains(ElemFlags::DELETE)
    }
}

type ElemCell<P> = Arc<Mutex<Element<P>>>;

struct Slot<P> {
    id: u64,
    elem: ElemCell<P>,
}

impl<P> Keyed for Slot<P> {
    type Key = u64;

    fn key(&self) -> &u64 {
        &self.id
    }
}

#[inline]
fn elem_bytes<P>() -> usize {
    // element, mutex and the two Arc counters
    std::mem::size_of::<Mutex<Element<P>>>() + 2 * std::mem::size_of::<usize>()
}

// ================================================================================================
// TABLE
// ================================================================================================

/// Table statistics.
#[derive(Clone, Debug, Default)]
pub struct ElemsHashStats {
    /// Number of elements
    pub elements: usize,
    /// Element lock acquisitions that had to wait
    pub contended_locks: u64,
}

pub struct ElemsHash<P: ElemPayload> {
    elems: RwLock<HashSet<Slot<P>>>,
    memf: Memf,
    ctx: P::Context,
    contended: AtomicU64,
}

impl<P: ElemPayload> ElemsHash<P> {
    pub fn new(memf: Memf, ctx: P::Context) -> Self {
        Self {
            elems: RwLock::new(HashSet::new(memf.clone())),
            memf,
            ctx,
            contended: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &P::Context {
        &self.ctx
    }

    pub fn memf(&self) -> &Memf {
        &self.memf
    }

    /// Runs `f` on element `id` under its lock, creating the element unless
    /// `flags` has [`ElemFlags::DO_NOT_CREATE`].
    ///
    /// # Returns
    /// - `Ok(R)`: the callback's result
    /// - `Err(StateError::NotFound)`: absent and creation suppressed, table unchanged
    /// - `Err(_)`: creation failed or the callback failed
    pub fn process<R, F>(&self, id: u64, flags: ElemFlags, f: F) -> Result<R>
    where
        F: FnOnce(&mut Element<P>, &Memf) -> Result<R>,
    {
        let cell: ElemCell<P>;
        let read = self.elems.read();
        let found = read.get(&id).map(|slot| slot.elem.clone());

        let (read, mut elem) = match found {
            Some(existing) => {
                cell = existing;
                let elem = self.lock_elem(&cell);
                (read, elem)
            }
            None => {
                if flags.contains(ElemFlags::DO_NOT_CREATE) {
                    return Err(StateError::NotFound(id));
                }
                drop(read);

                let mut write = self.elems.write();
                let raced = write.get(&id).map(|slot| slot.elem.clone());
                cell = match raced {
                    Some(existing) => {
                        debug!("Element {} was created by a concurrent caller", id);
                        existing
                    }
                    None => {
                        let created = self.create_elem(id)?;
                        if let Err(e) = write.insert(Slot {
                            id,
                            elem: created.clone(),
                        }) {
                            self.free_elem(&created);
                            return Err(e);
                        }
                        created
                    }
                };
                let elem = cell.lock();
                (RwLockWriteGuard::downgrade(write), elem)
            }
        };

        elem.flags.remove(ElemFlags::DELETE);
        let result = f(&mut elem, &self.memf);
        let delete = elem.is_marked_for_deletion();
        drop(elem);
        drop(read);

        if delete {
            self.remove_marked(id, &cell);
        }
        result
    }

    /// Runs `f` over every element, stopping at the first error.
    ///
    /// The meta lock is read-held for the pass, or write-held with
    /// [`ElemFlags::ITER_WRLOCK`]. Deletion marks are applied after the pass
    /// unless [`ElemFlags::READ_ONLY`] is set. Returns the number of elements
    /// visited.
    pub fn iterate<F>(&self, flags: ElemFlags, mut f: F) -> Result<usize>
    where
        F: FnMut(&mut Element<P>, &Memf) -> Result<()>,
    {
        let read_only = flags.contains(ElemFlags::READ_ONLY);
        let mut visited = 0;
        let mut outcome = Ok(());

        if flags.contains(ElemFlags::ITER_WRLOCK) {
            let mut elems = self.elems.write();
            for slot in elems.iter() {
                let mut elem = slot.elem.lock();
                elem.flags.remove(ElemFlags::DELETE);
                visited += 1;
                if let Err(e) = f(&mut elem, &self.memf) {
                    outcome = Err(e);
                    break;
                }
            }
            if !read_only {
                let removed = elems.retain(|slot| !slot.elem.lock().is_marked_for_deletion());
                drop(elems);
                for slot in removed {
                    self.free_elem(&slot.elem);
                }
            }
            return outcome.map(|_| visited);
        }

        let mut marked = Vec::new();
        {
            let elems = self.elems.read();
            for slot in elems.iter() {
                let mut elem = self.lock_elem(&slot.elem);
                elem.flags.remove(ElemFlags::DELETE);
                visited += 1;
                let result = f(&mut elem, &self.memf);
                if elem.is_marked_for_deletion() {
                    marked.push((slot.id, slot.elem.clone()));
                }
                if let Err(e) = result {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if !read_only {
            for (id, cell) in marked {
                self.remove_marked(id, &cell);
            }
        }
        outcome.map(|_| visited)
    }

    /// Read-only pass over every element.
    pub fn snapshot<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&Element<P>) -> Result<()>,
    {
        let elems = self.elems.read();
        let mut visited = 0;
        for slot in elems.iter() {
            let elem = self.lock_elem(&slot.elem);
            visited += 1;
            f(&elem)?;
        }
        Ok(visited)
    }

    /// Removes element `id`.
    pub fn delete(&self, id: u64) -> Result<()> {
        let removed = self.elems.write().remove(&id);
        match removed {
            Some(slot) => {
                self.free_elem(&slot.elem);
                Ok(())
            }
            None => Err(StateError::NotFound(id)),
        }
    }

    /// Removes every listed id that exists. Returns how many were removed.
    pub fn mass_delete(&self, ids: &[u64]) -> usize {
        let mut removed = Vec::new();
        {
            let mut elems = self.elems.write();
            for id in ids {
                if let Some(slot) = elems.remove(id) {
                    removed.push(slot);
                }
            }
        }
        for slot in &removed {
            self.free_elem(&slot.elem);
        }
        removed.len()
    }

    /// Removes every element whose id is not in `keep`. Returns how many were removed.
    pub fn retain_ids(&self, keep: &[u64]) -> usize {
        let mut sorted = keep.to_vec();
        sorted.sort_unstable();
        let removed = self
            .elems
            .write()
            .retain(|slot| sorted.binary_search(&slot.id).is_ok());
        for slot in &removed {
            self.free_elem(&slot.elem);
        }
        removed.len()
    }

    /// Swaps in the contents of `new` and releases what was stored before.
    ///
    /// Readers see either the old or the new contents, never a mix. `new` must
    /// have been built on the same region, since its elements stay charged there.
    pub fn replace(&self, mut new: ElemsHash<P>) -> Result<()> {
        if !same_region(&self.memf, &new.memf) {
            return Err(StateError::InvalidArgument(
                "replacement table lives in a different memory region".to_string(),
            ));
        }
        let incoming = std::mem::replace(new.elems.get_mut(), HashSet::new(new.memf.clone()));
        let mut previous = {
            let mut elems = self.elems.write();
            std::mem::replace(&mut *elems, incoming)
        };
        for slot in previous.drain() {
            self.free_elem(&slot.elem);
        }
        Ok(())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.elems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.elems.read().contains(&id)
    }

    pub fn stats(&self) -> ElemsHashStats {
        ElemsHashStats {
            elements: self.len(),
            contended_locks: self.contended.load(Ordering::Relaxed),
        }
    }

    // ============================================================================================
    // INTERNALS
    // ============================================================================================

    fn lock_elem<'a>(&self, cell: &'a ElemCell<P>) -> MutexGuard<'a, Element<P>> {
        match cell.try_lock() {
            Some(guard) => guard,
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                cell.lock()
            }
        }
    }

    fn create_elem(&self, id: u64) -> Result<ElemCell<P>> {
        let bytes = elem_bytes::<P>();
        self.memf.reserve(bytes)?;
        match P::create(id, &self.memf, &self.ctx) {
            Ok(data) => Ok(Arc::new(Mutex::new(Element {
                id,
                flags: ElemFlags::NONE,
                data,
            }))),
            Err(e) => {
                self.memf.release(bytes);
                Err(e)
            }
        }
    }

    fn free_elem(&self, cell: &ElemCell<P>) {
        let mut elem = cell.lock();
        let id = elem.id;
        elem.data.release(id, &self.memf, &self.ctx);
        self.memf.release(elem_bytes::<P>());
    }

    fn remove_marked(&self, id: u64, cell: &ElemCell<P>) {
        let removed = {
            let mut elems = self.elems.write();
            let same = elems
                .get(&id)
                .map(|slot| Arc::ptr_eq(&slot.elem, cell))
                .unwrap_or(false);
            if same && cell.lock().is_marked_for_deletion() {
                elems.remove(&id)
            } else {
                None
            }
        };
        if let Some(slot) = removed {
            self.free_elem(&slot.elem);
        }
    }
}

impl<P: ElemPayload> Drop for ElemsHash<P> {
    fn drop(&mut self) {
        let slots = self.elems.get_mut().drain();
        for slot in &slots {
            self.free_elem(&slot.elem);
        }
    }
}

impl<P: ElemPayload> std::fmt::Debug for ElemsHash<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElemsHash")
            .field("elements", &self.len())
            .field("contended_locks", &self.contended.load(Ordering::Relaxed))
            .finish()
    }
}

// ================================================================================================
// TESTS
// ================================================================================================
