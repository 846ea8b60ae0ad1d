//! Circular time-series buffer.
//!
//! Holds up to `size` timestamped records ordered by time from tail (oldest)
//! to head (newest). Inserts at either end are O(1) and are rejected instead
//! of reordering when they would break time order. Lookup by time is a binary
//! search over the logical positions of the circular index space.
//!
//! # State
//! - empty: `head == tail == -1`, `count == 0`
//! - partially filled: `0 < count < size`
//! - full: `count == size`
//!
//! Physical indices returned by this module are always in `[0, size)`.
//! Records evicted by [`TsBuff::resize`] and [`TsBuff::clear`] are handed to a
//! callback exactly once so the owner can release their payloads.

use crate::error::{InsertError, Result, StateError};
use crate::memory::Memf;
use log::warn;

/// Largest permitted buffer size
pub const MAX_SIZE: usize = 1_000_000;

/// One timestamped record.
#[derive(Debug, Clone, PartialEq)]
pub struct TsRecord<V> {
    pub time: i64,
    pub value: V,
}

pub struct TsBuff<V> {
    slots: Vec<Option<TsRecord<V>>>,
    head: isize,
    tail: isize,
    count: usize,
    memf: Memf,
}

#[inline]
fn slot_size<V>() -> usize {
    std::mem::size_of::<Option<TsRecord<V>>>()
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_SIZE {
        return Err(StateError::InvalidArgument(format!(
            "buffer size {} out of range 1..={}",
            size, MAX_SIZE
        )));
    }
    Ok(())
}

impl<V> TsBuff<V> {
    pub fn new(memf: Memf, size: usize) -> Result<Self> {
        check_size(size)?;
        memf.reserve(size * slot_size::<V>())?;
        Ok(Self {
            slots: (0..size).map(|_| None).collect(),
            head: -1,
            tail: -1,
            count: 0,
            memf,
        })
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Physical index of the newest record.
    pub fn head(&self) -> Option<usize> {
        (self.head >= 0).then_some(self.head as usize)
    }

    /// Physical index of the oldest record.
    pub fn tail(&self) -> Option<usize> {
        (self.tail >= 0).then_some(self.tail as usize)
    }

    #[inline]
    fn wrap(&self, idx: isize) -> usize {
        idx.rem_euclid(self.slots.len() as isize) as usize
    }

    /// Record at a physical index, `None` for unoccupied slots.
    pub fn get(&self, idx: usize) -> Option<&TsRecord<V>> {
        self.slots.get(idx).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut TsRecord<V>> {
        self.slots.get_mut(idx).and_then(|slot| slot.as_mut())
    }

    pub fn head_record(&self) -> Option<&TsRecord<V>> {
        self.head().and_then(|idx| self.get(idx))
    }

    pub fn tail_record(&self) -> Option<&TsRecord<V>> {
        self.tail().and_then(|idx| self.get(idx))
    }

    pub fn time_head(&self) -> Option<i64> {
        self.head_record().map(|r| r.time)
    }

    pub fn time_tail(&self) -> Option<i64> {
        self.tail_record().map(|r| r.time)
    }

    /// Number of records older than the one at `idx`.
    pub fn position(&self, idx: usize) -> Option<usize> {
        let tail = self.tail()?;
        let pos = (idx + self.size() - tail) % self.size();
        (pos < self.count).then_some(pos)
    }

    /// Physical index of the record at logical position `pos` (0 = tail).
    pub fn index_at(&self, pos: usize) -> Option<usize> {
        if pos >= self.count {
            return None;
        }
        Some(self.wrap(self.tail + pos as isize))
    }

    /// Records from tail to head.
    pub fn iter(&self) -> impl Iterator<Item = &TsRecord<V>> + '_ {
        (0..self.count).filter_map(move |pos| self.index_at(pos).and_then(|idx| self.get(idx)))
    }

    /// Records between two physical indices, inclusive, oldest first.
    pub fn range(&self, from_idx: usize, to_idx: usize) -> impl Iterator<Item = &TsRecord<V>> + '_ {
        let (from, to) = match (self.position(from_idx), self.position(to_idx)) {
            (Some(from), Some(to)) if from <= to => (from, to + 1),
            _ => (0, 0),
        };
        (from..to).filter_map(move |pos| self.index_at(pos).and_then(|idx| self.get(idx)))
    }

    // ============================================================================================
    // INSERT / EVICT
    // ============================================================================================

    fn put_first(&mut self, record: TsRecord<V>) {
        self.head = 0;
        self.tail = 0;
        self.slots[0] = Some(record);
        self.count = 1;
    }

    /// Appends a record newer than or as new as the current head.
    ///
    /// A size-1 buffer keeps only the latest record: the displaced one is
    /// returned so its payload can be released.
    pub fn add_to_head(&mut self, time: i64, value: V) -> std::result::Result<Option<TsRecord<V>>, InsertError> {
        let record = TsRecord { time, value };
        let head_time = match self.time_head() {
            None => {
                self.put_first(record);
                return Ok(None);
            }
            Some(t) => t,
        };
        if time < head_time {
            return Err(InsertError::OutOfOrder);
        }
        if self.size() == 1 {
            return Ok(self.slots[0].replace(record));
        }
        if self.is_full() {
            return Err(InsertError::NoSpace);
        }
        let new_head = self.wrap(self.head + 1);
        self.slots[new_head] = Some(record);
        self.head = new_head as isize;
        self.count += 1;
        Ok(None)
    }

    /// Prepends a record older than or as old as the current tail.
    pub fn add_to_tail(&mut self, time: i64, value: V) -> std::result::Result<(), InsertError> {
        let record = TsRecord { time, value };
        let tail_time = match self.time_tail() {
            None => {
                self.put_first(record);
                return Ok(());
            }
            Some(t) => t,
        };
        if time > tail_time {
            return Err(InsertError::OutOfOrder);
        }
        if self.is_full() {
            return Err(InsertError::NoSpace);
        }
        let new_tail = self.wrap(self.tail - 1);
        self.slots[new_tail] = Some(record);
        self.tail = new_tail as isize;
        self.count += 1;
        Ok(())
    }

    /// Pops the oldest record.
    pub fn free_tail(&mut self) -> Option<TsRecord<V>> {
        let tail = self.tail()?;
        let record = self.slots[tail].take();
        self.count -= 1;
        if self.count == 0 {
            self.head = -1;
            self.tail = -1;
        } else {
            self.tail = self.wrap(self.tail + 1) as isize;
        }
        record
    }

    /// Drains every record through `on_evict`, oldest first.
    pub fn clear<F>(&mut self, mut on_evict: F)
    where
        F: FnMut(TsRecord<V>),
    {
        while let Some(record) = self.free_tail() {
            on_evict(record);
        }
    }

    /// Changes capacity, re-laying records contiguously from index 0.
    ///
    /// Shrinking below the current count evicts the oldest records through
    /// `on_evict`, once each.
    pub fn resize<F>(&mut self, new_size: usize, mut on_evict: F) -> Result<()>
    where
        F: FnMut(TsRecord<V>),
    {
        check_size(new_size)?;
        let old_size = self.size();
        if new_size == old_size {
            return Ok(());
        }
        if new_size > old_size {
            self.memf.reserve((new_size - old_size) * slot_size::<V>())?;
        }

        while self.count > new_size {
            if let Some(record) = self.free_tail() {
                on_evict(record);
            }
        }

        let mut slots: Vec<Option<TsRecord<V>>> = Vec::with_capacity(new_size);
        while let Some(record) = self.free_tail() {
            slots.push(Some(record));
        }
        let count = slots.len();
        slots.resize_with(new_size, || None);

        self.slots = slots;
        self.count = count;
        if count > 0 {
            self.tail = 0;
            self.head = count as isize - 1;
        }

        if new_size < old_size {
            self.memf.release((old_size - new_size) * slot_size::<V>());
        }
        Ok(())
    }

    // ============================================================================================
    // TIME LOOKUP
    // ============================================================================================

    /// Index of the newest record with `time <= t`.
    ///
    /// Returns `None` when the buffer is empty or `t` lies outside
    /// `[tail_time, head_time]`.
    pub fn find_time_idx(&self, t: i64) -> Option<usize> {
        let tail_time = self.time_tail()?;
        let head_time = self.time_head()?;
        if t < tail_time || t > head_time {
            return None;
        }

        // first position whose time is after t
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let time = self.index_at(mid).and_then(|idx| self.get(idx)).map(|r| r.time)?;
            if time <= t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        // lo >= 1 because the tail record satisfies time <= t
        self.index_at(lo - 1)
    }

    /// Whether at least `need` records exist from the tail up to `head_idx`.
    pub fn has_enough_count_data_idx(&self, need: usize, head_idx: usize) -> bool {
        if need == 0 {
            return false;
        }
        match self.position(head_idx) {
            Some(pos) => pos + 1 >= need,
            None => false,
        }
    }

    /// Whether the buffer reaches back to `time` or further.
    pub fn has_enough_time_data(&self, time: i64) -> bool {
        matches!(self.time_tail(), Some(tail) if tail <= time)
    }
}

impl<V> Drop for TsBuff<V> {
    fn drop(&mut self) {
        if self.count > 0 {
            warn!("Destroying time buffer with {} live records", self.count);
        }
        self.memf.release(self.slots.len() * slot_size::<V>());
    }
}

impl<V> std::fmt::Debug for TsBuff<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsBuff")
            .field("size", &self.size())
            .field("count", &self.count)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap;

    fn filled(size: usize, times: &[i64]) -> TsBuff<u32> {
        let mut buf = TsBuff::new(heap(), size).unwrap();
        for (i, &t) in times.iter().enumerate() {
            buf.add_to_head(t, i as u32).unwrap();
        }
        buf
    }

    fn times(buf: &TsBuff<u32>) -> Vec<i64> {
        buf.iter().map(|r| r.time).collect()
    }

    #[test]
    fn test_empty_state() {
        let buf: TsBuff<u32> = TsBuff::new(heap(), 4).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.head(), None);
        assert_eq!(buf.tail(), None);
        assert_eq!(buf.find_time_idx(10), None);
        assert!(TsBuff::<u32>::new(heap(), 0).is_err());
        assert!(TsBuff::<u32>::new(heap(), MAX_SIZE + 1).is_err());
    }

    #[test]
    fn test_add_to_head_ordering_and_capacity() {
        let mut buf = filled(3, &[10, 20, 20]);
        assert!(buf.is_full());
        assert_eq!(buf.add_to_head(30, 9), Err(InsertError::NoSpace));
        assert_eq!(buf.add_to_head(5, 9), Err(InsertError::OutOfOrder));

        buf.free_tail();
        buf.add_to_head(30, 3).unwrap();
        assert_eq!(times(&buf), vec![20, 20, 30]);
        assert_eq!(buf.head(), Some(0), "head wraps around");
    }

    #[test]
    fn test_add_to_tail() {
        let mut buf = TsBuff::new(heap(), 3).unwrap();
        buf.add_to_tail(50, 1u32).unwrap();
        assert_eq!(buf.head(), Some(0));
        buf.add_to_tail(40, 2).unwrap();
        assert_eq!(buf.add_to_tail(45, 3), Err(InsertError::OutOfOrder));
        buf.add_to_tail(30, 3).unwrap();
        assert_eq!(buf.add_to_tail(20, 4), Err(InsertError::NoSpace));
        assert_eq!(times(&buf), vec![30, 40, 50]);
    }

    #[test]
    fn test_size_one_keeps_latest() {
        let mut buf = filled(1, &[10]);
        let displaced = buf.add_to_head(20, 7).unwrap();
        assert_eq!(displaced.map(|r| r.time), Some(10));
        assert_eq!(buf.count(), 1);
        assert_eq!(buf.time_head(), Some(20));
        assert_eq!(buf.add_to_head(15, 8), Err(InsertError::OutOfOrder));
    }

    #[test]
    fn test_free_tail_to_empty() {
        let mut buf = filled(2, &[1, 2]);
        assert_eq!(buf.free_tail().map(|r| r.time), Some(1));
        assert_eq!(buf.free_tail().map(|r| r.time), Some(2));
        assert!(buf.free_tail().is_none());
        assert_eq!(buf.tail(), None);
        assert_eq!(buf.head(), None);
    }

    #[test]
    fn test_find_time_idx_floor() {
        // wrap the buffer so the search crosses the physical end
        let mut buf = filled(5, &[100, 110, 120, 130, 140]);
        buf.free_tail();
        buf.free_tail();
        buf.add_to_head(150, 0).unwrap();
        buf.add_to_head(160, 0).unwrap();
        assert_eq!(times(&buf), vec![120, 130, 140, 150, 160]);

        let at = |t| buf.find_time_idx(t).and_then(|i| buf.get(i)).map(|r| r.time);
        assert_eq!(at(120), Some(120));
        assert_eq!(at(155), Some(150));
        assert_eq!(at(160), Some(160));
        assert_eq!(at(129), Some(120));
        assert_eq!(at(119), None);
        assert_eq!(at(161), None);
    }

    #[test]
    fn test_enough_count_data() {
        let mut buf = filled(4, &[1, 2, 3, 4]);
        buf.free_tail();
        buf.add_to_head(5, 0).unwrap();
        let head = buf.head().unwrap();
        assert!(buf.has_enough_count_data_idx(4, head));
        assert!(!buf.has_enough_count_data_idx(5, head));
        assert!(!buf.has_enough_count_data_idx(0, head));

        let idx = buf.find_time_idx(3).unwrap();
        assert!(buf.has_enough_count_data_idx(2, idx));
        assert!(!buf.has_enough_count_data_idx(3, idx));
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let mut buf = filled(4, &[1, 2, 3, 4]);
        buf.free_tail();
        buf.add_to_head(5, 0).unwrap();

        buf.resize(8, |_| panic!("grow must not evict")).unwrap();
        assert_eq!(times(&buf), vec![2, 3, 4, 5]);
        assert_eq!((buf.tail(), buf.head()), (Some(0), Some(3)));
        buf.add_to_head(6, 0).unwrap();

        let mut evicted = Vec::new();
        buf.resize(2, |r| evicted.push(r.time)).unwrap();
        assert_eq!(evicted, vec![2, 3, 4]);
        assert_eq!(times(&buf), vec![5, 6]);
        assert!(buf.resize(0, |_| {}).is_err());
    }

    #[test]
    fn test_memory_released() {
        let memf = heap();
        {
            let mut buf: TsBuff<u64> = TsBuff::new(memf.clone(), 10).unwrap();
            buf.resize(100, |_| {}).unwrap();
            buf.resize(3, |_| {}).unwrap();
            assert_eq!(memf.used(), 3 * slot_size::<u64>());
        }
        assert_eq!(memf.used(), 0);
    }
}
