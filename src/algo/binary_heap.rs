//! Min binary heap with an optional unique-key position index.
//!
//! Ordering comes from a comparison function over whole elements, so the same
//! heap type serves time-ordered queues and priority queues alike. With a key
//! index, elements can be updated or removed directly by key in O(log n).

use super::hashmap::HashMap;
use super::vector::Vector;
use crate::error::{Result, StateError};
use crate::memory::Memf;
use std::cmp::Ordering;

/// Heap element: a key plus caller data.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapElem<T> {
    pub key: u64,
    pub data: T,
}

pub type HeapCompare<T> = fn(&HeapElem<T>, &HeapElem<T>) -> Ordering;

pub struct BinaryHeap<T> {
    elems: Vector<HeapElem<T>>,
    compare: HeapCompare<T>,
    /// key -> position, present for unique-key heaps
    key_index: Option<HashMap>,
}

impl<T> BinaryHeap<T> {
    /// Heap allowing duplicate keys.
    pub fn new(memf: Memf, compare: HeapCompare<T>) -> Self {
        Self {
            elems: Vector::new(memf),
            compare,
            key_index: None,
        }
    }

    /// Heap whose keys are unique, enabling [`update_direct`](Self::update_direct)
    /// and [`remove_direct`](Self::remove_direct).
    pub fn with_unique_keys(memf: Memf, compare: HeapCompare<T>) -> Self {
        Self {
            elems: Vector::new(memf.clone()),
            compare,
            key_index: Some(HashMap::new(memf)),
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn find_min(&self) -> Option<&HeapElem<T>> {
        self.elems.first()
    }

    pub fn insert(&mut self, elem: HeapElem<T>) -> Result<()> {
        if let Some(index) = &self.key_index {
            if index.get(elem.key).is_some() {
                return Err(StateError::InvalidArgument(format!(
                    "duplicate heap key {}",
                    elem.key
                )));
            }
        }
        let key = elem.key;
        self.elems.push(elem)?;
        let pos = self.elems.len() - 1;
        if let Some(index) = &mut self.key_index {
            if let Err(e) = index.set(key, pos as i64) {
                self.elems.pop();
                return Err(e);
            }
        }
        self.sift_up(pos);
        Ok(())
    }

    pub fn remove_min(&mut self) -> Option<HeapElem<T>> {
        if self.elems.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Replaces the element with the same key and restores heap order.
    pub fn update_direct(&mut self, elem: HeapElem<T>) -> Result<()> {
        let pos = self.position_of(elem.key)?;
        self.elems.as_mut_slice()[pos] = elem;
        let pos = self.sift_up(pos);
        self.sift_down(pos);
        Ok(())
    }

    /// Removes the element with `key`, if present.
    pub fn remove_direct(&mut self, key: u64) -> Result<Option<HeapElem<T>>> {
        match self.position_of(key) {
            Ok(pos) => Ok(self.remove_at(pos)),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn clear(&mut self) {
        self.elems.clear();
        if let Some(index) = &mut self.key_index {
            index.clear();
        }
    }

    fn position_of(&self, key: u64) -> Result<usize> {
        let index = self.key_index.as_ref().ok_or_else(|| {
            StateError::InvalidArgument("direct access needs a unique-key heap".to_string())
        })?;
        index
            .get(key)
            .map(|pos| pos as usize)
            .ok_or(StateError::NotFound(key))
    }

    fn remove_at(&mut self, pos: usize) -> Option<HeapElem<T>> {
        let last = self.elems.len().checked_sub(1)?;
        self.swap(pos, last);
        let elem = self.elems.pop()?;
        if let Some(index) = &mut self.key_index {
            index.remove(elem.key);
        }
        if pos < self.elems.len() {
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(elem)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.elems.as_mut_slice().swap(a, b);
        if let Some(index) = &mut self.key_index {
            // positions always fit the index, set only fails on growth
            let _ = index.set(self.elems[a].key, a as i64);
            let _ = index.set(self.elems[b].key, b as i64);
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.elems[a], &self.elems[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.elems.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
