//! Open-addressing `u64 -> i64` map with linear probing.
//!
//! Used as the position index of keyed binary heaps. Deleted cells become
//! tombstones so probe chains stay intact; tombstones are dropped on rehash.

use crate::error::Result;
use crate::memory::Memf;

const MIN_CELLS: usize = 16;

#[derive(Clone, Copy, PartialEq)]
enum Cell {
    Empty,
    Deleted,
    Used(u64, i64),
}

pub struct HashMap {
    cells: Vec<Cell>,
    len: usize,
    /// Used plus deleted cells
    occupied: usize,
    memf: Memf,
}

#[inline]
fn mix(key: u64) -> u64 {
    // splitmix64 finalizer
    let mut x = key.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

impl HashMap {
    pub fn new(memf: Memf) -> Self {
        Self {
            cells: Vec::new(),
            len: 0,
            occupied: 0,
            memf,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn probe(&self, key: u64) -> Option<usize> {
        if self.cells.is_empty() {
            return None;
        }
        let mask = self.cells.len() - 1;
        let mut idx = (mix(key) as usize) & mask;
        loop {
            match self.cells[idx] {
                Cell::Empty => return None,
                Cell::Used(k, _) if k == key => return Some(idx),
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<i64> {
        self.probe(key).and_then(|idx| match self.cells[idx] {
            Cell::Used(_, v) => Some(v),
            _ => None,
        })
    }

    /// Sets `key` to `value`, overwriting any previous value.
    pub fn set(&mut self, key: u64, value: i64) -> Result<()> {
        if let Some(idx) = self.probe(key) {
            self.cells[idx] = Cell::Used(key, value);
            return Ok(());
        }

        if (self.occupied + 1) * 2 > self.cells.len() {
            let target = if self.len * 4 < self.cells.len() {
                self.cells.len()
            } else {
                (self.cells.len() * 2).max(MIN_CELLS)
            };
            self.rehash(target)?;
        }

        let mask = self.cells.len() - 1;
        let mut idx = (mix(key) as usize) & mask;
        loop {
            match self.cells[idx] {
                Cell::Empty => {
                    self.occupied += 1;
                    break;
                }
                Cell::Deleted => break,
                Cell::Used(..) => idx = (idx + 1) & mask,
            }
        }
        self.cells[idx] = Cell::Used(key, value);
        self.len += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: u64) -> Option<i64> {
        let idx = self.probe(key)?;
        let value = match self.cells[idx] {
            Cell::Used(_, v) => v,
            _ => return None,
        };
        self.cells[idx] = Cell::Deleted;
        self.len -= 1;
        Some(value)
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = Cell::Empty);
        self.len = 0;
        self.occupied = 0;
    }

    fn rehash(&mut self, num_cells: usize) -> Result<()> {
        let cell_size = std::mem::size_of::<Cell>();
        if num_cells > self.cells.len() {
            self.memf
                .reserve((num_cells - self.cells.len()) * cell_size)?;
        }
        let old = std::mem::replace(&mut self.cells, vec![Cell::Empty; num_cells]);
        if old.len() > num_cells {
            self.memf.release((old.len() - num_cells) * cell_size);
        }

        let mask = num_cells - 1;
        self.occupied = 0;
        for cell in old {
            if let Cell::Used(k, v) = cell {
                let mut idx = (mix(k) as usize) & mask;
                while self.cells[idx] != Cell::Empty {
                    idx = (idx + 1) & mask;
                }
                self.cells[idx] = Cell::Used(k, v);
                self.occupied += 1;
            }
        }
        Ok(())
    }
}

impl Drop for HashMap {
    fn drop(&mut self) {
        self.memf
            .release(self.cells.len() * std::mem::size_of::<Cell>());
    }
}
