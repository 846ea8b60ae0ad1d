//! Memory-aware containers the state tables are built from.
//!
//! - **vector**: growable array with accounted capacity
//! - **hashset**: keyed hash set, chained buckets over an entry slab
//! - **hashmap**: `u64 -> i64` open-addressing map
//! - **binary_heap**: min-heap with optional direct access by key
//! - **event_queue**: time-ordered callback queue on the heap
//! - **ring_buffer**: circular time-series buffer
//! - **intern**: reference-counted string/blob pools
//!
//! Every container is built with a [`Memf`](crate::memory::Memf) and fails
//! with `ResourceExhausted` instead of aborting when the region is full.

pub mod binary_heap;
pub mod event_queue;
pub mod hashmap;
pub mod hashset;
pub mod intern;
pub mod ring_buffer;
pub mod vector;

pub use binary_heap::{BinaryHeap, HeapElem};
pub use event_queue::EventQueue;
pub use hashmap::HashMap;
pub use hashset::{HashSet, Keyed};
pub use intern::{BinPool, InternPool, Pooled, PooledBin, PooledStr, StrPool};
pub use ring_buffer::{TsBuff, TsRecord};
pub use vector::Vector;
