//! # Glaber State Cache
//!
//! In-process, sharded cache of monitoring state:
//! - **items**: recent values per item in time-ordered ring buffers, filled
//!   from a history backend on demand
//! - **triggers**: last value, change time and error per trigger
//! - **interfaces**: availability per interface and an address-to-host index
//!
//! Every table is an [`ElemsHash`]: one read/write lock over the id set and a
//! lock per element, so work on different ids runs in parallel. Storage is
//! charged against a pluggable [`MemoryRegion`], and the tables are dumped to
//! gzip line-JSON files that [`GlbState::load`] reads back on restart.

pub mod algo;
pub mod config;
pub mod dump;
pub mod elems_hash;
pub mod error;
pub mod history;
pub mod interfaces;
pub mod items;
pub mod memory;
pub mod obj_index;
pub mod scheduler;
pub mod state;
pub mod triggers;
pub mod types;

pub use config::StateConfig;
pub use elems_hash::{ElemFlags, ElemPayload, Element, ElemsHash, ElemsHashStats};
pub use error::{InsertError, Result, StateError};
pub use history::{FetchMode, HistoryStore, NoHistory, SqliteHistory};
pub use interfaces::{Availability, InterfaceInfo, InterfacesState};
pub use items::{Demand, ItemMeta, ItemsState, ItemsStats, MetaFlags};
pub use memory::{heap, HeapRegion, Memf, MemoryRegion, SharedSegment};
pub use obj_index::ObjIndex;
pub use scheduler::{DumpScheduler, SchedulerConfig};
pub use state::{GlbState, MemoryStats, PersistStats, StateStats};
pub use triggers::{TriggerDiff, TriggerInfo, TriggerValue, TriggersState};
pub use types::{
    now_ms, now_secs, Clock, HistoryRecord, IngestRecord, ItemState, ManualClock, SystemClock,
    ValueType, Variant,
};
