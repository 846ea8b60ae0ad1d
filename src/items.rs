//! Item value cache.
//!
//! Keeps the recent history of every monitored item in a per-item ring
//! buffer and answers "last N values as of T" and "values of the last S
//! seconds as of T" queries, falling back to the [`HistoryStore`] when the
//! buffer does not reach far enough back.
//!
//! # Coverage
//! `db_fetched_time` is the lower bound of what the cache is known to hold:
//! every stored value with `clock > db_fetched_time` up to the head is in the
//! buffer. It starts at [`NEVER_FETCHED`], drops as backing-store fetches
//! succeed, becomes 0 once the store has nothing older, and is raised to the
//! clock of any record evicted from the tail. Values share a clock, so fetches
//! end at `min(tail_time, db_fetched_time)` inclusive and the records already
//! buffered at that second are dropped from the result. The covered range
//! stays contiguous and a repeated query is answered without another
//! backing-store call.
//!
//! # Demand
//! Every read raises the item's demanded count or period. The buffer grows
//! instead of evicting while the oldest records are still demanded. A
//! demand level that has not been reached again for a day decays to the
//! largest request seen since.

use crate::algo::intern::{PooledStr, StrPool};
use crate::algo::ring_buffer::{TsBuff, MAX_SIZE};
use crate::dump::{deserialize_id, StateDumper, StateLoader};
use crate::elems_hash::{ElemFlags, ElemPayload, Element, ElemsHash, ElemsHashStats};
use crate::error::{InsertError, Result, StateError};
use crate::history::{FetchMode, HistoryStore};
use crate::memory::Memf;
use crate::types::{Clock, HistoryRecord, IngestRecord, ItemState, ValueType, Variant};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::BitOr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// `db_fetched_time` of an item nothing was fetched for
pub const NEVER_FETCHED: i64 = i32::MAX as i64;

/// Values kept per item before demand grows the buffer
pub const INITIAL_BUFFER_SIZE: usize = 10;

/// Values per item in the last-values document when no count is given
pub const DEFAULT_LAST_VALUES: usize = 10;

/// How far ahead of the clock a value may be timestamped
const FUTURE_TOLERANCE_SECS: i64 = 300;

/// Age after which an unrenewed demand level decays
const DEMAND_DECAY_SECS: i64 = 86400;

const GROW_PERCENT: usize = 120;
const MIN_GROW_COUNT: usize = 8;

/// Dump file name
pub const DUMP_NAME: &str = "items";

// ================================================================================================
// DEMAND
// ================================================================================================

/// How much history has recently been asked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Demand {
    /// Values requested by count
    pub count: i64,
    /// Largest count requested since `count` last changed
    pub new_count: i64,
    pub count_change: i64,
    /// Seconds requested by time range
    pub period: i64,
    /// Largest period requested since `period` last changed
    pub new_period: i64,
    pub period_change: i64,
}

impl Demand {
    pub fn update(&mut self, count: i64, period: i64, now: i64) {
        track_level(&mut self.count, &mut self.new_count, &mut self.count_change, count, now);
        track_level(&mut self.period, &mut self.new_period, &mut self.period_change, period, now);
    }
}

fn track_level(level: &mut i64, candidate: &mut i64, changed: &mut i64, value: i64, now: i64) {
    if *level < value {
        *level = value;
        *candidate = 0;
        *changed = now;
    } else if *candidate < value {
        *candidate = value;
    }

    if now - *changed > DEMAND_DECAY_SECS {
        *changed = now;
        *level = *candidate;
        *candidate = 0;
    }
}

fn grown_size(size: usize) -> usize {
    let grown = size * GROW_PERCENT / 100;
    grown.max(size + MIN_GROW_COUNT).min(MAX_SIZE)
}

/// Seconds to fetch for a window of `span` seconds.
fn fetch_overhead(span: i64) -> i64 {
    if span < 300 {
        span + 300
    } else {
        span * 6 / 5
    }
}

// ================================================================================================
// METADATA
// ================================================================================================

/// Which fields an [`ItemsState::update_meta`] call applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaFlags(u8);

impl MetaFlags {
    pub const NONE: MetaFlags = MetaFlags(0);
    /// Raise `lastdata` (never lowers it)
    pub const LASTDATA: MetaFlags = MetaFlags(0x01);
    pub const NEXTCHECK: MetaFlags = MetaFlags(0x02);
    pub const STATE: MetaFlags = MetaFlags(0x04);
    /// Replace the error message, `None` clears it
    pub const ERROR: MetaFlags = MetaFlags(0x08);
    pub const ALL: MetaFlags = MetaFlags(0x0f);

    #[inline]
    pub fn contains(self, other: MetaFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MetaFlags {
    type Output = MetaFlags;

    fn bitor(self, rhs: MetaFlags) -> MetaFlags {
        MetaFlags(self.0 | rhs.0)
    }
}

/// Item metadata as seen by callers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemMeta {
    pub state: ItemState,
    pub lastdata: i64,
    pub nextcheck: i64,
    pub error: Option<String>,
}

// ================================================================================================
// ELEMENT
// ================================================================================================

/// Cached state of one item.
pub struct ItemElem {
    value_type: ValueType,
    buff: TsBuff<Variant>,
    db_fetched_time: i64,
    db_fetched_count: usize,
    last_accessed: i64,
    state: ItemState,
    lastdata: i64,
    nextcheck: i64,
    error: Option<PooledStr>,
    demand: Demand,
    /// String payload bytes charged for buffered values
    payload: usize,
}

impl ElemPayload for ItemElem {
    type Context = Arc<StrPool>;

    fn create(_id: u64, memf: &Memf, _pool: &Arc<StrPool>) -> Result<Self> {
        Ok(ItemElem {
            value_type: ValueType::None,
            buff: TsBuff::new(memf.clone(), INITIAL_BUFFER_SIZE)?,
            db_fetched_time: NEVER_FETCHED,
            db_fetched_count: 0,
            last_accessed: 0,
            state: ItemState::Normal,
            lastdata: 0,
            nextcheck: 0,
            error: None,
            demand: Demand::default(),
            payload: 0,
        })
    }

    fn release(&mut self, _id: u64, memf: &Memf, pool: &Arc<StrPool>) {
        self.buff.clear(|_| {});
        memf.release(self.payload);
        self.payload = 0;
        if let Some(error) = self.error.take() {
            pool.free(error);
        }
    }
}

impl ItemElem {
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn values_count(&self) -> usize {
        self.buff.count()
    }

    pub fn buffer_size(&self) -> usize {
        self.buff.size()
    }

    pub fn db_fetched_time(&self) -> i64 {
        self.db_fetched_time
    }

    pub fn demand(&self) -> &Demand {
        &self.demand
    }

    fn meta(&self) -> ItemMeta {
        ItemMeta {
            state: self.state,
            lastdata: self.lastdata,
            nextcheck: self.nextcheck,
            error: self.error.as_deref().map(str::to_string),
        }
    }

    // --------------------------------------------------------------------------------------------
    // buffer bookkeeping
    // --------------------------------------------------------------------------------------------

    /// Accounts for records that left the buffer, oldest first.
    fn forget(&mut self, memf: &Memf, bytes: usize, newest_evicted: Option<i64>) {
        memf.release(bytes);
        self.payload -= bytes;
        if let Some(time) = newest_evicted {
            self.db_fetched_time = self.db_fetched_time.max(time);
        }
    }

    fn evict_tail(&mut self, memf: &Memf) {
        if let Some(record) = self.buff.free_tail() {
            self.forget(memf, record.value.payload_size(), Some(record.time));
        }
    }

    fn resize(&mut self, memf: &Memf, size: usize) -> Result<()> {
        let mut bytes = 0;
        let mut newest = None;
        let res = self.buff.resize(size, |record| {
            bytes += record.value.payload_size();
            newest = Some(record.time);
        });
        self.forget(memf, bytes, newest);
        res
    }

    /// Drops every value and fetch record, keeping metadata and demand.
    fn reset(&mut self, memf: &Memf, value_type: ValueType) {
        self.buff.clear(|_| {});
        memf.release(self.payload);
        self.payload = 0;
        if self.buff.size() != INITIAL_BUFFER_SIZE {
            if let Err(e) = self.resize(memf, INITIAL_BUFFER_SIZE) {
                warn!("Cannot shrink value buffer back to {}: {}", INITIAL_BUFFER_SIZE, e);
            }
        }
        self.db_fetched_time = NEVER_FETCHED;
        self.db_fetched_count = 0;
        self.value_type = value_type;
    }

    /// Adopts `value_type`; a different known type invalidates cached values.
    fn ensure_type(&mut self, memf: &Memf, id: u64, value_type: ValueType) {
        if self.value_type == value_type {
            return;
        }
        if self.value_type != ValueType::None {
            debug!(
                "Item {}: value type changed {:?} -> {:?}, dropping {} cached values",
                id,
                self.value_type,
                value_type,
                self.buff.count()
            );
            self.reset(memf, value_type);
        }
        self.value_type = value_type;
    }

    /// Frees one slot in a full buffer: evicts the oldest value when demand
    /// no longer needs it, grows the buffer otherwise.
    fn ensure_space(&mut self, memf: &Memf, now: i64) {
        if !self.buff.is_full() {
            return;
        }
        let count = self.buff.count();
        let second_oldest = self
            .buff
            .index_at(1)
            .and_then(|idx| self.buff.get(idx))
            .map(|r| r.time)
            .unwrap_or(now);

        let demanded = self.demand.count > count as i64 - 1 || self.demand.period > now - second_oldest;
        if demanded && self.buff.size() < MAX_SIZE {
            let size = grown_size(self.buff.size());
            match self.resize(memf, size) {
                Ok(()) => return,
                Err(e) => warn!("Cannot grow value buffer to {}: {}, evicting instead", size, e),
            }
        }
        self.evict_tail(memf);
    }

    fn store_head(&mut self, memf: &Memf, time: i64, value: Variant) -> Result<()> {
        let bytes = value.payload_size();
        memf.reserve(bytes)?;
        match self.buff.add_to_head(time, value) {
            Ok(displaced) => {
                self.payload += bytes;
                if let Some(record) = displaced {
                    let freed = record.value.payload_size();
                    memf.release(freed);
                    self.payload -= freed;
                }
                Ok(())
            }
            Err(e) => {
                memf.release(bytes);
                Err(e.into())
            }
        }
    }

    /// Fetched records up to `end` the buffer does not hold yet, newest first.
    fn unbuffered(&self, mut records: Vec<HistoryRecord>, end: i64) -> Vec<HistoryRecord> {
        records.retain(|r| r.clock <= end);
        records.sort_by(|a, b| b.clock.cmp(&a.clock));
        let mut skip = self.buffered_at(end);
        records.retain(|r| {
            if skip > 0 && r.clock == end {
                skip -= 1;
                return false;
            }
            true
        });
        records
    }

    /// Inserts fetched records below the tail. `records` must come from
    /// [`ItemElem::unbuffered`].
    ///
    /// Returns `false` when records older than the new tail had to be left
    /// out for lack of space.
    fn merge(&mut self, memf: &Memf, mut records: Vec<HistoryRecord>) -> bool {
        let value_type = self.value_type;
        records.retain(|r| r.value.matches(value_type));
        if records.is_empty() {
            return true;
        }

        let wanted = (self.buff.count() + records.len()).min(MAX_SIZE);
        if wanted > self.buff.size() {
            if let Err(e) = self.resize(memf, wanted) {
                warn!("Cannot grow value buffer to {} for fetched history: {}", wanted, e);
            }
        }

        for record in records {
            let bytes = record.value.payload_size();
            if memf.reserve(bytes).is_err() {
                return false;
            }
            match self.buff.add_to_tail(record.clock, record.value) {
                Ok(()) => self.payload += bytes,
                Err(InsertError::OutOfOrder) => memf.release(bytes),
                Err(InsertError::NoSpace) => {
                    memf.release(bytes);
                    return false;
                }
            }
        }
        true
    }

    /// Records a successful fetch reaching down to `start`.
    fn mark_fetched(&mut self, start: i64, complete: bool) {
        if complete {
            self.db_fetched_time = self.db_fetched_time.min(start);
        } else if let Some(tail) = self.buff.time_tail() {
            self.db_fetched_time = tail;
        }
    }

    // --------------------------------------------------------------------------------------------
    // lookups
    // --------------------------------------------------------------------------------------------

    /// Index of the newest value at or before `ts`.
    fn serving_index(&self, ts: i64) -> Option<usize> {
        match self.buff.time_head() {
            Some(head_time) if ts >= head_time => self.buff.head(),
            Some(_) => self.buff.find_time_idx(ts),
            None => None,
        }
    }

    /// Values at or before `idx` that are already buffered.
    fn available_at(&self, idx: Option<usize>) -> usize {
        idx.and_then(|idx| self.buff.position(idx))
            .map(|pos| pos + 1)
            .unwrap_or(0)
    }

    /// Inclusive upper bound of the next backing-store fetch.
    fn fetch_end(&self, empty_limit: i64) -> i64 {
        self.buff.time_tail().unwrap_or(empty_limit).min(self.db_fetched_time)
    }

    /// Buffered values at the tail whose clock is `time`.
    fn buffered_at(&self, time: i64) -> usize {
        self.buff.iter().take_while(|r| r.time == time).count()
    }

    fn covers(&self, window_start: i64) -> bool {
        self.db_fetched_time <= window_start || self.buff.has_enough_time_data(window_start)
    }

    /// The `count` values ending at `idx`, oldest first.
    fn records_by_count(&self, count: usize, idx: usize) -> Vec<HistoryRecord> {
        let Some(pos) = self.buff.position(idx) else {
            return Vec::new();
        };
        let from = (pos + 1).saturating_sub(count);
        (from..=pos)
            .filter_map(|p| self.buff.index_at(p).and_then(|i| self.buff.get(i)))
            .map(|r| HistoryRecord::new(r.time, r.value.clone()))
            .collect()
    }

    /// Values with `window_start < clock <= ts`, oldest first.
    fn records_between(&self, window_start: i64, ts: i64) -> Vec<HistoryRecord> {
        self.buff
            .iter()
            .filter(|r| r.time > window_start && r.time <= ts)
            .map(|r| HistoryRecord::new(r.time, r.value.clone()))
            .collect()
    }
}

// ================================================================================================
// DUMP RECORDS
// ================================================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MetaRecord {
    state: i64,
    lastdata: i64,
    nextcheck: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ValueRecord {
    clock: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    /// Error recorded in place of a value
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ValueRecord {
    fn from_variant(clock: i64, value: &Variant) -> Self {
        match value {
            Variant::Err(e) => ValueRecord {
                clock,
                value: None,
                error: Some(e.clone()),
            },
            other => ValueRecord {
                clock,
                value: Some(other.to_json()),
                error: None,
            },
        }
    }

    fn into_variant(self, value_type: ValueType) -> Option<Variant> {
        match (self.error, self.value) {
            (Some(e), _) => Some(Variant::Err(e)),
            (None, Some(v)) => Variant::from_json(value_type, &v),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemRecord {
    #[serde(deserialize_with = "deserialize_id")]
    itemid: u64,
    #[serde(default = "none_type_code")]
    value_type: i64,
    #[serde(default = "never_fetched")]
    db_fetched_time: i64,
    #[serde(default)]
    db_fetched_count: u64,
    #[serde(default)]
    last_accessed: i64,
    #[serde(default)]
    item_metadata: MetaRecord,
    #[serde(default)]
    demand: Demand,
    #[serde(default)]
    values: Vec<ValueRecord>,
}

fn none_type_code() -> i64 {
    ValueType::None.code()
}

fn never_fetched() -> i64 {
    NEVER_FETCHED
}

impl ItemRecord {
    fn from_elem(id: u64, item: &ItemElem) -> Self {
        ItemRecord {
            itemid: id,
            value_type: item.value_type.code(),
            db_fetched_time: item.db_fetched_time,
            db_fetched_count: item.db_fetched_count as u64,
            last_accessed: item.last_accessed,
            item_metadata: MetaRecord {
                state: item.state.code(),
                lastdata: item.lastdata,
                nextcheck: item.nextcheck,
                error: item.error.as_deref().map(str::to_string),
            },
            demand: item.demand,
            values: item
                .buff
                .iter()
                .map(|r| ValueRecord::from_variant(r.time, &r.value))
                .collect(),
        }
    }
}

// ================================================================================================
// STATS
// ================================================================================================

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    db_requests: AtomicU64,
    db_fails: AtomicU64,
    fails: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Item cache statistics.
#[derive(Clone, Debug, Default)]
pub struct ItemsStats {
    /// Number of cached items
    pub items: usize,
    /// Queries served from the buffer alone
    pub hits: u64,
    /// Queries that needed the backing store
    pub misses: u64,
    pub db_requests: u64,
    pub db_fails: u64,
    /// Queries that failed
    pub fails: u64,
    pub contended_locks: u64,
}

// ================================================================================================
// ITEMS STATE
// ================================================================================================

pub struct ItemsState {
    items: ElemsHash<ItemElem>,
    history: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl ItemsState {
    pub fn new(
        memf: Memf,
        strpool: Arc<StrPool>,
        history: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            items: ElemsHash::new(memf, strpool),
            history,
            clock,
            counters: Counters::default(),
        }
    }

    fn pool(&self) -> &StrPool {
        self.items.context()
    }

    /// Runs `f` on item `itemid`, stamping its access time.
    fn with_item<R, F>(&self, itemid: u64, flags: ElemFlags, f: F) -> Result<R>
    where
        F: FnOnce(&mut ItemElem, &Memf, i64) -> Result<R>,
    {
        let now = self.clock.now();
        self.items.process(itemid, flags, |elem: &mut Element<ItemElem>, memf: &Memf| {
            let item = elem.data_mut();
            item.last_accessed = now;
            f(item, memf, now)
        })
    }

    /// Read-only view of one item.
    pub fn inspect<R, F>(&self, itemid: u64, f: F) -> Result<R>
    where
        F: FnOnce(&ItemElem) -> R,
    {
        self.items
            .process(itemid, ElemFlags::DO_NOT_CREATE, |elem, _| Ok(f(elem.data())))
    }

    // ============================================================================================
    // WRITE PATH
    // ============================================================================================

    /// Appends one collected value to its item's buffer.
    ///
    /// # Returns
    /// - `Err(FutureValue)`: timestamp more than 300s ahead of the clock
    /// - `Err(Rejected(OutOfOrder))`: older than the newest cached value
    /// - `Err(InvalidArgument)`: value does not fit the declared type
    pub fn add_value(&self, record: &IngestRecord) -> Result<()> {
        let Some(value) = &record.value else {
            return Ok(());
        };
        if !value.matches(record.value_type) {
            return Err(StateError::InvalidArgument(format!(
                "item {}: {:?} value for {:?} item",
                record.itemid, value, record.value_type
            )));
        }

        self.with_item(record.itemid, ElemFlags::NONE, |item, memf, now| {
            if record.clock > now + FUTURE_TOLERANCE_SECS {
                warn!(
                    "Item {} value timestamp {} is ahead of the clock {}, not caching",
                    record.itemid, record.clock, now
                );
                return Err(StateError::FutureValue {
                    itemid: record.itemid,
                    ahead: record.clock - now,
                });
            }

            let fresh = item.value_type != record.value_type;
            item.ensure_type(memf, record.itemid, record.value_type);

            if record.last_value_only {
                if item.buff.size() != 1 {
                    item.resize(memf, 1)?;
                }
            } else if !fresh {
                item.ensure_space(memf, now);
            }

            if let Err(e) = item.store_head(memf, record.clock, value.clone()) {
                warn!(
                    "Cannot cache value of item {} with timestamp {}: {}",
                    record.itemid, record.clock, e
                );
                return Err(e);
            }
            Ok(())
        })
    }

    /// Bulk ingest. Records without a value or of unsupported items are
    /// skipped; a failing record does not stop the batch.
    pub fn add_values(&self, records: &[IngestRecord]) -> Result<()> {
        let mut failed = 0;
        for record in records {
            if record.value.is_none() || record.state == ItemState::NotSupported {
                continue;
            }
            if self.add_value(record).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(StateError::Partial {
                failed,
                total: records.len(),
            });
        }
        Ok(())
    }

    // ============================================================================================
    // READ PATH
    // ============================================================================================

    /// Values of `itemid` as of `ts`, oldest first.
    ///
    /// With `count > 0`: the last `count` values at or before `ts`.
    /// Otherwise: the values in `(ts - seconds, ts]`.
    /// Fails with `NoData` when neither cache nor backing store can fill the request.
    pub fn get_values(
        &self,
        itemid: u64,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        ts: i64,
    ) -> Result<Vec<HistoryRecord>> {
        self.with_item(itemid, ElemFlags::NONE, |item, memf, now| {
            item.ensure_type(memf, itemid, value_type);
            let res = if count > 0 {
                self.values_by_count(itemid, item, memf, count, ts, now)
            } else {
                self.values_by_time(itemid, item, memf, seconds, ts, now)
            };
            if res.is_err() {
                bump(&self.counters.fails);
            }
            res
        })
    }

    /// The newest value at or before `ts`.
    pub fn get_value(&self, itemid: u64, value_type: ValueType, ts: i64) -> Result<HistoryRecord> {
        self.get_values(itemid, value_type, 0, 1, ts)?
            .pop()
            .ok_or(StateError::NoData { itemid })
    }

    fn fetch(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>> {
        bump(&self.counters.db_requests);
        debug!(
            "Item {}: fetching history start {} count {} end {}",
            itemid, start, count, end
        );
        self.history
            .fetch(itemid, value_type, start, count, end, FetchMode::NonInteractive)
            .map_err(|e| {
                bump(&self.counters.db_fails);
                warn!("Item {}: history fetch failed: {}", itemid, e);
                e
            })
    }

    fn values_by_count(
        &self,
        itemid: u64,
        item: &mut ItemElem,
        memf: &Memf,
        count: usize,
        ts: i64,
        now: i64,
    ) -> Result<Vec<HistoryRecord>> {
        item.demand.update(count as i64, 0, now);

        if let Some(idx) = item.serving_index(ts) {
            if item.buff.has_enough_count_data_idx(count, idx) {
                bump(&self.counters.hits);
                return Ok(item.records_by_count(count, idx));
            }
        }
        bump(&self.counters.misses);

        // nothing buffered at or before ts: establish [ts, now] first
        if item.serving_index(ts).is_none() {
            let end = item.fetch_end(now);
            if end >= ts {
                let records = self.fetch(itemid, item.value_type, ts, 0, end)?;
                let records = item.unbuffered(records, end);
                let complete = item.merge(memf, records);
                item.mark_fetched(ts, complete);
            }
        }

        let available = item.available_at(item.serving_index(ts));
        if available < count && item.db_fetched_time > 0 {
            let need = count - available;
            let end = item.fetch_end(ts);
            let again = item.buffered_at(end);
            let records = self.fetch(itemid, item.value_type, 0, need + again, end)?;
            let records = item.unbuffered(records, end);
            let returned = records.len();
            let complete = item.merge(memf, records);
            item.db_fetched_count = item.db_fetched_count.max(need);

            if complete && returned < need {
                // nothing older left in the store
                item.db_fetched_time = 0;
            } else if let Some(tail) = item.buff.time_tail() {
                item.db_fetched_time = item.db_fetched_time.min(tail);
            }
        }

        match item.serving_index(ts) {
            Some(idx) if item.buff.has_enough_count_data_idx(count, idx) => {
                Ok(item.records_by_count(count, idx))
            }
            _ => {
                debug!(
                    "Item {}: {} values requested at {}, {} available after fetch",
                    itemid,
                    count,
                    ts,
                    item.available_at(item.serving_index(ts))
                );
                Err(StateError::NoData { itemid })
            }
        }
    }

    fn values_by_time(
        &self,
        itemid: u64,
        item: &mut ItemElem,
        memf: &Memf,
        seconds: i64,
        ts: i64,
        now: i64,
    ) -> Result<Vec<HistoryRecord>> {
        let seconds = seconds.max(0);
        item.demand.update(0, seconds, now);
        let window_start = ts - seconds;

        if item.covers(window_start) {
            bump(&self.counters.hits);
            return Ok(item.records_between(window_start, ts));
        }
        bump(&self.counters.misses);

        let end = item.fetch_end(now);
        let start = end - fetch_overhead((end - window_start).max(0));
        let records = self.fetch(itemid, item.value_type, start, 0, end)?;
        let records = item.unbuffered(records, end);
        let complete = item.merge(memf, records);
        item.mark_fetched(start, complete);

        if !item.covers(window_start) {
            debug!(
                "Item {}: window from {} not covered after fetch, cache reaches {}",
                itemid, window_start, item.db_fetched_time
            );
            return Err(StateError::NoData { itemid });
        }
        Ok(item.records_between(window_start, ts))
    }

    // ============================================================================================
    // METADATA
    // ============================================================================================

    /// Applies the fields of `meta` selected by `flags`, creating the item if needed.
    pub fn update_meta(&self, itemid: u64, meta: &ItemMeta, flags: MetaFlags) -> Result<()> {
        let pool = self.pool();
        self.with_item(itemid, ElemFlags::NONE, |item, _, _| {
            if flags.contains(MetaFlags::LASTDATA) && item.lastdata < meta.lastdata {
                item.lastdata = meta.lastdata;
            }
            if flags.contains(MetaFlags::NEXTCHECK) {
                item.nextcheck = meta.nextcheck;
            }
            if flags.contains(MetaFlags::STATE) {
                item.state = meta.state;
            }
            if flags.contains(MetaFlags::ERROR) {
                item.error = pool.replace(item.error.take(), meta.error.as_deref())?;
            }
            Ok(())
        })
    }

    pub fn update_nextcheck(&self, itemid: u64, nextcheck: i64) -> Result<()> {
        self.with_item(itemid, ElemFlags::NONE, |item, _, _| {
            item.nextcheck = nextcheck;
            Ok(())
        })
    }

    /// Replaces the item's error message; `None` clears it.
    pub fn set_error(&self, itemid: u64, error: Option<&str>) -> Result<()> {
        let pool = self.pool();
        self.with_item(itemid, ElemFlags::NONE, |item, _, _| {
            item.error = pool.replace(item.error.take(), error)?;
            Ok(())
        })
    }

    /// Collection state, `Unknown` for items not in the cache.
    pub fn get_state(&self, itemid: u64) -> ItemState {
        self.inspect(itemid, |item| item.state)
            .unwrap_or(ItemState::Unknown)
    }

    pub fn get_nextcheck(&self, itemid: u64) -> Result<i64> {
        self.inspect(itemid, |item| item.nextcheck)
    }

    pub fn get_meta(&self, itemid: u64) -> Result<ItemMeta> {
        self.inspect(itemid, ItemElem::meta)
    }

    pub fn get_value_type(&self, itemid: u64) -> Result<ValueType> {
        self.inspect(itemid, |item| item.value_type)
    }

    // ============================================================================================
    // API DOCUMENTS
    // ============================================================================================

    /// `{"data": [{"itemid", "values": [{"clock", "value"}, ...]}, ...]}` with
    /// up to `count` newest values per cached item, newest first.
    pub fn get_last_values_json(&self, itemids: &[u64], count: usize) -> Value {
        let count = if count < 1 { DEFAULT_LAST_VALUES } else { count };
        let data: Vec<Value> = itemids
            .iter()
            .filter_map(|&itemid| {
                self.inspect(itemid, |item| {
                    let skip = item.buff.count().saturating_sub(count);
                    let mut values: Vec<Value> = item
                        .buff
                        .iter()
                        .skip(skip)
                        .map(|r| json!({"clock": r.time, "value": r.value.to_json()}))
                        .collect();
                    values.reverse();
                    json!({"itemid": itemid, "values": values})
                })
                .ok()
            })
            .collect();
        json!({ "data": data })
    }

    /// `{"data": [{"itemid", "lastdata", "nextcheck", "state", "error"?}, ...]}`
    pub fn get_state_json(&self, itemids: &[u64]) -> Value {
        let data: Vec<Value> = itemids
            .iter()
            .filter_map(|&itemid| {
                self.inspect(itemid, |item| {
                    let mut doc = json!({
                        "itemid": itemid,
                        "lastdata": item.lastdata,
                        "nextcheck": item.nextcheck,
                        "state": item.state.code(),
                    });
                    if let Some(error) = item.error.as_deref() {
                        doc["error"] = Value::from(error);
                    }
                    doc
                })
                .ok()
            })
            .collect();
        json!({ "data": data })
    }

    // ============================================================================================
    // MAINTENANCE
    // ============================================================================================

    /// Drops the listed items. Returns how many were cached.
    pub fn remove(&self, itemids: &[u64]) -> usize {
        self.items.mass_delete(itemids)
    }

    /// Drops items not accessed for `ttl` seconds. A zero ttl keeps everything.
    pub fn housekeep(&self, now: i64, ttl: i64) -> Result<usize> {
        if ttl <= 0 {
            return Ok(0);
        }
        let mut expired = 0;
        self.items.iterate(ElemFlags::NONE, |elem, _| {
            if elem.data().last_accessed + ttl < now {
                elem.mark_for_deletion();
                expired += 1;
            }
            Ok(())
        })?;
        if expired > 0 {
            info!("Items housekeeping: removed {} items idle for over {}s", expired, ttl);
        }
        Ok(expired)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, itemid: u64) -> bool {
        self.items.contains(itemid)
    }

    pub fn stats(&self) -> ItemsStats {
        let ElemsHashStats {
            elements,
            contended_locks,
        } = self.items.stats();
        ItemsStats {
            items: elements,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            db_requests: self.counters.db_requests.load(Ordering::Relaxed),
            db_fails: self.counters.db_fails.load(Ordering::Relaxed),
            fails: self.counters.fails.load(Ordering::Relaxed),
            contended_locks,
        }
    }

    // ============================================================================================
    // PERSISTENCE
    // ============================================================================================

    /// Writes every item to `<dir>/items.gz`. Returns (items, values) written.
    pub fn dump(&self, dir: &Path) -> Result<(usize, usize)> {
        let mut dumper = StateDumper::create(dir, DUMP_NAME)?;
        let mut values = 0;
        let items = self.items.snapshot(|elem| {
            let record = ItemRecord::from_elem(elem.id(), elem.data());
            values += record.values.len();
            dumper.write_json(&record)
        })?;
        dumper.finish()?;
        info!("Items dump finished: {} items, {} values", items, values);
        Ok((items, values))
    }

    /// Loads `<dir>/items.gz` into the cache. A missing dump loads nothing.
    /// Returns (items, values) loaded.
    pub fn load(&self, dir: &Path) -> Result<(usize, usize)> {
        let Some(mut loader) = StateLoader::open(dir, DUMP_NAME)? else {
            info!("No items dump in {}, starting empty", dir.display());
            return Ok((0, 0));
        };

        let (mut items, mut values) = (0, 0);
        while let Some(line) = loader.next_record() {
            let record: ItemRecord = match serde_json::from_value(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Items dump line {}: {}, skipped", loader.line_no(), e);
                    continue;
                }
            };
            if record.itemid == 0 {
                warn!("Items dump line {}: zero itemid, skipped", loader.line_no());
                continue;
            }
            let itemid = record.itemid;
            match self.items.process(itemid, ElemFlags::NONE, |elem, memf| {
                self.restore(elem.data_mut(), memf, itemid, record)
            }) {
                Ok(loaded) => {
                    items += 1;
                    values += loaded;
                }
                Err(e) => warn!("Cannot load item {}: {}", itemid, e),
            }
        }
        info!("Items load finished: {} items, {} values", items, values);
        Ok((items, values))
    }

    fn restore(&self, item: &mut ItemElem, memf: &Memf, itemid: u64, record: ItemRecord) -> Result<usize> {
        let value_type = ValueType::from_code(record.value_type).unwrap_or(ValueType::None);
        item.reset(memf, value_type);
        item.resize(memf, record.values.len().clamp(INITIAL_BUFFER_SIZE, MAX_SIZE))?;

        let mut loaded = 0;
        for value in record.values {
            let clock = value.clock;
            let Some(variant) = value.into_variant(value_type) else {
                debug!("Item {}: dumped value at {} does not fit {:?}", itemid, clock, value_type);
                continue;
            };
            match item.store_head(memf, clock, variant) {
                Ok(()) => loaded += 1,
                Err(e) => debug!("Item {}: dumped value at {} not restored: {}", itemid, clock, e),
            }
        }

        let meta = record.item_metadata;
        item.db_fetched_time = record.db_fetched_time;
        item.db_fetched_count = record.db_fetched_count as usize;
        item.last_accessed = record.last_accessed;
        item.state = ItemState::from_code(meta.state);
        item.lastdata = meta.lastdata;
        item.nextcheck = meta.nextcheck;
        item.error = self.pool().replace(item.error.take(), meta.error.as_deref())?;
        item.demand = record.demand;
        Ok(loaded)
    }
}

impl std::fmt::Debug for ItemsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemsState")
            .field("items", &self.items.len())
            .finish()
    }
}

// ================================================================================================
// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::NoHistory;
    use crate::memory::{heap, SharedSegment};
    use crate::types::ManualClock;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000;

    fn state() -> (ItemsState, ManualClock) {
        state_with(heap())
    }

    fn state_with(memf: Memf) -> (ItemsState, ManualClock) {
        let clock = ManualClock::new(NOW);
        let pool = Arc::new(StrPool::new(memf.clone()));
        let items = ItemsState::new(memf, pool, Arc::new(NoHistory), Arc::new(clock.clone()));
        (items, clock)
    }

    fn float(itemid: u64, clock: i64, v: f64) -> IngestRecord {
        IngestRecord::new(itemid, ValueType::Float, clock, Variant::Dbl(v))
    }

    fn clocks(records: &[HistoryRecord]) -> Vec<i64> {
        records.iter().map(|r| r.clock).collect()
    }

    #[test]
    fn test_demand_tracks_and_decays() {
        let mut demand = Demand::default();
        demand.update(5, 0, 100);
        assert_eq!((demand.count, demand.count_change), (5, 100));

        demand.update(3, 0, 200);
        assert_eq!((demand.count, demand.new_count), (5, 3));

        demand.update(2, 0, 100 + DEMAND_DECAY_SECS + 1);
        assert_eq!(demand.count, 3, "stale level decays to the best candidate");
        assert_eq!(demand.new_count, 0);

        demand.update(0, 600, 300);
        assert_eq!(demand.period, 600);
    }

    #[test]
    fn test_overhead_and_grow_sizes() {
        assert_eq!(fetch_overhead(10), 310);
        assert_eq!(fetch_overhead(1000), 1200);
        assert_eq!(grown_size(10), 18);
        assert_eq!(grown_size(100), 120);
        assert_eq!(grown_size(MAX_SIZE), MAX_SIZE);
    }

    #[test]
    fn test_add_and_get_last_value() {
        let (items, _) = state();
        items.add_value(&float(1, NOW - 10, 1.5)).unwrap();
        let values = items.get_values(1, ValueType::Float, 0, 1, NOW - 10).unwrap();
        assert_eq!(values, vec![HistoryRecord::new(NOW - 10, Variant::Dbl(1.5))]);
        assert_eq!(items.stats().hits, 1);
    }

    #[test]
    fn test_future_value_rejected() {
        let (items, _) = state();
        let res = items.add_value(&float(1, NOW + FUTURE_TOLERANCE_SECS + 1, 1.0));
        assert!(matches!(res, Err(StateError::FutureValue { itemid: 1, .. })));
        items.add_value(&float(1, NOW + FUTURE_TOLERANCE_SECS, 1.0)).unwrap();
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (items, _) = state();
        items.add_value(&float(1, NOW, 1.0)).unwrap();
        let res = items.add_value(&float(1, NOW - 1, 2.0));
        assert!(matches!(res, Err(StateError::Rejected(InsertError::OutOfOrder))));
    }

    #[test]
    fn test_type_change_resets_values() {
        let (items, _) = state();
        for i in 0..5 {
            items.add_value(&float(1, NOW - 10 + i, i as f64)).unwrap();
        }
        let text = IngestRecord::new(1, ValueType::Text, NOW, Variant::Str("up".to_string()));
        items.add_value(&text).unwrap();

        assert_eq!(items.get_value_type(1).unwrap(), ValueType::Text);
        assert_eq!(items.inspect(1, ItemElem::values_count).unwrap(), 1);
    }

    #[test]
    fn test_mismatched_value_rejected() {
        let (items, _) = state();
        let bad = IngestRecord::new(1, ValueType::Uint64, NOW, Variant::Dbl(1.0));
        assert!(matches!(items.add_value(&bad), Err(StateError::InvalidArgument(_))));
        assert!(!items.contains(1));
    }

    #[test]
    fn test_no_demand_keeps_initial_size() {
        let (items, _) = state();
        for i in 0..50 {
            items.add_value(&float(1, NOW - 100 + i, i as f64)).unwrap();
        }
        let (count, size) = items
            .inspect(1, |item| (item.values_count(), item.buffer_size()))
            .unwrap();
        assert_eq!((count, size), (INITIAL_BUFFER_SIZE, INITIAL_BUFFER_SIZE));
    }

    #[test]
    fn test_count_demand_grows_buffer() {
        let (items, _) = state();
        items.add_value(&float(1, NOW - 1000, 0.0)).unwrap();
        // db is empty, so this fails but records the demand
        assert!(items.get_values(1, ValueType::Float, 0, 20, NOW).is_err());

        for i in 0..100 {
            items.add_value(&float(1, NOW - 500 + i, i as f64)).unwrap();
        }
        let count = items.inspect(1, ItemElem::values_count).unwrap();
        assert!(count >= 20, "buffer kept {} values, demand is 20", count);
        let values = items.get_values(1, ValueType::Float, 0, 20, NOW).unwrap();
        assert_eq!(values.len(), 20);
        assert_eq!(values.last().map(|r| r.clock), Some(NOW - 401));
    }

    #[test]
    fn test_last_value_only() {
        let (items, _) = state();
        for i in 0..5 {
            let mut rec = float(1, NOW + i, i as f64);
            rec.last_value_only = true;
            items.add_value(&rec).unwrap();
        }
        let (count, size) = items
            .inspect(1, |item| (item.values_count(), item.buffer_size()))
            .unwrap();
        assert_eq!((count, size), (1, 1));
        let last = items.get_value(1, ValueType::Float, NOW + 10).unwrap();
        assert_eq!(last.value, Variant::Dbl(4.0));
    }

    #[test]
    fn test_time_window_from_cache() {
        let (items, _) = state();
        for i in 0..10 {
            items.add_value(&float(1, NOW - 90 + i * 10, i as f64)).unwrap();
        }
        let values = items.get_values(1, ValueType::Float, 30, 0, NOW).unwrap();
        assert_eq!(clocks(&values), vec![NOW - 20, NOW - 10, NOW]);
        assert_eq!(items.stats().hits, 1);
    }

    #[test]
    fn test_count_mode_before_tail_fails_without_history() {
        let (items, _) = state();
        items.add_value(&float(1, NOW, 1.0)).unwrap();
        let res = items.get_values(1, ValueType::Float, 0, 1, NOW - 100);
        assert!(matches!(res, Err(StateError::NoData { itemid: 1 })));
        let stats = items.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.fails, 1);
    }

    #[test]
    fn test_meta_updates() {
        let (items, _) = state();
        assert_eq!(items.get_state(9), ItemState::Unknown);

        let meta = ItemMeta {
            state: ItemState::NotSupported,
            lastdata: 100,
            nextcheck: 200,
            error: Some("timeout".to_string()),
        };
        items.update_meta(9, &meta, MetaFlags::ALL).unwrap();
        assert_eq!(items.get_meta(9).unwrap(), meta);

        let older = ItemMeta {
            lastdata: 50,
            ..ItemMeta::default()
        };
        items.update_meta(9, &older, MetaFlags::LASTDATA).unwrap();
        assert_eq!(items.get_meta(9).unwrap().lastdata, 100, "lastdata never goes back");

        items.update_nextcheck(9, 300).unwrap();
        assert_eq!(items.get_nextcheck(9).unwrap(), 300);
        assert_eq!(items.get_state(9), ItemState::NotSupported);

        items.set_error(9, None).unwrap();
        assert_eq!(items.get_meta(9).unwrap().error, None);
        assert!(items.pool().is_empty(), "cleared error leaves the pool");
    }

    #[test]
    fn test_shared_error_strings_interned() {
        let (items, _) = state();
        items.set_error(1, Some("unreachable")).unwrap();
        items.set_error(2, Some("unreachable")).unwrap();
        assert_eq!(items.pool().len(), 1);
        assert_eq!(items.pool().refcount("unreachable"), 2);
        items.remove(&[1, 2]);
        assert!(items.pool().is_empty());
    }

    #[test]
    fn test_json_documents() {
        let (items, _) = state();
        for i in 0..3 {
            items.add_value(&float(1, NOW + i, i as f64)).unwrap();
        }
        items.set_error(1, Some("slow")).unwrap();

        let doc = items.get_last_values_json(&[1, 2], 2);
        let data = doc["data"].as_array().unwrap();
        assert_eq!(data.len(), 1, "absent items are left out");
        assert_eq!(data[0]["values"][0]["clock"], json!(NOW + 2));
        assert_eq!(data[0]["values"].as_array().unwrap().len(), 2);

        let doc = items.get_state_json(&[1]);
        assert_eq!(doc["data"][0]["error"], json!("slow"));
        assert_eq!(doc["data"][0]["state"], json!(0));
    }

    #[test]
    fn test_housekeep_by_last_access() {
        let (items, clock) = state();
        items.add_value(&float(1, NOW, 1.0)).unwrap();
        clock.advance(100);
        items.add_value(&float(2, NOW + 100, 1.0)).unwrap();

        assert_eq!(items.housekeep(clock.now(), 0).unwrap(), 0);
        assert_eq!(items.housekeep(clock.now(), 50).unwrap(), 1);
        assert!(!items.contains(1));
        assert!(items.contains(2));
    }

    #[test]
    fn test_batch_reports_partial_failure() {
        let (items, _) = state();
        let mut unsupported = float(3, NOW, 1.0);
        unsupported.state = ItemState::NotSupported;
        let batch = vec![
            float(1, NOW, 1.0),
            float(2, NOW + 10_000, 1.0),
            unsupported,
            float(4, NOW, 4.0),
        ];
        let res = items.add_values(&batch);
        assert!(matches!(res, Err(StateError::Partial { failed: 1, total: 4 })));
        assert!(items.contains(4), "batch continues past a failure");
        assert!(!items.contains(3));
    }

    #[test]
    fn test_dump_load_round_trip() {
        let dir = tempdir().unwrap();
        let (items, _) = state();
        for i in 0..4 {
            items.add_value(&float(1, NOW + i, i as f64 * 0.1)).unwrap();
        }
        let text = IngestRecord::new(2, ValueType::Text, NOW, Variant::Str("line".to_string()));
        items.add_value(&text).unwrap();
        items.add_value(&IngestRecord::new(2, ValueType::Text, NOW + 1, Variant::Err("boom".into()))).unwrap();
        items.set_error(2, Some("parse error")).unwrap();
        let _ = items.get_values(1, ValueType::Float, 0, 3, NOW + 3);

        assert_eq!(items.dump(dir.path()).unwrap(), (2, 6));

        let (loaded, _) = state();
        assert_eq!(loaded.load(dir.path()).unwrap(), (2, 6));
        for itemid in [1, 2] {
            let before = items.inspect(itemid, |i| ItemRecord::from_elem(itemid, i)).unwrap();
            let after = loaded.inspect(itemid, |i| ItemRecord::from_elem(itemid, i)).unwrap();
            assert_eq!(
                serde_json::to_value(&before).unwrap(),
                serde_json::to_value(&after).unwrap()
            );
        }
    }

    #[test]
    fn test_payload_memory_released() {
        let memf: Memf = Arc::new(SharedSegment::new(1 << 20));
        {
            let (items, _) = state_with(memf.clone());
            for i in 0..30 {
                let rec = IngestRecord::new(1, ValueType::Str, NOW + i, Variant::Str("x".repeat(100)));
                items.add_value(&rec).unwrap();
            }
            items.set_error(1, Some("err")).unwrap();
            let used = memf.used();
            assert!(used > INITIAL_BUFFER_SIZE * 100);

            items.remove(&[1]);
            assert!(
                memf.used() + INITIAL_BUFFER_SIZE * 100 <= used,
                "buffered strings are released with the item"
            );
        }
        assert_eq!(memf.used(), 0);
    }
}
