//! Integration tests for the item value cache against a history backend.
//!
//! Tests verify:
//! - Count queries fill the buffer in two fetches and are then served from cache
//! - Time window queries fetch once with overhead and are then served from cache
//! - Backend failures leave cached values and fetch bookkeeping untouched
//! - The SQLite store answers the same queries

use parking_lot::Mutex;
use state::items::NEVER_FETCHED;
use state::{
    heap, FetchMode, HistoryRecord, HistoryStore, IngestRecord, ItemsState, ManualClock, Result,
    SqliteHistory, StateError, ValueType, Variant,
};
use state::algo::StrPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const NOW: i64 = 1_700_000_000;

/// In-memory history that counts fetches and can be switched to fail.
#[derive(Default)]
struct RecordingHistory {
    records: Mutex<Vec<(u64, HistoryRecord)>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingHistory {
    fn with_series(itemid: u64, step: i64, n: i64, value: impl Fn(i64) -> Variant) -> Self {
        let history = RecordingHistory::default();
        {
            let mut records = history.records.lock();
            for k in 1..=n {
                records.push((itemid, HistoryRecord::new(NOW - k * step, value(k))));
            }
        }
        history
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistoryStore for RecordingHistory {
    fn fetch(
        &self,
        itemid: u64,
        _value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
        _mode: FetchMode,
    ) -> Result<Vec<HistoryRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StateError::Backend("connection reset".to_string()));
        }

        let mut found: Vec<HistoryRecord> = self
            .records
            .lock()
            .iter()
            .filter(|(id, r)| *id == itemid && r.clock <= end)
            .filter(|(_, r)| count > 0 || r.clock >= start)
            .map(|(_, r)| r.clone())
            .collect();
        found.sort_by(|a, b| b.clock.cmp(&a.clock));
        if count > 0 {
            found.truncate(count);
        }
        Ok(found)
    }
}

fn items_with(history: Arc<dyn HistoryStore>) -> ItemsState {
    let memf = heap();
    let pool = Arc::new(StrPool::new(memf.clone()));
    ItemsState::new(memf, pool, history, Arc::new(ManualClock::new(NOW)))
}

fn clocks(records: &[HistoryRecord]) -> Vec<i64> {
    records.iter().map(|r| r.clock).collect()
}

// ============================================================================
// COUNT QUERIES
// ============================================================================

#[test]
fn test_count_query_fetches_twice_then_hits() {
    let history = Arc::new(RecordingHistory::with_series(1, 100, 20, |k| Variant::Ui64(k as u64)));
    let items = items_with(history.clone());

    let values = items.get_values(1, ValueType::Uint64, 0, 5, NOW - 50).unwrap();
    assert_eq!(clocks(&values), vec![NOW - 500, NOW - 400, NOW - 300, NOW - 200, NOW - 100]);
    assert_eq!(values[4].value, Variant::Ui64(1));
    assert_eq!(history.calls(), 2);

    let again = items.get_values(1, ValueType::Uint64, 0, 5, NOW - 50).unwrap();
    assert_eq!(again, values);
    assert_eq!(history.calls(), 2);

    let stats = items.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.db_requests, 2);
}

#[test]
fn test_larger_count_fetches_only_the_missing_values() {
    let history = Arc::new(RecordingHistory::with_series(1, 100, 20, |k| Variant::Ui64(k as u64)));
    let items = items_with(history.clone());

    items.get_values(1, ValueType::Uint64, 0, 5, NOW - 50).unwrap();
    let values = items.get_values(1, ValueType::Uint64, 0, 8, NOW - 50).unwrap();
    assert_eq!(values.len(), 8);
    assert_eq!(values[0].clock, NOW - 800);
    assert_eq!(history.calls(), 3);

    // served from the buffer at an older point in time
    let older = items.get_values(1, ValueType::Uint64, 0, 3, NOW - 250).unwrap();
    assert_eq!(clocks(&older), vec![NOW - 500, NOW - 400, NOW - 300]);
    assert_eq!(history.calls(), 3);
}

#[test]
fn test_exhausted_history_is_remembered() {
    let history = Arc::new(RecordingHistory::with_series(1, 100, 3, |k| Variant::Ui64(k as u64)));
    let items = items_with(history.clone());

    assert!(matches!(
        items.get_values(1, ValueType::Uint64, 0, 5, NOW),
        Err(StateError::NoData { itemid: 1 })
    ));
    let calls = history.calls();
    assert_eq!(items.inspect(1, |item| item.db_fetched_time()).unwrap(), 0);

    // store has nothing older, so no further fetch is made
    assert!(items.get_values(1, ValueType::Uint64, 0, 5, NOW).is_err());
    assert_eq!(history.calls(), calls);
    assert_eq!(items.get_values(1, ValueType::Uint64, 0, 3, NOW).unwrap().len(), 3);
}

#[test]
fn test_evicted_value_sharing_a_second_is_fetched_back() {
    let history = Arc::new(RecordingHistory::default());
    let items = items_with(history.clone());

    // two values at NOW - 200, then nine more; the buffer holds ten
    let mut clocks_in = vec![NOW - 200, NOW - 200];
    clocks_in.extend((1..=9).map(|k| NOW - 200 + k * 10));
    for (i, clock) in clocks_in.iter().enumerate() {
        let value = Variant::Dbl(i as f64);
        history.records.lock().push((1, HistoryRecord::new(*clock, value.clone())));
        items
            .add_value(&IngestRecord::new(1, ValueType::Float, *clock, value))
            .unwrap();
    }
    assert_eq!(items.inspect(1, |item| item.values_count()).unwrap(), 10);

    let values = items.get_values(1, ValueType::Float, 0, 11, NOW).unwrap();
    assert_eq!(clocks(&values), clocks_in);
    assert_eq!(values[0].clock, values[1].clock);
    assert_eq!(items.inspect(1, |item| item.db_fetched_time()).unwrap(), NOW - 200);
    assert_eq!(history.calls(), 1);

    // nothing older than the shared second exists
    assert!(matches!(
        items.get_values(1, ValueType::Float, 0, 12, NOW),
        Err(StateError::NoData { itemid: 1 })
    ));
    assert_eq!(items.inspect(1, |item| item.db_fetched_time()).unwrap(), 0);
    assert_eq!(items.get_values(1, ValueType::Float, 0, 11, NOW).unwrap().len(), 11);
    assert_eq!(history.calls(), 2);
}

// ============================================================================
// TIME QUERIES
// ============================================================================

#[test]
fn test_time_window_fetches_with_overhead_then_hits() {
    let history = Arc::new(RecordingHistory::with_series(2, 60, 60, |k| Variant::Dbl(k as f64 / 2.0)));
    let items = items_with(history.clone());

    let values = items.get_values(2, ValueType::Float, 600, 0, NOW).unwrap();
    assert_eq!(values.len(), 9);
    assert_eq!(values.first().map(|r| r.clock), Some(NOW - 540));
    assert_eq!(values.last().map(|r| r.clock), Some(NOW - 60));
    assert_eq!(history.calls(), 1);

    // the fetch reached 720s back, which covers a slightly wider window too
    let wider = items.get_values(2, ValueType::Float, 700, 0, NOW).unwrap();
    assert_eq!(wider.len(), 11);
    assert_eq!(history.calls(), 1);
    assert!(items.inspect(2, |item| item.values_count()).unwrap() >= 12);
}

#[test]
fn test_ingested_values_extend_fetched_history() {
    let history = Arc::new(RecordingHistory::with_series(2, 60, 60, |k| Variant::Dbl(k as f64)));
    let items = items_with(history.clone());

    items.get_values(2, ValueType::Float, 300, 0, NOW).unwrap();
    items
        .add_value(&IngestRecord::new(2, ValueType::Float, NOW + 10, Variant::Dbl(-1.0)))
        .unwrap();

    let calls = history.calls();
    let values = items.get_values(2, ValueType::Float, 300, 0, NOW + 10).unwrap();
    assert_eq!(values.last().map(|r| r.value.clone()), Some(Variant::Dbl(-1.0)));
    assert_eq!(history.calls(), calls);
}

// ============================================================================
// BACKEND FAILURES
// ============================================================================

#[test]
fn test_backend_failure_leaves_state_intact() {
    let history = Arc::new(RecordingHistory::default());
    let items = items_with(history.clone());
    for (i, clock) in [NOW - 30, NOW - 20, NOW - 10].into_iter().enumerate() {
        items
            .add_value(&IngestRecord::new(3, ValueType::Uint64, clock, Variant::Ui64(i as u64)))
            .unwrap();
    }
    history.failing.store(true, Ordering::SeqCst);

    assert!(matches!(
        items.get_values(3, ValueType::Uint64, 0, 5, NOW),
        Err(StateError::Backend(_))
    ));
    assert_eq!(items.inspect(3, |item| item.values_count()).unwrap(), 3);
    assert_eq!(items.inspect(3, |item| item.db_fetched_time()).unwrap(), NEVER_FETCHED);

    let cached = items.get_values(3, ValueType::Uint64, 0, 3, NOW).unwrap();
    assert_eq!(clocks(&cached), vec![NOW - 30, NOW - 20, NOW - 10]);

    let stats = items.stats();
    assert_eq!(stats.db_fails, 1);
    assert_eq!(stats.fails, 1);
}

// ============================================================================
// SQLITE
// ============================================================================

#[test]
fn test_sqlite_history_serves_misses() {
    let store = SqliteHistory::open_in_memory().unwrap();
    let records: Vec<IngestRecord> = (1..=10)
        .map(|k| IngestRecord::new(4, ValueType::Str, NOW - k * 10, Variant::Str(format!("v{}", k))))
        .collect();
    assert_eq!(store.store(&records).unwrap(), 10);

    let items = items_with(Arc::new(store));
    let values = items.get_values(4, ValueType::Str, 0, 4, NOW).unwrap();
    assert_eq!(clocks(&values), vec![NOW - 40, NOW - 30, NOW - 20, NOW - 10]);
    assert_eq!(values[3].value, Variant::Str("v1".to_string()));

    let last = items.get_value(4, ValueType::Str, NOW - 25).unwrap();
    assert_eq!(last.clock, NOW - 30);
}
