//! Core value types shared by the state tables.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since UNIX epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ================================================================================================
// CLOCK
// ================================================================================================

/// Source of "now" for demand tracking, future-value checks and fetch windows.
pub trait Clock: Send + Sync {
    /// Current time in seconds since UNIX epoch
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        now_secs()
    }
}

/// Manually driven clock, shared between the cache and whoever advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<i64>>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: i64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: i64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        *self.now.lock()
    }
}

// ================================================================================================
// VALUE TYPES
// ================================================================================================

/// Declared type of an item's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Str,
    Log,
    Uint64,
    Text,
    /// Not yet known, or an item holding only error values
    None,
}

impl ValueType {
    /// Numeric code used in dumps and history tables.
    pub fn code(self) -> i64 {
        match self {
            ValueType::Float => 0,
            ValueType::Str => 1,
            ValueType::Log => 2,
            ValueType::Uint64 => 3,
            ValueType::Text => 4,
            ValueType::None => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ValueType::Float),
            1 => Some(ValueType::Str),
            2 => Some(ValueType::Log),
            3 => Some(ValueType::Uint64),
            4 => Some(ValueType::Text),
            5 => Some(ValueType::None),
            _ => None,
        }
    }
}

/// Item collection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ItemState {
    #[default]
    Normal,
    NotSupported,
    Unknown,
}

impl ItemState {
    pub fn code(self) -> i64 {
        match self {
            ItemState::Normal => 0,
            ItemState::NotSupported => 1,
            ItemState::Unknown => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ItemState::Normal,
            1 => ItemState::NotSupported,
            _ => ItemState::Unknown,
        }
    }
}

/// Tagged value stored in the cache. Owns its string payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Dbl(f64),
    Ui64(u64),
    /// String, text and log values
    Str(String),
    /// Error text recorded in place of a value
    Err(String),
}

impl Variant {
    /// Heap bytes owned by this value.
    pub fn payload_size(&self) -> usize {
        match self {
            Variant::Str(s) | Variant::Err(s) => s.len(),
            _ => 0,
        }
    }

    /// Whether the variant can be stored for an item of `value_type`.
    pub fn matches(&self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (Variant::Dbl(_), ValueType::Float)
                | (Variant::Ui64(_), ValueType::Uint64)
                | (Variant::Str(_), ValueType::Str | ValueType::Text | ValueType::Log)
                | (Variant::Err(_), _)
        )
    }

    pub fn to_json(&self) -> Value {
        match self {
            Variant::Dbl(d) => serde_json::json!(d),
            Variant::Ui64(u) => Value::from(*u),
            Variant::Str(s) | Variant::Err(s) => Value::from(s.as_str()),
        }
    }

    /// Parses a JSON value according to the item's value type.
    pub fn from_json(value_type: ValueType, v: &Value) -> Option<Variant> {
        match value_type {
            ValueType::Float => v.as_f64().map(Variant::Dbl),
            ValueType::Uint64 => v.as_u64().map(Variant::Ui64),
            ValueType::Str | ValueType::Text | ValueType::Log => {
                v.as_str().map(|s| Variant::Str(s.to_string()))
            }
            ValueType::None => v.as_str().map(|s| Variant::Err(s.to_string())),
        }
    }
}

/// One timestamped value as returned by queries and the backing store.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    /// Seconds since UNIX epoch
    pub clock: i64,
    pub value: Variant,
}

impl HistoryRecord {
    pub fn new(clock: i64, value: Variant) -> Self {
        Self { clock, value }
    }
}

/// A newly collected value on its way into the cache.
#[derive(Clone, Debug)]
pub struct IngestRecord {
    pub itemid: u64,
    pub value_type: ValueType,
    pub clock: i64,
    /// `None` for records carrying only metadata (no value collected)
    pub value: Option<Variant>,
    pub state: ItemState,
    /// Keep only the most recent value (discovery rules and similar)
    pub last_value_only: bool,
}

impl IngestRecord {
    pub fn new(itemid: u64, value_type: ValueType, clock: i64, value: Variant) -> Self {
        Self {
            itemid,
            value_type,
            clock,
            value: Some(value),
            state: ItemState::Normal,
            last_value_only: false,
        }
    }
}
