//! Error taxonomy shared by every state table.
//!
//! All table operations return [`Result`]. Absence, ordering rejections,
//! backing-store failures and allocator exhaustion are distinct variants so
//! callers can decide what each means for them (e.g. evict on
//! [`StateError::ResourceExhausted`], report "unknown" on [`StateError::NoData`]).

use thiserror::Error;

/// Why a ring buffer refused a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Timestamp would break tail→head time order
    OutOfOrder,
    /// Buffer is full, caller must evict or resize first
    NoSpace,
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertError::OutOfOrder => write!(f, "out of order timestamp"),
            InsertError::NoSpace => write!(f, "no space left in buffer"),
        }
    }
}

/// Errors returned by state tables, containers and persistence.
#[derive(Debug, Error)]
pub enum StateError {
    /// Element is absent and creation was suppressed
    #[error("element {0} not found")]
    NotFound(u64),

    /// Ring buffer rejected an insert
    #[error("insert rejected: {0}")]
    Rejected(InsertError),

    /// Value timestamp is too far in the future
    #[error("value for item {itemid} is {ahead} seconds in the future")]
    FutureValue { itemid: u64, ahead: i64 },

    /// Not enough data to answer a query, even after backing-store fetches
    #[error("no data available for item {itemid} in requested range")]
    NoData { itemid: u64 },

    /// Backing store failed to deliver history
    #[error("history backend failure: {0}")]
    Backend(String),

    /// Memory region cannot satisfy a reservation
    #[error("memory exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    /// Argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Batch operation finished with failed entries
    #[error("{failed} of {total} records failed")]
    Partial { failed: usize, total: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<InsertError> for StateError {
    fn from(e: InsertError) -> Self {
        StateError::Rejected(e)
    }
}

impl From<rusqlite::Error> for StateError {
    fn from(e: rusqlite::Error) -> Self {
        StateError::Backend(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StateError>;
