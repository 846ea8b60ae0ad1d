//! Backing history store consulted on cache misses.
//!
//! The item cache only needs [`HistoryStore::fetch`]. Two stores ship with the
//! crate: [`NoHistory`] for deployments without a history database, and
//! [`SqliteHistory`], which keeps values in Zabbix-style per-type tables
//! (`history`, `history_uint`, `history_str`, `history_log`, `history_text`).

use crate::error::Result;
use crate::types::{HistoryRecord, IngestRecord, ValueType, Variant};
use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;

/// Who is asking; interactive fetches may be served with a different priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    Interactive,
    NonInteractive,
}

/// Source of historical values.
pub trait HistoryStore: Send + Sync {
    /// Fetches history of one item.
    ///
    /// With `count > 0`: the newest `count` records with `clock <= end`.
    /// Otherwise: all records with `start <= clock <= end`.
    /// Records may come back in any order.
    fn fetch(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
        mode: FetchMode,
    ) -> Result<Vec<HistoryRecord>>;
}

/// Store without any history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

impl HistoryStore for NoHistory {
    fn fetch(
        &self,
        _itemid: u64,
        _value_type: ValueType,
        _start: i64,
        _count: usize,
        _end: i64,
        _mode: FetchMode,
    ) -> Result<Vec<HistoryRecord>> {
        Ok(Vec::new())
    }
}

// ================================================================================================
// SQLITE
// ================================================================================================

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS history (itemid INTEGER NOT NULL, clock INTEGER NOT NULL, value REAL NOT NULL);
    CREATE INDEX IF NOT EXISTS history_1 ON history (itemid, clock);
    CREATE TABLE IF NOT EXISTS history_uint (itemid INTEGER NOT NULL, clock INTEGER NOT NULL, value INTEGER NOT NULL);
    CREATE INDEX IF NOT EXISTS history_uint_1 ON history_uint (itemid, clock);
    CREATE TABLE IF NOT EXISTS history_str (itemid INTEGER NOT NULL, clock INTEGER NOT NULL, value TEXT NOT NULL);
    CREATE INDEX IF NOT EXISTS history_str_1 ON history_str (itemid, clock);
    CREATE TABLE IF NOT EXISTS history_log (itemid INTEGER NOT NULL, clock INTEGER NOT NULL, value TEXT NOT NULL);
    CREATE INDEX IF NOT EXISTS history_log_1 ON history_log (itemid, clock);
    CREATE TABLE IF NOT EXISTS history_text (itemid INTEGER NOT NULL, clock INTEGER NOT NULL, value TEXT NOT NULL);
    CREATE INDEX IF NOT EXISTS history_text_1 ON history_text (itemid, clock);
";

fn table_for(value_type: ValueType) -> Option<&'static str> {
    match value_type {
        ValueType::Float => Some("history"),
        ValueType::Uint64 => Some("history_uint"),
        ValueType::Str => Some("history_str"),
        ValueType::Log => Some("history_log"),
        ValueType::Text => Some("history_text"),
        ValueType::None => None,
    }
}

/// SQLite-backed history.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    /// Opens (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stores collected values. Records without a value or with a value that
    /// does not match their type are skipped. Returns the number stored.
    pub fn store(&self, records: &[IngestRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut stored = 0;
        for record in records {
            let (Some(table), Some(value)) = (table_for(record.value_type), &record.value) else {
                continue;
            };
            let sql = format!(
                "INSERT INTO {} (itemid, clock, value) VALUES (?1, ?2, ?3)",
                table
            );
            let itemid = record.itemid as i64;
            let inserted = match value {
                Variant::Dbl(d) if record.value_type == ValueType::Float => {
                    tx.execute(&sql, params![itemid, record.clock, d])?
                }
                Variant::Ui64(u) if record.value_type == ValueType::Uint64 => {
                    tx.execute(&sql, params![itemid, record.clock, *u as i64])?
                }
                Variant::Str(s)
                    if matches!(
                        record.value_type,
                        ValueType::Str | ValueType::Log | ValueType::Text
                    ) =>
                {
                    tx.execute(&sql, params![itemid, record.clock, s])?
                }
                _ => 0,
            };
            stored += inserted;
        }
        tx.commit()?;
        Ok(stored)
    }
}

impl HistoryStore for SqliteHistory {
    fn fetch(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
        _mode: FetchMode,
    ) -> Result<Vec<HistoryRecord>> {
        let Some(table) = table_for(value_type) else {
            return Ok(Vec::new());
        };
        debug!(
            "History fetch item {} from {}: start {} count {} end {}",
            itemid, table, start, count, end
        );

        let read_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<HistoryRecord> {
            let clock: i64 = row.get(0)?;
            let value = match value_type {
                ValueType::Float => Variant::Dbl(row.get(1)?),
                ValueType::Uint64 => Variant::Ui64(row.get::<_, i64>(1)? as u64),
                _ => Variant::Str(row.get(1)?),
            };
            Ok(HistoryRecord { clock, value })
        };

        let conn = self.conn.lock();
        let records = if count > 0 {
            let mut stmt = conn.prepare(&format!(
                "SELECT clock, value FROM {} WHERE itemid = ?1 AND clock <= ?2 ORDER BY clock DESC LIMIT ?3",
                table
            ))?;
            let rows = stmt.query_map(params![itemid as i64, end, count as i64], read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT clock, value FROM {} WHERE itemid = ?1 AND clock >= ?2 AND clock <= ?3",
                table
            ))?;
            let rows = stmt.query_map(params![itemid as i64, start, end], read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(records)
    }
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory").finish()
    }
}
