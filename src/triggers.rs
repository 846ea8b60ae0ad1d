//! Trigger state table.
//!
//! Holds the last evaluated value of every trigger together with the time it
//! was calculated, the time the value last changed and, for triggers in the
//! UNKNOWN state, the evaluation error. Errors are interned: many triggers
//! tend to fail with the same message.

use crate::algo::intern::{PooledStr, StrPool};
use crate::dump::{deserialize_id, StateDumper, StateLoader};
use crate::elems_hash::{ElemFlags, ElemPayload, ElemsHash};
use crate::error::{Result, StateError};
use crate::memory::Memf;
use crate::types::Clock;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Dump file name
pub const DUMP_NAME: &str = "triggers";

/// Trigger evaluation result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TriggerValue {
    Ok,
    Problem,
    Unknown,
    /// Never evaluated
    #[default]
    None,
}

impl TriggerValue {
    pub fn code(self) -> u8 {
        match self {
            TriggerValue::Ok => 0,
            TriggerValue::Problem => 1,
            TriggerValue::Unknown => 2,
            TriggerValue::None => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TriggerValue::Ok),
            1 => Some(TriggerValue::Problem),
            2 => Some(TriggerValue::Unknown),
            3 => Some(TriggerValue::None),
            _ => None,
        }
    }
}

/// State of one trigger as exchanged with callers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerInfo {
    pub id: u64,
    pub value: TriggerValue,
    /// When the value last changed
    pub lastchange: i64,
    /// When the trigger was last evaluated
    pub lastcalc: i64,
    /// Evaluation error, only valid with [`TriggerValue::Unknown`]
    pub error: Option<String>,
}

/// One evaluation outcome from trigger processing.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerDiff {
    pub triggerid: u64,
    pub value: TriggerValue,
    /// Evaluation time
    pub lastchange: i64,
    /// `Some` when the evaluation updated the error
    pub error: Option<String>,
}

fn validate(info: &TriggerInfo) -> Result<()> {
    if info.id == 0 {
        return Err(StateError::InvalidArgument("trigger id is 0".to_string()));
    }
    if info.lastcalc == 0 {
        return Err(StateError::InvalidArgument(format!(
            "trigger {}: lastcalc is not set",
            info.id
        )));
    }
    if info.error.is_some() && info.value != TriggerValue::Unknown {
        return Err(StateError::InvalidArgument(format!(
            "trigger {}: error set for {:?} value",
            info.id, info.value
        )));
    }
    Ok(())
}

// ================================================================================================
// ELEMENT
// ================================================================================================

pub struct TriggerElem {
    value: TriggerValue,
    lastchange: i64,
    lastcalc: i64,
    error: Option<PooledStr>,
}

impl ElemPayload for TriggerElem {
    type Context = Arc<StrPool>;

    fn create(_id: u64, _memf: &Memf, _pool: &Arc<StrPool>) -> Result<Self> {
        Ok(TriggerElem {
            value: TriggerValue::None,
            lastchange: 0,
            lastcalc: 0,
            error: None,
        })
    }

    fn release(&mut self, _id: u64, _memf: &Memf, pool: &Arc<StrPool>) {
        if let Some(error) = self.error.take() {
            pool.free(error);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerRecord {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    value: u8,
    #[serde(default)]
    lastchange: i64,
    #[serde(default)]
    lastcalc: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ================================================================================================
// TRIGGERS STATE
// ================================================================================================

pub struct TriggersState {
    triggers: ElemsHash<TriggerElem>,
    clock: Arc<dyn Clock>,
}

impl TriggersState {
    pub fn new(memf: Memf, strpool: Arc<StrPool>, clock: Arc<dyn Clock>) -> Self {
        Self {
            triggers: ElemsHash::new(memf, strpool),
            clock,
        }
    }

    /// Stores an evaluation result. `lastchange` moves only when the value changes;
    /// an error is kept until another one replaces it.
    pub fn set_info(&self, info: &TriggerInfo) -> Result<()> {
        validate(info)?;
        let pool = self.triggers.context();
        let now = self.clock.now();
        self.triggers.process(info.id, ElemFlags::NONE, |elem, _| {
            let trigger = elem.data_mut();
            if trigger.value != info.value {
                trigger.value = info.value;
                trigger.lastchange = now;
            }
            trigger.lastcalc = info.lastcalc;
            if let Some(error) = info.error.as_deref() {
                trigger.error = pool.replace(trigger.error.take(), Some(error))?;
            }
            Ok(())
        })
    }

    /// Stores a value without an error. A zero `lastcalc` means now.
    pub fn set_value(&self, id: u64, value: TriggerValue, lastcalc: i64) -> Result<()> {
        let lastcalc = if lastcalc == 0 { self.clock.now() } else { lastcalc };
        self.set_info(&TriggerInfo {
            id,
            value,
            lastcalc,
            ..TriggerInfo::default()
        })
    }

    /// Current state; the error is only reported for UNKNOWN triggers.
    pub fn get_info(&self, id: u64) -> Result<TriggerInfo> {
        if id == 0 {
            return Err(StateError::InvalidArgument("trigger id is 0".to_string()));
        }
        self.triggers.process(id, ElemFlags::DO_NOT_CREATE, |elem, _| {
            let trigger = elem.data();
            let error = match trigger.value {
                TriggerValue::Unknown => trigger.error.as_deref().map(str::to_string),
                _ => None,
            };
            Ok(TriggerInfo {
                id,
                value: trigger.value,
                lastchange: trigger.lastchange,
                lastcalc: trigger.lastcalc,
                error,
            })
        })
    }

    /// Current value, `None` for unknown ids.
    pub fn get_value(&self, id: u64) -> TriggerValue {
        if id == 0 {
            return TriggerValue::None;
        }
        self.triggers
            .process(id, ElemFlags::DO_NOT_CREATE, |elem, _| Ok(elem.data().value))
            .unwrap_or(TriggerValue::None)
    }

    pub fn get_value_lastchange(&self, id: u64) -> Result<(TriggerValue, i64)> {
        let info = self.get_info(id)?;
        Ok((info.value, info.lastchange))
    }

    /// Applies a batch of evaluation results. Invalid entries are logged and
    /// counted; the rest of the batch is still applied.
    pub fn apply_diffs(&self, diffs: &[TriggerDiff]) -> Result<()> {
        let mut failed = 0;
        for diff in diffs {
            let info = TriggerInfo {
                id: diff.triggerid,
                value: diff.value,
                lastchange: 0,
                lastcalc: diff.lastchange,
                error: diff.error.clone(),
            };
            if let Err(e) = self.set_info(&info) {
                warn!("Cannot save state of trigger {}: {}", diff.triggerid, e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(StateError::Partial {
                failed,
                total: diffs.len(),
            });
        }
        Ok(())
    }

    pub fn remove(&self, ids: &[u64]) -> usize {
        self.triggers.mass_delete(ids)
    }

    /// Drops triggers not evaluated for `ttl` seconds. A zero ttl keeps everything.
    pub fn housekeep(&self, now: i64, ttl: i64) -> Result<usize> {
        if ttl <= 0 {
            return Ok(0);
        }
        let mut expired = 0;
        self.triggers.iterate(ElemFlags::NONE, |elem, _| {
            if elem.data().lastcalc + ttl < now {
                elem.mark_for_deletion();
                expired += 1;
            }
            Ok(())
        })?;
        if expired > 0 {
            info!("Triggers housekeeping: removed {} triggers not calculated for {}s", expired, ttl);
        }
        Ok(expired)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    // ============================================================================================
    // PERSISTENCE
    // ============================================================================================

    /// Writes every trigger to `<dir>/triggers.gz`. Returns the number written.
    pub fn dump(&self, dir: &Path) -> Result<usize> {
        let mut dumper = StateDumper::create(dir, DUMP_NAME)?;
        let written = self.triggers.snapshot(|elem| {
            let trigger = elem.data();
            dumper.write_json(&TriggerRecord {
                id: elem.id(),
                value: trigger.value.code(),
                lastchange: trigger.lastchange,
                lastcalc: trigger.lastcalc,
                error: trigger.error.as_deref().map(str::to_string),
            })
        })?;
        dumper.finish()?;
        info!("Triggers dump finished: {} triggers", written);
        Ok(written)
    }

    /// Loads `<dir>/triggers.gz`. A missing dump loads nothing.
    pub fn load(&self, dir: &Path) -> Result<usize> {
        let Some(mut loader) = StateLoader::open(dir, DUMP_NAME)? else {
            info!("No triggers dump in {}, starting empty", dir.display());
            return Ok(0);
        };

        let pool = self.triggers.context();
        let mut loaded = 0;
        while let Some(line) = loader.next_record() {
            let record: TriggerRecord = match serde_json::from_value(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Triggers dump line {}: {}, skipped", loader.line_no(), e);
                    continue;
                }
            };
            let Some(value) = TriggerValue::from_code(record.value as i64) else {
                warn!("Triggers dump line {}: bad value {}, skipped", loader.line_no(), record.value);
                continue;
            };
            if record.id == 0 {
                warn!("Triggers dump line {}: zero id, skipped", loader.line_no());
                continue;
            }

            let res = self.triggers.process(record.id, ElemFlags::NONE, |elem, _| {
                let trigger = elem.data_mut();
                trigger.value = value;
                trigger.lastchange = record.lastchange;
                trigger.lastcalc = record.lastcalc;
                trigger.error = pool.replace(trigger.error.take(), record.error.as_deref())?;
                Ok(())
            });
            match res {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Cannot load trigger {}: {}", record.id, e),
            }
        }
        info!("Triggers load finished: {} triggers", loaded);
        Ok(loaded)
    }
}

impl std::fmt::Debug for TriggersState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggersState")
            .field("triggers", &self.triggers.len())
            .finish()
    }
}
