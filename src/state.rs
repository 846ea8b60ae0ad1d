use crate::algo::intern::StrPool;
use crate::config::StateConfig;
use crate::error::{Result, StateError};
use crate::history::HistoryStore;
use crate::interfaces::InterfacesState;
use crate::items::{ItemsState, ItemsStats};
use crate::memory::{heap, Memf, SharedSegment};
use crate::obj_index::ObjIndex;
use crate::triggers::TriggersState;
use crate::types::{now_ms, Clock, SystemClock};
use log::info;
use std::sync::Arc;

// ================================================================================================
// STATISTICS
// ================================================================================================

/// Memory region usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub used: usize,
    /// `None` for the unbounded heap
    pub capacity: Option<usize>,
    /// Reservations the region refused
    pub failures: u64,
}

/// Snapshot of every table.
#[derive(Clone, Debug, Default)]
pub struct StateStats {
    pub items: ItemsStats,
    pub triggers: usize,
    pub interfaces: usize,
    pub registered_ips: usize,
    pub trigger_deps: usize,
    pub interned_strings: usize,
    pub memory: MemoryStats,
    /// Milliseconds since UNIX epoch
    pub created_at: u64,
}

/// Counts of one dump or load pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub items: usize,
    pub values: usize,
    pub triggers: usize,
}

// ================================================================================================
// STATE
// ================================================================================================

/// Aggregate of all state tables of one process.
///
/// # Architecture
/// - One memory region shared by every table and pool
/// - One string pool shared by item, trigger and interface errors
/// - Items, triggers and interfaces each in their own element hash
/// - Trigger dependencies (trigger -> item) in an object index
///
/// Tables are independent: a write to one never blocks another.
pub struct GlbState {
    config: StateConfig,
    memf: Memf,
    strpool: Arc<StrPool>,
    items: ItemsState,
    triggers: TriggersState,
    interfaces: InterfacesState,
    /// trigger -> items it depends on
    trigger_deps: ObjIndex,
    clock: Arc<dyn Clock>,
    created_at: u64,
}

impl GlbState {
    /// Creates empty tables on the wall clock.
    ///
    /// A non-zero `cache_size` in `config` places every table in a fixed-size
    /// segment; otherwise the tables live on the unbounded heap.
    pub fn new(config: StateConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self::with_clock(config, history, Arc::new(SystemClock))
    }

    /// Creates empty tables driven by `clock`.
    pub fn with_clock(config: StateConfig, history: Arc<dyn HistoryStore>, clock: Arc<dyn Clock>) -> Self {
        let memf: Memf = if config.cache_size > 0 {
            Arc::new(SharedSegment::new(config.cache_size))
        } else {
            heap()
        };
        let strpool = Arc::new(StrPool::new(memf.clone()));

        GlbState {
            items: ItemsState::new(memf.clone(), strpool.clone(), history, clock.clone()),
            triggers: TriggersState::new(memf.clone(), strpool.clone(), clock.clone()),
            interfaces: InterfacesState::new(memf.clone(), strpool.clone(), clock.clone()),
            trigger_deps: ObjIndex::new(memf.clone()),
            config,
            memf,
            strpool,
            clock,
            created_at: now_ms(),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn items(&self) -> &ItemsState {
        &self.items
    }

    pub fn triggers(&self) -> &TriggersState {
        &self.triggers
    }

    pub fn interfaces(&self) -> &InterfacesState {
        &self.interfaces
    }

    pub fn trigger_deps(&self) -> &ObjIndex {
        &self.trigger_deps
    }

    // ============================================================================================
    // TRIGGER DEPENDENCIES
    // ============================================================================================

    /// Records that `triggerid` is calculated from `itemid`.
    pub fn add_trigger_dependency(&self, triggerid: u64, itemid: u64) -> Result<()> {
        self.trigger_deps.add_ref(triggerid, itemid)
    }

    /// Triggers to recalculate when `itemid` receives a value.
    pub fn dependent_triggers(&self, itemid: u64) -> Result<Vec<u64>> {
        match self.trigger_deps.get_refs_from(itemid) {
            Err(StateError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Removes triggers together with their dependency edges.
    pub fn remove_triggers(&self, triggerids: &[u64]) -> Result<usize> {
        for &id in triggerids {
            without_edges(self.trigger_deps.del_id_from(id))?;
        }
        Ok(self.triggers.remove(triggerids))
    }

    /// Removes items together with the edges pointing at them.
    pub fn remove_items(&self, itemids: &[u64]) -> Result<usize> {
        for &id in itemids {
            without_edges(self.trigger_deps.del_id_to(id))?;
        }
        Ok(self.items.remove(itemids))
    }

    // ============================================================================================
    // LIFECYCLE
    // ============================================================================================

    /// Loads the dumps from the configured directory. Missing dumps load nothing.
    pub fn load(&self) -> Result<PersistStats> {
        let dir = &self.config.dump_dir;
        info!("Loading state from {}", dir.display());
        let (items, values) = self.items.load(dir)?;
        let triggers = self.triggers.load(dir)?;
        Ok(PersistStats {
            items,
            values,
            triggers,
        })
    }

    /// Dumps items and triggers to the configured directory.
    pub fn dump(&self) -> Result<PersistStats> {
        let dir = &self.config.dump_dir;
        let (items, values) = self.items.dump(dir)?;
        let triggers = self.triggers.dump(dir)?;
        Ok(PersistStats {
            items,
            values,
            triggers,
        })
    }

    /// Applies the configured ttls. Returns the number of removed elements.
    pub fn housekeep(&self) -> Result<usize> {
        let now = self.clock.now();
        let items = self.items.housekeep(now, self.config.item_ttl_secs)?;
        let triggers = self.triggers.housekeep(now, self.config.trigger_ttl_secs)?;
        Ok(items + triggers)
    }

    pub fn memory(&self) -> MemoryStats {
        MemoryStats {
            used: self.memf.used(),
            capacity: self.memf.capacity(),
            failures: self.memf.failures(),
        }
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            items: self.items.stats(),
            triggers: self.triggers.len(),
            interfaces: self.interfaces.len(),
            registered_ips: self.interfaces.registered_ips(),
            trigger_deps: self.trigger_deps.num_from(),
            interned_strings: self.strpool.len(),
            memory: self.memory(),
            created_at: self.created_at,
        }
    }
}

/// An id without edges has nothing to remove.
fn without_edges(res: Result<()>) -> Result<()> {
    match res {
        Err(StateError::NotFound(_)) => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for GlbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlbState")
            .field("items", &self.items)
            .field("triggers", &self.triggers)
            .field("interfaces", &self.interfaces)
            .field("memory", &self.memory())
            .finish()
    }
}
