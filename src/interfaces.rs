//! Interface availability and the address-to-host index.
//!
//! Addresses are interned in a [`BinPool`]: the element id of an address in
//! the index is the identity of its pooled copy, so looking an address up
//! is a pool lookup followed by an id lookup. Each index element keeps one
//! reference on its address, which keeps the id stable for as long as the
//! element exists.

use crate::algo::intern::{BinPool, PooledBin, PooledStr, StrPool};
use crate::elems_hash::{ElemFlags, ElemPayload, ElemsHash};
use crate::error::{Result, StateError};
use crate::memory::Memf;
use crate::types::Clock;
use std::sync::Arc;

/// Availability of one interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Availability record as seen by callers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InterfaceInfo {
    pub available: Availability,
    /// When availability last changed
    pub lastchange: i64,
    pub error: Option<String>,
}

pub struct InterfaceElem {
    available: Availability,
    lastchange: i64,
    error: Option<PooledStr>,
}

impl ElemPayload for InterfaceElem {
    type Context = Arc<StrPool>;

    fn create(_id: u64, _memf: &Memf, _pool: &Arc<StrPool>) -> Result<Self> {
        Ok(InterfaceElem {
            available: Availability::Unknown,
            lastchange: 0,
            error: None,
        })
    }

    fn release(&mut self, _id: u64, _memf: &Memf, pool: &Arc<StrPool>) {
        if let Some(error) = self.error.take() {
            pool.free(error);
        }
    }
}

/// Host owning an address; holds the index's reference on the address.
pub struct HostRef {
    hostid: u64,
    addr: Option<PooledBin>,
}

impl ElemPayload for HostRef {
    type Context = Arc<BinPool>;

    fn create(_id: u64, _memf: &Memf, _pool: &Arc<BinPool>) -> Result<Self> {
        Ok(HostRef {
            hostid: 0,
            addr: None,
        })
    }

    fn release(&mut self, _id: u64, _memf: &Memf, pool: &Arc<BinPool>) {
        if let Some(addr) = self.addr.take() {
            pool.free(addr);
        }
    }
}

pub struct InterfacesState {
    interfaces: ElemsHash<InterfaceElem>,
    ip_index: ElemsHash<HostRef>,
    clock: Arc<dyn Clock>,
}

impl InterfacesState {
    pub fn new(memf: Memf, strpool: Arc<StrPool>, clock: Arc<dyn Clock>) -> Self {
        let binpool = Arc::new(BinPool::new(memf.clone()));
        Self {
            interfaces: ElemsHash::new(memf.clone(), strpool),
            ip_index: ElemsHash::new(memf, binpool),
            clock,
        }
    }

    // ============================================================================================
    // AVAILABILITY
    // ============================================================================================

    /// Records availability of an interface; `lastchange` moves when it differs.
    pub fn set_availability(&self, interfaceid: u64, available: Availability, error: Option<&str>) -> Result<()> {
        let pool = self.interfaces.context();
        let now = self.clock.now();
        self.interfaces.process(interfaceid, ElemFlags::NONE, |elem, _| {
            let iface = elem.data_mut();
            if iface.available != available {
                iface.available = available;
                iface.lastchange = now;
            }
            iface.error = pool.replace(iface.error.take(), error)?;
            Ok(())
        })
    }

    pub fn get_info(&self, interfaceid: u64) -> Result<InterfaceInfo> {
        self.interfaces
            .process(interfaceid, ElemFlags::DO_NOT_CREATE, |elem, _| {
                let iface = elem.data();
                Ok(InterfaceInfo {
                    available: iface.available,
                    lastchange: iface.lastchange,
                    error: iface.error.as_deref().map(str::to_string),
                })
            })
    }

    pub fn remove(&self, interfaceids: &[u64]) -> usize {
        self.interfaces.mass_delete(interfaceids)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    // ============================================================================================
    // ADDRESS INDEX
    // ============================================================================================

    /// Maps `addr` to `hostid`, replacing an earlier mapping of the same address.
    pub fn register_ip(&self, addr: &str, hostid: u64) -> Result<()> {
        if addr.is_empty() || hostid == 0 {
            return Err(StateError::InvalidArgument(format!(
                "cannot register address '{}' for host {}",
                addr, hostid
            )));
        }
        let pool = self.ip_index.context();
        let pooled = pool.add(addr.as_bytes())?;
        let res = self.ip_index.process(pooled.id(), ElemFlags::NONE, |elem, _| {
            let host = elem.data_mut();
            host.hostid = hostid;
            if host.addr.is_none() {
                host.addr = Some(pool.copy(&pooled)?);
            }
            Ok(())
        });
        pool.free(pooled);
        res
    }

    /// Host registered for `addr`.
    pub fn find_host_by_ip(&self, addr: &str) -> Option<u64> {
        let id = self.ip_index.context().lookup(addr.as_bytes())?;
        self.ip_index
            .process(id, ElemFlags::DO_NOT_CREATE, |elem, _| Ok(elem.data().hostid))
            .ok()
    }

    /// Forgets the mapping of `addr`.
    pub fn release_ip(&self, addr: &str) -> Result<()> {
        let id = self
            .ip_index
            .context()
            .lookup(addr.as_bytes())
            .ok_or_else(|| StateError::InvalidArgument(format!("address '{}' is not registered", addr)))?;
        self.ip_index.delete(id)
    }

    /// Number of registered addresses
    pub fn registered_ips(&self) -> usize {
        self.ip_index.len()
    }
}

impl std::fmt::Debug for InterfacesState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfacesState")
            .field("interfaces", &self.interfaces.len())
            .field("registered_ips", &self.ip_index.len())
            .finish()
    }
}
