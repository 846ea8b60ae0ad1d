//! Bidirectional id→id multimap on two element hashes.
//!
//! `from_to[a]` holds every `b` with an edge `a -> b`, `to_from[b]` holds every
//! `a`. Lists are kept sorted and deduplicated, and a list that becomes empty
//! is removed from its table through the element deletion path.
//!
//! The two sides are updated one after the other, each under its own element
//! lock. An `add_ref` whose second side fails takes the first side back out.
//! `del_id_from`/`del_id_to` copy the adjacency list first and clean the
//! back-edges afterwards: an edge added to the same id in between may be left
//! on the other side until it is deleted explicitly. Callers that mutate one
//! id from several threads must serialize those calls themselves.

use crate::algo::vector::Vector;
use crate::elems_hash::{ElemFlags, ElemPayload, Element, ElemsHash};
use crate::error::{Result, StateError};
use crate::memory::{same_region, Memf};
use log::{info, warn};

/// Sorted adjacency list of one id.
pub struct RefList {
    refs: Vector<u64>,
}

impl ElemPayload for RefList {
    type Context = ();

    fn create(_id: u64, memf: &Memf, _ctx: &()) -> Result<Self> {
        Ok(RefList {
            refs: Vector::new(memf.clone()),
        })
    }
}

/// Returns whether the edge is new.
fn add_ref_cb(elem: &mut Element<RefList>, id: u64) -> Result<bool> {
    if elem.data().refs.binary_search(&id).is_ok() {
        return Ok(false);
    }
    if let Err(e) = elem.data_mut().refs.push(id) {
        if elem.data().refs.is_empty() {
            elem.mark_for_deletion();
        }
        return Err(e);
    }
    elem.data_mut().refs.sort_dedup();
    Ok(true)
}

fn del_ref_cb(elem: &mut Element<RefList>, id: u64) -> Result<()> {
    let refs = &mut elem.data_mut().refs;
    refs.remove_sorted(&id);
    if refs.is_empty() {
        elem.mark_for_deletion();
    }
    Ok(())
}

fn ignore_absent(res: Result<()>) -> Result<()> {
    match res {
        Err(StateError::NotFound(_)) => Ok(()),
        other => other,
    }
}

pub struct ObjIndex {
    from_to: ElemsHash<RefList>,
    to_from: ElemsHash<RefList>,
}

impl ObjIndex {
    pub fn new(memf: Memf) -> Self {
        Self {
            from_to: ElemsHash::new(memf.clone(), ()),
            to_from: ElemsHash::new(memf, ()),
        }
    }

    /// Adds the edge `from -> to`. Adding an existing edge changes nothing.
    pub fn add_ref(&self, from: u64, to: u64) -> Result<()> {
        let added = self
            .from_to
            .process(from, ElemFlags::NONE, |elem, _| add_ref_cb(elem, to))?;
        match self
            .to_from
            .process(to, ElemFlags::NONE, |elem, _| add_ref_cb(elem, from))
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if added {
                    if let Err(undo) = self
                        .from_to
                        .process(from, ElemFlags::DO_NOT_CREATE, |elem, _| del_ref_cb(elem, to))
                    {
                        warn!("Cannot take back edge {} -> {}: {}", from, to, undo);
                    }
                }
                Err(e)
            }
        }
    }

    /// Removes the edge `from -> to` from both sides.
    pub fn del_ref(&self, from: u64, to: u64) -> Result<()> {
        let forward = self
            .from_to
            .process(from, ElemFlags::DO_NOT_CREATE, |elem, _| del_ref_cb(elem, to));
        let backward = self
            .to_from
            .process(to, ElemFlags::DO_NOT_CREATE, |elem, _| del_ref_cb(elem, from));
        forward.and(backward)
    }

    /// Removes every edge leaving `id`.
    pub fn del_id_from(&self, id: u64) -> Result<()> {
        let targets = self.get_refs_to(id)?;
        for to in targets {
            ignore_absent(
                self.to_from
                    .process(to, ElemFlags::DO_NOT_CREATE, |elem, _| del_ref_cb(elem, id)),
            )?;
        }
        ignore_absent(self.from_to.delete(id))
    }

    /// Removes every edge arriving at `id`.
    pub fn del_id_to(&self, id: u64) -> Result<()> {
        let sources = self.get_refs_from(id)?;
        for from in sources {
            ignore_absent(
                self.from_to
                    .process(from, ElemFlags::DO_NOT_CREATE, |elem, _| del_ref_cb(elem, id)),
            )?;
        }
        ignore_absent(self.to_from.delete(id))
    }

    /// Removes `id` from the graph in both directions.
    pub fn del_id(&self, id: u64) -> Result<()> {
        let from = self.del_id_from(id);
        let to = self.del_id_to(id);
        match (from, to) {
            (Err(StateError::NotFound(_)), Err(StateError::NotFound(_))) => {
                Err(StateError::NotFound(id))
            }
            (Err(StateError::NotFound(_)), other) | (other, Err(StateError::NotFound(_))) => other,
            (from, to) => from.and(to),
        }
    }

    /// Ids that `from` points to.
    pub fn get_refs_to(&self, from: u64) -> Result<Vec<u64>> {
        self.from_to
            .process(from, ElemFlags::DO_NOT_CREATE, |elem, _| Ok(elem.data().refs.to_vec()))
    }

    /// Ids pointing to `to`.
    pub fn get_refs_from(&self, to: u64) -> Result<Vec<u64>> {
        self.to_from
            .process(to, ElemFlags::DO_NOT_CREATE, |elem, _| Ok(elem.data().refs.to_vec()))
    }

    /// Swaps in the whole graph of `new`, which must share this index's region.
    pub fn replace(&self, new: ObjIndex) -> Result<()> {
        let ObjIndex { from_to, to_from } = new;
        if !same_region(self.from_to.memf(), from_to.memf())
            || !same_region(self.to_from.memf(), to_from.memf())
        {
            return Err(StateError::InvalidArgument(
                "replacement index lives in a different memory region".to_string(),
            ));
        }
        self.from_to.replace(from_to)?;
        self.to_from.replace(to_from)
    }

    /// Drops every edge.
    pub fn clear(&self) {
        self.from_to.retain_ids(&[]);
        self.to_from.retain_ids(&[]);
    }

    /// Number of ids with outgoing edges
    pub fn num_from(&self) -> usize {
        self.from_to.len()
    }

    /// Number of ids with incoming edges
    pub fn num_to(&self) -> usize {
        self.to_from.len()
    }

    /// Writes both directions to the log.
    pub fn dump_to_log(&self) {
        for (name, table) in [("from -> to", &self.from_to), ("to -> from", &self.to_from)] {
            info!("Object index {} dump:", name);
            let res = table.snapshot(|elem| {
                let refs: Vec<String> = elem.data().refs.iter().map(|r| r.to_string()).collect();
                info!("Key: {} -> [{}]", elem.id(), refs.join(", "));
                Ok(())
            });
            if let Err(e) = res {
                warn!("Object index {} dump stopped: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{heap, SharedSegment};
    use std::sync::Arc;

    #[test]
    fn test_add_ref_both_directions() {
        let idx = ObjIndex::new(heap());
        idx.add_ref(1, 3).unwrap();
        idx.add_ref(1, 2).unwrap();
        idx.add_ref(4, 2).unwrap();

        assert_eq!(idx.get_refs_to(1).unwrap(), vec![2, 3]);
        assert_eq!(idx.get_refs_from(2).unwrap(), vec![1, 4]);
        assert_eq!(idx.num_from(), 2);
        assert_eq!(idx.num_to(), 2);
    }

    #[test]
    fn test_del_ref_removes_empty_lists() {
        let idx = ObjIndex::new(heap());
        idx.add_ref(1, 2).unwrap();
        idx.del_ref(1, 2).unwrap();
        assert!(matches!(idx.get_refs_to(1), Err(StateError::NotFound(1))));
        assert!(matches!(idx.get_refs_from(2), Err(StateError::NotFound(2))));
        assert!(idx.del_ref(1, 2).is_err());
    }

    #[test]
    fn test_del_id_from_and_to() {
        let idx = ObjIndex::new(heap());
        idx.add_ref(1, 10).unwrap();
        idx.add_ref(1, 11).unwrap();
        idx.add_ref(2, 10).unwrap();

        idx.del_id_from(1).unwrap();
        assert_eq!(idx.get_refs_from(10).unwrap(), vec![2]);
        assert!(idx.get_refs_from(11).is_err());

        idx.del_id_to(10).unwrap();
        assert!(idx.get_refs_to(2).is_err());
        assert_eq!(idx.num_from(), 0);
        assert_eq!(idx.num_to(), 0);
    }

    #[test]
    fn test_del_id_both_sides() {
        let idx = ObjIndex::new(heap());
        idx.add_ref(1, 2).unwrap();
        idx.add_ref(2, 3).unwrap();
        idx.del_id(2).unwrap();
        assert!(idx.get_refs_to(1).is_err());
        assert!(idx.get_refs_from(3).is_err());
        assert!(matches!(idx.del_id(2), Err(StateError::NotFound(2))));
    }

    #[test]
    fn test_replace_and_clear() {
        let memf = heap();
        let idx = ObjIndex::new(memf.clone());
        idx.add_ref(1, 2).unwrap();

        let fresh = ObjIndex::new(memf);
        fresh.add_ref(7, 8).unwrap();
        idx.replace(fresh).unwrap();
        assert!(idx.get_refs_to(1).is_err());
        assert_eq!(idx.get_refs_to(7).unwrap(), vec![8]);

        idx.clear();
        assert_eq!(idx.num_from(), 0);
        assert_eq!(idx.num_to(), 0);
    }

    #[test]
    fn test_replace_from_other_region_rejected() {
        let segment_a: Memf = Arc::new(SharedSegment::new(64 * 1024));
        let segment_b: Memf = Arc::new(SharedSegment::new(64 * 1024));
        let idx = ObjIndex::new(segment_a.clone());
        idx.add_ref(1, 2).unwrap();

        let other = ObjIndex::new(segment_b.clone());
        for id in 10..20 {
            other.add_ref(id, id + 100).unwrap();
        }
        let used_a = segment_a.used();

        assert!(matches!(idx.replace(other), Err(StateError::InvalidArgument(_))));
        assert_eq!(idx.get_refs_to(1).unwrap(), vec![2]);
        assert_eq!(segment_a.used(), used_a);

        idx.del_id(1).unwrap();
        assert!(segment_a.used() < used_a);
        idx.add_ref(3, 4).unwrap();
    }

    #[test]
    fn test_dump_to_log_leaves_index_intact() {
        let idx = ObjIndex::new(heap());
        idx.add_ref(1, 2).unwrap();
        idx.add_ref(1, 3).unwrap();
        idx.dump_to_log();
        assert_eq!(idx.get_refs_to(1).unwrap(), vec![2, 3]);
        assert_eq!(idx.num_to(), 2);
    }

    #[test]
    fn test_failed_add_leaves_no_half_edge() {
        let memf: Memf = Arc::new(SharedSegment::new(16 * 1024));
        let idx = ObjIndex::new(memf.clone());

        // the target's list keeps growing until a reservation fails
        let mut failed = None;
        for from in 1..10_000u64 {
            match idx.add_ref(from, 0) {
                Ok(()) => {}
                Err(StateError::ResourceExhausted { .. }) => {
                    failed = Some(from);
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        let failed = failed.expect("segment never filled up");

        assert!(matches!(idx.get_refs_to(failed), Err(StateError::NotFound(_))));
        let sources = idx.get_refs_from(0).unwrap();
        assert_eq!(sources.len(), (failed - 1) as usize);
        assert!(!sources.contains(&failed));
        assert_eq!(idx.num_from(), sources.len());
        assert!(memf.failures() > 0);
    }
}
