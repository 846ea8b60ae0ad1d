//! Tests for the bidirectional object index.

use state::{heap, Memf, ObjIndex, SharedSegment, StateError};
use std::sync::Arc;
use std::thread;

#[test]
fn test_adding_same_edge_twice_is_idempotent() {
    let idx = ObjIndex::new(heap());
    idx.add_ref(1, 2).unwrap();
    idx.add_ref(1, 2).unwrap();

    assert_eq!(idx.get_refs_to(1).unwrap(), vec![2]);
    assert_eq!(idx.get_refs_from(2).unwrap(), vec![1]);

    idx.del_ref(1, 2).unwrap();
    assert!(matches!(idx.get_refs_to(1), Err(StateError::NotFound(1))));
    assert_eq!(idx.num_from(), 0);
    assert_eq!(idx.num_to(), 0);
}

#[test]
fn test_del_id_removes_both_directions() {
    let idx = ObjIndex::new(heap());
    idx.add_ref(1, 2).unwrap();
    idx.add_ref(2, 3).unwrap();
    idx.add_ref(4, 2).unwrap();

    idx.del_id(2).unwrap();
    assert!(idx.get_refs_to(1).is_err());
    assert!(idx.get_refs_to(4).is_err());
    assert!(idx.get_refs_from(3).is_err());
    assert_eq!(idx.num_from(), 0);
    assert_eq!(idx.num_to(), 0);
    assert!(matches!(idx.del_id(2), Err(StateError::NotFound(2))));
}

#[test]
fn test_replace_and_clear() {
    let memf = heap();
    let idx = ObjIndex::new(memf.clone());
    idx.add_ref(1, 2).unwrap();

    let fresh = ObjIndex::new(memf.clone());
    fresh.add_ref(7, 8).unwrap();
    fresh.add_ref(7, 9).unwrap();
    idx.replace(fresh).unwrap();

    assert!(idx.get_refs_to(1).is_err());
    assert_eq!(idx.get_refs_to(7).unwrap(), vec![8, 9]);

    idx.clear();
    assert_eq!(idx.num_from(), 0);
    assert_eq!(idx.num_to(), 0);
}

#[test]
fn test_replace_keeps_segment_accounting_sane() {
    let segment_a: Memf = Arc::new(SharedSegment::new(64 * 1024));
    let segment_b: Memf = Arc::new(SharedSegment::new(64 * 1024));
    let idx = ObjIndex::new(segment_a.clone());

    let other = ObjIndex::new(segment_b.clone());
    for id in 1..=10 {
        other.add_ref(id, 1_000).unwrap();
    }
    assert!(matches!(idx.replace(other), Err(StateError::InvalidArgument(_))));
    assert_eq!(idx.num_from(), 0);

    // segment A was never charged for B's edges, so it still has room
    assert!(segment_a.used() <= 64 * 1024);
    for id in 1..=10 {
        idx.add_ref(id, 1_000).unwrap();
    }
    idx.del_id(1_000).unwrap();
    assert!(segment_a.used() <= 64 * 1024);
    idx.add_ref(5, 6).unwrap();
    assert_eq!(idx.get_refs_to(5).unwrap(), vec![6]);
}

#[test]
fn test_concurrent_edges_to_shared_target() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 250;

    let idx = Arc::new(ObjIndex::new(heap()));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let idx = idx.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let from = t * PER_THREAD + i + 1;
                    idx.add_ref(from, 0xdead).unwrap();
                    idx.add_ref(from, from + 1_000_000).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let sources = idx.get_refs_from(0xdead).unwrap();
    assert_eq!(sources.len(), (THREADS * PER_THREAD) as usize);
    assert!(sources.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(idx.num_from(), (THREADS * PER_THREAD) as usize);
    assert_eq!(idx.num_to(), (THREADS * PER_THREAD) as usize + 1);
}
