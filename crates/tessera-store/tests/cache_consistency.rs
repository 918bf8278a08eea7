//! The metadata cache against a backend that changes underneath it.

use assert_matches::assert_matches;
use proptest::prelude::*;
use tessera_core::{Fragment, FragmentKey, Hash32, Manifest, RingId, StoredFragment, VersionKey};
use tessera_store::{FragmentStore, MemoryStorage, StorageBackend, StoreError};

fn stored(expiration: u64, payload: &[u8]) -> StoredFragment {
    let fragment = Fragment::new(payload.to_vec());
    let manifest = Manifest {
        object_hash: Hash32::of(payload),
        fragment_hashes: vec![fragment.hash()],
        expiration,
        signature: vec![0; 64],
    };
    StoredFragment::new(fragment, manifest)
}

fn key(object: u128, index: u32) -> FragmentKey {
    VersionKey::new(RingId(object), 1).fragment(index)
}

#[test]
fn value_lost_behind_the_store_is_evicted_on_read() {
    let backend = MemoryStorage::new();
    let mut store = FragmentStore::open(Box::new(backend.clone())).unwrap();
    store.insert(key(1, 0), stored(500, b"lost"), 10).unwrap();

    let mut side = backend.clone();
    assert!(side.delete(&key(1, 0)).unwrap());

    assert_matches!(store.get(&key(1, 0)), Err(StoreError::Inconsistent { .. }));
    assert!(!store.contains(&key(1, 0)));
    assert_eq!(store.get(&key(1, 0)).unwrap(), None);
}

#[test]
fn remove_tolerates_a_value_already_gone() {
    let backend = MemoryStorage::new();
    let mut store = FragmentStore::open(Box::new(backend.clone())).unwrap();
    store.insert(key(2, 3), stored(500, b"gone"), 10).unwrap();
    let mut side = backend.clone();
    side.delete(&key(2, 3)).unwrap();

    assert_eq!(store.remove(&key(2, 3)).unwrap(), None);
    assert!(store.is_empty());
}

#[test]
fn failed_refresh_keeps_the_old_manifest() {
    let backend = MemoryStorage::new();
    let mut store = FragmentStore::open(Box::new(backend.clone())).unwrap();
    store.insert(key(3, 1), stored(500, b"keep"), 10).unwrap();

    backend.set_failing(true);
    let later = stored(900, b"keep").manifest;
    assert!(store.replace_manifest(&key(3, 1), later).is_err());
    backend.set_failing(false);

    let meta = store.metadata(&key(3, 1)).unwrap();
    assert_eq!((meta.current_expiration, meta.previous_expiration), (500, 0));
    assert_eq!(store.get(&key(3, 1)).unwrap().unwrap().manifest.expiration, 500);
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u32, u64),
    Refresh(u32, u64),
    Remove(u32),
    Fail(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..6, 1u64..1000).prop_map(|(i, e)| Op::Insert(i, e)),
        (0u32..6, 1u64..1000).prop_map(|(i, e)| Op::Refresh(i, e)),
        (0u32..6).prop_map(Op::Remove),
        any::<bool>().prop_map(Op::Fail),
    ]
}

proptest! {
    #[test]
    fn cache_mirrors_backend_under_failures(ops in prop::collection::vec(op(), 1..40)) {
        let backend = MemoryStorage::new();
        let mut store = FragmentStore::open(Box::new(backend.clone())).unwrap();
        for op in ops {
            match op {
                Op::Insert(index, expiration) => {
                    let _ = store.insert(key(9, index), stored(expiration, b"p"), 0);
                }
                Op::Refresh(index, expiration) => {
                    let _ = store.replace_manifest(&key(9, index), stored(expiration, b"p").manifest);
                }
                Op::Remove(index) => {
                    let _ = store.remove(&key(9, index));
                }
                Op::Fail(failing) => backend.set_failing(failing),
            }
        }
        backend.set_failing(false);

        let cached: Vec<_> = store.entries().map(|(k, m)| (*k, *m)).collect();
        let mut persisted = Vec::new();
        for k in backend.scan().unwrap() {
            persisted.push((k, backend.metadata(&k).unwrap().unwrap()));
        }
        prop_assert_eq!(&cached, &persisted);

        let reopened = FragmentStore::open(Box::new(backend)).unwrap();
        let again: Vec<_> = reopened.entries().map(|(k, m)| (*k, *m)).collect();
        prop_assert_eq!(cached, again);
    }
}
