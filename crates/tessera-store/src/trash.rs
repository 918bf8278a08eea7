//! Recently deleted fragments.
//!
//! Fragments handed off to another node are parked here for a while so a
//! later repair on this node can recover them without network traffic.
//! Entries leave after `retention` or when `capacity` forces out the oldest.

use std::collections::{BTreeMap, VecDeque};
use tessera_core::{FragmentKey, StoredFragment, Timestamp};

/// Bounded, time-limited holding area for deleted fragments.
#[derive(Debug)]
pub struct TrashStore {
    retention: u64,
    capacity: usize,
    entries: BTreeMap<FragmentKey, (StoredFragment, Timestamp)>,
    order: VecDeque<(Timestamp, FragmentKey)>,
}

impl TrashStore {
    /// Trash keeping at most `capacity` entries for `retention` ms each.
    pub fn new(retention: u64, capacity: usize) -> Self {
        Self {
            retention,
            capacity,
            entries: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Park a deleted fragment.
    pub fn insert(&mut self, key: FragmentKey, stored: StoredFragment, now: Timestamp) {
        if self.capacity == 0 {
            return;
        }
        self.entries.insert(key, (stored, now));
        self.order.push_back((now, key));
        while self.entries.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    /// Look up a parked fragment that has not yet aged out.
    pub fn get(&self, key: &FragmentKey, now: Timestamp) -> Option<&StoredFragment> {
        self.entries
            .get(key)
            .filter(|(_, deleted_at)| now.saturating_sub(*deleted_at) <= self.retention)
            .map(|(stored, _)| stored)
    }

    /// Drop entries older than the retention period.
    pub fn purge(&mut self, now: Timestamp) -> usize {
        let mut purged = 0;
        while let Some(&(deleted_at, key)) = self.order.front() {
            if now.saturating_sub(deleted_at) <= self.retention {
                break;
            }
            self.order.pop_front();
            if self.is_current(&key, deleted_at) {
                self.entries.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    /// Number of parked fragments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the trash is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Order entries can be stale when a key was re-inserted; those are skipped.
    fn pop_oldest(&mut self) -> bool {
        while let Some((deleted_at, key)) = self.order.pop_front() {
            if self.is_current(&key, deleted_at) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn is_current(&self, key: &FragmentKey, deleted_at: Timestamp) -> bool {
        matches!(self.entries.get(key), Some((_, at)) if *at == deleted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Fragment, Hash32, Manifest, RingId, VersionKey};

    fn stored() -> StoredFragment {
        StoredFragment::new(
            Fragment::new(vec![1]),
            Manifest {
                object_hash: Hash32::of(b"o"),
                fragment_hashes: vec![],
                expiration: 0,
                signature: vec![],
            },
        )
    }

    fn key(index: u32) -> FragmentKey {
        VersionKey::new(RingId(1), 0).fragment(index)
    }

    #[test]
    fn entries_age_out() {
        let mut trash = TrashStore::new(100, 10);
        trash.insert(key(0), stored(), 0);
        assert!(trash.get(&key(0), 100).is_some());
        assert!(trash.get(&key(0), 101).is_none());
        assert_eq!(trash.purge(101), 1);
        assert!(trash.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut trash = TrashStore::new(1_000, 2);
        trash.insert(key(0), stored(), 0);
        trash.insert(key(1), stored(), 1);
        trash.insert(key(2), stored(), 2);
        assert_eq!(trash.len(), 2);
        assert!(trash.get(&key(0), 2).is_none());
        assert!(trash.get(&key(2), 2).is_some());
    }

    #[test]
    fn reinsert_refreshes_position() {
        let mut trash = TrashStore::new(1_000, 2);
        trash.insert(key(0), stored(), 0);
        trash.insert(key(1), stored(), 1);
        trash.insert(key(0), stored(), 2);
        trash.insert(key(2), stored(), 3);
        assert!(trash.get(&key(0), 3).is_some());
        assert!(trash.get(&key(1), 3).is_none());
    }
}
