//! Neighbor table and responsible range.
//!
//! A node owns the ring interval between the midpoints to its nearest
//! counter-clockwise and clockwise neighbors. With a single neighbor, that
//! neighbor plays both roles; with none, the node owns the whole ring.

use std::collections::BTreeMap;
use tessera_core::{IdRange, NodeId, Timestamp};

/// Known neighbors and when each was last seen.
#[derive(Debug, Clone)]
pub struct NeighborTable {
    local_id: NodeId,
    last_seen: BTreeMap<NodeId, Timestamp>,
}

impl NeighborTable {
    /// Empty table for `local_id`.
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            last_seen: BTreeMap::new(),
        }
    }

    /// Record a sighting. Timestamps from the future are clamped to `now`,
    /// and a sighting never moves `last_seen` backwards.
    pub fn seen(&mut self, node: NodeId, when: Timestamp, now: Timestamp) {
        if node == self.local_id {
            return;
        }
        let when = when.min(now);
        let entry = self.last_seen.entry(node).or_insert(when);
        *entry = (*entry).max(when);
    }

    /// Forget a node.
    pub fn remove(&mut self, node: &NodeId) -> bool {
        self.last_seen.remove(node).is_some()
    }

    /// Drop neighbors not seen for more than `timeout`. Returns those dropped.
    pub fn expire(&mut self, now: Timestamp, timeout: u64) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_sub(**seen) > timeout)
            .map(|(node, _)| *node)
            .collect();
        for node in &stale {
            self.last_seen.remove(node);
        }
        stale
    }

    /// Known neighbors with their last sighting.
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, Timestamp)> + '_ {
        self.last_seen.iter().map(|(node, seen)| (*node, *seen))
    }

    /// Known neighbor ids.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.last_seen.keys().copied().collect()
    }

    /// Number of known neighbors.
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// Whether no neighbors are known.
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Nearest counter-clockwise and clockwise neighbors.
    pub fn closest(&self) -> Option<(NodeId, NodeId)> {
        let me = self.local_id;
        let ccw = self
            .last_seen
            .keys()
            .min_by_key(|node| node.clockwise_distance(me))?;
        let cw = self
            .last_seen
            .keys()
            .min_by_key(|node| me.clockwise_distance(**node))?;
        Some((*ccw, *cw))
    }

    /// The range this node is responsible for.
    pub fn responsible_range(&self) -> IdRange {
        match self.closest() {
            None => IdRange::Full,
            Some((ccw, cw)) => {
                let me = self.local_id;
                IdRange::new(ccw.clockwise_midpoint(me), me.clockwise_midpoint(cw))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::RingId;

    const QUARTER: u128 = 1 << 126;

    #[test]
    fn alone_owns_everything() {
        let table = NeighborTable::new(RingId(0));
        assert_eq!(table.responsible_range(), IdRange::Full);
    }

    #[test]
    fn two_nodes_split_the_ring() {
        let mut a = NeighborTable::new(RingId(0));
        a.seen(RingId(2 * QUARTER), 0, 0);
        let mut b = NeighborTable::new(RingId(2 * QUARTER));
        b.seen(RingId(0), 0, 0);
        let ra = a.responsible_range();
        let rb = b.responsible_range();
        for probe in [0, QUARTER - 1, QUARTER, 2 * QUARTER, 3 * QUARTER, u128::MAX] {
            assert!(ra.contains(RingId(probe)) ^ rb.contains(RingId(probe)), "probe {probe:x}");
        }
        assert!(ra.contains(RingId(0)));
        assert!(rb.contains(RingId(2 * QUARTER)));
    }

    #[test]
    fn range_is_bounded_by_midpoints() {
        let mut table = NeighborTable::new(RingId(QUARTER));
        table.seen(RingId(0), 0, 0);
        table.seen(RingId(2 * QUARTER), 0, 0);
        table.seen(RingId(3 * QUARTER), 0, 0);
        assert_eq!(
            table.responsible_range(),
            IdRange::new(RingId(QUARTER / 2), RingId(QUARTER + QUARTER / 2))
        );
    }

    #[test]
    fn future_sightings_are_clamped_and_expire() {
        let mut table = NeighborTable::new(RingId(0));
        table.seen(RingId(5), 1_000_000, 100);
        assert_eq!(table.entries().next(), Some((RingId(5), 100)));
        assert!(table.expire(200, 100).is_empty());
        assert_eq!(table.expire(201, 100), vec![RingId(5)]);
        assert!(table.is_empty());
    }

    #[test]
    fn local_id_is_never_a_neighbor() {
        let mut table = NeighborTable::new(RingId(9));
        table.seen(RingId(9), 0, 0);
        assert!(table.is_empty());
    }
}
