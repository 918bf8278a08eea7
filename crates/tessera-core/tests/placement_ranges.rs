//! Placement against responsible ranges derived from ring neighbors.

use proptest::prelude::*;
use tessera_core::{IdRange, Placement, RingId, VersionKey};

/// Midpoint ranges of a sorted ring, as every node computes its own.
fn midpoint_ranges(nodes: &[RingId]) -> Vec<IdRange> {
    if nodes.len() == 1 {
        return vec![IdRange::Full];
    }
    (0..nodes.len())
        .map(|i| {
            let prev = nodes[(i + nodes.len() - 1) % nodes.len()];
            let next = nodes[(i + 1) % nodes.len()];
            IdRange::new(
                prev.clockwise_midpoint(nodes[i]),
                nodes[i].clockwise_midpoint(next),
            )
        })
        .collect()
}

#[test]
fn evenly_spread_ring_gives_one_fragment_per_node() {
    let step = u128::MAX / 4;
    let nodes: Vec<RingId> = (0..4).map(|i| RingId(i * step)).collect();
    let ranges = midpoint_ranges(&nodes);
    let placement = Placement::new(4);
    let key = VersionKey::new(RingId(17), 0);

    for (index, location) in placement.locations(&key).into_iter().enumerate() {
        assert!(ranges[index].contains(location), "fragment {index}");
    }
}

proptest! {
    #[test]
    fn every_location_has_exactly_one_owner(
        ids in prop::collection::btree_set(any::<u128>(), 1..12),
        object in any::<u128>(),
        version in 0u64..10_000,
    ) {
        let nodes: Vec<RingId> = ids.into_iter().map(RingId).collect();
        let ranges = midpoint_ranges(&nodes);
        let placement = Placement::new(8);
        for location in placement.locations(&VersionKey::new(RingId(object), version)) {
            let owners = ranges.iter().filter(|r| r.contains(location)).count();
            prop_assert_eq!(owners, 1);
        }
    }

    #[test]
    fn shifted_range_holds_the_sibling(
        ccw in any::<u128>(),
        cw in any::<u128>(),
        object in any::<u128>(),
        version in 0u64..10_000,
        offset in 1u32..16,
    ) {
        // Power-of-two fragment counts make sibling offsets exact
        let placement = Placement::new(16);
        let range = IdRange::new(RingId(ccw), RingId(cw));
        let shifted = placement.shift_range(&range, offset);
        for index in 0..16 {
            let here = placement.location(RingId(object), index, version);
            let sibling = placement.location(RingId(object), index + offset, version);
            prop_assert_eq!(range.contains(here), shifted.contains(sibling));
        }
    }
}
