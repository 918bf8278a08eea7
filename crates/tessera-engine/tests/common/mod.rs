//! Helpers shared by the engine integration tests.

#![allow(dead_code)]

use tessera_core::{Object, RingId, VersionKey};
use tessera_testkit::{test_object, SimNetwork};

/// Nodes in the standard test ring.
pub const NODES: usize = 4;

/// An object whose fragment `i` lands well inside the range of node `i` of
/// [`SimNetwork::small`], a quarter of the way to the next node.
pub fn placed_object(seq: u128, len: usize) -> Object {
    let first = SimNetwork::spread(NODES)[0];
    let step = u128::MAX / NODES as u128;
    let mut object = test_object(seq, len);
    object.key = VersionKey::new(RingId(first.0 + step / 4 + seq), 0);
    object
}

/// Expiration `ms` after the network's current time.
pub fn expires_in(network: &SimNetwork, ms: u64) -> u64 {
    network.now() + ms
}
