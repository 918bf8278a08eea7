//! Neighbor discovery.

use super::operation::OpInput;
use super::{Engine, OpId};
use crate::message::{Body, Envelope, MessageTag};
use crate::overlay::Destination;
use tessera_core::Timestamp;

impl Engine {
    /// Refresh leaf-set sightings, ask the leaf set for its neighbors,
    /// expire silent nodes and recompute the range.
    pub(super) fn neighbor_round(&mut self, id: OpId, now: Timestamp) {
        let leaf_set = self.overlay.leaf_set();
        for node in &leaf_set {
            self.neighbors.seen(*node, now, now);
        }
        for node in leaf_set {
            if node != self.local_id {
                self.send(Destination::Node(node), id, MessageTag::Neighbor, Body::NeighborRequest);
            }
        }
        for node in self.neighbors.expire(now, self.config.neighbor_timeout_ms) {
            tracing::info!(node = %self.local_id, expired = %node, "Neighbor timed out");
        }
        self.recompute_range();
    }

    pub(super) fn neighbor_input(&mut self, input: OpInput) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(self.periodic.neighbor, &other, "neighbor takes only messages");
                return;
            }
        };
        let Envelope { source, body, .. } = envelope;
        let neighbors = match body {
            Body::NeighborResponse { neighbors } => neighbors,
            other => {
                self.counters.dropped += 1;
                tracing::warn!(node = %self.local_id, from = %source, body = other.name(), "Unexpected message for neighbor discovery");
                return;
            }
        };
        let now = self.now();
        let timeout = self.config.neighbor_timeout_ms;
        self.neighbors.seen(source, now, now);
        let mut learned = 0usize;
        for (node, last_seen) in neighbors {
            if now.saturating_sub(last_seen) > timeout {
                continue;
            }
            self.neighbors.seen(node, last_seen, now);
            learned += 1;
        }
        tracing::trace!(node = %self.local_id, from = %source, learned, "Neighbor response");
        self.recompute_range();
    }
}
