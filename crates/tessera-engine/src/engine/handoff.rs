//! Range-change handoff.
//!
//! Push: fragments whose location left our range are offered to the node
//! now responsible. Once that node holds a current copy, ours moves to the
//! trash. Pull: after our range changes, neighbors are asked what they hold
//! inside it and missing fragments are fetched and validated like any
//! other pushed data.

use super::operation::OpInput;
use super::Engine;
use crate::message::{Body, DataItem, Envelope, FetchedItem, MessageTag, QueryEntry};
use crate::overlay::Destination;
use std::collections::BTreeMap;
use tessera_core::{FragmentKey, NodeId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffStage {
    Queried,
    Pushed(NodeId),
}

#[derive(Default)]
pub(crate) struct HandoffState {
    /// Set when the range changed since the last round.
    pub pull_requested: bool,
    pending: BTreeMap<FragmentKey, HandoffStage>,
}

impl Engine {
    pub(super) fn handoff_round(&mut self, id: super::OpId, state: &mut HandoffState, now: Timestamp) {
        if !state.pending.is_empty() {
            tracing::debug!(node = %self.local_id, unresolved = state.pending.len(), "Handoffs from last round unresolved");
            state.pending.clear();
        }

        let placement = self.placement;
        let range = self.range;
        let outgoing: Vec<FragmentKey> = self
            .store
            .entries()
            .filter(|(key, metadata)| {
                !range.contains(placement.location_of(key)) && !metadata.is_expired(now)
            })
            .map(|(key, _)| *key)
            .take(self.config.handoff_max_fragments)
            .collect();
        if !outgoing.is_empty() {
            tracing::debug!(node = %self.local_id, fragments = outgoing.len(), "Offering out-of-range fragments");
        }
        for key in outgoing {
            state.pending.insert(key, HandoffStage::Queried);
            let location = self.location(&key);
            self.send(
                Destination::Key(location),
                id,
                MessageTag::Handoff,
                Body::Query { keys: vec![key] },
            );
        }

        if state.pull_requested {
            state.pull_requested = false;
            let neighbors = self.neighbors.nodes();
            tracing::debug!(node = %self.local_id, range = %range, neighbors = neighbors.len(), "Asking neighbors for holdings in new range");
            for node in neighbors {
                self.send(
                    Destination::Node(node),
                    id,
                    MessageTag::Handoff,
                    Body::HoldingsQuery { range },
                );
            }
        }
    }

    pub(super) fn handoff_input(&mut self, state: &mut HandoffState, input: OpInput) {
        let id = self.periodic.handoff;
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(id, &other, "handoff takes only messages");
                return;
            }
        };
        let now = self.now();
        let Envelope { source, body, .. } = envelope;
        match body {
            Body::QueryResponse { entries } => {
                for entry in entries {
                    self.handoff_answer(state, source, entry, now);
                }
            }
            Body::Receipt { keys } => {
                for key in keys {
                    if state.pending.get(&key) == Some(&HandoffStage::Pushed(source)) {
                        state.pending.remove(&key);
                        self.retire(&key, now);
                    }
                }
            }
            Body::Holdings { keys } => {
                let wanted: Vec<FragmentKey> = keys
                    .into_iter()
                    .filter(|key| {
                        key.index < self.config.num_fragments
                            && self.is_responsible(key)
                            && !self.store.contains(key)
                            && !self.shaper.is_pending(key)
                    })
                    .take(self.config.handoff_max_fragments)
                    .collect();
                for chunk in wanted.chunks(self.config.manifest_aggregation_factor) {
                    self.send(
                        Destination::Node(source),
                        id,
                        MessageTag::Handoff,
                        Body::Fetch {
                            keys: chunk.to_vec(),
                            manifest_only: false,
                        },
                    );
                }
            }
            Body::FetchResponse { items } => {
                for FetchedItem {
                    key,
                    fragment,
                    manifest,
                } in items
                {
                    let (Some(fragment), Some(manifest)) = (fragment, manifest) else {
                        tracing::debug!(node = %self.local_id, key = %key, from = %source, "Handoff source no longer has fragment");
                        continue;
                    };
                    let item = DataItem {
                        key,
                        fragment: Some(fragment),
                        manifest,
                    };
                    match self.accept_item(&item, MessageTag::Handoff, now) {
                        Ok(acceptance) => {
                            tracing::debug!(node = %self.local_id, key = %key, from = %source, outcome = ?acceptance, "Pulled handoff fragment");
                        }
                        Err(e) => {
                            tracing::warn!(node = %self.local_id, key = %key, from = %source, error = %e, "Rejected handoff fragment");
                        }
                    }
                }
            }
            other => {
                self.counters.dropped += 1;
                tracing::warn!(node = %self.local_id, from = %source, body = other.name(), "Unexpected message for handoff");
            }
        }
    }

    fn handoff_answer(&mut self, state: &mut HandoffState, source: NodeId, entry: QueryEntry, now: Timestamp) {
        let key = entry.key;
        if state.pending.get(&key) != Some(&HandoffStage::Queried) {
            tracing::debug!(node = %self.local_id, key = %key, from = %source, "Handoff answer for nothing pending");
            return;
        }
        if !entry.authoritative {
            tracing::debug!(node = %self.local_id, key = %key, from = %source, "Handoff target not authoritative; retry next round");
            state.pending.remove(&key);
            return;
        }
        let ours = self.store.metadata(&key).map(|m| m.current_expiration);
        let current = match (entry.have_it, entry.expiration, ours) {
            (true, Some(theirs), Some(ours)) => theirs >= ours,
            (true, _, None) => true,
            _ => false,
        };
        if current {
            state.pending.remove(&key);
            self.retire(&key, now);
            return;
        }
        let stored = match self.store.get(&key) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                state.pending.remove(&key);
                return;
            }
            Err(e) => {
                tracing::error!(node = %self.local_id, key = %key, error = %e, "Store read failed during handoff");
                state.pending.remove(&key);
                return;
            }
        };
        state.pending.insert(key, HandoffStage::Pushed(source));
        let item = DataItem {
            key,
            fragment: Some(stored.fragment),
            manifest: stored.manifest,
        };
        self.send(
            Destination::Node(source),
            self.periodic.handoff,
            MessageTag::Handoff,
            Body::Data { items: vec![item] },
        );
    }

    /// Move a handed-off fragment to the trash, unless the range moved back.
    fn retire(&mut self, key: &FragmentKey, now: Timestamp) {
        if self.is_responsible(key) {
            tracing::debug!(node = %self.local_id, key = %key, "Fragment back in range; kept");
            return;
        }
        match self.store.remove(key) {
            Ok(Some(stored)) => {
                tracing::info!(node = %self.local_id, key = %key, "Fragment handed off");
                self.trash.insert(*key, stored, now);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(node = %self.local_id, key = %key, error = %e, "Removing handed-off fragment failed");
            }
        }
    }
}
