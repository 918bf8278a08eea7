//! Bloom-filter anti-entropy.
//!
//! Each round picks a random fragment-index offset `o` and asks the node
//! responsible for our range shifted by `o` what it holds there. Siblings
//! `(i + o) mod N` of our fragments land in that range, so any of our
//! fragments whose version is missing from the returned filter points at a
//! sibling the peer probably lacks. Those siblings are announced
//! manifest-only; the peer pulls the payload itself.

use super::operation::OpInput;
use super::{Engine, OpId};
use crate::bloom::{sync_element, BloomFilter};
use crate::message::{Body, DataItem, Envelope, MessageTag};
use crate::overlay::Destination;
use rand::Rng;
use tessera_core::{FragmentKey, IdRange, NodeId, Timestamp};

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    /// Announcements sent since the round started.
    sent_this_round: usize,
}

impl Engine {
    pub(super) fn sync_round(&mut self, id: OpId, state: &mut SyncState, now: Timestamp) {
        state.sent_this_round = 0;
        let n = self.config.num_fragments;
        if n < 2 || self.store.is_empty() || self.range.is_empty() {
            tracing::trace!(node = %self.local_id, now, "Nothing to sync");
            return;
        }
        for _ in 0..self.config.sync_partners_per_trial {
            let offset = self.rng.gen_range(1..n);
            let target = self.local_id.add(self.placement.index_offset(offset));
            let range = self.placement.shift_range(&self.range, offset);
            tracing::debug!(node = %self.local_id, offset, range = %range, "Starting sync round");
            self.send(
                Destination::Key(target),
                id,
                MessageTag::Sync,
                Body::SyncQuery { range, offset },
            );
        }
    }

    pub(super) fn sync_input(&mut self, state: &mut SyncState, input: OpInput) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(self.periodic.sync, &other, "sync takes only messages");
                return;
            }
        };
        let Envelope { source, body, .. } = envelope;
        let (range, offset, bloom) = match body {
            Body::SyncResponse {
                range,
                offset,
                bloom,
            } => (range, offset, bloom),
            other => {
                self.counters.dropped += 1;
                tracing::warn!(node = %self.local_id, from = %source, body = other.name(), "Unexpected message for sync");
                return;
            }
        };
        let Some(bloom) = bloom else {
            tracing::debug!(node = %self.local_id, from = %source, "Peer owns none of the sync range");
            return;
        };
        if !bloom.is_well_formed() || offset == 0 || offset >= self.config.num_fragments {
            self.counters.dropped += 1;
            tracing::warn!(node = %self.local_id, from = %source, offset, "Malformed sync response dropped");
            return;
        }
        let now = self.now();
        let flagged = self.possibly_missing(&range, offset, &bloom, now);
        if flagged.is_empty() {
            tracing::debug!(node = %self.local_id, from = %source, range = %range, "Peer is in sync");
            return;
        }
        self.announce(state, source, flagged, now);
    }

    /// Sibling keys in `range` the peer's filter does not vouch for.
    fn possibly_missing(
        &self,
        range: &IdRange,
        offset: u32,
        bloom: &BloomFilter,
        now: Timestamp,
    ) -> Vec<(FragmentKey, FragmentKey)> {
        let n = self.config.num_fragments;
        let min_lifetime = self.config.sync_min_remaining_lifetime_ms;
        let quiet = self.config.sync_min_quiet_time_ms;
        self.store
            .entries()
            .filter(|(key, metadata)| {
                metadata.current_expiration.saturating_sub(now) > min_lifetime
                    && now.saturating_sub(metadata.stored_since) > quiet
                    && self.is_responsible(key)
            })
            .filter_map(|(key, metadata)| {
                let sibling = key.with_index((key.index + offset) % n);
                if !range.contains(self.location(&sibling)) {
                    return None;
                }
                let element = sync_element(&key.version_key, metadata.current_expiration);
                (!bloom.contains(&element)).then_some((*key, sibling))
            })
            .collect()
    }

    /// Send manifest-only announcements in aggregated batches, paying one
    /// token per message and stopping at the per-round cap.
    fn announce(
        &mut self,
        state: &mut SyncState,
        peer: NodeId,
        flagged: Vec<(FragmentKey, FragmentKey)>,
        now: Timestamp,
    ) {
        let budget = self
            .config
            .sync_max_fragments
            .saturating_sub(state.sent_this_round);
        let mut items = Vec::new();
        for (held, sibling) in flagged.into_iter().take(budget) {
            match self.store.get(&held) {
                Ok(Some(stored)) => items.push(DataItem {
                    key: sibling,
                    fragment: None,
                    manifest: stored.manifest,
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %held, error = %e, "Store read failed during sync");
                }
            }
        }
        let total = items.len();
        let mut sent = 0usize;
        for chunk in items.chunks(self.config.manifest_aggregation_factor) {
            if !self.shaper.charge(1, now) {
                tracing::debug!(node = %self.local_id, to = %peer, unsent = total - sent, "Token bucket empty; sync announcements deferred");
                break;
            }
            self.send(
                Destination::Node(peer),
                OpId::NONE,
                MessageTag::Sync,
                Body::Data {
                    items: chunk.to_vec(),
                },
            );
            sent += chunk.len();
        }
        state.sent_this_round += sent;
        tracing::debug!(node = %self.local_id, to = %peer, announced = sent, flagged = total, "Announced possibly missing fragments");
    }
}
