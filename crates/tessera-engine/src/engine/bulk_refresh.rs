//! Aggregated refresh for many objects at once.
//!
//! Three stages share one operation:
//!
//! 1. **Probing** asks random fragment locations which range they claim,
//!    building a map of holders.
//! 2. **Manifest fetch** obtains and re-signs a manifest for every object,
//!    preferring locally held copies and batching remote fetches.
//! 3. **Patching** sends each holder the new expiration and signature for
//!    the fragments in its range, without payloads, and counts the
//!    acknowledged updates per object.
//!
//! Each stage has its own timeout and attempt budget and moves on when it
//! completes or runs out of attempts.

use super::operation::{OpControl, OpInput, OperationKind};
use super::{Engine, RefreshOutcome};
use crate::message::{Body, Envelope, ManifestPatch, MessageTag};
use crate::overlay::Destination;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{
    IdRange, Manifest, NodeId, Result, RingId, TesseraError, Timestamp, VersionKey,
};
use tokio::sync::oneshot;

struct BulkObject {
    key: VersionKey,
    expiration: Timestamp,
    manifest: Option<Manifest>,
    acks: usize,
    result: Option<Result<()>>,
}

impl BulkObject {
    fn is_open(&self) -> bool {
        self.result.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkStage {
    Probing { attempts: u32 },
    FetchingManifests { attempts: u32 },
    Patching { retries: u32 },
}

pub(crate) struct BulkRefreshState {
    objects: Vec<BulkObject>,
    holders: BTreeMap<NodeId, IdRange>,
    stage: BulkStage,
    expected: BTreeMap<(NodeId, VersionKey), u32>,
    acked: BTreeSet<(NodeId, VersionKey)>,
    min_acceptable: usize,
    reply: Option<oneshot::Sender<Result<RefreshOutcome>>>,
}

impl BulkRefreshState {
    fn covered(&self, location: RingId) -> bool {
        self.holders.values().any(|range| range.contains(location))
    }

    fn objects_mut(&mut self, key: &VersionKey) -> impl Iterator<Item = &mut BulkObject> {
        let key = *key;
        self.objects.iter_mut().filter(move |o| o.key == key)
    }

    /// Settle every open object from its acknowledgements and reply.
    fn finish(&mut self) {
        let min_acceptable = self.min_acceptable;
        let outcome: RefreshOutcome = self
            .objects
            .drain(..)
            .map(|object| {
                let result = object.result.unwrap_or_else(|| {
                    if object.acks >= min_acceptable {
                        Ok(())
                    } else {
                        Err(TesseraError::NotEnoughReceipts {
                            key: object.key,
                            received: object.acks,
                            required: min_acceptable,
                        })
                    }
                });
                (object.key, result)
            })
            .collect();
        if let Some(tx) = self.reply.take() {
            if tx.send(Ok(outcome)).is_err() {
                tracing::debug!("Bulk refresh caller went away before the result arrived");
            }
        }
    }

    pub fn abandon(&mut self) {
        if self.reply.is_some() {
            for object in self.objects.iter_mut().filter(|o| o.is_open()) {
                if object.acks < self.min_acceptable {
                    object.result = Some(Err(TesseraError::timeout(format!(
                        "bulk refresh of {}",
                        object.key
                    ))));
                }
            }
            self.finish();
        }
    }
}

impl Engine {
    pub(super) fn start_bulk_refresh(
        &mut self,
        requests: Vec<(VersionKey, Timestamp)>,
        tx: oneshot::Sender<Result<RefreshOutcome>>,
    ) {
        let now = self.now();
        let mut objects = Vec::with_capacity(requests.len());
        for (key, expiration) in requests {
            let mut object = BulkObject {
                key,
                expiration,
                manifest: None,
                acks: 0,
                result: None,
            };
            if expiration <= now {
                object.result = Some(Err(TesseraError::invalid(format!(
                    "expiration {expiration} is not in the future"
                ))));
            } else if let Some(manifest) = self.local_manifest(&key) {
                self.adopt_manifest(&mut object, &manifest);
            }
            objects.push(object);
        }
        let mut holders = BTreeMap::new();
        holders.insert(self.local_id, self.range);
        let mut state = BulkRefreshState {
            objects,
            holders,
            stage: BulkStage::Probing { attempts: 0 },
            expected: BTreeMap::new(),
            acked: BTreeSet::new(),
            min_acceptable: self.config.min_acceptable(),
            reply: Some(tx),
        };
        tracing::info!(
            node = %self.local_id,
            objects = state.objects.len(),
            "Starting bulk refresh"
        );
        let id = self.registry.allocate();
        let mut control = OpControl {
            id,
            deadline: now,
            terminated: false,
        };
        self.probe(&mut control, &mut state);
        self.registry.insert(id, control.deadline, OperationKind::BulkRefresh(state));
        if control.terminated {
            self.registry.terminate(id);
        }
    }

    /// Re-sign a verified manifest with the object's new expiration.
    fn adopt_manifest(&self, object: &mut BulkObject, manifest: &Manifest) -> bool {
        if !self.policy.check_signature(manifest, &object.key) {
            tracing::warn!(node = %self.local_id, key = %object.key, "Manifest with invalid signature ignored");
            return false;
        }
        match self.policy.update_manifest(&object.key, manifest, object.expiration) {
            Ok(updated) => {
                object.manifest = Some(updated);
                true
            }
            Err(e) => {
                tracing::warn!(node = %self.local_id, key = %object.key, error = %e, "Manifest update failed");
                object.result = Some(Err(e));
                false
            }
        }
    }

    fn uncovered_locations(&self, state: &BulkRefreshState) -> Vec<RingId> {
        state
            .objects
            .iter()
            .filter(|o| o.is_open())
            .flat_map(|o| self.placement.locations(&o.key))
            .filter(|location| !state.covered(*location))
            .collect()
    }

    fn probe(&mut self, control: &mut OpControl, state: &mut BulkRefreshState) {
        let BulkStage::Probing { attempts } = state.stage else {
            return;
        };
        let mut uncovered = self.uncovered_locations(state);
        if uncovered.is_empty() || attempts >= self.config.bulk_refresh_probe_max_attempts {
            tracing::debug!(
                node = %self.local_id,
                holders = state.holders.len(),
                uncovered = uncovered.len(),
                "Probing finished"
            );
            state.stage = BulkStage::FetchingManifests { attempts: 0 };
            self.fetch_manifests(control, state);
            return;
        }
        state.stage = BulkStage::Probing {
            attempts: attempts + 1,
        };
        uncovered.shuffle(&mut self.rng);
        for location in uncovered.into_iter().take(self.config.bulk_refresh_probes_per_tick) {
            self.send(Destination::Key(location), control.id, MessageTag::Refresh, Body::Probe);
        }
        control.deadline = self.now() + self.config.bulk_refresh_probe_interval_ms;
    }

    fn fetch_manifests(&mut self, control: &mut OpControl, state: &mut BulkRefreshState) {
        let BulkStage::FetchingManifests { attempts } = state.stage else {
            return;
        };
        let missing: Vec<VersionKey> = state
            .objects
            .iter()
            .filter(|o| o.is_open() && o.manifest.is_none())
            .map(|o| o.key)
            .collect();
        if missing.is_empty() {
            state.stage = BulkStage::Patching { retries: 0 };
            self.send_patches(control, state);
            return;
        }
        if attempts >= self.config.bulk_refresh_manifest_max_attempts {
            for key in &missing {
                tracing::warn!(node = %self.local_id, key = %key, "No manifest obtained for bulk refresh");
                for object in state.objects_mut(key) {
                    object.result = Some(Err(TesseraError::ManifestUnavailable { key: *key }));
                }
            }
            state.stage = BulkStage::Patching { retries: 0 };
            self.send_patches(control, state);
            return;
        }
        state.stage = BulkStage::FetchingManifests {
            attempts: attempts + 1,
        };

        // One fragment per object, asked of a known holder of its location
        // when there is one
        let mut per_holder: BTreeMap<Destination, Vec<_>> = BTreeMap::new();
        for key in missing {
            let index = self.rng.gen_range(0..self.config.num_fragments);
            let fragment_key = key.fragment(index);
            let location = self.location(&fragment_key);
            let destination = state
                .holders
                .iter()
                .find(|(node, range)| **node != self.local_id && range.contains(location))
                .map(|(node, _)| Destination::Node(*node))
                .unwrap_or(Destination::Key(location));
            per_holder.entry(destination).or_default().push(fragment_key);
        }
        for (destination, keys) in per_holder {
            for chunk in keys.chunks(self.config.manifest_aggregation_factor) {
                self.send(
                    destination,
                    control.id,
                    MessageTag::Refresh,
                    Body::Fetch {
                        keys: chunk.to_vec(),
                        manifest_only: true,
                    },
                );
            }
        }
        control.deadline = self.now() + self.config.bulk_refresh_manifest_timeout_ms;
    }

    /// Patch every holder, skipping pairs already acknowledged. One
    /// object's patches for a holder always travel in a single message.
    fn send_patches(&mut self, control: &mut OpControl, state: &mut BulkRefreshState) {
        let BulkStage::Patching { retries } = state.stage else {
            return;
        };
        let mut per_holder: BTreeMap<NodeId, Vec<Vec<ManifestPatch>>> = BTreeMap::new();
        for (holder, range) in &state.holders {
            for object in state.objects.iter().filter(|o| o.is_open()) {
                let Some(manifest) = &object.manifest else {
                    continue;
                };
                if state.acked.contains(&(*holder, object.key)) {
                    continue;
                }
                let patches: Vec<ManifestPatch> = (0..self.config.num_fragments)
                    .map(|index| object.key.fragment(index))
                    .filter(|key| range.contains(self.location(key)))
                    .map(|key| ManifestPatch {
                        key,
                        expiration: manifest.expiration,
                        signature: manifest.signature.clone(),
                    })
                    .collect();
                if patches.is_empty() {
                    continue;
                }
                state
                    .expected
                    .insert((*holder, object.key), patches.len() as u32);
                per_holder.entry(*holder).or_default().push(patches);
            }
        }
        if per_holder.is_empty() {
            self.finish_bulk_refresh(control, state);
            return;
        }
        tracing::debug!(
            node = %self.local_id,
            holders = per_holder.len(),
            retries,
            "Sending expiration patches"
        );
        let aggregation = self.config.bulk_refresh_patch_aggregation;
        for (holder, groups) in per_holder {
            let mut batch: Vec<ManifestPatch> = Vec::new();
            for group in groups {
                if !batch.is_empty() && batch.len() + group.len() > aggregation {
                    let patches = std::mem::take(&mut batch);
                    self.send(Destination::Node(holder), control.id, MessageTag::Refresh, Body::Patch { patches });
                }
                batch.extend(group);
            }
            if !batch.is_empty() {
                self.send(Destination::Node(holder), control.id, MessageTag::Refresh, Body::Patch { patches: batch });
            }
        }
        control.deadline = self.now() + self.config.bulk_refresh_patch_timeout_ms;
    }

    fn finish_bulk_refresh(&mut self, control: &mut OpControl, state: &mut BulkRefreshState) {
        let failed = state
            .objects
            .iter()
            .filter(|o| o.result.as_ref().is_some_and(|r| r.is_err()) || o.acks < state.min_acceptable)
            .count();
        tracing::info!(
            node = %self.local_id,
            objects = state.objects.len(),
            failed,
            "Bulk refresh complete"
        );
        state.finish();
        control.terminate();
    }

    pub(super) fn bulk_refresh_input(
        &mut self,
        control: &mut OpControl,
        state: &mut BulkRefreshState,
        input: OpInput,
    ) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(control.id, &other, "bulk refresh takes only messages");
                return;
            }
        };
        let Envelope { source, body, .. } = envelope;
        match (state.stage, body) {
            (BulkStage::Probing { .. }, Body::RangeReply { range }) => {
                if !range.is_empty() {
                    state.holders.insert(source, range);
                }
                if self.uncovered_locations(state).is_empty() {
                    // Jump straight to the next stage
                    state.stage = BulkStage::Probing {
                        attempts: self.config.bulk_refresh_probe_max_attempts,
                    };
                    self.probe(control, state);
                }
            }
            (BulkStage::FetchingManifests { .. }, Body::FetchResponse { items }) => {
                for item in items {
                    let Some(manifest) = item.manifest else {
                        continue;
                    };
                    let key = item.key.version_key;
                    let Some(position) = state
                        .objects
                        .iter()
                        .position(|o| o.key == key && o.is_open() && o.manifest.is_none())
                    else {
                        continue;
                    };
                    let object = &mut state.objects[position];
                    self.adopt_manifest(object, &manifest);
                    let adopted = object.manifest.clone();
                    if let Some(adopted) = adopted {
                        for other in state.objects_mut(&key).filter(|o| o.manifest.is_none()) {
                            other.manifest = Some(adopted.clone());
                        }
                    }
                }
                let waiting = state
                    .objects
                    .iter()
                    .any(|o| o.is_open() && o.manifest.is_none());
                if !waiting {
                    state.stage = BulkStage::Patching { retries: 0 };
                    self.send_patches(control, state);
                }
            }
            (BulkStage::Patching { .. }, Body::PatchAck { counts }) => {
                for (key, count) in counts {
                    self.record_patch_ack(state, source, key, count);
                }
                let outstanding = state.expected.keys().any(|pair| !state.acked.contains(pair));
                if !outstanding {
                    self.finish_bulk_refresh(control, state);
                }
            }
            (stage, body) => {
                self.counters.dropped += 1;
                tracing::debug!(
                    node = %self.local_id,
                    op = %control.id,
                    from = %source,
                    stage = ?stage,
                    body = body.name(),
                    "Message outside its bulk refresh stage dropped"
                );
            }
        }
    }

    fn record_patch_ack(&self, state: &mut BulkRefreshState, source: NodeId, key: VersionKey, count: u32) {
        let Some(expected) = state.expected.get(&(source, key)).copied() else {
            tracing::warn!(node = %self.local_id, key = %key, from = %source, "Patch ack for a pair never patched");
            return;
        };
        if !state.acked.insert((source, key)) {
            tracing::warn!(node = %self.local_id, key = %key, from = %source, "Duplicate patch ack ignored");
            return;
        }
        if count > expected {
            // Counted anyway; a duplicating or spoofing holder can inflate this
            tracing::warn!(
                node = %self.local_id,
                key = %key,
                from = %source,
                count,
                expected,
                "Holder acknowledged more fragments than it should hold"
            );
        }
        for object in state.objects_mut(&key) {
            object.acks += count as usize;
        }
    }

    pub(super) fn bulk_refresh_timeout(
        &mut self,
        control: &mut OpControl,
        state: &mut BulkRefreshState,
        now: Timestamp,
    ) {
        match state.stage {
            BulkStage::Probing { .. } => self.probe(control, state),
            BulkStage::FetchingManifests { .. } => self.fetch_manifests(control, state),
            BulkStage::Patching { retries } => {
                if retries >= self.config.bulk_refresh_patch_max_retries {
                    tracing::debug!(node = %self.local_id, now, "Patch retries exhausted");
                    self.finish_bulk_refresh(control, state);
                } else {
                    state.stage = BulkStage::Patching {
                        retries: retries + 1,
                    };
                    self.send_patches(control, state);
                }
            }
        }
    }
}
