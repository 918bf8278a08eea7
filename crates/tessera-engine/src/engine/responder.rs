//! Answers to inbound requests.
//!
//! Requests are served straight from the store and range; none of them
//! creates an operation. Incoming fragments and manifests are checked for
//! responsibility, signature and payload hash before anything is stored.

use super::Engine;
use crate::bloom::{sync_element, BloomFilter};
use crate::message::{
    Body, DataItem, Envelope, FetchedItem, ManifestPatch, MessageTag, QueryEntry,
};
use crate::shaper::RepairJob;
use std::collections::BTreeMap;
use tessera_core::{
    FragmentKey, IdRange, Manifest, Result, StoredFragment, TesseraError, Timestamp, VersionKey,
};

/// What happened to one pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Acceptance {
    /// Payload stored.
    Stored,
    /// Manifest replaced by a later one.
    ManifestUpdated,
    /// Already held at this expiration or later.
    AlreadyCurrent,
    /// Payload missing locally; a repair job was queued or is already pending.
    RepairPending,
    /// Location is outside this node's range.
    NotResponsible,
}

impl Acceptance {
    /// Whether the sender may count this item as received.
    pub(super) fn is_receipt(self) -> bool {
        matches!(
            self,
            Acceptance::Stored | Acceptance::ManifestUpdated | Acceptance::AlreadyCurrent
        )
    }
}

impl Engine {
    pub(super) fn handle_request(&mut self, envelope: Envelope) {
        match &envelope.body {
            Body::Query { keys } => self.answer_query(&envelope, keys),
            Body::Data { items } => self.answer_data(&envelope, items),
            Body::Fetch {
                keys,
                manifest_only,
            } => self.answer_fetch(&envelope, keys, *manifest_only),
            Body::Patch { patches } => self.answer_patch(&envelope, patches),
            Body::SyncQuery { range, offset } => self.answer_sync_query(&envelope, range, *offset),
            Body::NeighborRequest => self.answer_neighbor_request(&envelope),
            Body::Probe => {
                let range = self.range;
                self.respond(&envelope, Body::RangeReply { range });
            }
            Body::HoldingsQuery { range } => self.answer_holdings(&envelope, range),
            other => {
                self.counters.dropped += 1;
                tracing::warn!(from = %envelope.source, body = other.name(), "Unexpected request body");
            }
        }
    }

    fn answer_query(&mut self, envelope: &Envelope, keys: &[FragmentKey]) {
        let entries = keys
            .iter()
            .map(|key| {
                let metadata = self.store.metadata(key);
                QueryEntry {
                    key: *key,
                    have_it: metadata.is_some(),
                    authoritative: self.is_responsible(key),
                    expiration: metadata.map(|m| m.current_expiration),
                }
            })
            .collect();
        self.respond(envelope, Body::QueryResponse { entries });
    }

    fn answer_data(&mut self, envelope: &Envelope, items: &[DataItem]) {
        let now = self.now();
        let mut accepted = Vec::new();
        for item in items {
            match self.accept_item(item, envelope.tag, now) {
                Ok(acceptance) if acceptance.is_receipt() => accepted.push(item.key),
                Ok(Acceptance::NotResponsible) => {
                    tracing::debug!(
                        node = %self.local_id,
                        key = %item.key,
                        from = %envelope.source,
                        "Not responsible for pushed fragment"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    self.counters.dropped += 1;
                    tracing::warn!(
                        node = %self.local_id,
                        key = %item.key,
                        from = %envelope.source,
                        error = %e,
                        "Rejected pushed fragment"
                    );
                }
            }
        }
        self.respond(envelope, Body::Receipt { keys: accepted });
    }

    /// Validate and store one pushed item.
    pub(super) fn accept_item(
        &mut self,
        item: &DataItem,
        origin: MessageTag,
        now: Timestamp,
    ) -> Result<Acceptance> {
        let key = item.key;
        if key.index >= self.config.num_fragments {
            return Err(TesseraError::invalid(format!("fragment index out of range in {key}")));
        }
        if !self.is_responsible(&key) {
            return Ok(Acceptance::NotResponsible);
        }
        if item.manifest.expiration <= now {
            return Err(TesseraError::invalid(format!("manifest for {key} already expired")));
        }
        if !self.policy.check_signature(&item.manifest, &key.version_key) {
            return Err(TesseraError::integrity(key, "manifest signature invalid"));
        }
        let Some(fragment) = &item.fragment else {
            return self.accept_manifest_only(key, &item.manifest, origin, now);
        };
        if !item.manifest.validates_fragment(fragment, key.index) {
            return Err(TesseraError::integrity(key, "fragment hash does not match manifest"));
        }
        if let Some(metadata) = self.store.metadata(&key) {
            if metadata.current_expiration >= item.manifest.expiration {
                return Ok(Acceptance::AlreadyCurrent);
            }
            return self.update_held_manifest(&key, item.manifest.clone());
        }
        self.store
            .insert(key, StoredFragment::new(fragment.clone(), item.manifest.clone()), now)?;
        tracing::debug!(node = %self.local_id, key = %key, origin = %origin, "Stored fragment");
        Ok(Acceptance::Stored)
    }

    fn accept_manifest_only(
        &mut self,
        key: FragmentKey,
        manifest: &Manifest,
        origin: MessageTag,
        now: Timestamp,
    ) -> Result<Acceptance> {
        if let Some(metadata) = self.store.metadata(&key) {
            if metadata.current_expiration >= manifest.expiration {
                return Ok(Acceptance::AlreadyCurrent);
            }
            return self.update_held_manifest(&key, manifest.clone());
        }
        let job = RepairJob {
            key,
            manifest: manifest.clone(),
            origin,
            queued_at: now,
        };
        match self.shaper.enqueue(job) {
            Ok(()) => {
                tracing::debug!(node = %self.local_id, key = %key, origin = %origin, "Queued repair for announced fragment");
            }
            Err(e) => {
                tracing::debug!(node = %self.local_id, key = %key, error = %e, "Repair not queued");
            }
        }
        Ok(Acceptance::RepairPending)
    }

    /// Swap in a later manifest, provided it still vouches for the held payload.
    fn update_held_manifest(&mut self, key: &FragmentKey, manifest: Manifest) -> Result<Acceptance> {
        let Some(stored) = self.store.get(key)? else {
            return Err(TesseraError::storage(format!("{key} vanished during update")));
        };
        if !manifest.validates_fragment(&stored.fragment, key.index) {
            return Err(TesseraError::integrity(*key, "new manifest does not match held payload"));
        }
        if self.store.replace_manifest(key, manifest)? {
            Ok(Acceptance::ManifestUpdated)
        } else {
            Ok(Acceptance::AlreadyCurrent)
        }
    }

    fn answer_fetch(&mut self, envelope: &Envelope, keys: &[FragmentKey], manifest_only: bool) {
        let now = self.now();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let item = match self.store.get(key) {
                Ok(Some(stored)) => FetchedItem {
                    key: *key,
                    fragment: (!manifest_only).then_some(stored.fragment),
                    manifest: Some(stored.manifest),
                },
                Ok(None) => self.fetch_fallback(key, manifest_only, now),
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %key, error = %e, "Store read failed while serving fetch");
                    FetchedItem {
                        key: *key,
                        fragment: None,
                        manifest: None,
                    }
                }
            };
            items.push(item);
        }
        self.respond(envelope, Body::FetchResponse { items });
    }

    /// Serve a fragment we no longer store: from the trash, or by
    /// re-encoding a locally cached original.
    fn fetch_fallback(&self, key: &FragmentKey, manifest_only: bool, now: Timestamp) -> FetchedItem {
        if let Some(stored) = self.trash.get(key, now) {
            return FetchedItem {
                key: *key,
                fragment: (!manifest_only).then(|| stored.fragment.clone()),
                manifest: Some(stored.manifest.clone()),
            };
        }
        if !manifest_only {
            if let Some(object) = self.policy.local_object(&key.version_key) {
                let encoded =
                    self.policy
                        .encode(&object, self.config.num_fragments, self.config.num_survivors);
                match encoded {
                    Ok(mut fragments) if (key.index as usize) < fragments.len() => {
                        tracing::debug!(node = %self.local_id, key = %key, "Regenerated fragment from local original");
                        return FetchedItem {
                            key: *key,
                            fragment: Some(fragments.swap_remove(key.index as usize)),
                            manifest: None,
                        };
                    }
                    Ok(_) => {
                        tracing::warn!(key = %key, "Encoder returned too few fragments");
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Re-encoding local original failed");
                    }
                }
            }
        }
        FetchedItem {
            key: *key,
            fragment: None,
            manifest: None,
        }
    }

    fn answer_patch(&mut self, envelope: &Envelope, patches: &[ManifestPatch]) {
        // Every patched object gets an entry, so a holder of none of its
        // fragments still acknowledges it with zero.
        let mut counts: BTreeMap<VersionKey, u32> = patches
            .iter()
            .map(|patch| (patch.key.version_key, 0))
            .collect();
        for patch in patches {
            match self.apply_patch(patch) {
                Ok(true) => *counts.entry(patch.key.version_key).or_insert(0) += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        node = %self.local_id,
                        key = %patch.key,
                        from = %envelope.source,
                        error = %e,
                        "Rejected manifest patch"
                    );
                }
            }
        }
        self.respond(
            envelope,
            Body::PatchAck {
                counts: counts.into_iter().collect(),
            },
        );
    }

    /// Returns whether the fragment now carries the patched expiration.
    fn apply_patch(&mut self, patch: &ManifestPatch) -> Result<bool> {
        let Some(metadata) = self.store.metadata(&patch.key) else {
            return Ok(false);
        };
        if metadata.current_expiration >= patch.expiration {
            return Ok(true);
        }
        let Some(stored) = self.store.get(&patch.key)? else {
            return Ok(false);
        };
        let manifest = stored
            .manifest
            .with_expiration(patch.expiration, patch.signature.clone());
        if !self.policy.check_signature(&manifest, &patch.key.version_key) {
            return Err(TesseraError::integrity(patch.key, "patched manifest signature invalid"));
        }
        self.store.replace_manifest(&patch.key, manifest)?;
        Ok(true)
    }

    fn answer_sync_query(&mut self, envelope: &Envelope, range: &IdRange, offset: u32) {
        let common = self.range.intersect(range);
        if common.is_empty() {
            self.respond(
                envelope,
                Body::SyncResponse {
                    range: IdRange::Empty,
                    offset,
                    bloom: None,
                },
            );
            return;
        }
        let placement = self.placement;
        let held: Vec<_> = self
            .store
            .entries()
            .filter(|(key, _)| common.contains(placement.location_of(key)))
            .map(|(key, metadata)| (key.version_key, *metadata))
            .collect();
        let mut bloom =
            BloomFilter::with_rate(held.len() * 2, self.config.sync_bloom_false_positive_rate);
        for (version_key, metadata) in &held {
            bloom.insert(&sync_element(version_key, metadata.current_expiration));
            if metadata.previous_expiration != 0 {
                bloom.insert(&sync_element(version_key, metadata.previous_expiration));
            }
        }
        tracing::debug!(
            node = %self.local_id,
            from = %envelope.source,
            range = %common,
            fragments = held.len(),
            "Answering sync query"
        );
        self.respond(
            envelope,
            Body::SyncResponse {
                range: common,
                offset,
                bloom: Some(bloom),
            },
        );
    }

    fn answer_neighbor_request(&mut self, envelope: &Envelope) {
        let now = self.now();
        self.neighbors.seen(envelope.source, now, now);
        let mut neighbors: Vec<_> = self.neighbors.entries().collect();
        neighbors.push((self.local_id, now));
        self.respond(envelope, Body::NeighborResponse { neighbors });
        self.recompute_range();
    }

    fn answer_holdings(&mut self, envelope: &Envelope, range: &IdRange) {
        let placement = self.placement;
        let keys = self
            .store
            .entries()
            .map(|(key, _)| *key)
            .filter(|key| range.contains(placement.location_of(key)))
            .take(self.config.handoff_max_fragments)
            .collect();
        self.respond(envelope, Body::Holdings { keys });
    }
}
