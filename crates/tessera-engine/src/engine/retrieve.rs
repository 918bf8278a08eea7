//! Object and fragment retrieval.
//!
//! A whole-object restore asks for random fragment indices, never the same
//! index twice. Its per-round timeout shrinks with every fragment that
//! arrives and doubles after a round that brought nothing. A bounded number
//! of boosts widens the fan-out; a strict restore asks for every remaining
//! index on its last boost.
//!
//! A fragment repair first looks in the trash, then asks one node for the
//! fragment directly, and only then restores the whole object and
//! re-encodes the missing index. Every fetch a repair sends, including
//! those of its restore, is paid for from the traffic bucket.

use super::operation::{OpControl, OpInput, OperationKind, Reply};
use super::{Engine, OpId};
use crate::message::{Body, FetchedItem, MessageTag};
use crate::overlay::Destination;
use crate::shaper::{RepairJob, RestorePermit};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use tessera_core::{
    EngineConfig, Fragment, FragmentKey, Hash32, Manifest, Object, Result, StoredFragment,
    TesseraError, Timestamp, VersionKey,
};

pub(crate) struct RetrieveObjectState {
    pub key: VersionKey,
    fragments: Vec<Option<Fragment>>,
    requested: BTreeSet<u32>,
    reference: Option<Manifest>,
    round_timeout: u64,
    boosts_left: u32,
    fan_out: usize,
    new_this_round: usize,
    started: Timestamp,
    be_strict: bool,
    tag: MessageTag,
    pub permit: Option<RestorePermit>,
    pub reply: Option<Reply<Object>>,
}

impl RetrieveObjectState {
    fn found(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_some()).count()
    }

    fn unchecked(&self) -> Vec<u32> {
        (0..self.fragments.len() as u32)
            .filter(|index| !self.requested.contains(index))
            .collect()
    }

    fn shortfall(&self) -> TesseraError {
        TesseraError::NotEnoughFragments {
            key: self.key,
            checked: self.requested.len(),
            found: self.found(),
        }
    }

    /// A new fragment shortens the round, down to the floor.
    fn fragment_arrived(&mut self, config: &EngineConfig) {
        self.new_this_round += 1;
        self.round_timeout = self
            .round_timeout
            .saturating_sub(config.restore_timeout_decrement_ms)
            .max(config.restore_timeout_min_ms);
    }

    /// Close a round and return how many indices to ask for next.
    ///
    /// A round that brought nothing doubles the timeout up to the ceiling.
    /// The fan-out doubles up to the request cap, except that the last boost
    /// of a strict restore asks for every index.
    fn boost(&mut self, config: &EngineConfig) -> usize {
        self.boosts_left = self.boosts_left.saturating_sub(1);
        if self.new_this_round == 0 {
            self.round_timeout = (self.round_timeout * 2).min(config.restore_timeout_max_ms);
        }
        self.new_this_round = 0;

        let k = config.num_survivors as f64;
        let cap = (k * config.restore_max_request_factor).ceil() as usize;
        self.fan_out = (self.fan_out.max(1) * 2).min(cap.max(1));
        if self.boosts_left == 0 && self.be_strict {
            self.fragments.len()
        } else {
            self.fan_out
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentPhase {
    /// Asking one node for the fragment itself.
    Direct { attempts: u32 },
    /// Waiting on a whole-object restore.
    Restore,
}

pub(crate) struct RetrieveFragmentState {
    pub key: FragmentKey,
    manifest: Manifest,
    tag: MessageTag,
    phase: FragmentPhase,
    pub child: Option<OpId>,
}

impl Engine {
    // ========================================================================
    // Whole-object restore
    // ========================================================================

    /// Start restoring `key`. A supplied manifest must already be verified.
    pub(super) fn start_retrieve_object(
        &mut self,
        key: VersionKey,
        manifest: Option<Manifest>,
        be_strict: bool,
        tag: MessageTag,
        reply: Reply<Object>,
    ) -> OpId {
        let now = self.now();
        let n = self.config.num_fragments as usize;
        let mut state = RetrieveObjectState {
            key,
            fragments: vec![None; n],
            requested: BTreeSet::new(),
            reference: manifest,
            round_timeout: self.config.restore_timeout_default_ms,
            boosts_left: self.config.restore_max_boosts,
            fan_out: 0,
            new_this_round: 0,
            started: now,
            be_strict,
            tag,
            permit: Some(self.shaper.acquire_restore()),
            reply: Some(reply),
        };
        self.collect_local_fragments(&mut state);

        let id = self.registry.allocate();
        let mut control = OpControl {
            id,
            deadline: now + state.round_timeout,
            terminated: false,
        };
        let k = self.config.num_survivors as usize;
        let found = state.found();
        tracing::debug!(node = %self.local_id, op = %id, key = %key, local = found, tag = %tag, "Restoring object");
        if found >= k {
            self.complete_restore(&mut control, &mut state);
        } else {
            state.fan_out = k - found;
            self.request_fragments(id, &mut state, k - found);
        }
        self.registry.insert(id, control.deadline, OperationKind::RetrieveObject(state));
        if control.terminated {
            self.registry.terminate(id);
        }
        id
    }

    fn collect_local_fragments(&mut self, state: &mut RetrieveObjectState) {
        for index in self.store.indices_of(&state.key) {
            let fragment_key = state.key.fragment(index);
            match self.store.get(&fragment_key) {
                Ok(Some(stored)) => {
                    state.requested.insert(index);
                    self.consider_fragment(state, &fragment_key, stored.fragment, Some(stored.manifest));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %fragment_key, error = %e, "Store read failed during restore");
                }
            }
        }
    }

    /// Accept a fragment if it validates against the reference manifest,
    /// adopting the fragment's own manifest as reference when there is none yet.
    fn consider_fragment(
        &self,
        state: &mut RetrieveObjectState,
        key: &FragmentKey,
        fragment: Fragment,
        manifest: Option<Manifest>,
    ) -> bool {
        if let Some(manifest) = &manifest {
            match &state.reference {
                Some(reference) if !reference.same_content(manifest) => {
                    tracing::warn!(node = %self.local_id, key = %key, "Fragment manifest disagrees with reference");
                    return false;
                }
                Some(_) => {}
                None => {
                    if !self.policy.check_signature(manifest, &key.version_key) {
                        tracing::warn!(node = %self.local_id, key = %key, "Fragment manifest signature invalid");
                        return false;
                    }
                    state.reference = Some(manifest.clone());
                }
            }
        }
        let Some(reference) = &state.reference else {
            tracing::debug!(node = %self.local_id, key = %key, "Fragment without manifest and no reference yet");
            return false;
        };
        if !reference.validates_fragment(&fragment, key.index) {
            tracing::warn!(node = %self.local_id, key = %key, "Fragment hash does not match manifest");
            return false;
        }
        state.fragments[key.index as usize] = Some(fragment);
        true
    }

    /// Ask for up to `count` random indices not asked before. Recovery
    /// restores stop early when the traffic bucket runs dry; the indices
    /// left unasked stay available to the next boost.
    fn request_fragments(&mut self, id: OpId, state: &mut RetrieveObjectState, count: usize) {
        let now = self.now();
        let mut candidates = state.unchecked();
        candidates.shuffle(&mut self.rng);
        for index in candidates.into_iter().take(count) {
            if state.tag.is_recovery() && !self.shaper.charge(1, now) {
                tracing::debug!(node = %self.local_id, key = %state.key, "Token bucket empty; restore fetches deferred");
                break;
            }
            state.requested.insert(index);
            let fragment_key = state.key.fragment(index);
            let location = self.location(&fragment_key);
            self.send(
                Destination::Key(location),
                id,
                state.tag,
                Body::Fetch {
                    keys: vec![fragment_key],
                    manifest_only: false,
                },
            );
        }
    }

    fn complete_restore(&mut self, control: &mut OpControl, state: &mut RetrieveObjectState) {
        let result = self.decode_object(state);
        match &result {
            Ok(_) => tracing::info!(
                node = %self.local_id,
                key = %state.key,
                checked = state.requested.len(),
                found = state.found(),
                "Object restored"
            ),
            Err(e) => tracing::warn!(node = %self.local_id, key = %state.key, error = %e, "Object restore failed"),
        }
        self.finish_restore(control, state, result);
    }

    fn decode_object(&self, state: &RetrieveObjectState) -> Result<Object> {
        let Some(reference) = &state.reference else {
            return Err(TesseraError::ManifestUnavailable { key: state.key });
        };
        let object = self
            .policy
            .decode(&state.key, &state.fragments, self.config.num_survivors)?;
        if Hash32::of(&object.data) != reference.object_hash {
            return Err(TesseraError::integrity(state.key, "decoded object hash does not match manifest"));
        }
        Ok(object)
    }

    fn finish_restore(&mut self, control: &mut OpControl, state: &mut RetrieveObjectState, result: Result<Object>) {
        if let Some(permit) = state.permit.take() {
            self.shaper.release_restore(permit);
        }
        if let Some(reply) = state.reply.take() {
            self.reply_object(reply, result);
        }
        control.terminate();
    }

    pub(super) fn retrieve_object_input(
        &mut self,
        control: &mut OpControl,
        state: &mut RetrieveObjectState,
        input: OpInput,
    ) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(control.id, &other, "restore takes only messages");
                return;
            }
        };
        let items = match envelope.body {
            Body::FetchResponse { items } => items,
            other => {
                self.counters.dropped += 1;
                tracing::warn!(node = %self.local_id, key = %state.key, body = other.name(), "Unexpected message for restore");
                return;
            }
        };
        let mut replacements = 0;
        for FetchedItem {
            key,
            fragment,
            manifest,
        } in items
        {
            let index = key.index as usize;
            if key.version_key != state.key || index >= state.fragments.len() {
                tracing::warn!(node = %self.local_id, key = %key, from = %envelope.source, "Fetched item for a foreign key");
                continue;
            }
            if state.fragments[index].is_some() {
                tracing::debug!(node = %self.local_id, key = %key, "Duplicate fragment ignored");
                continue;
            }
            let accepted = match fragment {
                Some(fragment) => self.consider_fragment(state, &key, fragment, manifest),
                None => false,
            };
            if accepted {
                state.fragment_arrived(&self.config);
            } else {
                replacements += 1;
            }
        }
        if state.found() >= self.config.num_survivors as usize {
            self.complete_restore(control, state);
        } else if replacements > 0 {
            self.request_fragments(control.id, state, replacements);
        }
    }

    pub(super) fn retrieve_object_timeout(
        &mut self,
        control: &mut OpControl,
        state: &mut RetrieveObjectState,
        now: Timestamp,
    ) {
        let give_up_at = state.started + self.config.overall_restore_timeout_ms;
        if now >= give_up_at || state.boosts_left == 0 {
            let err = state.shortfall();
            tracing::warn!(node = %self.local_id, key = %state.key, error = %err, "Object restore gave up");
            self.finish_restore(control, state, Err(err));
            return;
        }
        let count = state.boost(&self.config);
        tracing::debug!(
            node = %self.local_id,
            key = %state.key,
            found = state.found(),
            checked = state.requested.len(),
            count,
            round_timeout = state.round_timeout,
            "Boosting restore"
        );
        self.request_fragments(control.id, state, count);
        control.deadline = (now + state.round_timeout).min(give_up_at);
    }

    // ========================================================================
    // Single-fragment repair
    // ========================================================================

    /// Start repairing one fragment for a job released by the shaper.
    pub(super) fn start_retrieve_fragment(&mut self, job: RepairJob, now: Timestamp) -> OpId {
        let key = job.key;
        let mut state = RetrieveFragmentState {
            key,
            manifest: job.manifest,
            tag: job.origin,
            phase: FragmentPhase::Direct { attempts: 0 },
            child: None,
        };
        let id = self.registry.allocate();
        let mut control = OpControl {
            id,
            deadline: now,
            terminated: false,
        };
        if self.store.contains(&key) {
            tracing::debug!(node = %self.local_id, key = %key, "Repair target already held");
            control.terminate();
        } else if let Some(stored) = self.trash.get(&key, now).cloned() {
            if state.manifest.validates_fragment(&stored.fragment, key.index) {
                tracing::debug!(node = %self.local_id, key = %key, "Repair satisfied from trash");
                self.store_repaired(&state, stored.fragment, now);
                control.terminate();
            } else {
                self.request_fragment(&mut control, &mut state, now);
            }
        } else {
            self.request_fragment(&mut control, &mut state, now);
        }
        self.registry.insert(id, control.deadline, OperationKind::RetrieveFragment(state));
        if control.terminated {
            self.registry.terminate(id);
        }
        id
    }

    /// Node asked directly: the fragment's location when that is elsewhere,
    /// otherwise the object's home node, which may still hold the original.
    fn direct_source(&self, key: &FragmentKey) -> Option<Destination> {
        let location = self.location(key);
        if !self.range.contains(location) {
            return Some(Destination::Key(location));
        }
        if !self.range.contains(key.id()) {
            return Some(Destination::Key(key.id()));
        }
        None
    }

    fn request_fragment(&mut self, control: &mut OpControl, state: &mut RetrieveFragmentState, now: Timestamp) {
        let FragmentPhase::Direct { attempts } = state.phase else {
            return;
        };
        let destination = match self.direct_source(&state.key) {
            Some(destination) if attempts < self.config.fragment_request_max_attempts => destination,
            _ => {
                self.restore_for_fragment(control, state, now);
                return;
            }
        };
        control.deadline = now + self.config.fragment_request_timeout_ms;
        if !self.shaper.charge(1, now) {
            tracing::debug!(node = %self.local_id, key = %state.key, "Token bucket empty; direct fetch deferred");
            return;
        }
        state.phase = FragmentPhase::Direct {
            attempts: attempts + 1,
        };
        self.send(
            destination,
            control.id,
            MessageTag::Fetch,
            Body::Fetch {
                keys: vec![state.key],
                manifest_only: false,
            },
        );
    }

    fn restore_for_fragment(&mut self, control: &mut OpControl, state: &mut RetrieveFragmentState, now: Timestamp) {
        tracing::debug!(node = %self.local_id, key = %state.key, "Falling back to object restore");
        state.phase = FragmentPhase::Restore;
        let child = self.start_retrieve_object(
            state.key.version_key,
            Some(state.manifest.clone()),
            true,
            state.tag,
            Reply::Parent(control.id),
        );
        state.child = Some(child);
        control.deadline = now + self.config.overall_restore_timeout_ms + 1;
    }

    fn store_repaired(&mut self, state: &RetrieveFragmentState, fragment: Fragment, now: Timestamp) {
        if !self.is_responsible(&state.key) {
            tracing::debug!(node = %self.local_id, key = %state.key, "No longer responsible; repaired fragment dropped");
            return;
        }
        if state.manifest.expiration <= now {
            tracing::debug!(node = %self.local_id, key = %state.key, "Repaired fragment already expired");
            return;
        }
        let stored = StoredFragment::new(fragment, state.manifest.clone());
        match self.store.insert(state.key, stored, now) {
            Ok(()) => tracing::info!(node = %self.local_id, key = %state.key, origin = %state.tag, "Fragment repaired"),
            Err(e) => tracing::error!(node = %self.local_id, key = %state.key, error = %e, "Storing repaired fragment failed"),
        }
    }

    pub(super) fn retrieve_fragment_input(
        &mut self,
        control: &mut OpControl,
        state: &mut RetrieveFragmentState,
        input: OpInput,
    ) {
        let now = self.now();
        match (state.phase, input) {
            (FragmentPhase::Direct { .. }, OpInput::Message(envelope)) => {
                let items = match envelope.body {
                    Body::FetchResponse { items } => items,
                    other => {
                        self.counters.dropped += 1;
                        tracing::warn!(node = %self.local_id, key = %state.key, body = other.name(), "Unexpected message for repair");
                        return;
                    }
                };
                let fragment = items
                    .into_iter()
                    .filter(|item| item.key == state.key)
                    .filter_map(|item| item.fragment)
                    .find(|fragment| state.manifest.validates_fragment(fragment, state.key.index));
                match fragment {
                    Some(fragment) => {
                        self.store_repaired(state, fragment, now);
                        control.terminate();
                    }
                    None => {
                        tracing::debug!(node = %self.local_id, key = %state.key, from = %envelope.source, "Direct source lacks fragment");
                        self.restore_for_fragment(control, state, now);
                    }
                }
            }
            (FragmentPhase::Restore, OpInput::Object(result)) => {
                state.child = None;
                match result.and_then(|object| self.reencode(&state.key, &object)) {
                    Ok(fragment) if state.manifest.validates_fragment(&fragment, state.key.index) => {
                        self.store_repaired(state, fragment, now);
                    }
                    Ok(_) => {
                        tracing::warn!(node = %self.local_id, key = %state.key, "Re-encoded fragment does not match manifest");
                    }
                    Err(e) => {
                        tracing::warn!(node = %self.local_id, key = %state.key, error = %e, "Repair restore failed");
                    }
                }
                control.terminate();
            }
            (_, input) => self.discard_input(control.id, &input, "input does not match repair phase"),
        }
    }

    fn reencode(&self, key: &FragmentKey, object: &Object) -> Result<Fragment> {
        let mut fragments =
            self.policy
                .encode(object, self.config.num_fragments, self.config.num_survivors)?;
        if key.index as usize >= fragments.len() {
            return Err(TesseraError::encoding(format!("encoder produced no fragment {}", key.index)));
        }
        Ok(fragments.swap_remove(key.index as usize))
    }

    pub(super) fn retrieve_fragment_timeout(
        &mut self,
        control: &mut OpControl,
        state: &mut RetrieveFragmentState,
        now: Timestamp,
    ) {
        match state.phase {
            FragmentPhase::Direct { .. } => self.request_fragment(control, state, now),
            FragmentPhase::Restore => {
                tracing::warn!(node = %self.local_id, key = %state.key, "Repair restore timed out");
                control.terminate();
            }
        }
    }
}
