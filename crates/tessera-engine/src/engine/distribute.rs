//! Insert and simple refresh.
//!
//! Both run the same quorum distribution: every fragment location is
//! queried first, and payloads (or, for refresh, manifests) are pushed in
//! one batch only once enough holders have answered. A holder that already
//! carries the requested expiration counts as a receipt without a push.
//!
//! The caller hears back as soon as the receipt quorum is reached. The
//! distribution itself stays alive until every fragment has a receipt or
//! the insert timeout passes, so holders answering after the batch went
//! out still get their fragment.

use super::operation::{OpControl, OpInput, OperationKind, Reply};
use super::{Engine, OpId, RefreshOutcome};
use crate::message::{Body, DataItem, Envelope, MessageTag, QueryEntry};
use crate::overlay::Destination;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{
    Fragment, Manifest, NodeId, Object, Result, TesseraError, Timestamp, VersionKey,
};
use tokio::sync::oneshot;

/// What gets pushed to holders.
pub(crate) enum DistributeMode {
    /// Full fragments with their individual manifests.
    Insert {
        fragments: Vec<Fragment>,
        manifests: Vec<Manifest>,
    },
    /// One re-signed manifest, pushed without payload.
    Refresh { manifest: Manifest },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HolderStatus {
    Lacking,
    Stale,
    Current,
}

pub(crate) struct DistributeState {
    pub key: VersionKey,
    mode: DistributeMode,
    tag: MessageTag,
    expiration: Timestamp,
    holders: Vec<Option<(NodeId, HolderStatus)>>,
    receipts: BTreeSet<u32>,
    pushed: bool,
    reported: bool,
    min_acceptable: usize,
    pub reply: Option<Reply<usize>>,
}

impl DistributeState {
    fn responded(&self) -> usize {
        self.holders.iter().filter(|h| h.is_some()).count()
    }

    /// Every fragment has a receipt; nothing is left to push.
    fn is_finished(&self) -> bool {
        self.receipts.len() >= self.holders.len()
    }

    fn item(&self, index: u32) -> Option<DataItem> {
        let key = self.key.fragment(index);
        match &self.mode {
            DistributeMode::Insert {
                fragments,
                manifests,
            } => Some(DataItem {
                key,
                fragment: Some(fragments.get(index as usize)?.clone()),
                manifest: manifests.get(index as usize)?.clone(),
            }),
            DistributeMode::Refresh { manifest } => Some(DataItem {
                key,
                fragment: None,
                manifest: manifest.clone(),
            }),
        }
    }

    fn verdict(&self) -> Result<usize> {
        if self.receipts.len() >= self.min_acceptable {
            Ok(self.receipts.len())
        } else {
            Err(TesseraError::NotEnoughReceipts {
                key: self.key,
                received: self.receipts.len(),
                required: self.min_acceptable,
            })
        }
    }
}

enum RefreshStage {
    FetchingManifest { attempts: u32 },
    Distributing(DistributeState),
}

pub(crate) struct RefreshState {
    pub key: VersionKey,
    expiration: Timestamp,
    stage: RefreshStage,
    pub reply: Option<Reply<usize>>,
}

pub(crate) struct RefreshBatchState {
    slots: Vec<(VersionKey, Option<Result<()>>)>,
    children: Vec<OpId>,
    reply: Option<oneshot::Sender<Result<RefreshOutcome>>>,
}

impl RefreshBatchState {
    fn record(&mut self, key: VersionKey, result: Result<()>) {
        match self.slots.iter_mut().find(|(k, r)| *k == key && r.is_none()) {
            Some(slot) => slot.1 = Some(result),
            None => tracing::warn!(key = %key, "Refresh result for unknown or finished object"),
        }
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(|(_, r)| r.is_some())
    }

    /// Deliver the collected outcome, failing unfinished objects.
    fn complete(&mut self) {
        let outcome: RefreshOutcome = self
            .slots
            .drain(..)
            .map(|(key, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(TesseraError::timeout(format!("refresh of {key}")))
                });
                (key, result)
            })
            .collect();
        if let Some(tx) = self.reply.take() {
            if tx.send(Ok(outcome)).is_err() {
                tracing::debug!("Refresh caller went away before the result arrived");
            }
        }
    }

    pub fn abandon(&mut self) {
        if self.reply.is_some() {
            self.complete();
        }
    }
}

impl Engine {
    // ========================================================================
    // Insert
    // ========================================================================

    pub(super) fn start_insert(&mut self, object: Object, expiration: Timestamp, reply: Reply<usize>) {
        let key = object.key;
        match self.prepare_insert(&object, expiration) {
            Ok(mode) => {
                tracing::info!(node = %self.local_id, key = %key, expiration, "Inserting object");
                self.start_distribute(key, mode, MessageTag::Insert, expiration, reply);
            }
            Err(e) => {
                tracing::warn!(node = %self.local_id, key = %key, error = %e, "Insert rejected");
                self.reply_outcome(reply, key, Err(e));
            }
        }
    }

    fn prepare_insert(&self, object: &Object, expiration: Timestamp) -> Result<DistributeMode> {
        if expiration <= self.now() {
            return Err(TesseraError::invalid(format!(
                "expiration {expiration} is not in the future"
            )));
        }
        let n = self.config.num_fragments;
        let fragments = self.policy.encode(object, n, self.config.num_survivors)?;
        if fragments.len() != n as usize {
            return Err(TesseraError::encoding(format!(
                "encoder produced {} fragments, expected {n}",
                fragments.len()
            )));
        }
        let manifests = self.policy.create_manifests(object, &fragments, expiration)?;
        if manifests.len() != fragments.len() {
            return Err(TesseraError::encoding(format!(
                "policy produced {} manifests for {} fragments",
                manifests.len(),
                fragments.len()
            )));
        }
        Ok(DistributeMode::Insert {
            fragments,
            manifests,
        })
    }

    fn new_distribute(
        &self,
        key: VersionKey,
        mode: DistributeMode,
        tag: MessageTag,
        expiration: Timestamp,
        reply: Option<Reply<usize>>,
    ) -> DistributeState {
        DistributeState {
            key,
            mode,
            tag,
            expiration,
            holders: vec![None; self.config.num_fragments as usize],
            receipts: BTreeSet::new(),
            pushed: false,
            reported: false,
            min_acceptable: self.config.min_acceptable(),
            reply,
        }
    }

    fn start_distribute(
        &mut self,
        key: VersionKey,
        mode: DistributeMode,
        tag: MessageTag,
        expiration: Timestamp,
        reply: Reply<usize>,
    ) -> OpId {
        let state = self.new_distribute(key, mode, tag, expiration, Some(reply));
        let deadline = self.now() + self.config.insert_timeout_ms;
        let id = self.register(deadline, OperationKind::Distribute(state));
        self.query_holders(id, key, tag);
        id
    }

    fn query_holders(&mut self, id: OpId, key: VersionKey, tag: MessageTag) {
        for index in 0..self.config.num_fragments {
            let fragment_key = key.fragment(index);
            let location = self.location(&fragment_key);
            self.send(
                Destination::Key(location),
                id,
                tag,
                Body::Query {
                    keys: vec![fragment_key],
                },
            );
        }
    }

    pub(super) fn distribute_input(
        &mut self,
        control: &mut OpControl,
        state: &mut DistributeState,
        input: OpInput,
    ) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(control.id, &other, "distribute takes only messages");
                return;
            }
        };
        if let Some(result) = self.distribute_step(control.id, state, envelope) {
            if let Some(reply) = state.reply.take() {
                self.reply_outcome(reply, state.key, result);
            }
        }
        if state.is_finished() {
            control.terminate();
        }
    }

    pub(super) fn distribute_timeout(&mut self, control: &mut OpControl, state: &mut DistributeState) {
        if let Some(result) = self.conclude_distribute(state) {
            if let Some(reply) = state.reply.take() {
                self.reply_outcome(reply, state.key, result);
            }
        }
        control.terminate();
    }

    /// Verdict at the deadline, unless the caller already had one.
    fn conclude_distribute(&self, state: &mut DistributeState) -> Option<Result<usize>> {
        if state.reported {
            tracing::debug!(
                node = %self.local_id,
                key = %state.key,
                receipts = state.receipts.len(),
                "Distribution closed with holders still missing"
            );
            return None;
        }
        state.reported = true;
        let result = state.verdict();
        self.log_distribute_outcome(state, &result);
        Some(result)
    }

    fn log_distribute_outcome(&self, state: &DistributeState, result: &Result<usize>) {
        match result {
            Ok(receipts) => tracing::info!(
                node = %self.local_id,
                key = %state.key,
                tag = %state.tag,
                receipts,
                "Distribution complete"
            ),
            Err(e) => tracing::warn!(
                node = %self.local_id,
                key = %state.key,
                tag = %state.tag,
                responded = state.responded(),
                error = %e,
                "Distribution failed"
            ),
        }
    }

    /// Feed one response into a distribution. Returns the result the first
    /// time the receipt quorum is reached.
    fn distribute_step(
        &mut self,
        id: OpId,
        state: &mut DistributeState,
        envelope: Envelope,
    ) -> Option<Result<usize>> {
        match envelope.body {
            Body::QueryResponse { entries } => {
                for entry in entries {
                    self.record_holder(id, state, envelope.source, entry);
                }
                if !state.pushed && state.responded() >= state.min_acceptable {
                    self.push_all(id, state);
                }
            }
            Body::Receipt { keys } => {
                for key in keys {
                    let from_holder = key.version_key == state.key
                        && state
                            .holders
                            .get(key.index as usize)
                            .and_then(|h| h.as_ref())
                            .is_some_and(|(node, _)| *node == envelope.source);
                    if from_holder {
                        state.receipts.insert(key.index);
                    } else {
                        tracing::warn!(
                            node = %self.local_id,
                            key = %key,
                            from = %envelope.source,
                            "Receipt from a node that is not the recorded holder"
                        );
                    }
                }
            }
            other => {
                self.counters.dropped += 1;
                tracing::warn!(
                    node = %self.local_id,
                    key = %state.key,
                    from = %envelope.source,
                    body = other.name(),
                    "Unexpected message for distribution"
                );
                return None;
            }
        }
        if !state.reported && state.receipts.len() >= state.min_acceptable {
            state.reported = true;
            let result = state.verdict();
            self.log_distribute_outcome(state, &result);
            return Some(result);
        }
        None
    }

    fn record_holder(&mut self, id: OpId, state: &mut DistributeState, source: NodeId, entry: QueryEntry) {
        let index = entry.key.index as usize;
        if entry.key.version_key != state.key || index >= state.holders.len() {
            tracing::warn!(node = %self.local_id, key = %entry.key, from = %source, "Query answer for a foreign key");
            return;
        }
        if !entry.authoritative {
            tracing::debug!(node = %self.local_id, key = %entry.key, from = %source, "Non-authoritative answer ignored");
            return;
        }
        if state.holders[index].is_some() {
            self.counters.dropped += 1;
            tracing::warn!(node = %self.local_id, key = %entry.key, from = %source, "Duplicate answer discarded");
            return;
        }
        let status = match (entry.have_it, entry.expiration) {
            (true, Some(expiration)) if expiration >= state.expiration => HolderStatus::Current,
            (true, _) => HolderStatus::Stale,
            (false, _) => HolderStatus::Lacking,
        };
        state.holders[index] = Some((source, status));
        if status == HolderStatus::Current {
            state.receipts.insert(entry.key.index);
        } else if state.pushed {
            // Late responder: the batch already went out
            if let Some(item) = state.item(entry.key.index) {
                self.send(Destination::Node(source), id, state.tag, Body::Data { items: vec![item] });
            }
        }
    }

    fn push_all(&mut self, id: OpId, state: &mut DistributeState) {
        state.pushed = true;
        let mut batches: BTreeMap<NodeId, Vec<DataItem>> = BTreeMap::new();
        for (index, holder) in state.holders.iter().enumerate() {
            let Some((node, status)) = holder else {
                continue;
            };
            if *status == HolderStatus::Current {
                continue;
            }
            if let Some(item) = state.item(index as u32) {
                batches.entry(*node).or_default().push(item);
            }
        }
        tracing::debug!(
            node = %self.local_id,
            key = %state.key,
            holders = batches.len(),
            responded = state.responded(),
            "Pushing to holders"
        );
        for (node, items) in batches {
            self.send(Destination::Node(node), id, state.tag, Body::Data { items });
        }
    }

    // ========================================================================
    // Simple refresh
    // ========================================================================

    pub(super) fn start_refresh_batch(
        &mut self,
        requests: Vec<(VersionKey, Timestamp)>,
        tx: oneshot::Sender<Result<RefreshOutcome>>,
    ) {
        let mut batch = RefreshBatchState {
            slots: requests.iter().map(|(key, _)| (*key, None)).collect(),
            children: Vec::new(),
            reply: Some(tx),
        };
        if requests.is_empty() {
            batch.complete();
            return;
        }
        let now = self.now();
        let deadline = now
            + self.config.fragment_request_timeout_ms * self.config.fragment_request_max_attempts as u64
            + self.config.insert_timeout_ms
            + 1_000;
        let batch_id = self.register(deadline, OperationKind::RefreshBatch(batch));
        let children: Vec<OpId> = requests
            .into_iter()
            .map(|(key, expiration)| self.start_refresh(key, expiration, Reply::Parent(batch_id)))
            .collect();
        if let Some(OperationKind::RefreshBatch(state)) = self.registry.kind_mut(batch_id) {
            state.children = children;
        }
    }

    fn start_refresh(&mut self, key: VersionKey, expiration: Timestamp, reply: Reply<usize>) -> OpId {
        let now = self.now();
        let mut state = RefreshState {
            key,
            expiration,
            stage: RefreshStage::FetchingManifest { attempts: 0 },
            reply: Some(reply),
        };
        let id = self.registry.allocate();
        let mut control = OpControl {
            id,
            deadline: now,
            terminated: false,
        };
        if expiration <= now {
            self.finish_refresh(
                &mut control,
                &mut state,
                Err(TesseraError::invalid(format!("expiration {expiration} is not in the future"))),
            );
        } else if let Some(manifest) = self.local_manifest(&key) {
            self.begin_refresh_distribution(&mut control, &mut state, manifest);
        } else {
            self.request_manifest(&mut control, &mut state);
        }
        self.registry.insert(id, control.deadline, OperationKind::Refresh(state));
        if control.terminated {
            self.registry.terminate(id);
        }
        id
    }

    /// Manifest of any locally held fragment of `key`.
    pub(super) fn local_manifest(&mut self, key: &VersionKey) -> Option<Manifest> {
        for index in self.store.indices_of(key) {
            match self.store.get(&key.fragment(index)) {
                Ok(Some(stored)) => return Some(stored.manifest),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %key.fragment(index), error = %e, "Store read failed");
                }
            }
        }
        None
    }

    fn request_manifest(&mut self, control: &mut OpControl, state: &mut RefreshState) {
        let RefreshStage::FetchingManifest { attempts } = &mut state.stage else {
            return;
        };
        if *attempts >= self.config.fragment_request_max_attempts {
            let err = TesseraError::ManifestUnavailable { key: state.key };
            self.finish_refresh(control, state, Err(err));
            return;
        }
        *attempts += 1;
        let index = self.rng.gen_range(0..self.config.num_fragments);
        let fragment_key = state.key.fragment(index);
        let location = self.location(&fragment_key);
        self.send(
            Destination::Key(location),
            control.id,
            MessageTag::Refresh,
            Body::Fetch {
                keys: vec![fragment_key],
                manifest_only: true,
            },
        );
        control.deadline = self.now() + self.config.fragment_request_timeout_ms;
    }

    fn begin_refresh_distribution(
        &mut self,
        control: &mut OpControl,
        state: &mut RefreshState,
        manifest: Manifest,
    ) {
        let manifest = match self.policy.update_manifest(&state.key, &manifest, state.expiration) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.finish_refresh(control, state, Err(e));
                return;
            }
        };
        tracing::debug!(node = %self.local_id, key = %state.key, expiration = state.expiration, "Distributing refreshed manifest");
        let distribute = self.new_distribute(
            state.key,
            DistributeMode::Refresh { manifest },
            MessageTag::Refresh,
            state.expiration,
            None,
        );
        state.stage = RefreshStage::Distributing(distribute);
        control.deadline = self.now() + self.config.insert_timeout_ms;
        self.query_holders(control.id, state.key, MessageTag::Refresh);
    }

    fn finish_refresh(&mut self, control: &mut OpControl, state: &mut RefreshState, result: Result<usize>) {
        if let Some(reply) = state.reply.take() {
            self.reply_outcome(reply, state.key, result);
        }
        control.terminate();
    }

    pub(super) fn refresh_input(&mut self, control: &mut OpControl, state: &mut RefreshState, input: OpInput) {
        let envelope = match input {
            OpInput::Message(envelope) => envelope,
            other => {
                self.discard_input(control.id, &other, "refresh takes only messages");
                return;
            }
        };
        match &mut state.stage {
            RefreshStage::Distributing(distribute) => {
                let result = self.distribute_step(control.id, distribute, envelope);
                let finished = distribute.is_finished();
                if let (Some(result), Some(reply)) = (result, state.reply.take()) {
                    self.reply_outcome(reply, state.key, result);
                }
                if finished {
                    control.terminate();
                }
            }
            RefreshStage::FetchingManifest { .. } => {
                let items = match envelope.body {
                    Body::FetchResponse { items } => items,
                    other => {
                        self.counters.dropped += 1;
                        tracing::warn!(
                            node = %self.local_id,
                            key = %state.key,
                            body = other.name(),
                            "Unexpected message while fetching manifest"
                        );
                        return;
                    }
                };
                let key = state.key;
                let manifest = items
                    .into_iter()
                    .filter(|item| item.key.version_key == key)
                    .filter_map(|item| item.manifest)
                    .find(|manifest| self.policy.check_signature(manifest, &key));
                match manifest {
                    Some(manifest) => self.begin_refresh_distribution(control, state, manifest),
                    None => {
                        tracing::debug!(node = %self.local_id, key = %key, from = %envelope.source, "No valid manifest in reply; retrying");
                        self.request_manifest(control, state);
                    }
                }
            }
        }
    }

    pub(super) fn refresh_timeout(&mut self, control: &mut OpControl, state: &mut RefreshState, now: Timestamp) {
        match &mut state.stage {
            RefreshStage::FetchingManifest { attempts } => {
                tracing::debug!(node = %self.local_id, key = %state.key, attempts = *attempts, now, "Manifest fetch timed out");
                self.request_manifest(control, state);
            }
            RefreshStage::Distributing(distribute) => {
                let result = self.conclude_distribute(distribute);
                if let (Some(result), Some(reply)) = (result, state.reply.take()) {
                    self.reply_outcome(reply, state.key, result);
                }
                control.terminate();
            }
        }
    }

    pub(super) fn refresh_batch_input(
        &mut self,
        control: &mut OpControl,
        state: &mut RefreshBatchState,
        input: OpInput,
    ) {
        let (key, result) = match input {
            OpInput::Outcome(key, result) => (key, result),
            other => {
                self.discard_input(control.id, &other, "refresh batch takes only child results");
                return;
            }
        };
        state.record(key, result.map(|_| ()));
        if state.is_complete() {
            state.complete();
            control.terminate();
        }
    }

    pub(super) fn refresh_batch_timeout(&mut self, control: &mut OpControl, state: &mut RefreshBatchState) {
        tracing::warn!(
            node = %self.local_id,
            op = %control.id,
            unfinished = state.slots.iter().filter(|(_, r)| r.is_none()).count(),
            "Refresh batch timed out"
        );
        for child in std::mem::take(&mut state.children) {
            self.registry.terminate(child);
        }
        state.complete();
        control.terminate();
    }
}
