//! The fragment lifecycle engine.
//!
//! [`Engine`] is a single-threaded state machine. It is re-entered only
//! through [`Engine::deliver`], [`Engine::tick`] and the API calls; each
//! entry runs to completion without blocking. Operations waiting on the
//! network live in the registry until a response or their deadline
//! arrives.

mod bulk_refresh;
mod distribute;
mod handoff;
mod housekeeping;
mod neighbor;
mod operation;
mod responder;
mod retrieve;
mod sync;

pub use operation::{OpId, Pending};

use crate::error::EngineFault;
use crate::message::{Body, Envelope, MessageTag};
use crate::neighbors::NeighborTable;
use crate::overlay::{Destination, Overlay};
use crate::shaper::TrafficShaper;
use crate::stats::{EngineStatistics, MessageCounters};
use operation::{OpInput, Operation, OperationKind, OperationRegistry, Reply};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_core::{
    Clock, EngineConfig, FragmentKey, IdRange, NodeId, Object, ObjectPolicy, Placement, Result,
    RingId, TesseraError, Timestamp, VersionKey,
};
use tessera_store::{FragmentStore, StorageBackend, TrashStore};
use tokio::sync::oneshot;

/// Per-object result of a refresh.
pub type RefreshOutcome = Vec<(VersionKey, Result<()>)>;

/// Periodic maintenance tasks that can be run ahead of schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Neighbor discovery and range recomputation.
    Neighbor,
    /// Anti-entropy round.
    Sync,
    /// Range-change handoff.
    Handoff,
    /// Expired fragment deletion.
    GarbageCollection,
    /// Sibling repair scan.
    LocalScan,
    /// Repair job release.
    Shaper,
}

struct PeriodicOps {
    neighbor: OpId,
    sync: OpId,
    handoff: OpId,
    gc: OpId,
    local_scan: OpId,
    shaper: OpId,
}

/// Fragment lifecycle and repair engine for one node.
pub struct Engine {
    config: EngineConfig,
    placement: Placement,
    local_id: NodeId,
    overlay: Box<dyn Overlay>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn ObjectPolicy>,
    store: FragmentStore,
    trash: TrashStore,
    neighbors: NeighborTable,
    range: IdRange,
    shaper: TrafficShaper,
    registry: OperationRegistry,
    events: VecDeque<(OpId, OpInput)>,
    rng: StdRng,
    counters: MessageCounters,
    periodic: PeriodicOps,
}

impl Engine {
    /// Build an engine and schedule its maintenance tasks.
    pub fn new(
        config: EngineConfig,
        overlay: Box<dyn Overlay>,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn ObjectPolicy>,
        backend: Box<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let store = FragmentStore::open(backend)?;
        let now = clock.now();
        let local_id = overlay.local_id();

        let mut neighbors = NeighborTable::new(local_id);
        for node in overlay.leaf_set() {
            neighbors.seen(node, now, now);
        }
        let range = neighbors.responsible_range();

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ (local_id.bits() as u64)),
            None => StdRng::from_entropy(),
        };

        let mut registry = OperationRegistry::default();
        let mut schedule = |delay: u64, kind: OperationKind| {
            let id = registry.allocate();
            registry.insert(id, now + delay, kind);
            id
        };
        let periodic = PeriodicOps {
            neighbor: schedule(config.neighbor_delay_after_join_ms, OperationKind::Neighbor),
            sync: schedule(
                config.sync_delay_after_join_ms,
                OperationKind::Sync(sync::SyncState::default()),
            ),
            handoff: schedule(
                config.handoff_delay_after_join_ms,
                OperationKind::Handoff(handoff::HandoffState::default()),
            ),
            gc: schedule(config.gc_interval_ms, OperationKind::GarbageCollect),
            local_scan: schedule(
                config.local_scan_interval_ms,
                OperationKind::LocalScan(housekeeping::LocalScanState::default()),
            ),
            shaper: schedule(config.shaper_tick_interval_ms, OperationKind::Shaper),
        };

        tracing::info!(
            node = %local_id,
            range = %range,
            fragments = store.len(),
            neighbors = neighbors.len(),
            "Engine started"
        );

        Ok(Self {
            placement: Placement::new(config.num_fragments),
            trash: TrashStore::new(config.trash_retention_ms, config.trash_capacity),
            shaper: TrafficShaper::new(&config, now),
            config,
            local_id,
            overlay,
            clock,
            policy,
            store,
            neighbors,
            range,
            registry,
            events: VecDeque::new(),
            rng,
            counters: MessageCounters::default(),
            periodic,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// This node's ring identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Range this node currently owns.
    pub fn responsible_range(&self) -> IdRange {
        self.range
    }

    /// Read access to the fragment store.
    pub fn store(&self) -> &FragmentStore {
        &self.store
    }

    /// Current time according to the engine's clock.
    pub fn current_time(&self) -> Timestamp {
        self.now()
    }

    /// Earliest deadline among live operations.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.registry.next_deadline()
    }

    /// Current statistics.
    pub fn statistics(&mut self) -> EngineStatistics {
        let now = self.now();
        EngineStatistics {
            pending_operations: self.registry.count_live(),
            fragments: self.store.len(),
            neighbors: self.neighbors.len(),
            trash: self.trash.len(),
            pending_jobs: self.shaper.pending_jobs(),
            active_jobs: self.shaper.active_jobs(),
            active_restores: self.shaper.active_restores(),
            bucket_tokens: self.shaper.tokens(now),
            responsible_range: self.range,
            messages_sent_by_tag: self.counters.sent_by_tag.clone(),
            messages_received: self.counters.received,
            messages_dropped: self.counters.dropped,
        }
    }

    // ========================================================================
    // Caller API
    // ========================================================================

    /// Encode, sign and distribute an object. Resolves to the number of
    /// receipts once the quorum is reached.
    pub fn insert(&mut self, object: Object, expiration: Timestamp) -> Pending<usize> {
        let (tx, rx) = oneshot::channel();
        self.start_insert(object, expiration, Reply::Caller(tx));
        self.drain();
        rx
    }

    /// Extend the expiration of objects. Large batches use the bulk protocol.
    pub fn refresh(&mut self, requests: Vec<(VersionKey, Timestamp)>) -> Pending<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        if requests.len() >= self.config.bulk_refresh_threshold {
            self.start_bulk_refresh(requests, tx);
        } else {
            self.start_refresh_batch(requests, tx);
        }
        self.drain();
        rx
    }

    /// Retrieve and reconstruct an object version.
    pub fn lookup(&mut self, key: VersionKey) -> Pending<Object> {
        let (tx, rx) = oneshot::channel();
        self.start_retrieve_object(key, None, false, MessageTag::Lookup, Reply::Caller(tx));
        self.drain();
        rx
    }

    /// Retrieve version 0 of an object.
    pub fn lookup_latest(&mut self, id: RingId) -> Pending<Object> {
        self.lookup(VersionKey::new(id, 0))
    }

    /// The overlay reports a live neighbor.
    pub fn neighbor_seen(&mut self, node: NodeId) {
        let now = self.now();
        self.neighbors.seen(node, now, now);
        self.recompute_range();
        self.drain();
    }

    /// The overlay reports a departed neighbor.
    pub fn neighbor_departed(&mut self, node: NodeId) {
        if self.neighbors.remove(&node) {
            tracing::info!(node = %self.local_id, departed = %node, "Neighbor departed");
            self.recompute_range();
        }
        self.drain();
    }

    /// Run a maintenance task at the next tick.
    pub fn nudge(&mut self, task: MaintenanceTask) {
        let id = match task {
            MaintenanceTask::Neighbor => self.periodic.neighbor,
            MaintenanceTask::Sync => self.periodic.sync,
            MaintenanceTask::Handoff => self.periodic.handoff,
            MaintenanceTask::GarbageCollection => self.periodic.gc,
            MaintenanceTask::LocalScan => self.periodic.local_scan,
            MaintenanceTask::Shaper => self.periodic.shaper,
        };
        let now = self.now();
        self.registry.expedite(id, now);
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Handle one inbound message.
    pub fn deliver(&mut self, envelope: Envelope) {
        self.counters.received += 1;
        if envelope.body.is_response() {
            if self.registry.is_live(envelope.op_id) {
                self.events.push_back((envelope.op_id, OpInput::Message(envelope)));
            } else {
                self.counters.dropped += 1;
                tracing::debug!(
                    node = %self.local_id,
                    op = %envelope.op_id,
                    from = %envelope.source,
                    body = envelope.body.name(),
                    "Response for unknown or finished operation dropped"
                );
            }
        } else {
            self.handle_request(envelope);
        }
        self.drain();
    }

    /// Run every operation whose deadline has passed.
    ///
    /// Returns the next wake-up time. A timeout handler that leaves its
    /// operation alive without a deadline later than now is a fatal fault.
    pub fn tick(&mut self) -> std::result::Result<Option<Timestamp>, EngineFault> {
        let now = self.now();
        for id in self.registry.due(now) {
            let Some(mut op) = self.registry.take(id) else {
                continue;
            };
            if op.control.terminated || op.control.deadline > now {
                self.registry.restore(op);
                continue;
            }
            let previous = op.control.deadline;
            self.on_timeout(&mut op, now);
            if !op.control.terminated && op.control.deadline <= now {
                let fault = EngineFault::DeadlineNotAdvanced {
                    op: id,
                    kind: op.kind.name(),
                    previous,
                    deadline: op.control.deadline,
                    now,
                };
                tracing::error!(node = %self.local_id, error = %fault, "Protocol invariant violated");
                self.registry.restore(op);
                return Err(fault);
            }
            self.settle(op);
            self.drain();
        }
        for op in self.registry.purge() {
            self.finalize(op);
        }
        self.drain();
        Ok(self.registry.next_deadline())
    }

    fn drain(&mut self) {
        while let Some((id, input)) = self.events.pop_front() {
            let Some(mut op) = self.registry.take(id) else {
                self.discard_input(id, &input, "operation gone");
                continue;
            };
            if op.control.terminated {
                self.discard_input(id, &input, "operation terminated");
                self.registry.restore(op);
                continue;
            }
            self.on_input(&mut op, input);
            self.settle(op);
        }
    }

    fn discard_input(&mut self, id: OpId, input: &OpInput, reason: &str) {
        if let OpInput::Message(envelope) = input {
            self.counters.dropped += 1;
            tracing::debug!(op = %id, body = envelope.body.name(), reason, "Message dropped");
        } else {
            tracing::debug!(op = %id, reason, "Child result dropped");
        }
    }

    fn settle(&mut self, op: Operation) {
        if op.control.terminated {
            self.finalize(op);
        } else {
            self.registry.restore(op);
        }
    }

    fn on_input(&mut self, op: &mut Operation, input: OpInput) {
        let Operation { control, kind } = op;
        match kind {
            OperationKind::Neighbor => self.neighbor_input(input),
            OperationKind::Sync(state) => self.sync_input(state, input),
            OperationKind::Handoff(state) => self.handoff_input(state, input),
            OperationKind::Distribute(state) => self.distribute_input(control, state, input),
            OperationKind::Refresh(state) => self.refresh_input(control, state, input),
            OperationKind::RefreshBatch(state) => self.refresh_batch_input(control, state, input),
            OperationKind::BulkRefresh(state) => self.bulk_refresh_input(control, state, input),
            OperationKind::RetrieveObject(state) => self.retrieve_object_input(control, state, input),
            OperationKind::RetrieveFragment(state) => {
                self.retrieve_fragment_input(control, state, input);
            }
            OperationKind::GarbageCollect | OperationKind::LocalScan(_) | OperationKind::Shaper => {
                self.discard_input(control.id, &input, "periodic task takes no input");
            }
        }
    }

    fn on_timeout(&mut self, op: &mut Operation, now: Timestamp) {
        let Operation { control, kind } = op;
        match kind {
            OperationKind::Neighbor => {
                self.neighbor_round(control.id, now);
                control.deadline = self.next_period(control.deadline, self.config.neighbor_interval_ms, now);
            }
            OperationKind::Sync(state) => {
                self.sync_round(control.id, state, now);
                control.deadline = self.next_period(control.deadline, self.config.sync_interval_ms, now);
            }
            OperationKind::Handoff(state) => {
                self.handoff_round(control.id, state, now);
                control.deadline = self.next_period(control.deadline, self.config.handoff_interval_ms, now);
            }
            OperationKind::GarbageCollect => {
                self.collect_garbage(now);
                control.deadline = self.next_period(control.deadline, self.config.gc_interval_ms, now);
            }
            OperationKind::LocalScan(state) => {
                self.local_scan(state, now);
                control.deadline =
                    self.next_period(control.deadline, self.config.local_scan_interval_ms, now);
            }
            OperationKind::Shaper => {
                self.shaper_tick(now);
                control.deadline =
                    self.next_period(control.deadline, self.config.shaper_tick_interval_ms, now);
            }
            OperationKind::Distribute(state) => self.distribute_timeout(control, state),
            OperationKind::Refresh(state) => self.refresh_timeout(control, state, now),
            OperationKind::RefreshBatch(state) => self.refresh_batch_timeout(control, state),
            OperationKind::BulkRefresh(state) => self.bulk_refresh_timeout(control, state, now),
            OperationKind::RetrieveObject(state) => self.retrieve_object_timeout(control, state, now),
            OperationKind::RetrieveFragment(state) => {
                self.retrieve_fragment_timeout(control, state, now);
            }
        }
    }

    /// Release resources held by a terminated operation and fail any
    /// result nobody delivered.
    fn finalize(&mut self, op: Operation) {
        let id = op.control.id;
        match op.kind {
            OperationKind::RetrieveObject(mut state) => {
                if let Some(permit) = state.permit.take() {
                    self.shaper.release_restore(permit);
                }
                if let Some(reply) = state.reply.take() {
                    let err = TesseraError::timeout(format!("retrieve {} abandoned", state.key));
                    self.reply_object(reply, Err(err));
                }
            }
            OperationKind::RetrieveFragment(state) => {
                self.shaper.finish(&state.key);
                if let Some(child) = state.child {
                    self.registry.terminate(child);
                }
            }
            OperationKind::Distribute(mut state) => {
                if let Some(reply) = state.reply.take() {
                    let err = TesseraError::timeout(format!("distribute {} abandoned", state.key));
                    self.reply_outcome(reply, state.key, Err(err));
                }
            }
            OperationKind::Refresh(mut state) => {
                if let Some(reply) = state.reply.take() {
                    let err = TesseraError::timeout(format!("refresh {} abandoned", state.key));
                    self.reply_outcome(reply, state.key, Err(err));
                }
            }
            OperationKind::RefreshBatch(mut state) => state.abandon(),
            OperationKind::BulkRefresh(mut state) => state.abandon(),
            _ => {}
        }
        tracing::trace!(op = %id, "Operation finalized");
    }

    // ========================================================================
    // Helpers shared by protocols
    // ========================================================================

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Next run of a periodic task, never in the past.
    fn next_period(&self, deadline: Timestamp, interval: u64, now: Timestamp) -> Timestamp {
        (deadline + interval).max(now + 1)
    }

    fn register(&mut self, deadline: Timestamp, kind: OperationKind) -> OpId {
        let id = self.registry.allocate();
        self.registry.insert(id, deadline, kind);
        id
    }

    fn location(&self, key: &FragmentKey) -> RingId {
        self.placement.location_of(key)
    }

    fn is_responsible(&self, key: &FragmentKey) -> bool {
        self.range.contains(self.location(key))
    }

    fn send(&mut self, destination: Destination, op: OpId, tag: MessageTag, body: Body) {
        tracing::trace!(node = %self.local_id, op = %op, tag = %tag, body = body.name(), "Sending");
        self.counters.sent(tag);
        let envelope = Envelope::new(op, self.local_id, tag, body);
        self.overlay.send(destination, envelope);
    }

    fn respond(&mut self, request: &Envelope, body: Body) {
        if request.op_id == OpId::NONE {
            return;
        }
        self.counters.sent(request.tag);
        let envelope = request.reply(self.local_id, body);
        self.overlay.send(Destination::Node(request.source), envelope);
    }

    fn reply_object(&mut self, reply: Reply<Object>, result: Result<Object>) {
        match reply {
            Reply::Caller(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!("Lookup caller went away before the result arrived");
                }
            }
            Reply::Parent(parent) => self.events.push_back((parent, OpInput::Object(result))),
        }
    }

    fn reply_outcome(&mut self, reply: Reply<usize>, key: VersionKey, result: Result<usize>) {
        match reply {
            Reply::Caller(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!(key = %key, "Caller went away before the result arrived");
                }
            }
            Reply::Parent(parent) => self.events.push_back((parent, OpInput::Outcome(key, result))),
        }
    }

    fn recompute_range(&mut self) {
        let range = self.neighbors.responsible_range();
        if range != self.range {
            tracing::info!(
                node = %self.local_id,
                old = %self.range,
                new = %range,
                "Responsible range changed"
            );
            self.range = range;
            let now = self.now();
            self.registry.expedite(self.periodic.handoff, now);
            if let Some(OperationKind::Handoff(state)) = self.registry.kind_mut(self.periodic.handoff) {
                state.pull_requested = true;
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local_id", &self.local_id)
            .field("range", &self.range)
            .field("fragments", &self.store.len())
            .field("operations", &self.registry.len())
            .finish()
    }
}
