//! In-process ring of engines.
//!
//! [`SimNetwork`] owns one [`Engine`] per live node, a shared
//! [`ManualClock`] and a FIFO of messages in flight. Nothing moves until the
//! test calls [`run_until_quiet`](SimNetwork::run_until_quiet) (deliver
//! everything queued) or [`advance`](SimNetwork::advance) (step simulated
//! time through every engine deadline). Key-routed messages go to the live
//! node closest to the key, which matches the midpoint ranges the engines
//! compute once their neighbor tables have converged.

use crate::clock::ManualClock;
use crate::fixtures::small_config;
use crate::policy::ReferencePolicy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tessera_core::{
    Clock, EngineConfig, NodeId, Object, Placement, Result, RingId, Timestamp, VersionKey,
};
use tessera_engine::{Destination, Engine, Envelope, MessageTag, Overlay, Pending};
use tessera_store::MemoryStorage;
use tokio::sync::oneshot::error::TryRecvError;

/// Simulated start time; far enough from zero that expirations in the past
/// are representable.
pub const START_TIME: Timestamp = 1_000_000;

/// Messages delivered by one [`SimNetwork::run_until_quiet`] before the
/// network is declared to be looping.
const MESSAGE_STORM: usize = 1_000_000;

type DeliveryRule = Box<dyn FnMut(NodeId, &Envelope) -> bool>;

/// One message handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: NodeId,
    pub source: NodeId,
    pub tag: MessageTag,
    pub body: &'static str,
}

#[derive(Debug)]
struct NetState {
    outbox: VecDeque<(Destination, Envelope)>,
    live: BTreeSet<NodeId>,
    leaf_set_size: usize,
}

/// Overlay handed to each simulated engine.
#[derive(Debug, Clone)]
pub struct SimOverlay {
    local_id: NodeId,
    state: Arc<Mutex<NetState>>,
}

impl Overlay for SimOverlay {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn leaf_set(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut others: Vec<NodeId> = state
            .live
            .iter()
            .copied()
            .filter(|node| *node != self.local_id)
            .collect();
        others.sort_by_key(|node| (self.local_id.ring_distance(*node), *node));
        others.truncate(state.leaf_set_size);
        others
    }

    fn send(&mut self, destination: Destination, envelope: Envelope) {
        self.state.lock().outbox.push_back((destination, envelope));
    }
}

/// A deterministic network of engines sharing one clock and one signing key.
pub struct SimNetwork {
    config: EngineConfig,
    clock: ManualClock,
    policy: ReferencePolicy,
    state: Arc<Mutex<NetState>>,
    engines: BTreeMap<NodeId, Engine>,
    storage: BTreeMap<NodeId, MemoryStorage>,
    drop_rule: Option<DeliveryRule>,
    hold_rule: Option<DeliveryRule>,
    held: Vec<(NodeId, Envelope)>,
    traffic: Vec<Delivery>,
    delivered: u64,
}

impl SimNetwork {
    /// Empty network.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: ManualClock::new(START_TIME),
            policy: ReferencePolicy::new(0x7e55e7a),
            state: Arc::new(Mutex::new(NetState {
                outbox: VecDeque::new(),
                live: BTreeSet::new(),
                leaf_set_size: 8,
            })),
            engines: BTreeMap::new(),
            storage: BTreeMap::new(),
            drop_rule: None,
            hold_rule: None,
            held: Vec::new(),
            traffic: Vec::new(),
            delivered: 0,
        }
    }

    /// `count` nodes spread evenly around the ring, all aware of each other.
    pub fn ring(config: EngineConfig, count: usize) -> Self {
        let mut network = Self::new(config);
        for node in Self::spread(count) {
            network.add_node(node);
        }
        network.run_until_quiet();
        network
    }

    /// Four nodes with [`small_config`].
    pub fn small() -> Self {
        Self::ring(small_config(), 4)
    }

    /// Evenly spaced node ids, offset from zero so no node sits on a
    /// fragment of object `0`.
    pub fn spread(count: usize) -> Vec<NodeId> {
        let step = u128::MAX / count.max(1) as u128;
        (0..count as u128)
            .map(|i| RingId((i * step).wrapping_add(step / 3)))
            .collect()
    }

    /// Replace the signing policy used by nodes added from now on.
    pub fn with_policy(mut self, policy: ReferencePolicy) -> Self {
        self.policy = policy;
        self
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Start an engine at `id`. Existing engines learn about it immediately.
    pub fn add_node(&mut self, id: NodeId) {
        self.state.lock().live.insert(id);
        let storage = MemoryStorage::new();
        let overlay = SimOverlay {
            local_id: id,
            state: Arc::clone(&self.state),
        };
        let engine = Engine::new(
            self.config.clone(),
            Box::new(overlay),
            Arc::new(self.clock.clone()),
            Arc::new(self.policy.clone()),
            Box::new(storage.clone()),
        )
        .expect("engine starts");
        for other in self.engines.values_mut() {
            other.neighbor_seen(id);
        }
        self.engines.insert(id, engine);
        self.storage.insert(id, storage);
    }

    /// Crash `id`: its engine disappears and messages to it are lost. Peers
    /// only notice through neighbor timeouts.
    pub fn kill(&mut self, id: NodeId) {
        self.state.lock().live.remove(&id);
        self.engines.remove(&id);
    }

    /// Orderly departure: like [`kill`](Self::kill), but the overlay tells
    /// every remaining engine.
    pub fn depart(&mut self, id: NodeId) {
        self.kill(id);
        for other in self.engines.values_mut() {
            other.neighbor_departed(id);
        }
    }

    /// Live node ids in ring order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.engines.keys().copied().collect()
    }

    /// Engine at `id`.
    pub fn engine(&self, id: NodeId) -> &Engine {
        self.engines.get(&id).expect("node is live")
    }

    /// Mutable engine at `id`.
    pub fn engine_mut(&mut self, id: NodeId) -> &mut Engine {
        self.engines.get_mut(&id).expect("node is live")
    }

    /// Storage backend of `id`, kept even after the node dies.
    pub fn storage(&self, id: NodeId) -> &MemoryStorage {
        self.storage.get(&id).expect("node was added")
    }

    /// Shared clock.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Current simulated time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Shared signing policy.
    pub fn policy(&self) -> &ReferencePolicy {
        &self.policy
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Every delivery so far, in order.
    pub fn traffic(&self) -> &[Delivery] {
        &self.traffic
    }

    /// Forget the delivery log.
    pub fn clear_traffic(&mut self) {
        self.traffic.clear();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Live node closest to `key`.
    pub fn owner_of(&self, key: RingId) -> Option<NodeId> {
        self.engines
            .keys()
            .copied()
            .min_by_key(|node| (key.ring_distance(*node), *node))
    }

    /// Live nodes storing fragment `index` of `key`, by index.
    pub fn holders(&self, key: &VersionKey) -> BTreeMap<u32, Vec<NodeId>> {
        let mut holders: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
        for (node, engine) in &self.engines {
            for index in engine.store().indices_of(key) {
                holders.entry(index).or_default().push(*node);
            }
        }
        holders
    }

    /// Live copies of fragments of `key`.
    pub fn fragment_count(&self, key: &VersionKey) -> usize {
        self.holders(key).values().map(Vec::len).sum()
    }

    /// Node owning the placement location of fragment `index` of `key`.
    pub fn placement_owner(&self, key: &VersionKey, index: u32) -> Option<NodeId> {
        let placement = Placement::new(self.config.num_fragments);
        self.owner_of(placement.location(key.id, index, key.version))
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Discard every message for which `rule(destination node, envelope)`
    /// holds, until [`heal`](Self::heal).
    pub fn drop_where(&mut self, rule: impl FnMut(NodeId, &Envelope) -> bool + 'static) {
        self.drop_rule = Some(Box::new(rule));
    }

    /// Stop dropping messages.
    pub fn heal(&mut self) {
        self.drop_rule = None;
    }

    /// Park every message for which `rule(destination node, envelope)`
    /// holds instead of delivering it. Parked messages stay queued until
    /// [`release_held`](Self::release_held).
    pub fn hold_where(&mut self, rule: impl FnMut(NodeId, &Envelope) -> bool + 'static) {
        self.hold_rule = Some(Box::new(rule));
    }

    /// Messages parked so far.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Hand the parked messages to the test, which may alter and deliver
    /// them itself. Holding continues.
    pub fn take_held(&mut self) -> Vec<(NodeId, Envelope)> {
        std::mem::take(&mut self.held)
    }

    /// Stop holding and re-queue everything parked so far, in order.
    /// Returns how many messages were released.
    pub fn release_held(&mut self) -> usize {
        self.hold_rule = None;
        let held = std::mem::take(&mut self.held);
        let count = held.len();
        let mut state = self.state.lock();
        for (target, envelope) in held {
            state.outbox.push_back((Destination::Node(target), envelope));
        }
        count
    }

    fn route(&self, destination: Destination) -> Option<NodeId> {
        match destination {
            Destination::Node(node) => self.engines.contains_key(&node).then_some(node),
            Destination::Key(key) => self.owner_of(key),
        }
    }

    /// Deliver queued messages, including those sent in response, until
    /// none remain. Returns how many were delivered.
    pub fn run_until_quiet(&mut self) -> usize {
        let mut count = 0;
        loop {
            let next = self.state.lock().outbox.pop_front();
            let Some((destination, envelope)) = next else {
                return count;
            };
            let Some(target) = self.route(destination) else {
                tracing::trace!(?destination, body = envelope.body.name(), "No live route");
                continue;
            };
            if let Some(rule) = self.drop_rule.as_mut() {
                if rule(target, &envelope) {
                    continue;
                }
            }
            if let Some(rule) = self.hold_rule.as_mut() {
                if rule(target, &envelope) {
                    self.held.push((target, envelope));
                    continue;
                }
            }
            count += 1;
            self.delivered += 1;
            self.traffic.push(Delivery {
                target,
                source: envelope.source,
                tag: envelope.tag,
                body: envelope.body.name(),
            });
            assert!(count < MESSAGE_STORM, "message storm: {count} deliveries without quiescence");
            if let Some(engine) = self.engines.get_mut(&target) {
                engine.deliver(envelope);
            }
        }
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Tick every engine at the current time. A protocol fault fails the test.
    pub fn tick_all(&mut self) {
        for (node, engine) in &mut self.engines {
            if let Err(fault) = engine.tick() {
                panic!("engine {node} faulted: {fault}");
            }
        }
    }

    fn next_wakeup(&self) -> Option<Timestamp> {
        self.engines.values().filter_map(Engine::next_wakeup).min()
    }

    /// Step to the next engine deadline at or before `limit`, or to `limit`.
    fn step(&mut self, limit: Timestamp) {
        let at = match self.next_wakeup() {
            Some(at) if at <= limit => at,
            _ => limit,
        };
        self.clock.set(at);
        self.tick_all();
        self.run_until_quiet();
    }

    /// Advance simulated time by `ms`, running every deadline on the way.
    pub fn advance(&mut self, ms: u64) {
        let target = self.clock.now() + ms;
        self.run_until_quiet();
        while self.clock.now() < target {
            self.step(target);
        }
        // Deadlines landing exactly on the target
        self.step(target);
    }

    /// Drive the network until `pending` resolves, for at most `limit_ms`
    /// of simulated time.
    pub fn settle<T>(&mut self, mut pending: Pending<T>, limit_ms: u64) -> Result<T> {
        let limit = self.clock.now() + limit_ms;
        loop {
            self.run_until_quiet();
            match pending.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => panic!("engine dropped the reply"),
                Err(TryRecvError::Empty) => {}
            }
            assert!(
                self.clock.now() < limit,
                "operation unresolved after {limit_ms} ms of simulated time"
            );
            self.step(limit);
        }
    }

    /// Insert `object` through `via` and wait for the outcome.
    pub fn insert(
        &mut self,
        via: NodeId,
        object: Object,
        expiration: Timestamp,
    ) -> Result<usize> {
        let pending = self.engine_mut(via).insert(object, expiration);
        let limit = self.config.insert_timeout_ms * 2;
        self.settle(pending, limit)
    }

    /// Look up `key` through `via` and wait for the outcome.
    pub fn lookup(&mut self, via: NodeId, key: VersionKey) -> Result<Object> {
        let pending = self.engine_mut(via).lookup(key);
        let limit = self.config.overall_restore_timeout_ms * 2;
        self.settle(pending, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_routing_picks_the_closest_live_node() {
        let mut network = SimNetwork::small();
        let nodes = network.nodes();
        assert_eq!(network.owner_of(nodes[2]), Some(nodes[2]));
        assert_eq!(network.owner_of(nodes[2].add(RingId(5))), Some(nodes[2]));
        network.kill(nodes[2]);
        let owner = network.owner_of(nodes[2]).unwrap();
        assert_ne!(owner, nodes[2]);
    }

    #[test]
    fn engines_agree_on_a_partition_of_the_ring() {
        let network = SimNetwork::small();
        for point in [0u128, 1 << 64, 1 << 127, u128::MAX - 3] {
            let point = RingId(point);
            let owners: Vec<NodeId> = network
                .nodes()
                .into_iter()
                .filter(|node| network.engine(*node).responsible_range().contains(point))
                .collect();
            assert_eq!(owners, vec![network.owner_of(point).unwrap()], "point {point}");
        }
    }

    #[test]
    fn held_messages_arrive_once_released() {
        let mut network = SimNetwork::small();
        let via = network.nodes()[0];
        network.clear_traffic();
        network.hold_where(move |node, _| node != via);
        let expiration = network.now() + 60_000;
        let _pending = network
            .engine_mut(via)
            .insert(crate::fixtures::test_object(11, 64), expiration);
        network.run_until_quiet();
        assert!(network.traffic().iter().all(|d| d.target == via));

        let released = network.release_held();
        assert!(released > 0);
        network.run_until_quiet();
        let arrived = network.traffic().iter().filter(|d| d.target != via).count();
        assert!(arrived >= released);
    }

    #[test]
    fn advance_moves_the_clock_exactly() {
        let mut network = SimNetwork::small();
        let start = network.now();
        network.advance(12_345);
        assert_eq!(network.now(), start + 12_345);
    }
}
