//! The tokio actor wrapped around a single-node engine.

use assert_matches::assert_matches;
use std::sync::Arc;
use tessera_core::{Clock, NodeId, RingId, SystemClock, TesseraError, MINUTES};
use tessera_engine::runtime::{self, EngineHandle};
use tessera_engine::{Destination, Engine, Envelope, MaintenanceTask, Overlay};
use tessera_store::MemoryStorage;
use tessera_testkit::{init_tracing, small_config, test_object, ReferencePolicy};
use tokio::sync::mpsc;

/// Overlay for a ring of one: everything is delivered back to the sender.
struct Loopback {
    id: NodeId,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl Overlay for Loopback {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn leaf_set(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn send(&mut self, _destination: Destination, envelope: Envelope) {
        let _ = self.outbox.send(envelope);
    }
}

fn start() -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let engine = Engine::new(
        small_config(),
        Box::new(Loopback {
            id: RingId(1 << 100),
            outbox,
        }),
        Arc::new(SystemClock),
        Arc::new(ReferencePolicy::new(5)),
        Box::new(MemoryStorage::new()),
    )
    .unwrap();
    let (handle, task) = runtime::spawn(engine);
    let forward = handle.clone();
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            if forward.deliver(envelope).await.is_err() {
                break;
            }
        }
    });
    (handle, task)
}

#[tokio::test]
async fn insert_and_lookup_through_the_handle() {
    init_tracing();
    let (handle, task) = start();
    let object = test_object(77, 2_000);
    let expiration = SystemClock.now() + 10 * MINUTES;

    let receipts = handle.insert(object.clone(), expiration).await.unwrap();
    assert!(receipts >= 3);
    assert_eq!(handle.lookup(object.key).await.unwrap(), object);

    let refreshed = handle
        .refresh(vec![(object.key, expiration + MINUTES)])
        .await
        .unwrap();
    assert_matches!(refreshed[0], (_, Ok(())));

    handle.nudge(MaintenanceTask::GarbageCollection).await.unwrap();
    let stats = handle.statistics().await.unwrap();
    assert_eq!(stats.fragments, 4);
    assert_eq!(stats.neighbors, 0);
    assert!(stats.messages_received > 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_matches!(handle.lookup(object.key).await, Err(TesseraError::Shutdown));
}

#[tokio::test]
async fn rejected_insert_resolves_immediately() {
    init_tracing();
    let (handle, task) = start();
    let object = test_object(78, 10);
    assert_matches!(
        handle.insert(object, 1).await,
        Err(TesseraError::Invalid { .. })
    );
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
