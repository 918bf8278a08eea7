//! Tokio actor adapter.
//!
//! [`spawn`] moves an [`Engine`] into a single task. Every mutation goes
//! through that task's command channel, so the engine keeps its
//! single-threaded execution model while callers, transports and stores run
//! concurrently around it. The timer is a sleep until the engine's next
//! wake-up; any other command re-arms it.
//!
//! A [`EngineFault`](crate::EngineFault) returned from a tick means a
//! protocol handler broke its deadline contract. The actor logs it and
//! aborts the process.

use crate::engine::{Engine, MaintenanceTask, Pending, RefreshOutcome};
use crate::message::Envelope;
use crate::stats::EngineStatistics;
use std::time::Duration;
use tessera_core::{NodeId, Object, Result, TesseraError, Timestamp, VersionKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the command channel.
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

enum Command {
    Deliver(Envelope),
    Insert {
        object: Object,
        expiration: Timestamp,
        respond: oneshot::Sender<Pending<usize>>,
    },
    Refresh {
        requests: Vec<(VersionKey, Timestamp)>,
        respond: oneshot::Sender<Pending<RefreshOutcome>>,
    },
    Lookup {
        key: VersionKey,
        respond: oneshot::Sender<Pending<Object>>,
    },
    Statistics {
        respond: oneshot::Sender<EngineStatistics>,
    },
    NeighborSeen(NodeId),
    NeighborDeparted(NodeId),
    Nudge(MaintenanceTask),
    Shutdown,
}

/// Cloneable handle to an engine running in its own task.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TesseraError::Shutdown)
    }

    async fn call<T>(&self, command: Command, response: oneshot::Receiver<Pending<T>>) -> Result<T> {
        self.submit(command).await?;
        let pending = response.await.map_err(|_| TesseraError::Shutdown)?;
        pending.await.map_err(|_| TesseraError::Shutdown)?
    }

    /// Hand an inbound message to the engine.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.submit(Command::Deliver(envelope)).await
    }

    /// Insert an object; resolves once the receipt quorum is reached.
    pub async fn insert(&self, object: Object, expiration: Timestamp) -> Result<usize> {
        let (respond, response) = oneshot::channel();
        self.call(
            Command::Insert {
                object,
                expiration,
                respond,
            },
            response,
        )
        .await
    }

    /// Extend the expiration of objects.
    pub async fn refresh(&self, requests: Vec<(VersionKey, Timestamp)>) -> Result<RefreshOutcome> {
        let (respond, response) = oneshot::channel();
        self.call(Command::Refresh { requests, respond }, response).await
    }

    /// Retrieve an object version.
    pub async fn lookup(&self, key: VersionKey) -> Result<Object> {
        let (respond, response) = oneshot::channel();
        self.call(Command::Lookup { key, respond }, response).await
    }

    /// Current statistics.
    pub async fn statistics(&self) -> Result<EngineStatistics> {
        let (respond, response) = oneshot::channel();
        self.submit(Command::Statistics { respond }).await?;
        response.await.map_err(|_| TesseraError::Shutdown)
    }

    /// Report a live neighbor.
    pub async fn neighbor_seen(&self, node: NodeId) -> Result<()> {
        self.submit(Command::NeighborSeen(node)).await
    }

    /// Report a departed neighbor.
    pub async fn neighbor_departed(&self, node: NodeId) -> Result<()> {
        self.submit(Command::NeighborDeparted(node)).await
    }

    /// Run a maintenance task ahead of schedule.
    pub async fn nudge(&self, task: MaintenanceTask) -> Result<()> {
        self.submit(Command::Nudge(task)).await
    }

    /// Stop the engine task. Pending API calls resolve to
    /// [`TesseraError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(Command::Shutdown).await
    }
}

/// Run `engine` on the current tokio runtime.
pub fn spawn(engine: Engine) -> (EngineHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let task = tokio::spawn(run(engine, inbox));
    (EngineHandle { commands }, task)
}

async fn run(mut engine: Engine, mut inbox: mpsc::Receiver<Command>) {
    tracing::info!(node = %engine.local_id(), "Engine task started");
    loop {
        let delay = engine
            .next_wakeup()
            .map(|at| Duration::from_millis(at.saturating_sub(engine.current_time())));
        let timer = async move {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => apply(&mut engine, command),
            },
            () = timer => {
                if let Err(fault) = engine.tick() {
                    tracing::error!(node = %engine.local_id(), error = %fault, "Engine fault; aborting");
                    std::process::abort();
                }
            }
        }
    }
    tracing::info!(node = %engine.local_id(), "Engine task stopped");
}

fn apply(engine: &mut Engine, command: Command) {
    match command {
        Command::Deliver(envelope) => engine.deliver(envelope),
        Command::Insert {
            object,
            expiration,
            respond,
        } => answer(respond, engine.insert(object, expiration)),
        Command::Refresh { requests, respond } => answer(respond, engine.refresh(requests)),
        Command::Lookup { key, respond } => answer(respond, engine.lookup(key)),
        Command::Statistics { respond } => answer(respond, engine.statistics()),
        Command::NeighborSeen(node) => engine.neighbor_seen(node),
        Command::NeighborDeparted(node) => engine.neighbor_departed(node),
        Command::Nudge(task) => engine.nudge(task),
        Command::Shutdown => {}
    }
}

fn answer<T>(respond: oneshot::Sender<T>, value: T) {
    if respond.send(value).is_err() {
        tracing::debug!("Caller dropped before the engine answered");
    }
}
