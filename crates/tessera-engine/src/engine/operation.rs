//! Operation registry.
//!
//! Every in-flight protocol step is an [`Operation`]: a unique id, a
//! deadline, a terminated flag and a protocol-specific [`OperationKind`].
//! Ids are allocated from a counter and never reused. Terminated
//! operations stay in the registry only until the next purge.

use super::bulk_refresh::BulkRefreshState;
use super::distribute::{DistributeState, RefreshBatchState, RefreshState};
use super::handoff::HandoffState;
use super::housekeeping::LocalScanState;
use super::retrieve::{RetrieveFragmentState, RetrieveObjectState};
use super::sync::SyncState;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tessera_core::{Object, Result, Timestamp, VersionKey};
use tokio::sync::oneshot;

/// Operation identifier, unique for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl OpId {
    /// Marks requests that expect no response.
    pub const NONE: OpId = OpId(0);
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Receiver for the result of an engine API call.
pub type Pending<T> = oneshot::Receiver<Result<T>>;

/// Where an operation delivers its result.
pub(crate) enum Reply<T> {
    /// An API caller.
    Caller(oneshot::Sender<Result<T>>),
    /// A parent operation.
    Parent(OpId),
}

/// Scheduling state shared by all operations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpControl {
    pub id: OpId,
    pub deadline: Timestamp,
    pub terminated: bool,
}

impl OpControl {
    pub fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Protocol state, one variant per protocol.
pub(crate) enum OperationKind {
    Neighbor,
    Sync(SyncState),
    Handoff(HandoffState),
    GarbageCollect,
    LocalScan(LocalScanState),
    Shaper,
    Distribute(DistributeState),
    Refresh(RefreshState),
    RefreshBatch(RefreshBatchState),
    BulkRefresh(BulkRefreshState),
    RetrieveObject(RetrieveObjectState),
    RetrieveFragment(RetrieveFragmentState),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Neighbor => "neighbor",
            Self::Sync(_) => "sync",
            Self::Handoff(_) => "handoff",
            Self::GarbageCollect => "garbage-collect",
            Self::LocalScan(_) => "local-scan",
            Self::Shaper => "shaper",
            Self::Distribute(_) => "distribute",
            Self::Refresh(_) => "refresh",
            Self::RefreshBatch(_) => "refresh-batch",
            Self::BulkRefresh(_) => "bulk-refresh",
            Self::RetrieveObject(_) => "retrieve-object",
            Self::RetrieveFragment(_) => "retrieve-fragment",
        }
    }
}

pub(crate) struct Operation {
    pub control: OpControl,
    pub kind: OperationKind,
}

/// Input delivered to a live operation.
pub(crate) enum OpInput {
    /// A response message.
    Message(Envelope),
    /// Result of a child object retrieval.
    Object(Result<Object>),
    /// Result of a child distribution or refresh.
    Outcome(VersionKey, Result<usize>),
}

#[derive(Default)]
pub(crate) struct OperationRegistry {
    ops: BTreeMap<OpId, Operation>,
    next_id: u64,
}

impl OperationRegistry {
    pub fn allocate(&mut self) -> OpId {
        self.next_id += 1;
        OpId(self.next_id)
    }

    pub fn insert(&mut self, id: OpId, deadline: Timestamp, kind: OperationKind) {
        let control = OpControl {
            id,
            deadline,
            terminated: false,
        };
        if self.ops.insert(id, Operation { control, kind }).is_some() {
            tracing::error!(op = %id, "Operation id registered twice");
        }
    }

    /// Remove an operation for exclusive use by a handler.
    pub fn take(&mut self, id: OpId) -> Option<Operation> {
        self.ops.remove(&id)
    }

    /// Put back an operation taken with [`take`](Self::take).
    pub fn restore(&mut self, op: Operation) {
        self.ops.insert(op.control.id, op);
    }

    pub fn kind_mut(&mut self, id: OpId) -> Option<&mut OperationKind> {
        self.ops.get_mut(&id).map(|op| &mut op.kind)
    }

    pub fn is_live(&self, id: OpId) -> bool {
        self.ops.get(&id).is_some_and(|op| !op.control.terminated)
    }

    pub fn terminate(&mut self, id: OpId) -> bool {
        match self.ops.get_mut(&id) {
            Some(op) if !op.control.terminated => {
                op.control.terminate();
                true
            }
            _ => false,
        }
    }

    /// Pull a live operation's deadline forward to `when`.
    pub fn expedite(&mut self, id: OpId, when: Timestamp) {
        if let Some(op) = self.ops.get_mut(&id) {
            op.control.deadline = op.control.deadline.min(when);
        }
    }

    /// Live operations whose deadline has passed, earliest first.
    pub fn due(&self, now: Timestamp) -> Vec<OpId> {
        let mut due: Vec<(Timestamp, OpId)> = self
            .ops
            .values()
            .filter(|op| !op.control.terminated && op.control.deadline <= now)
            .map(|op| (op.control.deadline, op.control.id))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.ops
            .values()
            .filter(|op| !op.control.terminated)
            .map(|op| op.control.deadline)
            .min()
    }

    /// Remove and return every terminated operation.
    pub fn purge(&mut self) -> Vec<Operation> {
        let done: Vec<OpId> = self
            .ops
            .values()
            .filter(|op| op.control.terminated)
            .map(|op| op.control.id)
            .collect();
        done.into_iter().filter_map(|id| self.ops.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn count_live(&self) -> usize {
        self.ops.values().filter(|op| !op.control.terminated).count()
    }
}
