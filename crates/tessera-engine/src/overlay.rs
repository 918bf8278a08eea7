//! Ring overlay collaborator.

use crate::message::Envelope;
use tessera_core::{NodeId, RingId};

/// Where a message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Destination {
    /// A specific node.
    Node(NodeId),
    /// Whichever live node is currently closest to a ring position.
    Key(RingId),
}

/// Routing and membership services provided by the ring overlay.
pub trait Overlay: Send {
    /// This node's ring identifier.
    fn local_id(&self) -> NodeId;

    /// Nodes the overlay currently believes to be live neighbors.
    fn leaf_set(&self) -> Vec<NodeId>;

    /// Fire-and-forget delivery. Loss, duplication and reordering are allowed.
    fn send(&mut self, destination: Destination, envelope: Envelope);
}
