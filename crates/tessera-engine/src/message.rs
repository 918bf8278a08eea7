//! Protocol messages.
//!
//! Every message travels in an [`Envelope`] carrying the sender, the
//! operation id responses are routed back to, and a [`MessageTag`] naming
//! the protocol that caused it. Requests and responses share one [`Body`]
//! enum; [`Body::is_response`] tells them apart.

use crate::bloom::BloomFilter;
use crate::engine::OpId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::{
    Fragment, FragmentKey, IdRange, Manifest, NodeId, Timestamp, VersionKey,
};

/// Protocol that caused a message, used for traffic accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageTag {
    /// Neighbor discovery.
    Neighbor,
    /// Anti-entropy.
    Sync,
    /// Range-change handoff.
    Handoff,
    /// Expiration refresh.
    Refresh,
    /// Insert distribution.
    Insert,
    /// Whole-object retrieval.
    Lookup,
    /// Single-fragment retrieval.
    Fetch,
    /// Repair triggered by the local scan.
    LocalScan,
}

impl MessageTag {
    /// Whether sends under this tag rebuild lost redundancy and so are
    /// charged to the traffic bucket.
    pub fn is_recovery(self) -> bool {
        matches!(self, Self::Sync | Self::Handoff | Self::Fetch | Self::LocalScan)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Neighbor => "neighbor",
            Self::Sync => "sync",
            Self::Handoff => "handoff",
            Self::Refresh => "refresh",
            Self::Insert => "insert",
            Self::Lookup => "lookup",
            Self::Fetch => "fetch",
            Self::LocalScan => "local-scan",
        };
        f.write_str(name)
    }
}

/// A message with routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation on the requester that awaits the response.
    /// [`OpId::NONE`] marks a request that expects no response.
    pub op_id: OpId,
    /// Sender.
    pub source: NodeId,
    /// Protocol accounting tag.
    pub tag: MessageTag,
    /// Payload.
    pub body: Body,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(op_id: OpId, source: NodeId, tag: MessageTag, body: Body) -> Self {
        Self {
            op_id,
            source,
            tag,
            body,
        }
    }

    /// Response to this envelope from `responder`.
    pub fn reply(&self, responder: NodeId, body: Body) -> Envelope {
        Envelope {
            op_id: self.op_id,
            source: responder,
            tag: self.tag,
            body,
        }
    }
}

/// One answer to a [`Body::Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEntry {
    /// Fragment asked about.
    pub key: FragmentKey,
    /// Whether the responder holds it.
    pub have_it: bool,
    /// Whether the fragment's location is inside the responder's range.
    pub authoritative: bool,
    /// Expiration of the held copy.
    pub expiration: Option<Timestamp>,
}

/// A fragment pushed to a holder. Without a payload it is a manifest-only
/// announcement and the holder pulls the payload itself if it needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// Fragment key.
    pub key: FragmentKey,
    /// Payload, absent for manifest-only announcements.
    pub fragment: Option<Fragment>,
    /// Manifest vouching for the fragment.
    pub manifest: Manifest,
}

/// One answer to a [`Body::Fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedItem {
    /// Fragment asked for.
    pub key: FragmentKey,
    /// Payload, if the responder could supply it.
    pub fragment: Option<Fragment>,
    /// Manifest, if the responder holds one.
    pub manifest: Option<Manifest>,
}

impl FetchedItem {
    /// Whether the responder could not help at all.
    pub fn is_empty(&self) -> bool {
        self.fragment.is_none() && self.manifest.is_none()
    }
}

/// New expiration for a held fragment, without payload or full manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPatch {
    /// Fragment to patch.
    pub key: FragmentKey,
    /// New expiration.
    pub expiration: Timestamp,
    /// Signature over the manifest with the new expiration.
    pub signature: Vec<u8>,
}

/// Message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    // ========================================================================
    // Requests
    // ========================================================================
    /// Does the responder hold these fragments?
    Query {
        /// Fragments asked about.
        keys: Vec<FragmentKey>,
    },
    /// Store these fragments or manifests.
    Data {
        /// Items pushed.
        items: Vec<DataItem>,
    },
    /// Send these fragments (or only their manifests).
    Fetch {
        /// Fragments wanted.
        keys: Vec<FragmentKey>,
        /// Omit payloads.
        manifest_only: bool,
    },
    /// Extend the expiration of held fragments.
    Patch {
        /// Patches to apply.
        patches: Vec<ManifestPatch>,
    },
    /// Anti-entropy: summarize holdings in a range.
    SyncQuery {
        /// Range, in the responder's fragment-index frame.
        range: IdRange,
        /// Fragment index offset between requester and responder.
        offset: u32,
    },
    /// Which neighbors does the responder know?
    NeighborRequest,
    /// Which range does the responder claim?
    Probe,
    /// Which fragments does the responder hold in a range?
    HoldingsQuery {
        /// Range of interest.
        range: IdRange,
    },

    // ========================================================================
    // Responses
    // ========================================================================
    /// Answer to [`Body::Query`].
    QueryResponse {
        /// One entry per key asked.
        entries: Vec<QueryEntry>,
    },
    /// Answer to [`Body::Data`]: keys now held at the pushed expiration.
    Receipt {
        /// Accepted keys.
        keys: Vec<FragmentKey>,
    },
    /// Answer to [`Body::Fetch`].
    FetchResponse {
        /// One item per key asked.
        items: Vec<FetchedItem>,
    },
    /// Answer to [`Body::Patch`]: fragments updated per object.
    PatchAck {
        /// Count of fragments now carrying the patched expiration, per object.
        counts: Vec<(VersionKey, u32)>,
    },
    /// Answer to [`Body::SyncQuery`].
    SyncResponse {
        /// Part of the requested range the responder owns.
        range: IdRange,
        /// Offset echoed from the query.
        offset: u32,
        /// Holdings in `range`; absent when the range is empty.
        bloom: Option<BloomFilter>,
    },
    /// Answer to [`Body::NeighborRequest`].
    NeighborResponse {
        /// Known neighbors with the time each was last seen.
        neighbors: Vec<(NodeId, Timestamp)>,
    },
    /// Answer to [`Body::Probe`].
    RangeReply {
        /// The responder's responsible range.
        range: IdRange,
    },
    /// Answer to [`Body::HoldingsQuery`].
    Holdings {
        /// Held fragments in the requested range.
        keys: Vec<FragmentKey>,
    },
}

impl Body {
    /// Whether this body answers a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Body::QueryResponse { .. }
                | Body::Receipt { .. }
                | Body::FetchResponse { .. }
                | Body::PatchAck { .. }
                | Body::SyncResponse { .. }
                | Body::NeighborResponse { .. }
                | Body::RangeReply { .. }
                | Body::Holdings { .. }
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Body::Query { .. } => "query",
            Body::Data { .. } => "data",
            Body::Fetch { .. } => "fetch",
            Body::Patch { .. } => "patch",
            Body::SyncQuery { .. } => "sync-query",
            Body::NeighborRequest => "neighbor-request",
            Body::Probe => "probe",
            Body::HoldingsQuery { .. } => "holdings-query",
            Body::QueryResponse { .. } => "query-response",
            Body::Receipt { .. } => "receipt",
            Body::FetchResponse { .. } => "fetch-response",
            Body::PatchAck { .. } => "patch-ack",
            Body::SyncResponse { .. } => "sync-response",
            Body::NeighborResponse { .. } => "neighbor-response",
            Body::RangeReply { .. } => "range-reply",
            Body::Holdings { .. } => "holdings",
        }
    }
}
