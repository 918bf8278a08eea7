//! Statistics feed for external monitoring.

use crate::message::MessageTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_core::IdRange;

/// Snapshot of engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatistics {
    /// Live operations in the registry.
    pub pending_operations: usize,
    /// Fragments in the local store.
    pub fragments: usize,
    /// Known neighbors.
    pub neighbors: usize,
    /// Fragments parked in the trash.
    pub trash: usize,
    /// Repair jobs waiting.
    pub pending_jobs: usize,
    /// Repair jobs running.
    pub active_jobs: usize,
    /// Object restores running.
    pub active_restores: usize,
    /// Tokens left in the traffic bucket.
    pub bucket_tokens: u32,
    /// Current responsible range.
    pub responsible_range: IdRange,
    /// Messages sent, by protocol.
    pub messages_sent_by_tag: BTreeMap<MessageTag, u64>,
    /// Messages received.
    pub messages_received: u64,
    /// Messages discarded (late, duplicate, malformed or rejected).
    pub messages_dropped: u64,
}

/// Running message counters.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageCounters {
    pub sent_by_tag: BTreeMap<MessageTag, u64>,
    pub received: u64,
    pub dropped: u64,
}

impl MessageCounters {
    pub fn sent(&mut self, tag: MessageTag) {
        *self.sent_by_tag.entry(tag).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::RingId;

    #[test]
    fn snapshot_exports_as_json() {
        let mut counters = MessageCounters::default();
        counters.sent(MessageTag::Insert);
        counters.sent(MessageTag::Insert);
        counters.sent(MessageTag::Sync);
        let stats = EngineStatistics {
            pending_operations: 2,
            fragments: 10,
            neighbors: 3,
            trash: 0,
            pending_jobs: 1,
            active_jobs: 0,
            active_restores: 0,
            bucket_tokens: 40,
            responsible_range: IdRange::new(RingId(10), RingId(20)),
            messages_sent_by_tag: counters.sent_by_tag,
            messages_received: 7,
            messages_dropped: 1,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["messages_sent_by_tag"]["Insert"], 2);
        assert_eq!(json["messages_sent_by_tag"]["Sync"], 1);
        assert_eq!(json["fragments"], 10);
    }
}
