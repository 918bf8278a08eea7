//! Wire format helpers.

use crate::error::WireError;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};

/// Schema version of [`WireMessage`].
pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// Versioned frame around an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Schema version the sender speaks.
    pub schema_version: u16,
    /// The message.
    pub envelope: Envelope,
}

impl WireMessage {
    /// Frame an envelope at the current schema version.
    pub fn new(envelope: Envelope) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            envelope,
        }
    }
}

/// Encode an envelope for transmission.
pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let frame = WireMessage::new(envelope.clone());
    bincode::serialize(&frame).map_err(|e| WireError::Codec {
        message: e.to_string(),
    })
}

/// Decode a received frame, rejecting other schema versions.
pub fn deserialize_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    let frame: WireMessage = bincode::deserialize(bytes).map_err(|e| WireError::Codec {
        message: e.to_string(),
    })?;
    if frame.schema_version != WIRE_SCHEMA_VERSION {
        return Err(WireError::SchemaMismatch {
            expected: WIRE_SCHEMA_VERSION,
            found: frame.schema_version,
        });
    }
    Ok(frame.envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpId;
    use crate::message::{Body, MessageTag};
    use assert_matches::assert_matches;
    use tessera_core::{RingId, VersionKey};

    #[test]
    fn frame_roundtrip() {
        let envelope = Envelope::new(
            OpId(7),
            RingId(1),
            MessageTag::Insert,
            Body::Query {
                keys: vec![VersionKey::new(RingId(2), 0).fragment(3)],
            },
        );
        let bytes = serialize_envelope(&envelope).unwrap();
        assert_eq!(deserialize_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn other_schema_rejected() {
        let frame = WireMessage {
            schema_version: WIRE_SCHEMA_VERSION + 1,
            envelope: Envelope::new(OpId::NONE, RingId(1), MessageTag::Neighbor, Body::NeighborRequest),
        };
        let bytes = bincode::serialize(&frame).unwrap();
        assert_matches!(
            deserialize_envelope(&bytes),
            Err(WireError::SchemaMismatch { found, .. }) if found == WIRE_SCHEMA_VERSION + 1
        );
    }

    #[test]
    fn garbage_rejected() {
        assert_matches!(deserialize_envelope(&[0xff, 0x01]), Err(WireError::Codec { .. }));
    }
}
