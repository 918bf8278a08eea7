//! Engine-level errors.

use crate::engine::OpId;
use tessera_core::{TesseraError, Timestamp};

/// Wire encoding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Bytes could not be encoded or decoded.
    #[error("Wire codec error: {message}")]
    Codec {
        /// Details.
        message: String,
    },

    /// The peer speaks another schema version.
    #[error("Wire schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version this build speaks.
        expected: u16,
        /// Version received.
        found: u16,
    },
}

impl WireError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Codec { .. } => "wire_codec",
            Self::SchemaMismatch { .. } => "wire_schema_mismatch",
        }
    }
}

impl From<WireError> for TesseraError {
    fn from(err: WireError) -> Self {
        TesseraError::encoding(err.to_string())
    }
}

/// Unrecoverable engine faults. These indicate a logic bug, not an
/// environmental problem, and the process should not continue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineFault {
    /// A timeout handler left its operation alive without moving the deadline
    /// past the current time.
    #[error(
        "Operation {op} ({kind}) did not advance its deadline: previous {previous}, new {deadline}, now {now}"
    )]
    DeadlineNotAdvanced {
        /// Offending operation.
        op: OpId,
        /// Protocol name.
        kind: &'static str,
        /// Deadline that expired.
        previous: Timestamp,
        /// Deadline after the handler ran.
        deadline: Timestamp,
        /// Clock reading.
        now: Timestamp,
    },
}
