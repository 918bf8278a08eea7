//! Unified error taxonomy.
//!
//! Every failure surfaced to a Tessera caller is a [`TesseraError`]. The
//! variants follow the five failure classes the engine distinguishes:
//! integrity, insufficiency, transient, local storage and usage errors.

use crate::keys::VersionKey;
use serde::{Deserialize, Serialize};

/// Broad failure class, used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Bad signature or hash mismatch. Never retried.
    Integrity,
    /// Too few receipts or fragments.
    Insufficiency,
    /// Timeouts, unresponsive peers, shutdown.
    Transient,
    /// The local store misbehaved.
    LocalStorage,
    /// Caller supplied something unusable.
    Usage,
}

/// Errors returned by Tessera operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TesseraError {
    /// Manifest signature invalid or fragment hash mismatch.
    #[error("Integrity failure for {subject}: {reason}")]
    Integrity {
        /// What failed validation (key or peer).
        subject: String,
        /// Why it failed.
        reason: String,
    },

    /// Insert or refresh did not reach its receipt quorum.
    #[error("Not enough receipts for {key}: {received}/{required}")]
    NotEnoughReceipts {
        /// Object version concerned.
        key: VersionKey,
        /// Receipts obtained.
        received: usize,
        /// Receipts needed.
        required: usize,
    },

    /// Retrieval could not gather enough valid fragments.
    #[error("Not enough fragments for {key}: found {found} after checking {checked}")]
    NotEnoughFragments {
        /// Object version concerned.
        key: VersionKey,
        /// Fragment indices asked for.
        checked: usize,
        /// Valid fragments received.
        found: usize,
    },

    /// An operation ran out of time or attempts.
    #[error("Timed out: {operation}")]
    Timeout {
        /// Operation description.
        operation: String,
    },

    /// The local store failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Details.
        message: String,
    },

    /// Encoding, decoding or (de)serialization failed.
    #[error("Encoding error: {message}")]
    Encoding {
        /// Details.
        message: String,
    },

    /// No valid manifest could be obtained for an object.
    #[error("Manifest unavailable for {key}")]
    ManifestUnavailable {
        /// Object version concerned.
        key: VersionKey,
    },

    /// The request duplicates work already in flight or a queue is full.
    #[error("Busy: {message}")]
    Busy {
        /// Details.
        message: String,
    },

    /// Invalid input or configuration.
    #[error("Invalid: {message}")]
    Invalid {
        /// Details.
        message: String,
    },

    /// The engine stopped before the operation completed.
    #[error("Engine shut down")]
    Shutdown,
}

impl TesseraError {
    /// Integrity failure for `subject`.
    pub fn integrity(subject: impl ToString, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }

    /// Timeout of `operation`.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Local storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Encoding failure.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Duplicate or overloaded request.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Invalid input.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Integrity { .. } => "integrity",
            Self::NotEnoughReceipts { .. } => "not_enough_receipts",
            Self::NotEnoughFragments { .. } => "not_enough_fragments",
            Self::Timeout { .. } => "timeout",
            Self::Storage { .. } => "storage",
            Self::Encoding { .. } => "encoding",
            Self::ManifestUnavailable { .. } => "manifest_unavailable",
            Self::Busy { .. } => "busy",
            Self::Invalid { .. } => "invalid",
            Self::Shutdown => "shutdown",
        }
    }

    /// Failure class.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::NotEnoughReceipts { .. }
            | Self::NotEnoughFragments { .. }
            | Self::ManifestUnavailable { .. } => ErrorCategory::Insufficiency,
            Self::Timeout { .. } | Self::Busy { .. } | Self::Shutdown => ErrorCategory::Transient,
            Self::Storage { .. } => ErrorCategory::LocalStorage,
            Self::Encoding { .. } | Self::Invalid { .. } => ErrorCategory::Usage,
        }
    }
}

/// Standard result type for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
