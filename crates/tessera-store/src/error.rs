//! Store errors.

use tessera_core::TesseraError;

/// Failures of the local store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend refused or failed an operation.
    #[error("Storage backend error: {message}")]
    Backend {
        /// Details.
        message: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("Stored value codec error: {message}")]
    Codec {
        /// Details.
        message: String,
    },

    /// Metadata and value disagree, e.g. a cached key vanished from the backend.
    #[error("Store inconsistency: {message}")]
    Inconsistent {
        /// Details.
        message: String,
    },
}

impl StoreError {
    /// Backend failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Codec failure.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Cache/backend mismatch.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent {
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend { .. } => "store_backend",
            Self::Codec { .. } => "store_codec",
            Self::Inconsistent { .. } => "store_inconsistent",
        }
    }
}

impl From<StoreError> for TesseraError {
    fn from(err: StoreError) -> Self {
        TesseraError::storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::codec(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
