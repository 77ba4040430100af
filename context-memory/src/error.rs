//! Error types for the memory subsystem.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by memory components.
///
/// Lookups that miss return `None` and capacity pressure is resolved by
/// eviction. Outside of construction ([`MemoryError::InvalidConfig`]),
/// errors come from record validation or a failing ledger backend.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The provided configuration was invalid.
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(&'static str),
    /// A record or context item failed validation.
    #[error("invalid memory record: {0}")]
    InvalidRecord(&'static str),
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// A long-term ledger backend reported a failure.
    #[error("ledger error: {reason}")]
    Ledger {
        /// Human-readable reason describing the failure.
        reason: String,
    },
    /// A context consumer rejected a propagated item.
    #[error("context consumer error: {reason}")]
    Consumer {
        /// Human-readable reason describing the failure.
        reason: String,
    },
}

impl MemoryError {
    /// Helper to construct ledger errors from string-like values.
    #[must_use]
    pub fn ledger(reason: impl Into<String>) -> Self {
        Self::Ledger {
            reason: reason.into(),
        }
    }

    /// Helper to construct consumer errors from string-like values.
    #[must_use]
    pub fn consumer(reason: impl Into<String>) -> Self {
        Self::Consumer {
            reason: reason.into(),
        }
    }
}

/// Result type alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
