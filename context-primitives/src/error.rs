//! Shared error definitions for context primitives.

use thiserror::Error;

/// Result alias used throughout the context memory crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// An identifier failed validation.
    #[error("invalid {kind} id `{id}`: {reason}")]
    InvalidIdentifier {
        /// Which identifier family was being parsed (`task`, `agent`).
        kind: &'static str,
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },
}
