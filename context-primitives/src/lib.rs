//! Core shared types for the tiered context memory subsystem.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Validated identifiers for tasks and agents.
pub use ids::{AgentId, TaskId};
