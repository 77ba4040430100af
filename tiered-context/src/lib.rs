//! Tiered context memory facade.
//!
//! Depend on this crate to pull in the memory tiers and their coordinator
//! together with the tracing helpers. Each component sits behind a feature
//! flag so hosts can leave out what they do not need.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use context_primitives as primitives;

/// Memory tiers and coordinator (enabled by `memory` feature).
#[cfg(feature = "memory")]
pub use context_memory as memory;

/// Tracing setup and span helpers (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use context_telemetry as telemetry;

/// Common imports for hosts embedding the coordinator.
#[cfg(feature = "memory")]
pub mod prelude {
    pub use context_memory::{
        ContextCategory, ContextDraft, ExecutionKind, MemoryConfig, MemoryCoordinator,
        MemoryError, MemoryResult,
    };
    pub use context_primitives::{AgentId, TaskId};
}
