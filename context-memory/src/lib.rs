//! Tiered context memory for agents.
//!
//! Three tiers sit behind a single [`MemoryCoordinator`]:
//!
//! - short-term memory caches recent [`TaskContext`]s with LRU eviction and a TTL;
//! - working memory files shared context into category buckets and keeps
//!   per-agent scratch state;
//! - long-term memory is an append-only [`ExecutionLedger`] of completed work.
//!
//! The coordinator classifies and propagates shared context, reports
//! utilisation, and runs periodic maintenance that expires, archives, and
//! compresses entries across the tiers.

#![warn(missing_docs, clippy::pedantic)]

mod classify;
mod clock;
mod config;
mod coordinator;
mod error;
mod long_term;
mod maintenance;
mod metrics;
mod propagation;
mod record;
mod short_term;
mod similarity;
mod working;

pub use classify::{CategoryMatch, ContextClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CategoryPolicy, MemoryConfig, TierWeights};
pub use coordinator::{MemoryCoordinator, MemoryCoordinatorBuilder, ShareOutcome, SharedPlacement};
pub use error::{MemoryError, MemoryResult};
pub use long_term::{ExecutionLedger, InMemoryLedger};
pub use maintenance::{
    CompressionReport, MaintenanceHandle, MaintenanceOutcome, MaintenanceReport, MaintenanceState,
};
pub use metrics::{AgentPerformance, AnalyticsSnapshot, MemoryUsageSnapshot, PerformanceReport};
pub use propagation::{ContextConsumer, Delivery, PropagationReport, Propagator};
pub use record::{
    AgentScratch, ContextCategory, ContextDraft, ExecutionKind, ExecutionRecord,
    ExecutionRecordBuilder, SharedContextItem, SharedContextItemBuilder, TaskContext,
    TaskContextBuilder,
};
pub use short_term::{ShortTermConfig, ShortTermStore};
pub use similarity::{RelatedTask, TaskPattern, jaccard};
pub use working::{AddOutcome, CategoryLimits, RankedItem, WorkingConfig, WorkingStore};
