//! Utilisation and analytics snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use context_primitives::AgentId;
use serde::{Deserialize, Serialize};

use crate::record::{ExecutionKind, ExecutionRecord};

/// Point-in-time utilisation of the three tiers. Derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsageSnapshot {
    /// Short-term entries over capacity.
    pub short_term_utilization: f64,
    /// Working buckets over capacity.
    pub working_utilization: f64,
    /// Long-term records over the configured soft capacity.
    pub long_term_utilization: f64,
    /// Weighted average of the three.
    pub overall_utilization: f64,
    /// Items across all working-memory buckets.
    pub shared_context_count: usize,
    /// Share of ingested entries discarded by compression or archival.
    pub compression_ratio: f64,
    /// Coordinator calls that touched a tier.
    pub access_count: u64,
}

/// Execution totals for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Number of records attributed to the agent.
    pub executions: usize,
    /// Mean quality score over records that carry one.
    pub average_quality: Option<f64>,
}

impl AgentPerformance {
    /// Summarises `records`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut executions = 0;
        let mut quality_sum = 0.0;
        let mut quality_count = 0_usize;
        for record in records {
            executions += 1;
            if let Some(quality) = record.quality_score() {
                quality_sum += quality;
                quality_count += 1;
            }
        }
        Self {
            executions,
            average_quality: (quality_count > 0).then(|| quality_sum / quality_count as f64),
        }
    }
}

/// Records for one agent inside a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Agent queried.
    pub agent_id: AgentId,
    /// Matching records, oldest first.
    pub records: Vec<ExecutionRecord>,
    /// Summary of `records`.
    pub summary: AgentPerformance,
}

/// Usage plus long-term history aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    /// Tier utilisation.
    pub usage: MemoryUsageSnapshot,
    /// Long-term records per kind.
    pub records_by_kind: BTreeMap<ExecutionKind, usize>,
    /// Long-term records across kinds.
    pub total_records: usize,
    /// Per-agent totals for records attributed to an agent.
    pub agents: BTreeMap<AgentId, AgentPerformance>,
}

/// Monotonic counters feeding [`MemoryUsageSnapshot`].
#[derive(Debug, Default)]
pub(crate) struct UsageCounters {
    accesses: AtomicU64,
    ingested: AtomicU64,
    discarded: AtomicU64,
}

impl UsageCounters {
    pub(crate) fn record_access(&self) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ingested(&self, count: usize) {
        self.ingested.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: usize) {
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn compression_ratio(&self) -> f64 {
        let ingested = self.ingested.load(Ordering::Relaxed);
        if ingested == 0 {
            return 0.0;
        }
        (self.discarded.load(Ordering::Relaxed) as f64 / ingested as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_ratio_is_bounded() {
        let counters = UsageCounters::default();
        assert!(counters.compression_ratio().abs() < f64::EPSILON);
        counters.record_ingested(4);
        counters.record_discarded(1);
        assert!((counters.compression_ratio() - 0.25).abs() < f64::EPSILON);
        counters.record_discarded(10);
        assert!((counters.compression_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn performance_averages_available_scores() {
        let records = [
            ExecutionRecord::builder(ExecutionKind::Task, "a")
                .quality_score(0.5)
                .build()
                .unwrap(),
            ExecutionRecord::builder(ExecutionKind::Task, "b").build().unwrap(),
            ExecutionRecord::builder(ExecutionKind::Task, "c")
                .quality_score(1.0)
                .build()
                .unwrap(),
        ];
        let summary = AgentPerformance::from_records(&records);
        assert_eq!(summary.executions, 3);
        assert!((summary.average_quality.unwrap() - 0.75).abs() < f64::EPSILON);
    }
}
