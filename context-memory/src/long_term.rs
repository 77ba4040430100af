//! Long-term execution ledger.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_primitives::AgentId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::MemoryResult;
use crate::record::{ExecutionKind, ExecutionRecord};

/// Trait implemented by long-term ledgers.
///
/// Implementations must serialise writers: records are stored in the order
/// `append` calls complete, and concurrent callers queue rather than race.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Appends a record.
    async fn append(&self, record: ExecutionRecord) -> MemoryResult<()>;

    /// Returns `agent_id`'s records with `timestamp >= since`, oldest first.
    async fn query(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> MemoryResult<Vec<ExecutionRecord>>;

    /// Returns every record of `kind` (or all records when `None`) in stored order.
    async fn records(&self, kind: Option<ExecutionKind>) -> MemoryResult<Vec<ExecutionRecord>>;

    /// Deletes records with `timestamp < cutoff`, returning how many were removed.
    /// Records at or after `cutoff` are never touched.
    async fn archive_old_entries(&self, cutoff: DateTime<Utc>) -> MemoryResult<usize>;

    /// Number of records per kind. Every kind is present, possibly with zero.
    async fn count_by_kind(&self) -> MemoryResult<BTreeMap<ExecutionKind, usize>>;

    /// Number of records across all kinds.
    async fn total_count(&self) -> MemoryResult<usize> {
        Ok(self.count_by_kind().await?.values().sum())
    }
}

/// Ledger kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn append(&self, record: ExecutionRecord) -> MemoryResult<()> {
        let mut guard = self.records.lock().await;
        guard.push(record);
        Ok(())
    }

    async fn query(
        &self,
        agent_id: &AgentId,
        since: DateTime<Utc>,
    ) -> MemoryResult<Vec<ExecutionRecord>> {
        let guard = self.records.lock().await;
        let mut matches: Vec<ExecutionRecord> = guard
            .iter()
            .filter(|record| record.agent_id() == Some(agent_id) && record.timestamp() >= since)
            .cloned()
            .collect();
        // Stable: records sharing a timestamp keep completion order.
        matches.sort_by_key(ExecutionRecord::timestamp);
        Ok(matches)
    }

    async fn records(&self, kind: Option<ExecutionKind>) -> MemoryResult<Vec<ExecutionRecord>> {
        let guard = self.records.lock().await;
        Ok(guard
            .iter()
            .filter(|record| kind.is_none_or(|kind| record.kind() == kind))
            .cloned()
            .collect())
    }

    async fn archive_old_entries(&self, cutoff: DateTime<Utc>) -> MemoryResult<usize> {
        let mut guard = self.records.lock().await;
        let before = guard.len();
        guard.retain(|record| record.timestamp() >= cutoff);
        let removed = before - guard.len();
        if removed > 0 {
            debug!(removed, %cutoff, "archived long-term records");
        }
        Ok(removed)
    }

    async fn count_by_kind(&self) -> MemoryResult<BTreeMap<ExecutionKind, usize>> {
        let guard = self.records.lock().await;
        let mut counts: BTreeMap<ExecutionKind, usize> =
            ExecutionKind::ALL.into_iter().map(|kind| (kind, 0)).collect();
        for record in guard.iter() {
            *counts.entry(record.kind()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn total_count(&self) -> MemoryResult<usize> {
        Ok(self.records.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn record(kind: ExecutionKind, agent: &str, secs: i64) -> ExecutionRecord {
        ExecutionRecord::builder(kind, format!("subject-{secs}"))
            .agent(AgentId::new(agent).unwrap())
            .timestamp(at(secs))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn query_filters_by_agent_and_inclusive_bound() {
        let ledger = InMemoryLedger::new();
        for secs in [20, 0, 10, 3700, 3800] {
            ledger.append(record(ExecutionKind::Task, "A1", secs)).await.unwrap();
        }
        ledger.append(record(ExecutionKind::Task, "B2", 15)).await.unwrap();

        let agent = AgentId::new("A1").unwrap();
        let found: Vec<i64> = ledger
            .query(&agent, at(10))
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp().timestamp())
            .collect();
        assert_eq!(found, [10, 20, 3700, 3800]);
    }

    #[tokio::test]
    async fn archive_removes_only_strictly_older_records() {
        let ledger = InMemoryLedger::new();
        for secs in [5, 10, 15] {
            ledger.append(record(ExecutionKind::Workflow, "A1", secs)).await.unwrap();
        }
        assert_eq!(ledger.archive_old_entries(at(10)).await.unwrap(), 1);
        assert_eq!(ledger.archive_old_entries(at(10)).await.unwrap(), 0);
        let remaining: Vec<i64> = ledger
            .records(None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp().timestamp())
            .collect();
        assert_eq!(remaining, [10, 15]);
    }

    #[tokio::test]
    async fn counts_aggregate_across_kinds() {
        let ledger = InMemoryLedger::new();
        ledger.append(record(ExecutionKind::Task, "A1", 1)).await.unwrap();
        ledger.append(record(ExecutionKind::Graph, "A1", 2)).await.unwrap();
        ledger.append(record(ExecutionKind::Graph, "A2", 3)).await.unwrap();

        let counts = ledger.count_by_kind().await.unwrap();
        assert_eq!(counts[&ExecutionKind::Graph], 2);
        assert_eq!(counts[&ExecutionKind::Aggregate], 0);
        assert_eq!(ledger.total_count().await.unwrap(), 3);
        assert_eq!(
            ledger.records(Some(ExecutionKind::Task)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_queue_without_loss() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for writer in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    let record = ExecutionRecord::builder(ExecutionKind::Task, format!("w{writer}"))
                        .attribute("seq", serde_json::Value::from(n))
                        .build()
                        .unwrap();
                    ledger.append(record).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = ledger.records(None).await.unwrap();
        assert_eq!(records.len(), 200);
        // Each writer's own appends land in issue order.
        for writer in 0..8 {
            let seqs: Vec<i64> = records
                .iter()
                .filter(|r| r.subject_id() == format!("w{writer}"))
                .filter_map(|r| r.attributes().get("seq").and_then(serde_json::Value::as_i64))
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }
    }
}
