//! Coordinates short-term, working, and long-term memory behind one API.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use context_primitives::{AgentId, TaskId};
use context_telemetry::{maintenance_span, operation_span};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::classify::ContextClassifier;
use crate::clock::{Clock, SystemClock, saturating_sub};
use crate::config::MemoryConfig;
use crate::long_term::{ExecutionLedger, InMemoryLedger};
use crate::maintenance::{
    self, CompressionReport, CycleGate, MaintenanceHandle, MaintenanceOutcome, MaintenanceReport,
    MaintenanceState,
};
use crate::metrics::{
    AgentPerformance, AnalyticsSnapshot, MemoryUsageSnapshot, PerformanceReport, UsageCounters,
};
use crate::propagation::{ContextConsumer, Delivery, PropagationReport, Propagator};
use crate::record::{
    AgentScratch, ContextCategory, ContextDraft, ExecutionKind, ExecutionRecord, SharedContextItem,
    TaskContext, TaskContextBuilder,
};
use crate::short_term::{ShortTermConfig, ShortTermStore};
use crate::similarity::{self, RelatedTask, TaskPattern};
use crate::working::{AddOutcome, RankedItem, WorkingConfig, WorkingStore};
use crate::{MemoryError, MemoryResult};

/// Builder for [`MemoryCoordinator`] instances.
pub struct MemoryCoordinatorBuilder {
    config: MemoryConfig,
    ledger: Option<Arc<dyn ExecutionLedger>>,
    clock: Option<Arc<dyn Clock>>,
}

impl MemoryCoordinatorBuilder {
    /// Starts a new builder using the supplied configuration.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            ledger: None,
            clock: None,
        }
    }

    /// Installs a long-term ledger. Defaults to [`InMemoryLedger`].
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Installs a clock. Defaults to [`SystemClock`].
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the [`MemoryCoordinator`].
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] when the configuration fails validation.
    pub fn build(self) -> MemoryResult<MemoryCoordinator> {
        self.config.validate()?;
        let capacity = NonZeroUsize::new(self.config.max_short_term_entries).ok_or(
            MemoryError::InvalidConfig("short-term capacity must be greater than zero"),
        )?;
        let short_term = ShortTermStore::new(ShortTermConfig::new(
            capacity,
            self.config.short_term_ttl,
        ));
        let working = WorkingStore::new(WorkingConfig::from_memory_config(&self.config)?);

        Ok(MemoryCoordinator {
            inner: Arc::new(Inner {
                classifier: ContextClassifier::from_config(&self.config),
                tiers: RwLock::new(Tiers {
                    short_term,
                    working,
                }),
                ledger: self
                    .ledger
                    .unwrap_or_else(|| Arc::new(InMemoryLedger::new())),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                propagator: Propagator::new(),
                counters: UsageCounters::default(),
                gate: CycleGate::default(),
                cycles: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

struct Tiers {
    short_term: ShortTermStore,
    working: WorkingStore,
}

struct Inner {
    config: MemoryConfig,
    classifier: ContextClassifier,
    tiers: RwLock<Tiers>,
    ledger: Arc<dyn ExecutionLedger>,
    clock: Arc<dyn Clock>,
    propagator: Propagator,
    counters: UsageCounters,
    gate: CycleGate,
    cycles: AtomicU64,
}

/// Item stored by [`MemoryCoordinator::share_context`].
#[derive(Debug, Clone, PartialEq)]
pub struct SharedPlacement {
    /// Bucket the item went into.
    pub key: String,
    /// Category it was classified under.
    pub category: ContextCategory,
    /// Relevance computed for that category.
    pub relevance: f64,
}

/// What [`MemoryCoordinator::share_context`] did with a draft.
#[derive(Debug)]
pub struct ShareOutcome {
    /// Categories the draft was stored under.
    pub stored: Vec<SharedPlacement>,
    /// Categories that matched but fell below their relevance threshold.
    pub below_threshold: Vec<ContextCategory>,
    /// Background propagation task, when any consumer was registered.
    /// Dropping it does not cancel delivery.
    pub propagation: Option<JoinHandle<PropagationReport>>,
}

/// Central memory facade. Cheap to clone; clones share state.
///
/// Mutations of short-term and working memory are serialised by one
/// readers-writer lock, and reads that bump recency take the write side.
/// The long-term ledger serialises its own writers independently.
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("config", &self.inner.config)
            .field("ledger", &"dyn ExecutionLedger")
            .field("clock", &self.inner.clock)
            .field("maintenance", &self.inner.gate.state())
            .finish_non_exhaustive()
    }
}

impl MemoryCoordinator {
    /// Creates a builder for a coordinator.
    #[must_use]
    pub fn builder(config: MemoryConfig) -> MemoryCoordinatorBuilder {
        MemoryCoordinatorBuilder::new(config)
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// Returns the current time according to the coordinator's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Returns the long-term ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.inner.ledger
    }

    // ---- short-term ----

    /// Starts a task context stamped with the coordinator's clock.
    #[must_use]
    pub fn new_task_context(
        &self,
        task_id: TaskId,
        description: impl Into<String>,
    ) -> TaskContextBuilder {
        TaskContext::builder(task_id, description).created_at(self.now())
    }

    /// Stores a task context as most recently used, evicting the least
    /// recently used context when over capacity.
    pub async fn store_context(&self, context: TaskContext) {
        self.inner.counters.record_access();
        let evicted = self.inner.tiers.write().await.short_term.store(context);
        self.inner.counters.record_ingested(1);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "short-term capacity reached");
        }
    }

    /// Returns a task context and marks it most recently used.
    pub async fn get_context(&self, task_id: &TaskId) -> Option<TaskContext> {
        self.inner.counters.record_access();
        self.inner.tiers.write().await.short_term.get(task_id)
    }

    /// Returns a task context without touching recency.
    pub async fn peek_context(&self, task_id: &TaskId) -> Option<TaskContext> {
        self.inner.counters.record_access();
        self.inner
            .tiers
            .read()
            .await
            .short_term
            .peek(task_id)
            .cloned()
    }

    /// Returns up to `limit` task contexts, most recently used first.
    pub async fn recent_contexts(&self, limit: usize) -> Vec<TaskContext> {
        self.inner.counters.record_access();
        self.inner.tiers.read().await.short_term.recent(limit)
    }

    /// Finds cached tasks whose requirement tags resemble `tags`
    /// (Jaccard similarity at least `min_similarity`), best first.
    pub async fn related_tasks<S: AsRef<str> + Sync>(
        &self,
        tags: &[S],
        min_similarity: f64,
        limit: usize,
    ) -> Vec<RelatedTask> {
        self.inner.counters.record_access();
        let tiers = self.inner.tiers.read().await;
        similarity::related_tasks(tiers.short_term.iter_recent(), tags, min_similarity, limit)
    }

    // ---- working ----

    /// Classifies `draft` against every category's trigger vocabulary and
    /// stores one item per matching category that clears its threshold, then
    /// notifies consumers in the background (at most once, unordered).
    pub async fn share_context(&self, draft: ContextDraft) -> ShareOutcome {
        self.share(draft)
            .instrument(operation_span("share_context"))
            .await
    }

    async fn share(&self, draft: ContextDraft) -> ShareOutcome {
        self.inner.counters.record_access();
        let now = self.now();
        let matches = self.inner.classifier.classify(&draft.content);

        let mut stored = Vec::new();
        let mut below_threshold = Vec::new();
        let mut deliveries = Vec::new();
        {
            let mut tiers = self.inner.tiers.write().await;
            for found in matches {
                let key = draft.bucket_key(found.category);
                let item = match SharedContextItem::builder(found.category, draft.content.clone())
                    .relevance(found.relevance)
                    .created_at(now)
                    .origin_turn(draft.origin_turn)
                    .merge_metadata(draft.metadata.clone())
                    .build()
                {
                    Ok(item) => item,
                    Err(err) => {
                        warn!(?err, category = %found.category, "skipping unbuildable context item");
                        continue;
                    }
                };
                let shared = Arc::new(item.clone());
                match tiers.working.add_shared_item(&key, item) {
                    AddOutcome::Stored { .. } => {
                        self.inner.counters.record_ingested(1);
                        stored.push(SharedPlacement {
                            key: key.clone(),
                            category: found.category,
                            relevance: found.relevance,
                        });
                        deliveries.push(Delivery { key, item: shared });
                    }
                    AddOutcome::BelowThreshold => below_threshold.push(found.category),
                }
            }
        }

        let propagation = self.inner.propagator.propagate(deliveries).await;
        ShareOutcome {
            stored,
            below_threshold,
            propagation,
        }
    }

    /// Adds an already classified item to bucket `key` without propagation.
    pub async fn add_shared_item(&self, key: &str, item: SharedContextItem) -> AddOutcome {
        self.inner.counters.record_access();
        let outcome = self.inner.tiers.write().await.working.add_shared_item(key, item);
        if outcome.is_stored() {
            self.inner.counters.record_ingested(1);
        }
        outcome
    }

    /// Items of bucket `key`, best blended relevance/recency score first.
    pub async fn shared_context(&self, key: &str) -> Vec<Arc<SharedContextItem>> {
        self.inner.counters.record_access();
        let now = self.now();
        self.inner.tiers.read().await.working.shared_context(key, now)
    }

    /// Items of several buckets merged and ranked by blended score.
    pub async fn shared_context_for(&self, keys: &[&str]) -> Vec<RankedItem> {
        self.inner.counters.record_access();
        let now = self.now();
        self.inner.tiers.read().await.working.ranked(keys, now)
    }

    /// Keys of stale working-memory buckets.
    pub async fn stale_contexts(&self) -> Vec<String> {
        self.inner.counters.record_access();
        let now = self.now();
        self.inner.tiers.read().await.working.stale_contexts(now)
    }

    /// Removes bucket `key` outright. Returns whether it existed.
    pub async fn remove_context(&self, key: &str) -> bool {
        self.inner.counters.record_access();
        self.inner
            .tiers
            .write()
            .await
            .working
            .remove_context(key)
            .is_some()
    }

    /// Sets one scratch entry for `agent_id`, returning the previous value.
    pub async fn set_scratch(
        &self,
        agent_id: &AgentId,
        key: impl Into<String>,
        value: Value,
    ) -> Option<Value> {
        self.inner.counters.record_access();
        self.inner
            .tiers
            .write()
            .await
            .working
            .set_scratch(agent_id, key, value)
    }

    /// Returns a copy of `agent_id`'s scratch map.
    pub async fn get_scratch(&self, agent_id: &AgentId) -> Option<AgentScratch> {
        self.inner.counters.record_access();
        self.inner
            .tiers
            .read()
            .await
            .working
            .scratch(agent_id)
            .cloned()
    }

    /// Ends the session: drops every working bucket and scratch map.
    /// Returns the number of buckets dropped.
    pub async fn end_session(&self) -> usize {
        self.inner.counters.record_access();
        let dropped = self.inner.tiers.write().await.working.clear();
        info!(dropped, "session ended; working memory cleared");
        dropped
    }

    /// Registers a consumer for shared-context propagation.
    pub async fn register_consumer(&self, consumer: Arc<dyn ContextConsumer>) {
        self.inner.propagator.register(consumer).await;
    }

    // ---- long-term ----

    /// Appends a record to the long-term ledger.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by the configured ledger.
    pub async fn record_execution(&self, record: ExecutionRecord) -> MemoryResult<()> {
        self.inner.counters.record_access();
        self.inner.ledger.append(record).await
    }

    /// Records a completed task, carrying its requirement tags into history.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by the configured ledger.
    pub async fn record_task_completion(
        &self,
        context: &TaskContext,
        agent_id: Option<AgentId>,
        quality_score: Option<f64>,
    ) -> MemoryResult<()> {
        let mut builder = ExecutionRecord::builder(ExecutionKind::Task, context.task_id().as_str())
            .timestamp(self.now())
            .tags(context.requirements().iter().cloned())?
            .attribute("description", Value::from(context.description()));
        if let Some(agent_id) = agent_id {
            builder = builder.agent(agent_id);
        }
        if let Some(score) = quality_score {
            builder = builder.quality_score(score);
        }
        self.record_execution(builder.build()?).await
    }

    /// Records a completed workflow.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] for an empty id or out-of-range
    /// score, or a ledger failure.
    pub async fn record_workflow_completion(
        &self,
        workflow_id: &str,
        agent_id: Option<AgentId>,
        quality_score: Option<f64>,
    ) -> MemoryResult<()> {
        self.record_simple(ExecutionKind::Workflow, workflow_id, agent_id, quality_score)
            .await
    }

    /// Records a completed task graph.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] for an empty id or out-of-range
    /// score, or a ledger failure.
    pub async fn record_graph_completion(
        &self,
        graph_id: &str,
        agent_id: Option<AgentId>,
        quality_score: Option<f64>,
    ) -> MemoryResult<()> {
        self.record_simple(ExecutionKind::Graph, graph_id, agent_id, quality_score)
            .await
    }

    /// Records an aggregate summary with free-form attributes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] for an empty subject, or a ledger failure.
    pub async fn record_aggregate(
        &self,
        subject_id: &str,
        agent_id: Option<AgentId>,
        attributes: Map<String, Value>,
    ) -> MemoryResult<()> {
        let mut builder = ExecutionRecord::builder(ExecutionKind::Aggregate, subject_id)
            .timestamp(self.now());
        for (key, value) in attributes {
            builder = builder.attribute(key, value);
        }
        if let Some(agent_id) = agent_id {
            builder = builder.agent(agent_id);
        }
        self.record_execution(builder.build()?).await
    }

    async fn record_simple(
        &self,
        kind: ExecutionKind,
        subject_id: &str,
        agent_id: Option<AgentId>,
        quality_score: Option<f64>,
    ) -> MemoryResult<()> {
        let mut builder = ExecutionRecord::builder(kind, subject_id).timestamp(self.now());
        if let Some(agent_id) = agent_id {
            builder = builder.agent(agent_id);
        }
        if let Some(score) = quality_score {
            builder = builder.quality_score(score);
        }
        self.record_execution(builder.build()?).await
    }

    /// Returns `agent_id`'s records no older than `now - window` (inclusive),
    /// oldest first, with a summary.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by the configured ledger.
    pub async fn query_performance(
        &self,
        agent_id: &AgentId,
        window: Duration,
    ) -> MemoryResult<PerformanceReport> {
        self.inner.counters.record_access();
        let since = saturating_sub(self.now(), window);
        let records = self.inner.ledger.query(agent_id, since).await?;
        Ok(PerformanceReport {
            agent_id: agent_id.clone(),
            summary: AgentPerformance::from_records(&records),
            records,
        })
    }

    /// Tags recurring across at least `min_support` completed tasks.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by the configured ledger.
    pub async fn task_patterns(&self, min_support: usize) -> MemoryResult<Vec<TaskPattern>> {
        self.inner.counters.record_access();
        let records = self.inner.ledger.records(Some(ExecutionKind::Task)).await?;
        Ok(similarity::extract_patterns(&records, min_support))
    }

    // ---- metrics ----

    /// Recomputes tier utilisation from current state.
    pub async fn usage_snapshot(&self) -> MemoryUsageSnapshot {
        let long_term_records = match self.inner.ledger.total_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(?err, "long-term count unavailable; reporting zero");
                0
            }
        };
        let tiers = self.inner.tiers.read().await;
        self.snapshot_from(&tiers, long_term_records)
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot_from(&self, tiers: &Tiers, long_term_records: usize) -> MemoryUsageSnapshot {
        let short_term = tiers.short_term.utilization();
        let working = tiers.working.utilization();
        let long_term = (long_term_records as f64
            / self.inner.config.max_long_term_records.max(1) as f64)
            .clamp(0.0, 1.0);
        MemoryUsageSnapshot {
            short_term_utilization: short_term,
            working_utilization: working,
            long_term_utilization: long_term,
            overall_utilization: self
                .inner
                .config
                .tier_weights
                .blend(short_term, working, long_term),
            shared_context_count: tiers.working.item_count(),
            compression_ratio: self.inner.counters.compression_ratio(),
            access_count: self.inner.counters.accesses(),
        }
    }

    /// Usage plus long-term aggregates.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by the configured ledger.
    pub async fn analytics_snapshot(&self) -> MemoryResult<AnalyticsSnapshot> {
        let records = self.inner.ledger.records(None).await?;
        let records_by_kind = self.inner.ledger.count_by_kind().await?;
        let total_records: usize = records_by_kind.values().sum();

        let mut by_agent: BTreeMap<AgentId, Vec<&ExecutionRecord>> = BTreeMap::new();
        for record in &records {
            if let Some(agent_id) = record.agent_id() {
                by_agent.entry(agent_id.clone()).or_default().push(record);
            }
        }
        let agents = by_agent
            .into_iter()
            .map(|(agent_id, records)| (agent_id, AgentPerformance::from_records(records)))
            .collect();

        let usage = {
            let tiers = self.inner.tiers.read().await;
            self.snapshot_from(&tiers, total_records)
        };
        Ok(AnalyticsSnapshot {
            usage,
            records_by_kind,
            total_records,
            agents,
        })
    }

    // ---- maintenance ----

    /// Promotes stale working buckets to long-term aggregate records, then
    /// removes them. A bucket whose promotion fails stays in working memory.
    ///
    /// Returns `(archived, failures)`.
    pub async fn archive_stale_contexts(&self) -> (usize, usize) {
        let now = self.now();
        let mut tiers = self.inner.tiers.write().await;
        self.archive_stale_locked(&mut tiers, now).await
    }

    async fn archive_stale_locked(&self, tiers: &mut Tiers, now: DateTime<Utc>) -> (usize, usize) {
        let mut archived = 0;
        let mut failures = 0;
        for key in tiers.working.stale_contexts(now) {
            let items = tiers.working.items(&key);
            let record = match archive_record(&key, &items, now) {
                Ok(record) => record,
                Err(err) => {
                    failures += 1;
                    warn!(key = %key, ?err, "could not summarise stale bucket");
                    continue;
                }
            };
            // Append before removal so the items are never absent from both tiers.
            if let Err(err) = self.inner.ledger.append(record).await {
                failures += 1;
                warn!(key = %key, ?err, "stale bucket promotion failed; keeping it in working memory");
                continue;
            }
            tiers.working.remove_context(&key);
            self.inner.counters.record_discarded(items.len());
            archived += 1;
        }
        if archived > 0 {
            debug!(archived, "promoted stale working buckets to long-term memory");
        }
        (archived, failures)
    }

    /// Compresses when weighted utilisation exceeds the configured threshold:
    /// short-term keeps its most recent half and stale working buckets are
    /// promoted to long-term.
    pub async fn compress_if_needed(&self) -> CompressionReport {
        let (report, _) = self
            .compress_inner()
            .instrument(operation_span("compress"))
            .await;
        report
    }

    async fn compress_inner(&self) -> (CompressionReport, usize) {
        let now = self.now();
        let long_term_records = self.inner.ledger.total_count().await.unwrap_or_else(|err| {
            warn!(?err, "long-term count unavailable; treating tier as empty");
            0
        });
        let mut tiers = self.inner.tiers.write().await;
        let before = self.snapshot_from(&tiers, long_term_records).overall_utilization;
        let threshold = self.inner.config.compression_threshold;
        if before <= threshold {
            return (
                CompressionReport {
                    utilization_before: before,
                    utilization_after: before,
                    ..CompressionReport::default()
                },
                0,
            );
        }

        let short_term_discarded = tiers.short_term.compress();
        self.inner.counters.record_discarded(short_term_discarded);
        let (buckets_archived, failures) = self.archive_stale_locked(&mut tiers, now).await;
        let after = self
            .snapshot_from(&tiers, long_term_records + buckets_archived)
            .overall_utilization;
        info!(
            utilization_before = before,
            utilization_after = after,
            short_term_discarded,
            buckets_archived,
            "memory compressed"
        );
        (
            CompressionReport {
                utilization_before: before,
                utilization_after: after,
                triggered: true,
                short_term_discarded,
                buckets_archived,
            },
            failures,
        )
    }

    /// Runs one maintenance cycle: short-term expiry, stale-bucket archival,
    /// long-term retention purge, then the compression check.
    ///
    /// Returns [`MaintenanceOutcome::Skipped`] when a cycle is already running.
    pub async fn run_maintenance_cycle(&self) -> MaintenanceOutcome {
        let Some(_pass) = self.inner.gate.try_enter() else {
            return MaintenanceOutcome::Skipped;
        };
        let cycle = self.inner.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let report = self.maintain().instrument(maintenance_span(cycle)).await;
        MaintenanceOutcome::Completed(report)
    }

    async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let now = self.now();
        report.short_term_expired = self
            .inner
            .tiers
            .write()
            .await
            .short_term
            .cleanup_expired(now);

        let (archived, failures) = self.archive_stale_contexts().await;
        report.working_archived = archived;
        report.failures += failures;

        let cutoff = saturating_sub(now, self.inner.config.long_term_retention);
        match self.inner.ledger.archive_old_entries(cutoff).await {
            Ok(purged) => report.long_term_purged = purged,
            Err(err) => {
                report.failures += 1;
                warn!(?err, "long-term retention purge failed");
            }
        }

        let (compression, failures) = self.compress_inner().await;
        report.compression = compression;
        report.failures += failures;

        info!(
            short_term_expired = report.short_term_expired,
            working_archived = report.working_archived,
            long_term_purged = report.long_term_purged,
            compressed = report.compression.triggered,
            failures = report.failures,
            "maintenance cycle finished"
        );
        report
    }

    /// Whether a maintenance cycle is running.
    #[must_use]
    pub fn maintenance_state(&self) -> MaintenanceState {
        self.inner.gate.state()
    }

    /// Spawns the background maintenance scheduler on the current tokio runtime.
    #[must_use]
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        maintenance::spawn(self.clone(), self.inner.config.maintenance_interval)
    }
}

fn archive_record(
    key: &str,
    items: &[Arc<SharedContextItem>],
    now: DateTime<Utc>,
) -> MemoryResult<ExecutionRecord> {
    let mut categories: Vec<&str> = items.iter().map(|item| item.category().as_str()).collect();
    categories.sort_unstable();
    categories.dedup();
    let snapshot = items
        .iter()
        .map(|item| serde_json::to_value(item.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    #[allow(clippy::cast_precision_loss)]
    let mean_relevance = if items.is_empty() {
        0.0
    } else {
        items.iter().map(|item| item.relevance()).sum::<f64>() / items.len() as f64
    };

    ExecutionRecord::builder(ExecutionKind::Aggregate, key)
        .timestamp(now)
        .attribute("source", Value::from("working_memory"))
        .attribute("categories", Value::from(categories))
        .attribute("item_count", Value::from(items.len()))
        .attribute("mean_relevance", Value::from(mean_relevance))
        .attribute("items", Value::Array(snapshot))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use crate::clock::ManualClock;
    use crate::config::CategoryPolicy;

    fn coordinator(config: MemoryConfig) -> (MemoryCoordinator, ManualClock) {
        let clock = ManualClock::at_epoch();
        let coordinator = MemoryCoordinator::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (coordinator, clock)
    }

    fn task(coordinator: &MemoryCoordinator, id: &str, tags: &[&str]) -> TaskContext {
        coordinator
            .new_task_context(TaskId::new(id).unwrap(), format!("task {id}"))
            .requirements(tags.iter().copied())
            .unwrap()
            .build()
    }

    #[test]
    fn invalid_config_fails_fast() {
        let err = MemoryCoordinator::builder(MemoryConfig::default().with_working_capacity(0))
            .build()
            .expect_err("zero capacity should fail");
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn share_context_files_by_category_and_threshold() {
        let config = MemoryConfig::default().with_category(
            ContextCategory::Document,
            CategoryPolicy::default_for(ContextCategory::Document).with_threshold(0.7),
        );
        let (coordinator, _) = coordinator(config);

        let outcome = coordinator
            .share_context(ContextDraft::new("invoice payment total on the scanned receipt"))
            .await;
        let keys: Vec<_> = outcome.stored.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, ["financial"]);
        assert_eq!(outcome.below_threshold, [ContextCategory::Document]);
        assert!(outcome.propagation.is_none());

        let items = coordinator.shared_context("financial").await;
        assert_eq!(items.len(), 1);
        assert!((items[0].relevance() - 1.0).abs() < f64::EPSILON);
        assert!(coordinator.shared_context("document").await.is_empty());
    }

    #[tokio::test]
    async fn unmatched_drafts_store_nothing() {
        let (coordinator, _) = coordinator(MemoryConfig::default());
        let outcome = coordinator.share_context(ContextDraft::new("hello there")).await;
        assert!(outcome.stored.is_empty());
        assert_eq!(coordinator.usage_snapshot().await.shared_context_count, 0);
    }

    #[tokio::test]
    async fn scoped_drafts_use_scoped_buckets() {
        let (coordinator, _) = coordinator(MemoryConfig::default());
        coordinator
            .share_context(ContextDraft::new("tax invoice").with_scope("session-1"))
            .await;
        assert_eq!(coordinator.shared_context("session-1/financial").await.len(), 1);
        assert!(coordinator.shared_context("financial").await.is_empty());
    }

    #[tokio::test]
    async fn compression_runs_only_above_threshold() {
        let config = MemoryConfig::default()
            .with_short_term_capacity(4)
            .with_working_capacity(1)
            .with_compression_threshold(0.5);
        let (coordinator, clock) = coordinator(config);

        for n in 0..4 {
            coordinator.store_context(task(&coordinator, &format!("t{n}"), &[])).await;
        }
        // short 1.0 * 0.4 / 1.0 = 0.4: below threshold.
        let report = coordinator.compress_if_needed().await;
        assert!(!report.triggered);
        assert_eq!(coordinator.recent_contexts(10).await.len(), 4);

        coordinator.share_context(ContextDraft::new("invoice")).await;
        clock.advance(Duration::from_secs(2 * 60 * 60 + 1));
        // short 1.0, working 1.0 -> 0.8 overall.
        let report = coordinator.compress_if_needed().await;
        assert!(report.triggered);
        assert_eq!(report.short_term_discarded, 2);
        assert_eq!(report.buckets_archived, 1);
        assert!(report.utilization_after < report.utilization_before);
        assert_eq!(coordinator.recent_contexts(10).await.len(), 2);
        assert!(coordinator.shared_context("financial").await.is_empty());

        let aggregates = coordinator
            .ledger()
            .records(Some(ExecutionKind::Aggregate))
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].subject_id(), "financial");
        assert_eq!(aggregates[0].attributes()["item_count"], Value::from(1));

        let usage = coordinator.usage_snapshot().await;
        assert!((0.0..=1.0).contains(&usage.compression_ratio));
        assert!(usage.compression_ratio > 0.0);
    }

    struct BrokenLedger {
        inner: InMemoryLedger,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl ExecutionLedger for BrokenLedger {
        async fn append(&self, record: ExecutionRecord) -> MemoryResult<()> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(MemoryError::ledger("disk full"));
            }
            self.inner.append(record).await
        }

        async fn query(
            &self,
            agent_id: &AgentId,
            since: DateTime<Utc>,
        ) -> MemoryResult<Vec<ExecutionRecord>> {
            self.inner.query(agent_id, since).await
        }

        async fn records(
            &self,
            kind: Option<ExecutionKind>,
        ) -> MemoryResult<Vec<ExecutionRecord>> {
            self.inner.records(kind).await
        }

        async fn archive_old_entries(&self, _cutoff: DateTime<Utc>) -> MemoryResult<usize> {
            Err(MemoryError::ledger("purge unavailable"))
        }

        async fn count_by_kind(&self) -> MemoryResult<BTreeMap<ExecutionKind, usize>> {
            self.inner.count_by_kind().await
        }
    }

    #[tokio::test]
    async fn maintenance_continues_past_failing_tiers() {
        let clock = ManualClock::at_epoch();
        let ledger = Arc::new(BrokenLedger {
            inner: InMemoryLedger::new(),
            fail_appends: AtomicBool::new(true),
        });
        let coordinator = MemoryCoordinator::builder(MemoryConfig::default())
            .with_clock(Arc::new(clock.clone()))
            .with_ledger(ledger.clone())
            .build()
            .unwrap();

        coordinator.store_context(task(&coordinator, "t1", &[])).await;
        coordinator.share_context(ContextDraft::new("invoice")).await;
        clock.advance(Duration::from_secs(3 * 60 * 60));

        let MaintenanceOutcome::Completed(report) = coordinator.run_maintenance_cycle().await else {
            panic!("cycle should run");
        };
        // Short-term expiry ran despite the ledger failing afterwards.
        assert_eq!(report.short_term_expired, 1);
        assert_eq!(report.working_archived, 0);
        assert_eq!(report.failures, 2);
        // The bucket was not promoted, so it must still be readable.
        assert_eq!(coordinator.stale_contexts().await, ["financial"]);
        assert_eq!(coordinator.maintenance_state(), MaintenanceState::Idle);

        ledger.fail_appends.store(false, Ordering::SeqCst);
        let (archived, failures) = coordinator.archive_stale_contexts().await;
        assert_eq!((archived, failures), (1, 0));
        assert!(coordinator.stale_contexts().await.is_empty());
    }

    #[tokio::test]
    async fn end_session_clears_working_memory_only() {
        let (coordinator, _) = coordinator(MemoryConfig::default());
        let agent = AgentId::new("planner").unwrap();
        coordinator.store_context(task(&coordinator, "t1", &[])).await;
        coordinator.share_context(ContextDraft::new("tax invoice")).await;
        coordinator.set_scratch(&agent, "draft", Value::from("v1")).await;

        assert_eq!(coordinator.end_session().await, 1);
        assert!(coordinator.get_scratch(&agent).await.is_none());
        assert!(coordinator.shared_context("financial").await.is_empty());
        assert_eq!(coordinator.recent_contexts(5).await.len(), 1);
    }

    #[tokio::test]
    async fn task_history_feeds_patterns_and_similarity() {
        let (coordinator, _) = coordinator(MemoryConfig::default());
        let agent = AgentId::new("extractor").unwrap();
        for (id, tags) in [
            ("t1", &["ocr", "invoice"][..]),
            ("t2", &["ocr", "receipt"][..]),
            ("t3", &["calendar"][..]),
        ] {
            let context = task(&coordinator, id, tags);
            coordinator.store_context(context.clone()).await;
            coordinator
                .record_task_completion(&context, Some(agent.clone()), Some(0.5))
                .await
                .unwrap();
        }

        let patterns = coordinator.task_patterns(2).await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].tag, "ocr");

        let related = coordinator.related_tasks(&["ocr", "invoice"], 0.3, 5).await;
        let ids: Vec<_> = related.iter().map(|r| r.context.task_id().as_str()).collect();
        assert_eq!(ids, ["t1", "t2"]);
    }

    #[tokio::test]
    async fn analytics_snapshot_groups_by_agent() {
        let (coordinator, _) = coordinator(MemoryConfig::default());
        let a1 = AgentId::new("A1").unwrap();
        let a2 = AgentId::new("A2").unwrap();
        coordinator
            .record_workflow_completion("wf-1", Some(a1.clone()), Some(0.9))
            .await
            .unwrap();
        coordinator
            .record_graph_completion("g-1", Some(a1.clone()), Some(0.7))
            .await
            .unwrap();
        coordinator
            .record_workflow_completion("wf-2", Some(a2.clone()), None)
            .await
            .unwrap();
        coordinator
            .record_aggregate("daily", None, Map::new())
            .await
            .unwrap();

        let analytics = coordinator.analytics_snapshot().await.unwrap();
        assert_eq!(analytics.total_records, 4);
        assert_eq!(analytics.records_by_kind[&ExecutionKind::Workflow], 2);
        assert_eq!(analytics.agents[&a1].executions, 2);
        assert!((analytics.agents[&a1].average_quality.unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(analytics.agents[&a2].average_quality, None);
        assert!((0.0..=1.0).contains(&analytics.usage.long_term_utilization));
    }
}
