//! Working memory: shared context buckets and per-agent scratch maps.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use context_primitives::AgentId;
use serde_json::Value;
use tracing::debug;

use crate::clock::age;
use crate::config::MemoryConfig;
use crate::record::{AgentScratch, ContextCategory, SharedContextItem};
use crate::MemoryResult;

/// Admission limits for one category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryLimits {
    cap: NonZeroUsize,
    threshold: f64,
}

impl CategoryLimits {
    /// Creates limits with the given per-bucket cap and relevance threshold.
    #[must_use]
    pub fn new(cap: NonZeroUsize, threshold: f64) -> Self {
        Self {
            cap,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Maximum items per bucket.
    #[must_use]
    pub const fn cap(self) -> NonZeroUsize {
        self.cap
    }

    /// Minimum relevance admitted.
    #[must_use]
    pub const fn threshold(self) -> f64 {
        self.threshold
    }
}

/// Configuration for the working store.
#[derive(Debug, Clone)]
pub struct WorkingConfig {
    max_buckets: NonZeroUsize,
    staleness_ttl: Duration,
    relevance_weight: f64,
    recency_weight: f64,
    limits: BTreeMap<ContextCategory, CategoryLimits>,
}

impl WorkingConfig {
    /// Creates a configuration with default category limits and a 70/30
    /// relevance/recency blend.
    #[must_use]
    pub fn new(max_buckets: NonZeroUsize, staleness_ttl: Duration) -> Self {
        let default_cap = NonZeroUsize::new(crate::config::CategoryPolicy::DEFAULT_CAP)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            max_buckets,
            staleness_ttl,
            relevance_weight: 0.7,
            recency_weight: 0.3,
            limits: ContextCategory::ALL
                .into_iter()
                .map(|category| {
                    (
                        category,
                        CategoryLimits::new(
                            default_cap,
                            crate::config::CategoryPolicy::DEFAULT_THRESHOLD,
                        ),
                    )
                })
                .collect(),
        }
    }

    /// Derives the working configuration from a validated [`MemoryConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::MemoryError::InvalidConfig`] when a capacity is zero.
    pub fn from_memory_config(config: &MemoryConfig) -> MemoryResult<Self> {
        let max_buckets = NonZeroUsize::new(config.max_working_entries).ok_or(
            crate::MemoryError::InvalidConfig("working capacity must be greater than zero"),
        )?;
        let mut working = Self::new(max_buckets, config.working_staleness_ttl)
            .with_blend(config.relevance_weight, config.recency_weight);
        for category in ContextCategory::ALL {
            let policy = config.policy(category);
            let cap = NonZeroUsize::new(policy.cap).ok_or(crate::MemoryError::InvalidConfig(
                "category cap must be greater than zero",
            ))?;
            working = working.with_limits(
                category,
                CategoryLimits::new(cap, policy.relevance_threshold),
            );
        }
        Ok(working)
    }

    /// Overrides the limits for one category.
    #[must_use]
    pub fn with_limits(mut self, category: ContextCategory, limits: CategoryLimits) -> Self {
        self.limits.insert(category, limits);
        self
    }

    /// Overrides the retrieval blend weights.
    #[must_use]
    pub fn with_blend(mut self, relevance_weight: f64, recency_weight: f64) -> Self {
        self.relevance_weight = relevance_weight.max(0.0);
        self.recency_weight = recency_weight.max(0.0);
        self
    }

    /// Returns the bucket capacity.
    #[must_use]
    pub const fn max_buckets(&self) -> NonZeroUsize {
        self.max_buckets
    }

    /// Returns the staleness TTL.
    #[must_use]
    pub const fn staleness_ttl(&self) -> Duration {
        self.staleness_ttl
    }

    /// Returns the limits for `category`.
    #[must_use]
    pub fn limits(&self, category: ContextCategory) -> CategoryLimits {
        self.limits.get(&category).copied().unwrap_or(CategoryLimits {
            cap: NonZeroUsize::MIN,
            threshold: 0.0,
        })
    }
}

#[derive(Debug, Clone)]
struct Slot {
    item: Arc<SharedContextItem>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    items: VecDeque<Slot>,
}

impl Bucket {
    fn newest(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|slot| slot.item.created_at()).max()
    }

    fn last_seq(&self) -> u64 {
        self.items.back().map_or(0, |slot| slot.seq)
    }
}

/// Result of offering an item to working memory.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The item was stored.
    Stored {
        /// Oldest item dropped from the bucket to honour the category cap.
        evicted_item: Option<Arc<SharedContextItem>>,
        /// Bucket dropped to honour the bucket capacity.
        evicted_bucket: Option<String>,
    },
    /// The item scored below its category threshold and was dropped.
    BelowThreshold,
}

impl AddOutcome {
    /// Returns `true` when the item was stored.
    #[must_use]
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Item returned by ranked retrieval, with the score used to order it.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    /// Bucket the item was found in.
    pub key: String,
    /// Read-only view of the stored item.
    pub item: Arc<SharedContextItem>,
    /// Blended relevance/recency score.
    pub score: f64,
    seq: u64,
}

/// Bounded set of shared context buckets plus unbounded per-agent scratch.
#[derive(Debug)]
pub struct WorkingStore {
    config: WorkingConfig,
    buckets: HashMap<String, Bucket>,
    scratch: HashMap<AgentId, AgentScratch>,
    next_seq: u64,
}

impl WorkingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: WorkingConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            scratch: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &WorkingConfig {
        &self.config
    }

    /// Appends `item` to bucket `key`.
    ///
    /// Items scoring below their category threshold are dropped silently. A
    /// bucket over its category cap loses its oldest item; a new bucket beyond
    /// the bucket capacity displaces the bucket whose newest item is oldest.
    pub fn add_shared_item(&mut self, key: &str, item: SharedContextItem) -> AddOutcome {
        let limits = self.config.limits(item.category());
        if item.relevance() < limits.threshold() {
            debug!(
                key,
                category = %item.category(),
                relevance = item.relevance(),
                threshold = limits.threshold(),
                "dropped low-relevance context item"
            );
            return AddOutcome::BelowThreshold;
        }

        let evicted_bucket = if self.buckets.contains_key(key) {
            None
        } else {
            self.make_room_for_bucket()
        };

        self.next_seq += 1;
        let seq = self.next_seq;
        let bucket = self.buckets.entry(key.to_owned()).or_default();
        bucket.items.push_back(Slot {
            item: Arc::new(item),
            seq,
        });

        let mut evicted_item = None;
        while bucket.items.len() > limits.cap().get() {
            evicted_item = bucket.items.pop_front().map(|slot| slot.item);
        }
        if let Some(evicted) = &evicted_item {
            debug!(key, item_id = %evicted.id(), "evicted oldest item from context bucket");
        }

        AddOutcome::Stored {
            evicted_item,
            evicted_bucket,
        }
    }

    fn make_room_for_bucket(&mut self) -> Option<String> {
        if self.buckets.len() < self.config.max_buckets().get() {
            return None;
        }
        let victim = self
            .buckets
            .iter()
            .min_by_key(|(_, bucket)| (bucket.newest(), bucket.last_seq()))
            .map(|(key, _)| key.clone())?;
        self.buckets.remove(&victim);
        debug!(key = %victim, "evicted context bucket with the oldest newest item");
        Some(victim)
    }

    /// Returns the items of bucket `key`, ranked by blended score.
    #[must_use]
    pub fn shared_context(&self, key: &str, now: DateTime<Utc>) -> Vec<Arc<SharedContextItem>> {
        self.ranked(&[key], now)
            .into_iter()
            .map(|ranked| ranked.item)
            .collect()
    }

    /// Merges the items of several buckets and orders them by
    /// `relevance_weight * relevance + recency_weight * recency`, best first.
    ///
    /// Recency decays linearly from 1 at creation to 0 at the staleness TTL.
    /// Ties go to the more recently added item.
    #[must_use]
    pub fn ranked(&self, keys: &[&str], now: DateTime<Utc>) -> Vec<RankedItem> {
        let mut ranked: Vec<RankedItem> = Vec::new();
        let mut seen = Vec::with_capacity(keys.len());
        for key in keys {
            if seen.contains(key) {
                continue;
            }
            seen.push(*key);
            let Some(bucket) = self.buckets.get(*key) else {
                continue;
            };
            ranked.extend(bucket.items.iter().map(|slot| RankedItem {
                key: (*key).to_owned(),
                score: self.blend(&slot.item, now),
                item: Arc::clone(&slot.item),
                seq: slot.seq,
            }));
        }
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        ranked
    }

    fn blend(&self, item: &SharedContextItem, now: DateTime<Utc>) -> f64 {
        let ttl = self.config.staleness_ttl().as_secs_f64();
        let recency = if ttl > 0.0 {
            (1.0 - age(now, item.created_at()).as_secs_f64() / ttl).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let total = self.config.relevance_weight + self.config.recency_weight;
        if total <= 0.0 {
            return 0.0;
        }
        (self.config.relevance_weight * item.relevance() + self.config.recency_weight * recency)
            / total
    }

    /// Items of bucket `key` in insertion order, oldest first.
    #[must_use]
    pub fn items(&self, key: &str) -> Vec<Arc<SharedContextItem>> {
        self.buckets
            .get(key)
            .map(|bucket| bucket.items.iter().map(|slot| Arc::clone(&slot.item)).collect())
            .unwrap_or_default()
    }

    /// Keys of buckets whose newest item is older than the staleness TTL, sorted.
    #[must_use]
    pub fn stale_contexts(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = self.config.staleness_ttl();
        let mut stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.newest().is_none_or(|newest| age(now, newest) > ttl))
            .map(|(key, _)| key.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Removes bucket `key`, returning its items oldest first.
    pub fn remove_context(&mut self, key: &str) -> Option<Vec<Arc<SharedContextItem>>> {
        self.buckets
            .remove(key)
            .map(|bucket| bucket.items.into_iter().map(|slot| slot.item).collect())
    }

    /// Sets one scratch entry for `agent_id`, returning the previous value.
    pub fn set_scratch(
        &mut self,
        agent_id: &AgentId,
        key: impl Into<String>,
        value: Value,
    ) -> Option<Value> {
        self.scratch
            .entry(agent_id.clone())
            .or_insert_with(|| AgentScratch::new(agent_id.clone()))
            .set(key.into(), value)
    }

    /// Returns the scratch map for `agent_id`.
    #[must_use]
    pub fn scratch(&self, agent_id: &AgentId) -> Option<&AgentScratch> {
        self.scratch.get(agent_id)
    }

    /// Drops every bucket and scratch map, returning the number of buckets dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buckets.len();
        self.buckets.clear();
        self.scratch.clear();
        dropped
    }

    /// Bucket keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` when no bucket exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total items across all buckets.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.items.len()).sum()
    }

    /// Number of agents with scratch state.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.scratch.len()
    }

    /// Fraction of bucket capacity in use, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        (self.buckets.len() as f64 / self.config.max_buckets().get() as f64).clamp(0.0, 1.0)
    }
}
