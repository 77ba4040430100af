//! Configuration for the tiered memory subsystem.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::ContextCategory;
use crate::{MemoryError, MemoryResult};

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

fn non_zero(value: usize, message: &'static str) -> MemoryResult<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or(MemoryError::InvalidConfig(message))
}

/// Admission and retention policy for one context category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Maximum items retained per bucket of this category.
    pub cap: usize,
    /// Items scoring below this relevance are dropped on ingestion.
    pub relevance_threshold: f64,
    /// Lowercase trigger vocabulary used for classification.
    pub triggers: Vec<String>,
}

impl CategoryPolicy {
    /// Default relevance threshold for every category.
    pub const DEFAULT_THRESHOLD: f64 = 0.3;
    /// Default per-bucket item cap.
    pub const DEFAULT_CAP: usize = 10;

    /// Creates a policy with the given cap and trigger vocabulary.
    #[must_use]
    pub fn new<I, S>(cap: usize, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cap,
            relevance_threshold: Self::DEFAULT_THRESHOLD,
            triggers: triggers
                .into_iter()
                .map(|trigger| trigger.into().to_lowercase())
                .collect(),
        }
    }

    /// Overrides the relevance threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    /// Built-in policy for `category`.
    #[must_use]
    pub fn default_for(category: ContextCategory) -> Self {
        let triggers: &[&str] = match category {
            ContextCategory::Financial => &[
                "invoice", "payment", "tax", "amount", "balance", "expense", "revenue",
                "account", "budget", "transaction", "total", "vat",
            ],
            ContextCategory::Document => &[
                "receipt", "statement", "contract", "pdf", "page", "scan", "document", "form",
                "attachment", "ocr",
            ],
            ContextCategory::Conversation => &[
                "question", "answer", "asked", "reply", "discuss", "clarify", "follow-up",
                "conversation", "chat",
            ],
            ContextCategory::Workflow => &[
                "task", "step", "workflow", "deadline", "schedule", "plan", "pending",
                "complete", "assign", "review",
            ],
            ContextCategory::Preference => &[
                "prefer", "preference", "always", "never", "setting", "default", "currency",
                "format", "language",
            ],
        };
        Self::new(Self::DEFAULT_CAP, triggers.iter().copied())
    }

    fn validate(&self) -> MemoryResult<()> {
        non_zero(self.cap, "category cap must be greater than zero")?;
        if !(self.relevance_threshold.is_finite()
            && (0.0..=1.0).contains(&self.relevance_threshold))
        {
            return Err(MemoryError::InvalidConfig(
                "category relevance threshold must lie within [0, 1]",
            ));
        }
        if self.triggers.iter().all(|trigger| trigger.trim().is_empty()) {
            return Err(MemoryError::InvalidConfig(
                "category trigger vocabulary must not be empty",
            ));
        }
        // Triggers are matched against single tokens.
        if self.triggers.iter().any(|trigger| {
            trigger
                .trim()
                .chars()
                .any(|c| !(c.is_alphanumeric() || c == '-'))
        }) {
            return Err(MemoryError::InvalidConfig(
                "category triggers must be single words",
            ));
        }
        Ok(())
    }
}

/// Weights used to blend tier utilisations into one figure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierWeights {
    /// Weight of short-term utilisation.
    pub short_term: f64,
    /// Weight of working utilisation.
    pub working: f64,
    /// Weight of long-term utilisation.
    pub long_term: f64,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            short_term: 0.4,
            working: 0.4,
            long_term: 0.2,
        }
    }
}

impl TierWeights {
    /// Weighted average of the three utilisations, clamped to `[0, 1]`.
    #[must_use]
    pub fn blend(self, short_term: f64, working: f64, long_term: f64) -> f64 {
        let total = self.short_term + self.working + self.long_term;
        if total <= 0.0 {
            return 0.0;
        }
        let weighted =
            self.short_term * short_term + self.working * working + self.long_term * long_term;
        (weighted / total).clamp(0.0, 1.0)
    }

    fn validate(self) -> MemoryResult<()> {
        let weights = [self.short_term, self.working, self.long_term];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MemoryError::InvalidConfig(
                "tier weights must be finite and non-negative",
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(MemoryError::InvalidConfig(
                "at least one tier weight must be positive",
            ));
        }
        Ok(())
    }
}

/// Configuration for the memory coordinator and its tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum task contexts held in short-term memory.
    pub max_short_term_entries: usize,
    /// Age after which a short-term context expires.
    #[serde(with = "duration_secs")]
    pub short_term_ttl: Duration,
    /// Maximum buckets held in working memory.
    pub max_working_entries: usize,
    /// Age of a bucket's newest item after which the bucket is stale.
    #[serde(with = "duration_secs")]
    pub working_staleness_ttl: Duration,
    /// Long-term record count treated as full utilisation.
    pub max_long_term_records: usize,
    /// Long-term records older than this are purged by maintenance.
    #[serde(with = "duration_secs")]
    pub long_term_retention: Duration,
    /// Weighted utilisation above which compression runs.
    pub compression_threshold: f64,
    /// Period of the background maintenance cycle.
    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
    /// Weights for the blended utilisation.
    pub tier_weights: TierWeights,
    /// Weight of relevance in the retrieval score.
    pub relevance_weight: f64,
    /// Weight of recency in the retrieval score.
    pub recency_weight: f64,
    /// Per-category policies. Missing categories fall back to built-in defaults.
    pub categories: BTreeMap<ContextCategory, CategoryPolicy>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_short_term_entries: 100,
            short_term_ttl: Duration::from_secs(60 * 60),
            max_working_entries: 50,
            working_staleness_ttl: Duration::from_secs(2 * 60 * 60),
            max_long_term_records: 10_000,
            long_term_retention: Duration::from_secs(30 * 24 * 60 * 60),
            compression_threshold: 0.8,
            maintenance_interval: Duration::from_secs(5 * 60),
            tier_weights: TierWeights::default(),
            relevance_weight: 0.7,
            recency_weight: 0.3,
            categories: ContextCategory::ALL
                .into_iter()
                .map(|category| (category, CategoryPolicy::default_for(category)))
                .collect(),
        }
    }
}

impl MemoryConfig {
    /// Parses a configuration from JSON and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Serialization`] for malformed JSON and
    /// [`MemoryError::InvalidConfig`] when validation fails.
    pub fn from_json_str(raw: &str) -> MemoryResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the short-term capacity.
    #[must_use]
    pub fn with_short_term_capacity(mut self, capacity: usize) -> Self {
        self.max_short_term_entries = capacity;
        self
    }

    /// Sets the short-term TTL.
    #[must_use]
    pub fn with_short_term_ttl(mut self, ttl: Duration) -> Self {
        self.short_term_ttl = ttl;
        self
    }

    /// Sets the working-memory bucket capacity.
    #[must_use]
    pub fn with_working_capacity(mut self, capacity: usize) -> Self {
        self.max_working_entries = capacity;
        self
    }

    /// Sets the working-memory staleness TTL.
    #[must_use]
    pub fn with_staleness_ttl(mut self, ttl: Duration) -> Self {
        self.working_staleness_ttl = ttl;
        self
    }

    /// Sets the long-term record count treated as full.
    #[must_use]
    pub fn with_long_term_capacity(mut self, capacity: usize) -> Self {
        self.max_long_term_records = capacity;
        self
    }

    /// Sets the long-term retention window.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.long_term_retention = retention;
        self
    }

    /// Sets the compression threshold.
    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: f64) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the maintenance interval.
    #[must_use]
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Replaces the policy for one category.
    #[must_use]
    pub fn with_category(mut self, category: ContextCategory, policy: CategoryPolicy) -> Self {
        self.categories.insert(category, policy);
        self
    }

    /// Returns the policy for `category`.
    #[must_use]
    pub fn policy(&self, category: ContextCategory) -> CategoryPolicy {
        self.categories
            .get(&category)
            .cloned()
            .unwrap_or_else(|| CategoryPolicy::default_for(category))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for zero capacities or
    /// durations, a staleness TTL that does not exceed the short-term TTL,
    /// weights and thresholds outside their ranges, or category triggers that
    /// are not single words.
    pub fn validate(&self) -> MemoryResult<()> {
        non_zero(
            self.max_short_term_entries,
            "short-term capacity must be greater than zero",
        )?;
        non_zero(
            self.max_working_entries,
            "working capacity must be greater than zero",
        )?;
        non_zero(
            self.max_long_term_records,
            "long-term capacity must be greater than zero",
        )?;
        if self.short_term_ttl.is_zero() {
            return Err(MemoryError::InvalidConfig(
                "short-term ttl must be greater than zero",
            ));
        }
        if self.working_staleness_ttl <= self.short_term_ttl {
            return Err(MemoryError::InvalidConfig(
                "working staleness ttl must exceed the short-term ttl",
            ));
        }
        if self.long_term_retention.is_zero() {
            return Err(MemoryError::InvalidConfig(
                "long-term retention must be greater than zero",
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(MemoryError::InvalidConfig(
                "maintenance interval must be greater than zero",
            ));
        }
        if !(self.compression_threshold.is_finite()
            && self.compression_threshold > 0.0
            && self.compression_threshold <= 1.0)
        {
            return Err(MemoryError::InvalidConfig(
                "compression threshold must lie within (0, 1]",
            ));
        }
        self.tier_weights.validate()?;
        let blend = [self.relevance_weight, self.recency_weight];
        if blend.iter().any(|w| !w.is_finite() || *w < 0.0) || blend.iter().sum::<f64>() <= 0.0 {
            return Err(MemoryError::InvalidConfig(
                "retrieval weights must be non-negative with a positive sum",
            ));
        }
        for category in ContextCategory::ALL {
            self.policy(category).validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MemoryConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_fails_fast() {
        let err = MemoryConfig::default()
            .with_short_term_capacity(0)
            .validate()
            .expect_err("zero capacity should fail");
        assert!(matches!(err, MemoryError::InvalidConfig(_)));

        let err = MemoryConfig::default()
            .with_category(
                ContextCategory::Financial,
                CategoryPolicy::new(0, ["invoice"]),
            )
            .validate()
            .expect_err("zero category cap should fail");
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
    }

    #[test]
    fn staleness_must_exceed_short_term_ttl() {
        let config = MemoryConfig::default()
            .with_short_term_ttl(Duration::from_secs(600))
            .with_staleness_ttl(Duration::from_secs(600));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        assert!(
            MemoryConfig::default()
                .with_compression_threshold(1.5)
                .validate()
                .is_err()
        );
        let policy = CategoryPolicy::new(3, ["tax"]).with_threshold(-0.2);
        assert!(
            MemoryConfig::default()
                .with_category(ContextCategory::Financial, policy)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn rejects_multi_word_triggers() {
        let err = MemoryConfig::default()
            .with_category(
                ContextCategory::Workflow,
                CategoryPolicy::new(3, ["deadline", "due date"]),
            )
            .validate()
            .expect_err("a trigger with whitespace can never match");
        assert!(matches!(err, MemoryError::InvalidConfig(_)));

        let hyphenated = CategoryPolicy::new(3, ["follow-up", " reminder "]);
        MemoryConfig::default()
            .with_category(ContextCategory::Workflow, hyphenated)
            .validate()
            .unwrap();
    }

    #[test]
    fn loads_partial_json_with_defaults() {
        let config = MemoryConfig::from_json_str(
            r#"{
                "max_short_term_entries": 3,
                "short_term_ttl": 60,
                "working_staleness_ttl": 120,
                "categories": {
                    "financial": { "cap": 2, "relevance_threshold": 0.5, "triggers": ["invoice"] }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_short_term_entries, 3);
        assert_eq!(config.short_term_ttl, Duration::from_secs(60));
        assert_eq!(config.policy(ContextCategory::Financial).cap, 2);
        assert_eq!(
            config.policy(ContextCategory::Document),
            CategoryPolicy::default_for(ContextCategory::Document)
        );
    }

    #[test]
    fn json_validation_errors_surface() {
        let err = MemoryConfig::from_json_str(r#"{ "max_working_entries": 0 }"#)
            .expect_err("zero working capacity should fail");
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
        let err = MemoryConfig::from_json_str("{ not json").expect_err("malformed");
        assert!(matches!(err, MemoryError::Serialization { .. }));
    }

    #[test]
    fn blended_utilisation_is_clamped() {
        let weights = TierWeights::default();
        let blended = weights.blend(1.0, 1.0, 1.0);
        assert!((blended - 1.0).abs() < f64::EPSILON);
        assert!(weights.blend(2.0, 2.0, 2.0) <= 1.0);
    }
}
