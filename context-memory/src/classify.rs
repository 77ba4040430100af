//! Trigger-vocabulary classification of shared context.

use std::collections::BTreeSet;

use crate::config::MemoryConfig;
use crate::record::ContextCategory;

/// Distinct trigger hits that yield a relevance of 1.0.
const SATURATION_HITS: usize = 3;
/// Triggers at least this long also match as word prefixes ("invoice" → "invoices").
const PREFIX_MATCH_MIN_LEN: usize = 4;

/// A category the classifier matched, with its relevance.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMatch {
    /// Matched category.
    pub category: ContextCategory,
    /// `min(1, distinct hits / 3)`.
    pub relevance: f64,
    /// Triggers that matched, sorted.
    pub triggers: Vec<String>,
}

/// Classifies text into categories by matching trigger vocabularies.
#[derive(Debug, Clone)]
pub struct ContextClassifier {
    vocabularies: Vec<(ContextCategory, Vec<String>)>,
}

impl ContextClassifier {
    /// Builds a classifier from the category policies in `config`.
    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            vocabularies: ContextCategory::ALL
                .into_iter()
                .map(|category| {
                    let triggers = config
                        .policy(category)
                        .triggers
                        .into_iter()
                        .map(|trigger| trigger.trim().to_lowercase())
                        .filter(|trigger| !trigger.is_empty())
                        .collect();
                    (category, triggers)
                })
                .collect(),
        }
    }

    /// Returns every category with at least one trigger hit, best match first.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn classify(&self, text: &str) -> Vec<CategoryMatch> {
        let lowered = text.to_lowercase();
        let tokens: BTreeSet<&str> = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .filter(|token| !token.is_empty())
            .collect();

        let mut matches: Vec<CategoryMatch> = self
            .vocabularies
            .iter()
            .filter_map(|(category, triggers)| {
                let hits: BTreeSet<&String> = triggers
                    .iter()
                    .filter(|trigger| tokens.iter().any(|token| token_matches(token, trigger)))
                    .collect();
                if hits.is_empty() {
                    return None;
                }
                Some(CategoryMatch {
                    category: *category,
                    relevance: (hits.len() as f64 / SATURATION_HITS as f64).min(1.0),
                    triggers: hits.into_iter().cloned().collect(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.category.cmp(&b.category))
        });
        matches
    }
}

fn token_matches(token: &str, trigger: &str) -> bool {
    token == trigger || (trigger.len() >= PREFIX_MATCH_MIN_LEN && token.starts_with(trigger))
}
