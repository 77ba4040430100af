//! Tag-set similarity and pattern extraction over stored history.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::record::{ExecutionRecord, TaskContext};

fn tag_set<S: AsRef<str>>(tags: &[S]) -> BTreeSet<String> {
    tags.iter()
        .map(|tag| tag.as_ref().trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|` of two tag lists, case-insensitive.
/// Two empty sets score 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jaccard<A: AsRef<str>, B: AsRef<str>>(lhs: &[A], rhs: &[B]) -> f64 {
    let lhs = tag_set(lhs);
    let rhs = tag_set(rhs);
    let union = lhs.union(&rhs).count();
    if union == 0 {
        return 0.0;
    }
    lhs.intersection(&rhs).count() as f64 / union as f64
}

/// Task context paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedTask {
    /// The matching context.
    pub context: TaskContext,
    /// Jaccard similarity of requirement tags.
    pub similarity: f64,
}

/// Ranks `candidates` (expected most recent first) by tag similarity to
/// `tags`, keeping those at or above `min_similarity`. Ties keep candidate order.
#[must_use]
pub fn related_tasks<'a, I, S>(
    candidates: I,
    tags: &[S],
    min_similarity: f64,
    limit: usize,
) -> Vec<RelatedTask>
where
    I: IntoIterator<Item = &'a TaskContext>,
    S: AsRef<str>,
{
    let mut related: Vec<RelatedTask> = candidates
        .into_iter()
        .filter_map(|context| {
            let similarity = jaccard(context.requirements(), tags);
            (similarity > 0.0 && similarity >= min_similarity).then(|| RelatedTask {
                context: context.clone(),
                similarity,
            })
        })
        .collect();
    related.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    related.truncate(limit);
    related
}

/// A requirement tag that recurs across completed tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPattern {
    /// Lowercased tag.
    pub tag: String,
    /// Number of records carrying the tag.
    pub support: usize,
    /// Mean quality score of those records that have one.
    pub average_quality: Option<f64>,
}

/// Extracts tags present in at least `min_support` records, ordered by
/// support descending, then tag.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn extract_patterns(records: &[ExecutionRecord], min_support: usize) -> Vec<TaskPattern> {
    #[derive(Default)]
    struct Tally {
        support: usize,
        quality_sum: f64,
        quality_count: usize,
    }

    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for record in records {
        for tag in tag_set(record.tags()) {
            let tally = tallies.entry(tag).or_default();
            tally.support += 1;
            if let Some(quality) = record.quality_score() {
                tally.quality_sum += quality;
                tally.quality_count += 1;
            }
        }
    }

    let mut patterns: Vec<TaskPattern> = tallies
        .into_iter()
        .filter(|(_, tally)| tally.support >= min_support.max(1))
        .map(|(tag, tally)| TaskPattern {
            tag,
            support: tally.support,
            average_quality: (tally.quality_count > 0)
                .then(|| tally.quality_sum / tally.quality_count as f64),
        })
        .collect();
    patterns.sort_by(|a, b| b.support.cmp(&a.support).then_with(|| a.tag.cmp(&b.tag)));
    patterns
}
