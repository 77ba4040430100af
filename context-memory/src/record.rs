//! Record types owned by the memory tiers.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use context_primitives::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{MemoryError, MemoryResult};

/// Category a shared context item is filed under in working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCategory {
    /// Amounts, invoices, tax and account data.
    Financial,
    /// Facts about ingested documents (receipts, statements, contracts).
    Document,
    /// Conversational state carried between turns.
    Conversation,
    /// Task planning and workflow progress.
    Workflow,
    /// Stated user preferences and settings.
    Preference,
}

impl ContextCategory {
    /// Every category, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Financial,
        Self::Document,
        Self::Conversation,
        Self::Workflow,
        Self::Preference,
    ];

    /// Stable lowercase name, also used as the default bucket key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Document => "document",
            Self::Conversation => "conversation",
            Self::Workflow => "workflow",
            Self::Preference => "preference",
        }
    }
}

impl Display for ContextCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(MemoryError::InvalidRecord("unknown context category"))
    }
}

fn validate_unit_score(score: f64, message: &'static str) -> MemoryResult<f64> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(MemoryError::InvalidRecord(message))
    }
}

fn validate_tag(tag: String) -> MemoryResult<String> {
    if tag.trim().is_empty() {
        return Err(MemoryError::InvalidRecord("tags must not be empty"));
    }
    Ok(tag)
}

/// Context captured for a single task. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    task_id: TaskId,
    description: String,
    #[serde(default)]
    requirements: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TaskContext {
    /// Creates a builder for a task context stamped with the current time.
    #[must_use]
    pub fn builder(task_id: TaskId, description: impl Into<String>) -> TaskContextBuilder {
        TaskContextBuilder {
            task_id,
            description: description.into(),
            requirements: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Returns the task identifier.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Returns the task description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns requirement tags in the order they were supplied.
    #[must_use]
    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Builder for [`TaskContext`].
#[derive(Debug)]
pub struct TaskContextBuilder {
    task_id: TaskId,
    description: String,
    requirements: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TaskContextBuilder {
    /// Appends a requirement tag.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when the tag is empty or whitespace.
    pub fn requirement(mut self, tag: impl Into<String>) -> MemoryResult<Self> {
        self.requirements.push(validate_tag(tag.into())?);
        Ok(self)
    }

    /// Appends several requirement tags, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] if any supplied tag is empty.
    pub fn requirements<I, S>(mut self, tags: I) -> MemoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self = self.requirement(tag)?;
        }
        Ok(self)
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Finalises the context.
    #[must_use]
    pub fn build(self) -> TaskContext {
        TaskContext {
            task_id: self.task_id,
            description: self.description,
            requirements: self.requirements,
            created_at: self.created_at,
        }
    }
}

/// Context published for several consumers, filed under one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContextItem {
    id: Uuid,
    category: ContextCategory,
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    relevance: f64,
    created_at: DateTime<Utc>,
    origin_turn: u64,
}

impl SharedContextItem {
    /// Creates a builder for an item in `category`.
    #[must_use]
    pub fn builder(category: ContextCategory, content: impl Into<String>) -> SharedContextItemBuilder {
        SharedContextItemBuilder {
            id: Uuid::new_v4(),
            category,
            content: content.into(),
            metadata: Map::new(),
            relevance: 1.0,
            created_at: Utc::now(),
            origin_turn: 0,
        }
    }

    /// Returns the unique identifier for this item.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the category the item is filed under.
    #[must_use]
    pub fn category(&self) -> ContextCategory {
        self.category
    }

    /// Returns the opaque payload text.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns caller-supplied metadata.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Relevance to the category, in `[0, 1]`.
    #[must_use]
    pub fn relevance(&self) -> f64 {
        self.relevance
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Conversation turn that produced the item.
    #[must_use]
    pub fn origin_turn(&self) -> u64 {
        self.origin_turn
    }
}

/// Builder for [`SharedContextItem`].
#[derive(Debug)]
pub struct SharedContextItemBuilder {
    id: Uuid,
    category: ContextCategory,
    content: String,
    metadata: Map<String, Value>,
    relevance: f64,
    created_at: DateTime<Utc>,
    origin_turn: u64,
}

impl SharedContextItemBuilder {
    /// Overrides the item identifier.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Sets the relevance score. Validated in [`build`](Self::build).
    #[must_use]
    pub fn relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the originating conversation turn.
    #[must_use]
    pub fn origin_turn(mut self, turn: u64) -> Self {
        self.origin_turn = turn;
        self
    }

    /// Adds a full metadata map, overwriting existing keys when duplicates occur.
    #[must_use]
    pub fn merge_metadata(mut self, map: Map<String, Value>) -> Self {
        self.metadata.extend(map);
        self
    }

    /// Finalises the builder.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when the relevance lies outside `[0, 1]`.
    pub fn build(self) -> MemoryResult<SharedContextItem> {
        let relevance =
            validate_unit_score(self.relevance, "relevance score must lie within [0, 1]")?;
        Ok(SharedContextItem {
            id: self.id,
            category: self.category,
            content: self.content,
            metadata: self.metadata,
            relevance,
            created_at: self.created_at,
            origin_turn: self.origin_turn,
        })
    }
}

/// Unclassified context handed to the coordinator for sharing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDraft {
    /// Opaque payload text; classification matches against it.
    pub content: String,
    /// Conversation turn that produced the content.
    #[serde(default)]
    pub origin_turn: u64,
    /// Optional scope prefix for the bucket key (e.g. a session or document id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Metadata copied onto every stored item.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ContextDraft {
    /// Creates a draft from payload text.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Sets the originating turn.
    #[must_use]
    pub fn with_origin_turn(mut self, turn: u64) -> Self {
        self.origin_turn = turn;
        self
    }

    /// Scopes the resulting buckets.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Bucket key this draft files into for `category`.
    #[must_use]
    pub fn bucket_key(&self, category: ContextCategory) -> String {
        match self.scope.as_deref().map(str::trim) {
            Some(scope) if !scope.is_empty() => format!("{scope}/{category}"),
            _ => category.as_str().to_owned(),
        }
    }
}

/// Per-agent scratch state. Last write wins per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScratch {
    agent_id: AgentId,
    #[serde(default)]
    data: HashMap<String, Value>,
}

impl AgentScratch {
    /// Creates an empty scratch map for `agent_id`.
    #[must_use]
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            data: HashMap::new(),
        }
    }

    /// Returns the owning agent.
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Returns the stored entries.
    #[must_use]
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// Returns one entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub(crate) fn set(&mut self, key: String, value: Value) -> Option<Value> {
        self.data.insert(key, value)
    }
}

/// Kind of completed work an execution record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// A single task finished.
    Task,
    /// A multi-step workflow finished.
    Workflow,
    /// A task graph finished.
    Graph,
    /// Aggregated history, including archived working-memory buckets.
    Aggregate,
}

impl ExecutionKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 4] = [Self::Task, Self::Workflow, Self::Graph, Self::Aggregate];
}

/// Append-only record of completed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    kind: ExecutionKind,
    subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<AgentId>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quality_score: Option<f64>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

impl ExecutionRecord {
    /// Creates a builder for a record about `subject_id`, timestamped now.
    #[must_use]
    pub fn builder(kind: ExecutionKind, subject_id: impl Into<String>) -> ExecutionRecordBuilder {
        ExecutionRecordBuilder {
            kind,
            subject_id: subject_id.into(),
            agent_id: None,
            timestamp: Utc::now(),
            quality_score: None,
            tags: Vec::new(),
            attributes: Map::new(),
        }
    }

    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// Identifier of the task, workflow, graph, or bucket the record describes.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Returns the executing agent, when known.
    #[must_use]
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent_id.as_ref()
    }

    /// Returns the completion timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the optional quality score in `[0, 1]`.
    #[must_use]
    pub fn quality_score(&self) -> Option<f64> {
        self.quality_score
    }

    /// Returns requirement tags carried over from the task.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Returns free-form attributes.
    #[must_use]
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }
}

/// Builder for [`ExecutionRecord`].
#[derive(Debug)]
pub struct ExecutionRecordBuilder {
    kind: ExecutionKind,
    subject_id: String,
    agent_id: Option<AgentId>,
    timestamp: DateTime<Utc>,
    quality_score: Option<f64>,
    tags: Vec<String>,
    attributes: Map<String, Value>,
}

impl ExecutionRecordBuilder {
    /// Attributes the record to an agent.
    #[must_use]
    pub fn agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Sets the completion timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the quality score. Validated in [`build`](Self::build).
    #[must_use]
    pub fn quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    /// Extends the record with tags.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] if any supplied tag is empty.
    pub fn tags<I, S>(mut self, tags: I) -> MemoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.tags.push(validate_tag(tag.into())?);
        }
        Ok(self)
    }

    /// Adds an attribute entry.
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Finalises the builder.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when the subject is empty or the
    /// quality score lies outside `[0, 1]`.
    pub fn build(self) -> MemoryResult<ExecutionRecord> {
        if self.subject_id.trim().is_empty() {
            return Err(MemoryError::InvalidRecord(
                "execution record subject must not be empty",
            ));
        }
        let quality_score = self
            .quality_score
            .map(|score| validate_unit_score(score, "quality score must lie within [0, 1]"))
            .transpose()?;
        Ok(ExecutionRecord {
            kind: self.kind,
            subject_id: self.subject_id,
            agent_id: self.agent_id,
            timestamp: self.timestamp,
            quality_score,
            tags: self.tags,
            attributes: self.attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_context_builder_rejects_blank_requirements() {
        let id = TaskId::new("t1").unwrap();
        let err = TaskContext::builder(id.clone(), "reconcile statement")
            .requirements(["ocr", " "])
            .expect_err("blank tag should fail");
        assert!(matches!(err, MemoryError::InvalidRecord(_)));

        let context = TaskContext::builder(id, "reconcile statement")
            .requirements(["ocr", "tax"])
            .unwrap()
            .build();
        assert_eq!(context.requirements(), ["ocr", "tax"]);
    }

    #[test]
    fn shared_item_rejects_out_of_range_relevance() {
        for bad in [-0.1, 1.01, f64::NAN] {
            let err = SharedContextItem::builder(ContextCategory::Financial, "invoice")
                .relevance(bad)
                .build()
                .expect_err("relevance outside [0, 1] should fail");
            assert!(matches!(err, MemoryError::InvalidRecord(_)));
        }
    }

    #[test]
    fn execution_record_validates_subject_and_quality() {
        assert!(ExecutionRecord::builder(ExecutionKind::Task, "").build().is_err());
        assert!(
            ExecutionRecord::builder(ExecutionKind::Task, "t1")
                .quality_score(1.5)
                .build()
                .is_err()
        );
        let record = ExecutionRecord::builder(ExecutionKind::Graph, "g1")
            .agent(AgentId::new("A1").unwrap())
            .quality_score(0.9)
            .attribute("nodes", Value::from(4))
            .build()
            .unwrap();
        assert_eq!(record.agent_id().map(AgentId::as_str), Some("A1"));
        assert_eq!(record.attributes().get("nodes"), Some(&Value::from(4)));
    }

    #[test]
    fn draft_bucket_keys_respect_scope() {
        let draft = ContextDraft::new("invoice total");
        assert_eq!(draft.bucket_key(ContextCategory::Financial), "financial");
        let scoped = draft.with_scope("session-7");
        assert_eq!(
            scoped.bucket_key(ContextCategory::Financial),
            "session-7/financial"
        );
    }

    #[test]
    fn categories_parse_case_insensitively() {
        assert_eq!(
            "Financial".parse::<ContextCategory>().unwrap(),
            ContextCategory::Financial
        );
        assert!("unknown".parse::<ContextCategory>().is_err());
    }
}
