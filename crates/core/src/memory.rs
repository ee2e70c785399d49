//! Memory traits: durable tiers that the pipeline learns from.
//!
//! - Episodic: append-only session log, chainable into threads
//! - Semantic: append-only versioned rule base
//! - Patterns: frequency and filter statistics per query signature
//!
//! The working tier is an in-process cache and lives in the memory crate.

use crate::error::MemoryError;
use crate::intent::{EntityTag, FilterCondition, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Default number of sessions returned by entity lookups.
pub const DEFAULT_ENTITY_SESSION_LIMIT: usize = 10;

/// Default number of sessions returned by time-window lookups.
pub const DEFAULT_RECENT_SESSION_LIMIT: usize = 50;

/// Default number of hops followed by [`EpisodicStore::get_session_chain`].
pub const DEFAULT_CHAIN_DEPTH: usize = 10;

// ── Episodic ──────────────────────────────────────────────────────────────

/// One recorded analysis session. Immutable once saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workflow: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

impl Session {
    /// A session stamped with the current time.
    pub fn new(id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow: workflow.into(),
            timestamp: Utc::now(),
            entity_ids: Vec::new(),
            result: Value::Null,
            metadata: Value::Null,
            previous_session_id: None,
        }
    }

    pub fn with_entities<I, S>(mut self, entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = entity_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Chain this session after `previous_id`.
    pub fn following(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_session_id = Some(previous_id.into());
        self
    }

    /// Reject sessions missing an id or workflow name.
    pub fn validate(&self) -> std::result::Result<(), MemoryError> {
        if self.id.trim().is_empty() {
            return Err(MemoryError::validation("session_id", "must not be empty"));
        }
        if self.workflow.trim().is_empty() {
            return Err(MemoryError::validation("workflow", "must not be empty"));
        }
        if self.previous_session_id.as_deref() == Some(self.id.as_str()) {
            return Err(MemoryError::validation(
                "previous_session_id",
                "a session cannot follow itself",
            ));
        }
        Ok(())
    }
}

/// Append-only, timestamped session log.
///
/// Implementations: SQLite, in-memory.
#[async_trait]
pub trait EpisodicStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Persist a new session. Saving an id twice is an unsupported overwrite.
    async fn save_session(&self, session: Session) -> std::result::Result<String, MemoryError>;

    async fn get_session(&self, id: &str) -> std::result::Result<Option<Session>, MemoryError>;

    /// Sessions that touched `entity_id`, most recent first.
    async fn get_sessions_by_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Session>, MemoryError>;

    /// Sessions newer than `since_days` days, most recent first.
    async fn get_recent_sessions(
        &self,
        since_days: u32,
        workflow: Option<&str>,
        limit: usize,
    ) -> std::result::Result<Vec<Session>, MemoryError>;

    /// Follow previous-session links from `id` up to `max_depth` hops.
    /// Returned oldest first, ending with `id` itself.
    async fn get_session_chain(
        &self,
        id: &str,
        max_depth: usize,
    ) -> std::result::Result<Vec<Session>, MemoryError>;

    async fn exists(&self, id: &str) -> std::result::Result<bool, MemoryError>;

    /// Session ids whose workflow contains `workflow_pattern`, if given.
    async fn list_session_ids(
        &self,
        workflow_pattern: Option<&str>,
    ) -> std::result::Result<Vec<String>, MemoryError>;

    async fn count(&self) -> std::result::Result<usize, MemoryError>;

    /// Remove every session. Returns how many were removed.
    async fn clear(&self) -> std::result::Result<usize, MemoryError>;

    /// Sessions are never deleted individually.
    async fn delete_session(&self, _id: &str) -> std::result::Result<(), MemoryError> {
        Err(MemoryError::unsupported(self.name(), "delete_session"))
    }
}

// ── Semantic ──────────────────────────────────────────────────────────────

/// A request to store the next version of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub id: String,
    pub category: String,
    pub content: Value,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Build on this version instead of the latest one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u32>,
}

impl NewRule {
    pub fn new(id: impl Into<String>, category: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            content,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            metadata: Value::Null,
            previous_version: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn after_version(mut self, version: u32) -> Self {
        self.previous_version = Some(version);
        self
    }

    pub fn validate(&self) -> std::result::Result<(), MemoryError> {
        if self.id.trim().is_empty() {
            return Err(MemoryError::validation("rule_id", "must not be empty"));
        }
        if self.category.trim().is_empty() {
            return Err(MemoryError::validation("category", "must not be empty"));
        }
        if self.previous_version == Some(0) {
            return Err(MemoryError::validation("previous_version", "versions start at 1"));
        }
        Ok(())
    }
}

/// One stored version of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub version: u32,
    pub category: String,
    pub content: Value,
    pub tags: BTreeSet<String>,
    /// Ids of rules that were active when this version was stored.
    pub dependencies: BTreeSet<String>,
    pub metadata: Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// The version this one supersedes.
    pub previous_version: Option<u32>,
}

/// Append-only versioned rule base.
///
/// Implementations: SQLite, in-memory.
#[async_trait]
pub trait SemanticStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store the next version of a rule and make it the active one.
    async fn store_rule(&self, rule: NewRule) -> std::result::Result<Rule, MemoryError>;

    async fn get_current_rule(&self, id: &str) -> std::result::Result<Option<Rule>, MemoryError>;

    async fn get_rule_version(
        &self,
        id: &str,
        version: u32,
    ) -> std::result::Result<Option<Rule>, MemoryError>;

    /// Every version of a rule, oldest first.
    async fn get_rule_history(&self, id: &str) -> std::result::Result<Vec<Rule>, MemoryError>;

    async fn get_rules_by_category(
        &self,
        category: &str,
        active_only: bool,
    ) -> std::result::Result<Vec<Rule>, MemoryError>;

    async fn get_rules_by_tag(
        &self,
        tag: &str,
        active_only: bool,
    ) -> std::result::Result<Vec<Rule>, MemoryError>;

    /// Deactivate the active version of a rule. Returns false if none was active.
    async fn deactivate_rule(&self, id: &str) -> std::result::Result<bool, MemoryError>;

    async fn exists(&self, id: &str) -> std::result::Result<bool, MemoryError>;

    /// Distinct rule ids whose category contains `category_pattern`, if given.
    async fn list_rule_ids(
        &self,
        category_pattern: Option<&str>,
    ) -> std::result::Result<Vec<String>, MemoryError>;

    /// Number of stored versions across all rules.
    async fn count(&self) -> std::result::Result<usize, MemoryError>;

    async fn clear(&self) -> std::result::Result<usize, MemoryError>;

    /// Rules are versioned, never overwritten in place.
    async fn set_rule(&self, _rule: Rule) -> std::result::Result<(), MemoryError> {
        Err(MemoryError::unsupported(self.name(), "set_rule"))
    }

    /// Rules are versioned, never deleted individually.
    async fn delete_rule(&self, _id: &str) -> std::result::Result<(), MemoryError> {
        Err(MemoryError::unsupported(self.name(), "delete_rule"))
    }
}

// ── Patterns ──────────────────────────────────────────────────────────────

/// Canonical key for an (operation, entities) combination.
///
/// Entities are sorted and de-duplicated so mention order does not matter.
pub fn pattern_signature(operation: Operation, entities: &[EntityTag]) -> String {
    let sorted: BTreeSet<&str> = entities.iter().map(EntityTag::as_str).collect();
    let joined: Vec<&str> = sorted.into_iter().collect();
    format!("{}::{}", operation.as_str(), joined.join(","))
}

/// Aggregated statistics for one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub signature: String,
    pub operation: Operation,
    pub entities: Vec<EntityTag>,
    pub frequency: u64,
    pub success_count: u64,
    /// field -> value -> times observed
    pub filter_counts: BTreeMap<String, BTreeMap<String, u64>>,
    pub last_updated: DateTime<Utc>,
}

impl Pattern {
    pub fn success_rate(&self) -> f64 {
        if self.frequency == 0 {
            0.0
        } else {
            self.success_count as f64 / self.frequency as f64
        }
    }

    /// Most frequently observed value per field.
    pub fn common_filters(&self) -> BTreeMap<String, Value> {
        most_frequent_values(&self.filter_counts, 1)
    }
}

/// Pick the most frequent value for each field, keeping only fields whose
/// winning value was seen at least `min_occurrences` times.
///
/// Values are keyed by their JSON text; ties go to the smaller text so the
/// answer does not depend on insertion order.
pub fn most_frequent_values(
    counts: &BTreeMap<String, BTreeMap<String, u64>>,
    min_occurrences: u64,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (field, values) in counts {
        let best = values
            .iter()
            .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then_with(|| vb.cmp(va)));
        if let Some((raw, count)) = best {
            if *count >= min_occurrences {
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
                out.insert(field.clone(), value);
            }
        }
    }
    out
}

/// Durable frequency statistics keyed by signature.
///
/// Implementations: SQLite, in-memory.
#[async_trait]
pub trait PatternStore: Send + Sync {
    fn name(&self) -> &str;

    /// Create or update the pattern for this signature in one atomic step.
    ///
    /// Frequency grows by one; the success counter grows when `result_count > 0`;
    /// each filter's value count grows by one.
    async fn record_query_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
        filters: &[FilterCondition],
        result_count: usize,
    ) -> std::result::Result<Pattern, MemoryError>;

    async fn get_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
    ) -> std::result::Result<Option<Pattern>, MemoryError>;

    /// Filters seen at least `min_occurrences` times for this operation,
    /// optionally restricted to patterns that mention `entity`.
    async fn get_common_filters(
        &self,
        operation: Operation,
        entity: Option<&EntityTag>,
        min_occurrences: u64,
    ) -> std::result::Result<BTreeMap<String, Value>, MemoryError>;

    /// Most frequent patterns first.
    async fn top_patterns(&self, limit: usize) -> std::result::Result<Vec<Pattern>, MemoryError>;

    /// Number of distinct signatures.
    async fn count(&self) -> std::result::Result<usize, MemoryError>;

    async fn clear(&self) -> std::result::Result<usize, MemoryError>;
}

/// Merge per-pattern filter counts into one table.
pub fn merge_filter_counts<'a, I>(patterns: I) -> BTreeMap<String, BTreeMap<String, u64>>
where
    I: IntoIterator<Item = &'a Pattern>,
{
    let mut merged: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for pattern in patterns {
        for (field, values) in &pattern.filter_counts {
            let slot = merged.entry(field.clone()).or_default();
            for (value, count) in values {
                *slot.entry(value.clone()).or_default() += count;
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_entity_order() {
        let a = pattern_signature(
            Operation::Filter,
            &[EntityTag::from("vendor"), EntityTag::from("risk")],
        );
        let b = pattern_signature(
            Operation::Filter,
            &[EntityTag::from("risk"), EntityTag::from("vendor")],
        );
        assert_eq!(a, b);
        assert_eq!(a, "filter::risk,vendor");
        assert_eq!(pattern_signature(Operation::List, &[]), "list::");
    }

    #[test]
    fn most_frequent_value_wins_with_threshold() {
        let mut counts = BTreeMap::new();
        counts.insert(
            "riskLevel".to_string(),
            BTreeMap::from([("\"Critical\"".to_string(), 3), ("\"High\"".to_string(), 1)]),
        );
        counts.insert(
            "status".to_string(),
            BTreeMap::from([("\"Active\"".to_string(), 1)]),
        );

        let common = most_frequent_values(&counts, 2);
        assert_eq!(common.get("riskLevel"), Some(&Value::from("Critical")));
        assert!(!common.contains_key("status"));
    }

    #[test]
    fn ties_break_towards_smaller_value() {
        let mut counts = BTreeMap::new();
        counts.insert(
            "compliant".to_string(),
            BTreeMap::from([("true".to_string(), 2), ("false".to_string(), 2)]),
        );
        let common = most_frequent_values(&counts, 1);
        assert_eq!(common.get("compliant"), Some(&Value::Bool(false)));
    }

    #[test]
    fn session_validation() {
        assert!(Session::new("s1", "vendor_review").validate().is_ok());
        assert!(matches!(
            Session::new("", "vendor_review").validate(),
            Err(MemoryError::Validation { .. })
        ));
        assert!(matches!(
            Session::new("s1", " ").validate(),
            Err(MemoryError::Validation { .. })
        ));
        assert!(Session::new("s1", "w").following("s1").validate().is_err());
    }

    #[test]
    fn rule_validation() {
        let rule = NewRule::new("R1", "lending", serde_json::json!({"max_dti": 0.43}));
        assert!(rule.validate().is_ok());
        assert!(rule.clone().after_version(0).validate().is_err());
        assert!(NewRule::new("", "lending", Value::Null).validate().is_err());
    }
}
