//! Session-scoped preference tracking on top of pattern memory.
//!
//! The tracker keeps light in-process counters for the current session and
//! delegates everything durable to a [`PatternStore`].

use async_trait::async_trait;
use cypherloom_core::{
    EntityTag, ExecutionResult, Intent, Operation, Pattern, PatternStore, Result, Suggestion,
    SuggestionKind, SuggestionSource,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Default number of times a filter value must be seen before it is suggested.
pub const DEFAULT_MIN_OCCURRENCES: u64 = 2;

#[derive(Default)]
struct Usage {
    /// Entity tag and use count, in order of first use.
    entities: Vec<(EntityTag, u64)>,
    /// Filter sets observed per operation, oldest first.
    filters: BTreeMap<Operation, Vec<BTreeMap<String, Value>>>,
}

/// Snapshot of what the tracker has seen this session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub total_entities_used: u64,
    pub unique_entities: usize,
    pub most_used_entity: Option<EntityTag>,
    pub operations_tracked: Vec<Operation>,
}

pub struct PreferenceTracker {
    session_id: String,
    patterns: Arc<dyn PatternStore>,
    min_occurrences: u64,
    usage: Mutex<Usage>,
}

impl PreferenceTracker {
    pub fn new(session_id: impl Into<String>, patterns: Arc<dyn PatternStore>) -> Self {
        Self {
            session_id: session_id.into(),
            patterns,
            min_occurrences: DEFAULT_MIN_OCCURRENCES,
            usage: Mutex::new(Usage::default()),
        }
    }

    pub fn with_min_occurrences(mut self, min_occurrences: u64) -> Self {
        self.min_occurrences = min_occurrences.max(1);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn min_occurrences(&self) -> u64 {
        self.min_occurrences
    }

    fn usage(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the intent's entities and filters, then fold it into pattern
    /// memory. An unsatisfied outcome is recorded with a result count of 0,
    /// so it never counts as a success.
    pub async fn record_query_preference(
        &self,
        intent: &Intent,
        result: &ExecutionResult,
        satisfied: bool,
    ) -> Result<Pattern> {
        {
            let mut usage = self.usage();
            for entity in &intent.entities {
                match usage.entities.iter_mut().find(|(tag, _)| tag == entity) {
                    Some((_, count)) => *count += 1,
                    None => usage.entities.push((entity.clone(), 1)),
                }
            }
            if !intent.filters.is_empty() {
                let observed = intent
                    .filters
                    .iter()
                    .map(|f| (f.field.clone(), f.value.clone()))
                    .collect();
                usage
                    .filters
                    .entry(intent.operation)
                    .or_default()
                    .push(observed);
            }
        }

        let result_count = if satisfied { result.row_count() } else { 0 };
        let pattern = self
            .patterns
            .record_query_pattern(intent.operation, &intent.entities, &intent.filters, result_count)
            .await?;

        debug!(
            session = %self.session_id,
            signature = %pattern.signature,
            frequency = pattern.frequency,
            "Recorded query preference"
        );
        Ok(pattern)
    }

    /// Filters used at least `min_occurrences` times for `operation`,
    /// optionally only in patterns that mention `entity`.
    pub async fn get_preferred_filters(
        &self,
        operation: Operation,
        entity: Option<&EntityTag>,
    ) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .patterns
            .get_common_filters(operation, entity, self.min_occurrences)
            .await?)
    }

    /// Most used entities this session, most used first. Ties keep the
    /// order in which the entities were first used.
    pub fn get_preferred_entities(&self, limit: usize) -> Vec<EntityTag> {
        let mut ranked = self.usage().entities.clone();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().take(limit).map(|(tag, _)| tag).collect()
    }

    pub fn session_stats(&self) -> SessionStats {
        let usage = self.usage();
        let most_used_entity = usage
            .entities
            .iter()
            .fold(None::<&(EntityTag, u64)>, |best, item| match best {
                Some(b) if b.1 >= item.1 => Some(b),
                _ => Some(item),
            })
            .map(|(tag, _)| tag.clone());

        SessionStats {
            session_id: self.session_id.clone(),
            total_entities_used: usage.entities.iter().map(|(_, n)| n).sum(),
            unique_entities: usage.entities.len(),
            most_used_entity,
            operations_tracked: usage.filters.keys().copied().collect(),
        }
    }
}

#[async_trait]
impl SuggestionSource for PreferenceTracker {
    /// Learned filters for the intent's operation and primary entity, in
    /// field order, skipping fields the intent already filters on.
    async fn suggest_enhancements(&self, intent: &Intent) -> Result<Vec<Suggestion>> {
        let common = self
            .get_preferred_filters(intent.operation, intent.primary_entity())
            .await?;

        Ok(common
            .into_iter()
            .filter(|(field, _)| !intent.has_filter_on(field))
            .map(|(field, value)| Suggestion {
                kind: SuggestionKind::AddFilter,
                field,
                value,
                reason: format!(
                    "You often use this filter for {} queries",
                    intent.operation
                ),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypherloom_core::{AccessMode, ExecutionMetadata, FilterCondition, Params, Row};
    use cypherloom_memory::InMemoryPatternStore;

    fn result_with_rows(n: usize) -> ExecutionResult {
        ExecutionResult {
            columns: vec!["v".into()],
            rows: vec![Row::new(); n],
            metadata: ExecutionMetadata {
                query: "MATCH (v:vendor)\nRETURN v".into(),
                params: Params::new(),
                mode: AccessMode::Read,
                elapsed_ms: 1,
                available_after_ms: None,
                counters: Default::default(),
            },
            summary: format!("Found {n} results"),
        }
    }

    fn critical_vendors() -> Intent {
        let mut intent = Intent::new(Operation::Filter, 0.9);
        intent.entities = vec![EntityTag::from("vendor")];
        intent.filters = vec![FilterCondition::equals("riskLevel", "Critical")];
        intent
    }

    fn tracker() -> PreferenceTracker {
        PreferenceTracker::new("s1", Arc::new(InMemoryPatternStore::new()))
    }

    #[tokio::test]
    async fn suggestions_appear_after_repeated_use() {
        let tracker = tracker();
        let mut plain = Intent::new(Operation::Filter, 0.9);
        plain.entities = vec![EntityTag::from("vendor")];

        tracker
            .record_query_preference(&critical_vendors(), &result_with_rows(3), true)
            .await
            .unwrap();
        assert!(tracker.suggest_enhancements(&plain).await.unwrap().is_empty());

        tracker
            .record_query_preference(&critical_vendors(), &result_with_rows(3), true)
            .await
            .unwrap();
        let suggestions = tracker.suggest_enhancements(&plain).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].field, "riskLevel");
        assert_eq!(suggestions[0].value, Value::from("Critical"));
        assert_eq!(
            suggestions[0].reason,
            "You often use this filter for filter queries"
        );

        // Fields already present are never suggested.
        assert!(tracker
            .suggest_enhancements(&critical_vendors())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unsatisfied_queries_do_not_count_as_success() {
        let tracker = tracker();
        let pattern = tracker
            .record_query_preference(&critical_vendors(), &result_with_rows(5), false)
            .await
            .unwrap();
        assert_eq!(pattern.frequency, 1);
        assert_eq!(pattern.success_count, 0);
    }

    #[tokio::test]
    async fn entity_preferences_and_stats() {
        let tracker = tracker().with_min_occurrences(3);
        assert_eq!(tracker.min_occurrences(), 3);

        let mut controls = Intent::new(Operation::List, 0.8);
        controls.entities = vec![EntityTag::from("control"), EntityTag::from("vendor")];
        tracker
            .record_query_preference(&controls, &result_with_rows(1), true)
            .await
            .unwrap();
        for _ in 0..2 {
            tracker
                .record_query_preference(&critical_vendors(), &result_with_rows(1), true)
                .await
                .unwrap();
        }

        assert_eq!(
            tracker.get_preferred_entities(5),
            vec![EntityTag::from("vendor"), EntityTag::from("control")]
        );
        assert_eq!(tracker.get_preferred_entities(1).len(), 1);

        let stats = tracker.session_stats();
        assert_eq!(stats.session_id, "s1");
        assert_eq!(stats.total_entities_used, 4);
        assert_eq!(stats.unique_entities, 2);
        assert_eq!(stats.most_used_entity, Some(EntityTag::from("vendor")));
        assert_eq!(stats.operations_tracked, vec![Operation::Filter]);
    }
}
