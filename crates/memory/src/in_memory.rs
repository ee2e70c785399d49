//! In-memory backends: useful for testing and ephemeral sessions.
//!
//! Each store keeps its rows behind one `RwLock`, so every write (including
//! rule version assignment) happens under a single lock acquisition.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use cypherloom_core::memory::{merge_filter_counts, most_frequent_values, pattern_signature};
use cypherloom_core::{
    EntityTag, EpisodicStore, FilterCondition, MemoryError, NewRule, Operation, Pattern,
    PatternStore, Rule, SemanticStore, Session,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

const NAME: &str = "in_memory";

// ── Episodic ────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct InMemoryEpisodicStore {
    sessions: Arc<RwLock<BTreeMap<String, Session>>>,
}

impl InMemoryEpisodicStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Most recent first, id descending on equal timestamps.
fn newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}

#[async_trait]
impl EpisodicStore for InMemoryEpisodicStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn save_session(&self, session: Session) -> Result<String, MemoryError> {
        session.validate()?;
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&session.id) {
            return Err(MemoryError::unsupported(NAME, "overwrite_session"));
        }
        if let Some(prev) = &session.previous_session_id {
            if !sessions.contains_key(prev) {
                return Err(MemoryError::validation(
                    "previous_session_id",
                    format!("unknown session '{prev}'"),
                ));
            }
        }

        let id = session.id.clone();
        sessions.insert(id.clone(), session);
        Ok(id)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, MemoryError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn get_sessions_by_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let mut found: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.entity_ids.iter().any(|e| e == entity_id))
            .cloned()
            .collect();
        newest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }

    async fn get_recent_sessions(
        &self,
        since_days: u32,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(since_days));
        let mut found: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.timestamp >= cutoff)
            .filter(|s| workflow.is_none_or(|w| s.workflow == w))
            .cloned()
            .collect();
        newest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }

    async fn get_session_chain(
        &self,
        id: &str,
        max_depth: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let sessions = self.sessions.read().await;
        let mut chain = Vec::new();
        let mut cursor = sessions.get(id);
        while let Some(session) = cursor {
            chain.push(session.clone());
            if chain.len() > max_depth {
                break;
            }
            cursor = session
                .previous_session_id
                .as_deref()
                .and_then(|prev| sessions.get(prev));
        }
        chain.reverse();
        Ok(chain)
    }

    async fn exists(&self, id: &str) -> Result<bool, MemoryError> {
        Ok(self.sessions.read().await.contains_key(id))
    }

    async fn list_session_ids(
        &self,
        workflow_pattern: Option<&str>,
    ) -> Result<Vec<String>, MemoryError> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<&Session> = sessions
            .values()
            .filter(|s| workflow_pattern.is_none_or(|p| s.workflow.contains(p)))
            .collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(matching.into_iter().map(|s| s.id.clone()).collect())
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.sessions.read().await.len())
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.len();
        sessions.clear();
        Ok(removed)
    }
}

// ── Semantic ────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct InMemorySemanticStore {
    /// id -> versions, ascending
    rules: Arc<RwLock<BTreeMap<String, Vec<Rule>>>>,
}

impl InMemorySemanticStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collect<F>(&self, keep: F) -> Vec<Rule>
    where
        F: Fn(&Rule) -> bool,
    {
        self.rules
            .read()
            .await
            .values()
            .flatten()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }
}

fn next_version(version: u32) -> Result<u32, MemoryError> {
    version
        .checked_add(1)
        .ok_or_else(|| MemoryError::validation("previous_version", "version overflow"))
}

#[async_trait]
impl SemanticStore for InMemorySemanticStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn store_rule(&self, rule: NewRule) -> Result<Rule, MemoryError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;

        let versions = rules.get(&rule.id).map(Vec::as_slice).unwrap_or_default();
        let latest = versions.iter().map(|r| r.version).max();
        let (version, previous_version) = match rule.previous_version {
            Some(prev) => {
                if !versions.iter().any(|r| r.version == prev) {
                    return Err(MemoryError::validation(
                        "previous_version",
                        format!("rule '{}' has no version {prev}", rule.id),
                    ));
                }
                let next = next_version(prev)?;
                if versions.iter().any(|r| r.version == next) {
                    return Err(MemoryError::validation(
                        "previous_version",
                        format!("version {next} of rule '{}' already exists", rule.id),
                    ));
                }
                (next, Some(prev))
            }
            None => (next_version(latest.unwrap_or(0))?, latest),
        };

        // Dependencies only link to rules that are active right now.
        let dependencies: BTreeSet<String> = rule
            .dependencies
            .iter()
            .filter(|dep| **dep != rule.id)
            .filter(|dep| {
                rules
                    .get(dep.as_str())
                    .is_some_and(|vs| vs.iter().any(|r| r.active))
            })
            .cloned()
            .collect();

        let stored = Rule {
            id: rule.id.clone(),
            version,
            category: rule.category,
            content: rule.content,
            tags: rule.tags,
            dependencies,
            metadata: rule.metadata,
            active: true,
            created_at: Utc::now(),
            previous_version,
        };

        let versions = rules.entry(rule.id).or_default();
        for existing in versions.iter_mut() {
            existing.active = false;
        }
        versions.push(stored.clone());
        versions.sort_by_key(|r| r.version);
        Ok(stored)
    }

    async fn get_current_rule(&self, id: &str) -> Result<Option<Rule>, MemoryError> {
        Ok(self
            .rules
            .read()
            .await
            .get(id)
            .and_then(|vs| vs.iter().find(|r| r.active).cloned()))
    }

    async fn get_rule_version(&self, id: &str, version: u32) -> Result<Option<Rule>, MemoryError> {
        Ok(self
            .rules
            .read()
            .await
            .get(id)
            .and_then(|vs| vs.iter().find(|r| r.version == version).cloned()))
    }

    async fn get_rule_history(&self, id: &str) -> Result<Vec<Rule>, MemoryError> {
        Ok(self.rules.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn get_rules_by_category(
        &self,
        category: &str,
        active_only: bool,
    ) -> Result<Vec<Rule>, MemoryError> {
        Ok(self
            .collect(|r| r.category == category && (r.active || !active_only))
            .await)
    }

    async fn get_rules_by_tag(&self, tag: &str, active_only: bool) -> Result<Vec<Rule>, MemoryError> {
        Ok(self
            .collect(|r| r.tags.contains(tag) && (r.active || !active_only))
            .await)
    }

    async fn deactivate_rule(&self, id: &str) -> Result<bool, MemoryError> {
        let mut rules = self.rules.write().await;
        let Some(active) = rules
            .get_mut(id)
            .and_then(|vs| vs.iter_mut().find(|r| r.active))
        else {
            return Ok(false);
        };
        active.active = false;
        Ok(true)
    }

    async fn exists(&self, id: &str) -> Result<bool, MemoryError> {
        Ok(self.rules.read().await.contains_key(id))
    }

    async fn list_rule_ids(&self, category_pattern: Option<&str>) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|(_, vs)| {
                category_pattern.is_none_or(|p| vs.iter().any(|r| r.category.contains(p)))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.rules.read().await.values().map(Vec::len).sum())
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut rules = self.rules.write().await;
        let removed = rules.values().map(Vec::len).sum();
        rules.clear();
        Ok(removed)
    }
}

// ── Patterns ────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct InMemoryPatternStore {
    patterns: Arc<RwLock<BTreeMap<String, Pattern>>>,
}

impl InMemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Filter values are counted by their JSON text.
pub(crate) fn value_key(value: &Value) -> Result<String, MemoryError> {
    serde_json::to_string(value)
        .map_err(|e| MemoryError::Storage(format!("Filter value serialization: {e}")))
}

#[async_trait]
impl PatternStore for InMemoryPatternStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn record_query_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
        filters: &[FilterCondition],
        result_count: usize,
    ) -> Result<Pattern, MemoryError> {
        let signature = pattern_signature(operation, entities);
        let keys = filters
            .iter()
            .map(|f| Ok((f.field.clone(), value_key(&f.value)?)))
            .collect::<Result<Vec<_>, MemoryError>>()?;

        let mut patterns = self.patterns.write().await;
        let pattern = patterns.entry(signature.clone()).or_insert_with(|| Pattern {
            signature,
            operation,
            entities: entities
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            frequency: 0,
            success_count: 0,
            filter_counts: BTreeMap::new(),
            last_updated: Utc::now(),
        });

        pattern.frequency += 1;
        if result_count > 0 {
            pattern.success_count += 1;
        }
        for (field, value) in keys {
            *pattern
                .filter_counts
                .entry(field)
                .or_default()
                .entry(value)
                .or_default() += 1;
        }
        pattern.last_updated = Utc::now();
        Ok(pattern.clone())
    }

    async fn get_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
    ) -> Result<Option<Pattern>, MemoryError> {
        let signature = pattern_signature(operation, entities);
        Ok(self.patterns.read().await.get(&signature).cloned())
    }

    async fn get_common_filters(
        &self,
        operation: Operation,
        entity: Option<&EntityTag>,
        min_occurrences: u64,
    ) -> Result<BTreeMap<String, Value>, MemoryError> {
        let patterns = self.patterns.read().await;
        let matching = patterns
            .values()
            .filter(|p| p.operation == operation)
            .filter(|p| entity.is_none_or(|e| p.entities.contains(e)));
        Ok(most_frequent_values(
            &merge_filter_counts(matching),
            min_occurrences,
        ))
    }

    async fn top_patterns(&self, limit: usize) -> Result<Vec<Pattern>, MemoryError> {
        let mut all: Vec<Pattern> = self.patterns.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        all.truncate(limit);
        Ok(all)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.patterns.read().await.len())
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut patterns = self.patterns.write().await;
        let removed = patterns.len();
        patterns.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypherloom_core::FilterOperator;

    #[tokio::test]
    async fn session_chain_is_chronological() {
        let store = InMemoryEpisodicStore::new();
        let t0 = Utc::now() - Duration::minutes(5);
        store
            .save_session(Session::new("s1", "nl_query").with_timestamp(t0))
            .await
            .unwrap();
        store
            .save_session(
                Session::new("s2", "nl_query")
                    .with_timestamp(t0 + Duration::minutes(1))
                    .following("s1"),
            )
            .await
            .unwrap();

        let chain = store.get_session_chain("s2", 10).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn chain_depth_is_bounded() {
        let store = InMemoryEpisodicStore::new();
        store.save_session(Session::new("s0", "w")).await.unwrap();
        for i in 1..=5 {
            store
                .save_session(Session::new(format!("s{i}"), "w").following(format!("s{}", i - 1)))
                .await
                .unwrap();
        }
        let chain = store.get_session_chain("s5", 2).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s4", "s5"]);
        assert!(store.get_session_chain("nope", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_append_only() {
        let store = InMemoryEpisodicStore::new();
        store.save_session(Session::new("s1", "w")).await.unwrap();

        let err = store.save_session(Session::new("s1", "w")).await.unwrap_err();
        assert!(matches!(err, MemoryError::UnsupportedOperation { .. }));
        let err = store.delete_session("s1").await.unwrap_err();
        assert!(matches!(err, MemoryError::UnsupportedOperation { .. }));

        let err = store
            .save_session(Session::new("s2", "w").following("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
        let err = store.save_session(Session::new("", "w")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
    }

    #[tokio::test]
    async fn entity_and_recent_lookups() {
        let store = InMemoryEpisodicStore::new();
        let now = Utc::now();
        store
            .save_session(
                Session::new("old", "risk_review")
                    .with_entities(["V1"])
                    .with_timestamp(now - Duration::days(40)),
            )
            .await
            .unwrap();
        store
            .save_session(
                Session::new("mid", "nl_query")
                    .with_entities(["V1", "V2"])
                    .with_timestamp(now - Duration::days(2)),
            )
            .await
            .unwrap();
        store
            .save_session(
                Session::new("new", "risk_review")
                    .with_entities(["V1"])
                    .with_timestamp(now - Duration::hours(1)),
            )
            .await
            .unwrap();

        let by_entity = store.get_sessions_by_entity("V1", 2).await.unwrap();
        let ids: Vec<&str> = by_entity.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);

        let recent = store.get_recent_sessions(7, None, 50).await.unwrap();
        assert_eq!(recent.len(), 2);
        let reviews = store
            .get_recent_sessions(7, Some("risk_review"), 50)
            .await
            .unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "new");

        assert_eq!(
            store.list_session_ids(Some("review")).await.unwrap(),
            vec!["old", "new"]
        );
        assert_eq!(EpisodicStore::clear(&store).await.unwrap(), 3);
        assert_eq!(EpisodicStore::count(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rule_versions_are_monotonic() {
        let store = InMemorySemanticStore::new();
        for k in 1..=4u32 {
            let rule = store
                .store_rule(NewRule::new("R1", "lending", Value::from(k)))
                .await
                .unwrap();
            assert_eq!(rule.version, k);
            let history = store.get_rule_history("R1").await.unwrap();
            assert_eq!(history.iter().filter(|r| r.active).count(), 1);
        }
        let current = store.get_current_rule("R1").await.unwrap().unwrap();
        assert_eq!(current.version, 4);
        assert_eq!(current.previous_version, Some(3));
    }

    #[tokio::test]
    async fn explicit_previous_version() {
        let store = InMemorySemanticStore::new();
        store
            .store_rule(NewRule::new("R1", "lending", Value::from("v1")))
            .await
            .unwrap();
        let v2 = store
            .store_rule(NewRule::new("R1", "lending", Value::from("v2")).after_version(1))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version, Some(1));

        let v1 = store.get_rule_version("R1", 1).await.unwrap().unwrap();
        assert!(!v1.active);
        assert!(store.get_rule_version("R1", 2).await.unwrap().unwrap().active);

        // Version 2 already follows version 1.
        let err = store
            .store_rule(NewRule::new("R1", "lending", Value::Null).after_version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
        let err = store
            .store_rule(NewRule::new("R1", "lending", Value::Null).after_version(9))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
    }

    #[tokio::test]
    async fn last_representable_version_is_rejected() {
        let store = InMemorySemanticStore::new();
        store
            .store_rule(NewRule::new("R1", "lending", Value::from("v1")))
            .await
            .unwrap();
        store.rules.write().await.get_mut("R1").unwrap()[0].version = u32::MAX;

        let err = store
            .store_rule(NewRule::new("R1", "lending", Value::Null).after_version(u32::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
        let err = store
            .store_rule(NewRule::new("R1", "lending", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));
        assert_eq!(store.get_rule_history("R1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dependencies_link_only_active_rules() {
        let store = InMemorySemanticStore::new();
        store
            .store_rule(NewRule::new("BASE", "aml", Value::Null).with_tags(["kyc"]))
            .await
            .unwrap();
        store
            .store_rule(NewRule::new("RETIRED", "aml", Value::Null))
            .await
            .unwrap();
        assert!(store.deactivate_rule("RETIRED").await.unwrap());
        assert!(!store.deactivate_rule("RETIRED").await.unwrap());

        let rule = store
            .store_rule(
                NewRule::new("CHILD", "aml", Value::Null)
                    .with_tags(["kyc", "daily"])
                    .with_dependencies(["BASE", "RETIRED", "MISSING"]),
            )
            .await
            .unwrap();
        assert_eq!(rule.dependencies, BTreeSet::from(["BASE".to_string()]));

        let tagged = store.get_rules_by_tag("kyc", true).await.unwrap();
        assert_eq!(tagged.len(), 2);
        let aml = store.get_rules_by_category("aml", true).await.unwrap();
        assert_eq!(aml.len(), 2);
        let aml_all = store.get_rules_by_category("aml", false).await.unwrap();
        assert_eq!(aml_all.len(), 3);
        assert_eq!(
            store.list_rule_ids(Some("am")).await.unwrap(),
            vec!["BASE", "CHILD", "RETIRED"]
        );
    }

    #[tokio::test]
    async fn rules_cannot_be_set_or_deleted() {
        let store = InMemorySemanticStore::new();
        let rule = store
            .store_rule(NewRule::new("R1", "c", Value::Null))
            .await
            .unwrap();
        assert!(matches!(
            store.set_rule(rule).await,
            Err(MemoryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            store.delete_rule("R1").await,
            Err(MemoryError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_rule_writes_get_distinct_versions() {
        let store = InMemorySemanticStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .store_rule(NewRule::new("R1", "c", Value::from(i)))
                        .await
                        .unwrap()
                        .version
                })
            })
            .collect();
        let mut versions = BTreeSet::new();
        for handle in handles {
            versions.insert(handle.await.unwrap());
        }
        assert_eq!(versions, (1..=8).collect());
    }

    #[tokio::test]
    async fn pattern_convergence() {
        let store = InMemoryPatternStore::new();
        let entities = [EntityTag::from("vendor")];
        let filters = [FilterCondition::equals("riskLevel", "Critical")];

        for k in 1..=3u64 {
            let pattern = store
                .record_query_pattern(Operation::Filter, &entities, &filters, 5)
                .await
                .unwrap();
            assert_eq!(pattern.frequency, k);

            let common = store
                .get_common_filters(Operation::Filter, Some(&entities[0]), 3)
                .await
                .unwrap();
            if k < 3 {
                assert!(common.is_empty());
            } else {
                assert_eq!(common["riskLevel"], Value::from("Critical"));
            }
        }
    }

    #[tokio::test]
    async fn pattern_success_and_ranking() {
        let store = InMemoryPatternStore::new();
        let vendor = [EntityTag::from("vendor")];
        let risk = [EntityTag::from("risk")];
        store
            .record_query_pattern(Operation::List, &vendor, &[], 0)
            .await
            .unwrap();
        store
            .record_query_pattern(Operation::List, &vendor, &[], 3)
            .await
            .unwrap();
        store
            .record_query_pattern(
                Operation::Filter,
                &risk,
                &[FilterCondition::new("score", FilterOperator::GreaterThan, 7)],
                1,
            )
            .await
            .unwrap();

        let pattern = store
            .get_pattern(Operation::List, &vendor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pattern.success_count, 1);
        assert!((pattern.success_rate() - 0.5).abs() < f64::EPSILON);

        let top = store.top_patterns(1).await.unwrap();
        assert_eq!(top[0].signature, "list::vendor");
        assert_eq!(PatternStore::count(&store).await.unwrap(), 2);
        assert_eq!(PatternStore::clear(&store).await.unwrap(), 2);
    }
}
