//! Multi-turn conversation context kept in working memory, and the
//! classifier that uses it to resolve follow-up questions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cypherloom_core::intent::CONTEXT_ENTITIES_KEY;
use cypherloom_core::{Classify, EntityTag, Intent, MemoryError, Operation, Result};
use cypherloom_memory::WorkingCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Turns kept per conversation.
pub const DEFAULT_MAX_TURNS: usize = 5;

/// Lifetime of the stored history, refreshed on every turn.
pub const CONTEXT_TTL: Duration = Duration::from_secs(3600);

/// Entities inherited by a follow-up that names none.
const MAX_INHERITED_ENTITIES: usize = 3;

/// Turns consulted when inheriting entities.
const INHERIT_FROM_TURNS: usize = 2;

const PRONOUNS: &[&str] = &["it", "them", "those", "these", "that", "they", "ones", "one"];
const NARROWING_WORDS: &[&str] = &["only", "just", "narrow", "filter"];
const REFINEMENT_STARTERS: &[&str] = &[
    "only", "just", "filter", "narrow", "show", "which", "what", "in", "with", "for", "by",
];

/// One remembered question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub operation: Operation,
    pub entities: Vec<EntityTag>,
    pub confidence: f64,
    pub has_filters: bool,
    pub has_aggregations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

/// The last few turns of one conversation, stored under
/// `conversation:{session}:history`.
pub struct ConversationContext {
    cache: Arc<WorkingCache>,
    session_id: String,
    key: String,
    max_turns: usize,
}

impl ConversationContext {
    pub fn new(cache: Arc<WorkingCache>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            cache,
            key: format!("conversation:{session_id}:history"),
            session_id,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored turns, oldest first. Missing or expired history is empty.
    pub fn turns(&self) -> Result<Vec<ConversationTurn>> {
        match self.cache.get(&self.key) {
            Ok(Some(value)) => Ok(serde_json::from_value(value)?),
            Ok(None) | Err(MemoryError::Expired { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn add_turn(&self, query: &str, intent: &Intent, result_count: Option<usize>) -> Result<()> {
        let mut turns = self.turns()?;
        turns.push(ConversationTurn {
            query: query.to_string(),
            operation: intent.operation,
            entities: intent.entities.clone(),
            confidence: intent.confidence(),
            has_filters: !intent.filters.is_empty(),
            has_aggregations: !intent.aggregations.is_empty(),
            result_count,
            timestamp: Utc::now(),
        });
        if turns.len() > self.max_turns {
            turns.drain(..turns.len() - self.max_turns);
        }

        self.cache
            .set(&self.key, serde_json::to_value(&turns)?, Some(CONTEXT_TTL))?;
        debug!(session = %self.session_id, turns = turns.len(), "Recorded conversation turn");
        Ok(())
    }

    /// Distinct entities of the last `n` turns, most recent turn first.
    pub fn last_entities(&self, n: usize) -> Result<Vec<EntityTag>> {
        let turns = self.turns()?;
        let mut entities: Vec<EntityTag> = Vec::new();
        for turn in turns.iter().rev().take(n) {
            for entity in &turn.entities {
                if !entities.contains(entity) {
                    entities.push(entity.clone());
                }
            }
        }
        Ok(entities)
    }

    pub fn last_operation(&self) -> Result<Option<Operation>> {
        Ok(self.turns()?.last().map(|t| t.operation))
    }

    pub fn last_query(&self) -> Result<Option<String>> {
        Ok(self.turns()?.pop().map(|t| t.query))
    }

    /// Forget the conversation. Returns whether anything was stored.
    pub fn clear(&self) -> bool {
        self.cache.delete(&self.key)
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `text` reads like it refers back to an earlier question.
pub fn is_follow_up(text: &str) -> bool {
    words(text)
        .iter()
        .any(|w| PRONOUNS.contains(&w.as_str()) || NARROWING_WORDS.contains(&w.as_str()))
}

/// Whether `text` opens with a refinement word ("only critical ones").
pub fn is_refinement(text: &str) -> bool {
    words(text)
        .first()
        .is_some_and(|w| REFINEMENT_STARTERS.contains(&w.as_str()))
}

/// Classifies through a base classifier, then fills gaps in follow-up
/// questions from the conversation so far.
///
/// A follow-up with no entities inherits up to three from the last two
/// turns; an unknown follow-up that opens with a refinement word inherits
/// the previous operation.
pub struct ContextAwareClassifier {
    base: Arc<dyn Classify>,
    context: Arc<ConversationContext>,
}

impl ContextAwareClassifier {
    pub fn new(base: Arc<dyn Classify>, context: Arc<ConversationContext>) -> Self {
        Self { base, context }
    }

    pub fn context(&self) -> &Arc<ConversationContext> {
        &self.context
    }

    fn resolve(&self, text: &str, mut intent: Intent) -> Result<Intent> {
        if !is_follow_up(text) {
            return Ok(intent);
        }

        if intent.entities.is_empty() {
            let mut inherited = self.context.last_entities(INHERIT_FROM_TURNS)?;
            inherited.truncate(MAX_INHERITED_ENTITIES);
            if !inherited.is_empty() {
                debug!(entities = ?inherited, "Inheriting entities from conversation");
                intent.metadata.insert(
                    CONTEXT_ENTITIES_KEY.to_string(),
                    Value::Array(
                        inherited
                            .iter()
                            .map(|e| Value::String(e.as_str().to_string()))
                            .collect(),
                    ),
                );
                intent.entities = inherited;
            }
        }

        if intent.operation == Operation::Unknown && is_refinement(text) {
            if let Some(previous) = self.context.last_operation()? {
                debug!(operation = %previous, "Inheriting operation from conversation");
                intent.operation = previous;
            }
        }

        Ok(intent)
    }
}

#[async_trait]
impl Classify for ContextAwareClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        let intent = self.base.classify(text).await?;
        match self.resolve(text, intent.clone()) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                warn!(error = %e, "Conversation context unavailable, using base intent");
                Ok(intent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypherloom_planning::IntentClassifier;

    fn context() -> Arc<ConversationContext> {
        Arc::new(ConversationContext::new(Arc::new(WorkingCache::default()), "conv_1"))
    }

    fn intent(operation: Operation, entities: &[&str]) -> Intent {
        let mut intent = Intent::new(operation, 0.9);
        intent.entities = entities.iter().map(|e| EntityTag::from(*e)).collect();
        intent
    }

    #[test]
    fn history_keeps_last_turns() {
        let ctx = ConversationContext::new(Arc::new(WorkingCache::default()), "s").with_max_turns(2);
        assert!(ctx.turns().unwrap().is_empty());
        assert_eq!(ctx.key(), "conversation:s:history");

        ctx.add_turn("q1", &intent(Operation::List, &["vendor"]), Some(3)).unwrap();
        ctx.add_turn("q2", &intent(Operation::Filter, &["control"]), None).unwrap();
        ctx.add_turn("q3", &intent(Operation::Aggregate, &["risk", "control"]), Some(1)).unwrap();

        let turns = ctx.turns().unwrap();
        let queries: Vec<&str> = turns.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["q2", "q3"]);
        assert_eq!(ctx.last_query().unwrap().as_deref(), Some("q3"));
        assert_eq!(ctx.last_operation().unwrap(), Some(Operation::Aggregate));
        assert_eq!(
            ctx.last_entities(2).unwrap(),
            vec![EntityTag::from("risk"), EntityTag::from("control")]
        );

        assert!(ctx.clear());
        assert_eq!(ctx.last_query().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_history_is_empty() {
        let ctx = context();
        ctx.add_turn("Show all vendors", &intent(Operation::List, &["vendor"]), None)
            .unwrap();
        tokio::time::advance(CONTEXT_TTL + Duration::from_secs(1)).await;
        assert!(ctx.turns().unwrap().is_empty());
        assert!(ctx.last_entities(2).unwrap().is_empty());
    }

    #[test]
    fn follow_up_detection() {
        assert!(is_follow_up("Which of them are critical?"));
        assert!(is_follow_up("only the active ones"));
        assert!(!is_follow_up("List all vendors"));
        assert!(is_refinement("Only critical"));
        assert!(!is_refinement("Count controls"));
    }

    #[tokio::test]
    async fn follow_up_inherits_entities() {
        let ctx = context();
        ctx.add_turn("Show all vendors", &intent(Operation::List, &["vendor"]), Some(12))
            .unwrap();

        let classifier = ContextAwareClassifier::new(Arc::new(IntentClassifier::new().unwrap()), ctx);
        let intent = classifier.classify("Which of them are inactive?").await.unwrap();

        assert_eq!(intent.entities, vec![EntityTag::from("vendor")]);
        assert_eq!(intent.metadata[CONTEXT_ENTITIES_KEY], serde_json::json!(["vendor"]));
        assert!(intent.has_filter_on("status"));
    }

    #[tokio::test]
    async fn refinement_inherits_operation() {
        let ctx = context();
        ctx.add_turn("Count controls", &intent(Operation::Aggregate, &["control"]), Some(1))
            .unwrap();

        let classifier = ContextAwareClassifier::new(Arc::new(IntentClassifier::new().unwrap()), ctx);
        let intent = classifier
            .classify("just the ones from last quarter")
            .await
            .unwrap();
        assert_eq!(intent.operation, Operation::Aggregate);
        assert_eq!(intent.entities, vec![EntityTag::from("control")]);
    }

    #[tokio::test]
    async fn standalone_question_is_untouched() {
        let ctx = context();
        ctx.add_turn("Show all vendors", &intent(Operation::List, &["vendor"]), None)
            .unwrap();
        let classifier = ContextAwareClassifier::new(Arc::new(IntentClassifier::new().unwrap()), ctx);
        let intent = classifier.classify("List all controls").await.unwrap();
        assert_eq!(intent, IntentClassifier::new().unwrap().classify("List all controls"));
    }
}
