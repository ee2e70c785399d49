//! One call from question text to result.
//!
//! Sequence per query: classify (context-aware, then enhanced) → generate →
//! answer from the result cache or execute → feed back into pattern memory,
//! conversation context and episodic memory → append to history.
//!
//! Every collaborator past the three core components is optional. Without
//! them the orchestrator is exactly classify → generate → execute.

use crate::context::{ContextAwareClassifier, ConversationContext};
use crate::enhancer::{EnhancementStats, EnhancingClassifier};
use crate::history::{QueryHistory, QueryRecord};
use crate::preferences::PreferenceTracker;
use chrono::Utc;
use cypherloom_config::OrchestratorConfig;
use cypherloom_core::event::{EventBus, PipelineEvent};
use cypherloom_core::{
    AccessMode, Classify, EntityTag, EpisodicStore, Error, ExecutionResult, GeneratedQuery, Intent,
    MemoryError, Result, Session, SuggestionSource,
};
use cypherloom_executor::QueryExecutor;
use cypherloom_memory::{MemoryManager, WorkingCache};
use cypherloom_planning::{IntentClassifier, QueryGenerator};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Workflow name of the episodic sessions the orchestrator saves.
pub const SESSION_WORKFLOW: &str = "nl_query";

/// Per-call switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Add learned filters. Ignored when enhancement is off in config.
    pub apply_enhancements: bool,
    pub mode: AccessMode,
}

impl QueryOptions {
    pub fn write() -> Self {
        Self {
            mode: AccessMode::Write,
            ..Self::default()
        }
    }

    pub fn without_enhancements(mut self) -> Self {
        self.apply_enhancements = false;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            apply_enhancements: true,
            mode: AccessMode::Read,
        }
    }
}

/// What a query got as far as, kept for the history record on failure.
#[derive(Default)]
struct Progress {
    intent: Option<Intent>,
    generated: Option<GeneratedQuery>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    session_id: String,

    /// Plain classifier every other layer wraps.
    base: Arc<dyn Classify>,

    /// `base`, wrapped in conversation context and learned-filter layers
    /// according to the collaborators attached.
    classifier: EnhancingClassifier,

    generator: QueryGenerator,
    executor: Arc<QueryExecutor>,

    tracker: Option<Arc<PreferenceTracker>>,
    cache: Option<Arc<WorkingCache>>,
    context: Option<Arc<ConversationContext>>,
    episodic: Option<Arc<dyn EpisodicStore>>,

    event_bus: Arc<EventBus>,
    history: Mutex<QueryHistory>,

    /// Id of the last saved episodic session; held while saving so the
    /// chain follows call order.
    last_session: AsyncMutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        generator: QueryGenerator,
        executor: Arc<QueryExecutor>,
    ) -> Result<Self> {
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
        let base: Arc<dyn Classify> = Arc::new(IntentClassifier::new()?);

        Ok(Self {
            history: Mutex::new(QueryHistory::new(config.max_history_size)),
            config,
            session_id,
            classifier: EnhancingClassifier::new(base.clone(), None),
            base,
            generator,
            executor,
            tracker: None,
            cache: None,
            context: None,
            episodic: None,
            event_bus: Arc::new(EventBus::default()),
            last_session: AsyncMutex::new(None),
        })
    }

    /// Replace the plain classifier (e.g. one built from a custom vocabulary).
    pub fn with_classifier(mut self, classifier: Arc<dyn Classify>) -> Self {
        self.base = classifier;
        self.rebuild_classifier();
        self
    }

    pub fn with_preference_tracker(mut self, tracker: Arc<PreferenceTracker>) -> Self {
        self.tracker = Some(tracker);
        self.rebuild_classifier();
        self
    }

    /// Attach a working cache for result caching and conversation context.
    pub fn with_working_cache(mut self, cache: Arc<WorkingCache>) -> Self {
        self.context = Some(Arc::new(ConversationContext::new(
            cache.clone(),
            self.session_id.clone(),
        )));
        self.cache = Some(cache);
        self.rebuild_classifier();
        self
    }

    pub fn with_episodic_store(mut self, store: Arc<dyn EpisodicStore>) -> Self {
        self.episodic = Some(store);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Attach every tier of `memory`: the working cache, the episodic store
    /// and, when learning is enabled, a preference tracker over its patterns.
    pub fn with_memory(mut self, memory: &MemoryManager) -> Self {
        if self.config.enable_learning {
            let tracker = PreferenceTracker::new(self.session_id.clone(), memory.patterns().clone())
                .with_min_occurrences(self.config.min_filter_occurrences);
            self.tracker = Some(Arc::new(tracker));
        }
        self.episodic = Some(memory.episodic().clone());
        self.with_working_cache(memory.working().clone())
    }

    fn rebuild_classifier(&mut self) {
        let inner: Arc<dyn Classify> = match &self.context {
            Some(context) if self.config.enable_context => Arc::new(ContextAwareClassifier::new(
                self.base.clone(),
                context.clone(),
            )),
            _ => self.base.clone(),
        };
        let source = self
            .tracker
            .clone()
            .map(|t| t as Arc<dyn SuggestionSource>);
        self.classifier = EnhancingClassifier::new(inner, source);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn preference_tracker(&self) -> Option<&Arc<PreferenceTracker>> {
        self.tracker.as_ref()
    }

    pub fn conversation(&self) -> Option<&Arc<ConversationContext>> {
        self.context.as_ref()
    }

    /// Classify and generate without executing.
    pub async fn plan(&self, text: &str, apply_enhancements: bool) -> Result<(Intent, GeneratedQuery)> {
        validate_text(text)?;
        let intent = self
            .classifier
            .classify_with(text, apply_enhancements && self.config.apply_enhancements)
            .await?;
        let generated = self.generator.generate(&intent)?;
        Ok((intent, generated))
    }

    /// Answer `text`. Failures are recorded in history and returned unchanged.
    pub async fn query(&self, text: &str, options: QueryOptions) -> Result<ExecutionResult> {
        let query_id = format!("q_{}", Uuid::new_v4().simple());
        let started = Instant::now();
        let mut progress = Progress::default();

        let outcome = self.run(&query_id, text, options, &mut progress).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                info!(
                    query_id = %query_id,
                    rows = result.row_count(),
                    elapsed_ms = execution_time_ms,
                    "Query answered"
                );
                self.record_history(QueryRecord {
                    query_id,
                    natural_language: text.to_string(),
                    intent: progress.intent,
                    query_text: result.metadata.query.clone(),
                    parameters: result.metadata.params.clone(),
                    result_count: result.row_count(),
                    execution_time_ms,
                    timestamp: Utc::now(),
                    success: true,
                    error_message: None,
                });
                Ok(result)
            }
            Err(e) => {
                warn!(query_id = %query_id, error = %e, "Query failed");
                self.event_bus.publish(PipelineEvent::QueryFailed {
                    query_id: query_id.clone(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                let (query_text, parameters) = progress
                    .generated
                    .map(|g| (g.text, g.params))
                    .unwrap_or_default();
                self.record_history(QueryRecord {
                    query_id,
                    natural_language: text.to_string(),
                    intent: progress.intent,
                    query_text,
                    parameters,
                    result_count: 0,
                    execution_time_ms,
                    timestamp: Utc::now(),
                    success: false,
                    error_message: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        query_id: &str,
        text: &str,
        options: QueryOptions,
        progress: &mut Progress,
    ) -> Result<ExecutionResult> {
        validate_text(text)?;

        // ── Classify ───────────────────────────────────────────────────
        let apply = options.apply_enhancements && self.config.apply_enhancements;
        let intent = self.classifier.classify_with(text, apply).await?;
        debug!(
            query_id,
            operation = %intent.operation,
            confidence = intent.confidence(),
            entities = ?intent.entities,
            "Classified query"
        );
        self.event_bus.publish(PipelineEvent::QueryClassified {
            query_id: query_id.to_string(),
            operation: intent.operation,
            confidence: intent.confidence(),
            enhancements: intent.enhancements().len(),
            timestamp: Utc::now(),
        });
        progress.intent = Some(intent.clone());

        // ── Generate ───────────────────────────────────────────────────
        let generated = self.generator.generate(&intent)?;
        progress.generated = Some(generated.clone());

        // ── Execute, or answer from cache ──────────────────────────────
        let result_cache = self
            .cache
            .as_ref()
            .filter(|_| self.config.enable_caching && options.mode == AccessMode::Read);
        let key = match result_cache {
            Some(_) => Some(result_cache_key(&generated)?),
            None => None,
        };
        let cached = match (result_cache, &key) {
            (Some(cache), Some(key)) => lookup_cached(cache, key)?,
            _ => None,
        };

        let result = match cached {
            Some(result) => {
                debug!(query_id, "Answered from result cache");
                self.event_bus.publish(PipelineEvent::CacheHit {
                    query_id: query_id.to_string(),
                    cache_key: key.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                });
                result
            }
            None => {
                let result = self
                    .executor
                    .execute_generated(&generated, options.mode)
                    .await?;
                self.event_bus.publish(PipelineEvent::QueryExecuted {
                    query_id: query_id.to_string(),
                    mode: options.mode,
                    row_count: result.row_count(),
                    elapsed_ms: result.metadata.elapsed_ms,
                    timestamp: Utc::now(),
                });
                if let (Some(cache), Some(key)) = (result_cache, &key) {
                    cache.set(
                        key,
                        serde_json::to_value(&result)?,
                        Some(Duration::from_secs(self.config.cache_ttl_secs)),
                    )?;
                }
                result
            }
        };

        // ── Learn ──────────────────────────────────────────────────────
        if let Some(tracker) = self.tracker.as_ref().filter(|_| self.config.enable_learning) {
            let pattern = tracker.record_query_preference(&intent, &result, true).await?;
            self.event_bus.publish(PipelineEvent::PatternRecorded {
                signature: pattern.signature,
                frequency: pattern.frequency,
                timestamp: Utc::now(),
            });
        }

        if let Some(context) = &self.context {
            context.add_turn(text, &intent, Some(result.row_count()))?;
        }

        if let Some(store) = &self.episodic {
            self.save_session(store.as_ref(), query_id, text, &intent, &generated, &result)
                .await?;
        }

        Ok(result)
    }

    async fn save_session(
        &self,
        store: &dyn EpisodicStore,
        query_id: &str,
        text: &str,
        intent: &Intent,
        generated: &GeneratedQuery,
        result: &ExecutionResult,
    ) -> Result<()> {
        let mut last = self.last_session.lock().await;

        let mut session = Session::new(query_id, SESSION_WORKFLOW)
            .with_entities(intent.entities.iter().map(EntityTag::as_str))
            .with_result(json!({
                "row_count": result.row_count(),
                "summary": result.summary,
            }))
            .with_metadata(json!({
                "conversation_id": self.session_id,
                "natural_language": text,
                "operation": intent.operation,
                "confidence": intent.confidence(),
                "query": generated.text,
            }));
        if let Some(previous) = last.as_deref() {
            session = session.following(previous);
        }

        store.save_session(session).await?;
        *last = Some(query_id.to_string());
        Ok(())
    }

    fn history_guard(&self) -> MutexGuard<'_, QueryHistory> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_history(&self, record: QueryRecord) {
        if self.config.enable_history {
            self.history_guard().add(record);
        }
    }

    // ── History access ─────────────────────────────────────────────────

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<QueryRecord> {
        self.history_guard().history(limit)
    }

    pub fn last_query(&self) -> Option<QueryRecord> {
        self.history_guard().last().cloned()
    }

    pub fn successful_queries(&self, limit: usize) -> Vec<QueryRecord> {
        self.history_guard().successful(limit)
    }

    pub fn search_history_by_entity(&self, entity: &EntityTag, limit: usize) -> Vec<QueryRecord> {
        self.history_guard().search_by_entity(entity, limit)
    }

    pub fn clear_history(&self) {
        self.history_guard().clear();
    }

    pub fn enhancement_stats(&self) -> EnhancementStats {
        self.classifier.enhancement_stats()
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::validation("text", "query text must not be empty"));
    }
    Ok(())
}

/// `query:` + SHA-256 of the query text and its parameters.
fn result_cache_key(generated: &GeneratedQuery) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(generated.text.as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_string(&generated.params)?.as_bytes());
    Ok(format!("query:{}", hex::encode(hasher.finalize())))
}

fn lookup_cached(cache: &WorkingCache, key: &str) -> Result<Option<ExecutionResult>> {
    match cache.get(key) {
        Ok(Some(value)) => Ok(Some(serde_json::from_value(value)?)),
        Ok(None) | Err(MemoryError::Expired { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
