//! Classification enhanced with learned filters.

use async_trait::async_trait;
use cypherloom_core::intent::PATTERN_ENHANCEMENTS_KEY;
use cypherloom_core::{
    Classify, FilterCondition, Intent, Result, SuggestionKind, SuggestionSource,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Counters for [`EnhancingClassifier::enhancement_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnhancementStats {
    pub source_attached: bool,
    pub classified: u64,
    pub enhanced: u64,
    pub filters_added: u64,
}

/// Wraps a base classifier and appends learned filters from an optional
/// suggestion source.
///
/// Each field is filtered at most once: suggestions for fields the intent
/// already has are dropped, and so are repeats within one batch.
pub struct EnhancingClassifier {
    base: Arc<dyn Classify>,
    source: Option<Arc<dyn SuggestionSource>>,
    classified: AtomicU64,
    enhanced: AtomicU64,
    filters_added: AtomicU64,
}

impl EnhancingClassifier {
    pub fn new(base: Arc<dyn Classify>, source: Option<Arc<dyn SuggestionSource>>) -> Self {
        Self {
            base,
            source,
            classified: AtomicU64::new(0),
            enhanced: AtomicU64::new(0),
            filters_added: AtomicU64::new(0),
        }
    }

    /// Classify `text`, adding learned filters when `apply_enhancements` is
    /// set and a source is attached.
    pub async fn classify_with(&self, text: &str, apply_enhancements: bool) -> Result<Intent> {
        let intent = self.base.classify(text).await?;
        self.classified.fetch_add(1, Ordering::Relaxed);

        match &self.source {
            Some(source) if apply_enhancements => self.enhance(source.as_ref(), intent).await,
            _ => Ok(intent),
        }
    }

    async fn enhance(&self, source: &dyn SuggestionSource, mut intent: Intent) -> Result<Intent> {
        let suggestions = source.suggest_enhancements(&intent).await?;

        let mut seen: BTreeSet<String> = intent.filters.iter().map(|f| f.field.clone()).collect();
        let mut reasons = Vec::new();
        for suggestion in suggestions {
            match suggestion.kind {
                SuggestionKind::AddFilter => {
                    if !seen.insert(suggestion.field.clone()) {
                        continue;
                    }
                    let mut filter = FilterCondition::equals(suggestion.field, suggestion.value);
                    filter.entity = intent.primary_entity().cloned();
                    intent.filters.push(filter);
                    reasons.push(Value::String(suggestion.reason));
                }
            }
        }

        if reasons.is_empty() {
            return Ok(intent);
        }

        debug!(added = reasons.len(), operation = %intent.operation, "Applied learned filters");
        self.enhanced.fetch_add(1, Ordering::Relaxed);
        self.filters_added
            .fetch_add(reasons.len() as u64, Ordering::Relaxed);

        let slot = intent
            .metadata
            .entry(PATTERN_ENHANCEMENTS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(existing) => existing.extend(reasons),
            other => *other = Value::Array(reasons),
        }
        Ok(intent)
    }

    pub fn enhancement_stats(&self) -> EnhancementStats {
        EnhancementStats {
            source_attached: self.source.is_some(),
            classified: self.classified.load(Ordering::Relaxed),
            enhanced: self.enhanced.load(Ordering::Relaxed),
            filters_added: self.filters_added.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Classify for EnhancingClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        self.classify_with(text, true).await
    }
}
