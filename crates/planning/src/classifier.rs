//! Intent classifier: free text to [`Intent`] by ordered pattern matching.
//!
//! Classification picks the operation from the first matching rule of an
//! ordered table. Four extraction passes then run regardless of which rule
//! won (or whether any did): entities, filters, aggregations, sort/limit.

use crate::vocabulary::Vocabulary;
use async_trait::async_trait;
use cypherloom_core::intent::ORIGINAL_QUERY_KEY;
use cypherloom_core::{
    Aggregation, AggregationKind, Classify, EntityTag, FilterCondition, FilterOperator, Intent,
    Operation, Sort, SortDirection,
};
use regex_lite::Regex;
use serde_json::Value;
use std::num::NonZeroU32;
use tracing::debug;

/// Confidence reported when no rule matches.
pub const UNKNOWN_CONFIDENCE: f64 = 0.5;

/// A vocabulary pattern that failed to compile.
#[derive(Debug, thiserror::Error)]
#[error("Invalid vocabulary pattern '{pattern}': {reason}")]
pub struct VocabularyError {
    pub pattern: String,
    pub reason: String,
}

impl From<VocabularyError> for cypherloom_core::Error {
    fn from(err: VocabularyError) -> Self {
        cypherloom_core::Error::Config {
            message: err.to_string(),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, VocabularyError> {
    Regex::new(pattern).map_err(|e| VocabularyError {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn word_alternation(words: &[String]) -> Result<Regex, VocabularyError> {
    compile(&format!(r"\b(?:{})\b", words.join("|")))
}

// ── Compiled tables ───────────────────────────────────────────────────────

struct CompiledRule {
    operation: Operation,
    pattern: Regex,
    confidence: f64,
}

struct CompiledEntity {
    tag: EntityTag,
    pattern: Regex,
}

struct CompiledFilter {
    field: String,
    entity: Option<EntityTag>,
    values: Vec<(Regex, Value)>,
}

struct CompiledAggregation {
    kind: AggregationKind,
    pattern: Regex,
}

/// Classifies free text into a structured [`Intent`].
///
/// Pure and synchronous: no I/O, never suspends.
pub struct IntentClassifier {
    rules: Vec<CompiledRule>,
    entities: Vec<CompiledEntity>,
    filters: Vec<CompiledFilter>,
    aggregations: Vec<CompiledAggregation>,
    aggregation_fields: Vec<String>,
    descending: Regex,
    relationship_words: Regex,
    group_by: Regex,
    explicit_sort: Regex,
    ranked_sort: Regex,
    limit: Regex,
}

impl IntentClassifier {
    /// A classifier over the built-in risk and compliance vocabulary.
    pub fn new() -> Result<Self, VocabularyError> {
        Self::with_vocabulary(&Vocabulary::default())
    }

    /// Compile a custom vocabulary.
    pub fn with_vocabulary(vocabulary: &Vocabulary) -> Result<Self, VocabularyError> {
        let rules = vocabulary
            .operations
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    operation: r.operation,
                    pattern: compile(&r.pattern)?,
                    confidence: r.confidence,
                })
            })
            .collect::<Result<Vec<_>, VocabularyError>>()?;

        let entities = vocabulary
            .entities
            .iter()
            .map(|e| {
                Ok(CompiledEntity {
                    tag: e.tag.clone(),
                    pattern: word_alternation(&e.synonyms)?,
                })
            })
            .collect::<Result<Vec<_>, VocabularyError>>()?;

        let filters = vocabulary
            .filters
            .iter()
            .map(|f| {
                let values = f
                    .values
                    .iter()
                    .map(|(pattern, value)| Ok((compile(pattern)?, value.clone())))
                    .collect::<Result<Vec<_>, VocabularyError>>()?;
                Ok(CompiledFilter {
                    field: f.field.clone(),
                    entity: f.entity.clone(),
                    values,
                })
            })
            .collect::<Result<Vec<_>, VocabularyError>>()?;

        let aggregations = vocabulary
            .aggregations
            .iter()
            .map(|a| {
                Ok(CompiledAggregation {
                    kind: a.kind,
                    pattern: word_alternation(&a.keywords)?,
                })
            })
            .collect::<Result<Vec<_>, VocabularyError>>()?;

        Ok(Self {
            rules,
            entities,
            filters,
            aggregations,
            aggregation_fields: vocabulary.aggregation_fields.clone(),
            descending: word_alternation(&vocabulary.descending_words)?,
            relationship_words: word_alternation(&vocabulary.relationship_words)?,
            group_by: compile(r"\b(\w+)\s+by\s+(\w+)\b")?,
            explicit_sort: compile(r"\b(?:sort|order)(?:ed)?\s+(?:by|on)\s+(\w+)")?,
            ranked_sort: compile(r"\b(?:top|first)\s+\d+\b[^.]*?\bby\s+(\w+)")?,
            limit: compile(r"\b(?:top|first|limit)\s+(\d+)\b")?,
        })
    }

    /// Classify `text`. Never fails: an unmatched question is a valid
    /// low-confidence [`Operation::Unknown`] intent.
    pub fn classify(&self, text: &str) -> Intent {
        let lowered = text.trim().to_lowercase();

        let (operation, confidence) = self.classify_operation(&lowered);
        let mut intent = Intent::new(operation, confidence);

        intent.entities = self.extract_entities(&lowered);
        intent.filters = self.extract_filters(&lowered);
        intent.aggregations = self.extract_aggregations(&lowered);
        intent.sort = self.extract_sort(&lowered);
        intent.limit = self.extract_limit(&lowered);
        intent.include_relationships = self.relationship_words.is_match(&lowered);
        intent
            .metadata
            .insert(ORIGINAL_QUERY_KEY.into(), Value::from(text));

        debug!(
            operation = %intent.operation,
            confidence = intent.confidence(),
            entities = intent.entities.len(),
            filters = intent.filters.len(),
            "Classified query"
        );
        intent
    }

    fn classify_operation(&self, text: &str) -> (Operation, f64) {
        self.rules
            .iter()
            .find(|r| r.pattern.is_match(text))
            .map(|r| (r.operation, r.confidence))
            .unwrap_or((Operation::Unknown, UNKNOWN_CONFIDENCE))
    }

    /// Entities in order of first mention; declaration order breaks ties.
    fn extract_entities(&self, text: &str) -> Vec<EntityTag> {
        let mut found: Vec<(usize, usize, &EntityTag)> = self
            .entities
            .iter()
            .enumerate()
            .filter_map(|(rank, e)| e.pattern.find(text).map(|m| (m.start(), rank, &e.tag)))
            .collect();
        found.sort();
        found.into_iter().map(|(_, _, tag)| tag.clone()).collect()
    }

    /// One filter per field: the first vocabulary value that matches.
    fn extract_filters(&self, text: &str) -> Vec<FilterCondition> {
        self.filters
            .iter()
            .filter_map(|f| {
                let (_, value) = f.values.iter().find(|(re, _)| re.is_match(text))?;
                Some(FilterCondition {
                    field: f.field.clone(),
                    operator: FilterOperator::Equals,
                    value: value.clone(),
                    entity: f.entity.clone(),
                })
            })
            .collect()
    }

    fn extract_aggregations(&self, text: &str) -> Vec<Aggregation> {
        let mut remaining = text.to_string();
        let mut aggregations = Vec::new();

        for def in &self.aggregations {
            if !def.pattern.is_match(&remaining) {
                continue;
            }
            // Blank out what this kind claimed so shorter keywords of later
            // kinds cannot match inside it.
            remaining = def
                .pattern
                .replace_all(&remaining, |caps: &regex_lite::Captures<'_>| {
                    " ".repeat(caps[0].len())
                })
                .into_owned();

            let field = match def.kind {
                AggregationKind::Count => None,
                _ => self
                    .aggregation_fields
                    .iter()
                    .find(|f| text.contains(f.as_str()))
                    .cloned(),
            };
            aggregations.push(Aggregation::new(def.kind, field));
        }

        if let Some(group) = self.extract_group_by(text) {
            for agg in &mut aggregations {
                agg.group_by = Some(group.clone());
            }
        }
        aggregations
    }

    /// `by X`, `group by X`, `grouped by X`, but not `sorted by X`.
    fn extract_group_by(&self, text: &str) -> Option<String> {
        self.group_by
            .captures_iter(text)
            .filter(|caps| !matches!(&caps[1], "sort" | "sorted" | "order" | "ordered"))
            .map(|caps| caps[2].to_string())
            .next()
    }

    fn extract_sort(&self, text: &str) -> Option<Sort> {
        let field = self
            .explicit_sort
            .captures(text)
            .or_else(|| self.ranked_sort.captures(text))
            .map(|caps| caps[1].to_string())?;

        let direction = if self.descending.is_match(text) {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        };
        Some(Sort { field, direction })
    }

    fn extract_limit(&self, text: &str) -> Option<NonZeroU32> {
        let caps = self.limit.captures(text)?;
        caps[1].parse::<u32>().ok().and_then(NonZeroU32::new)
    }
}

#[async_trait]
impl Classify for IntentClassifier {
    async fn classify(&self, text: &str) -> cypherloom_core::Result<Intent> {
        Ok(IntentClassifier::classify(self, text))
    }
}
