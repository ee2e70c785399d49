//! Vocabulary: the words the classifier knows.
//!
//! Every pattern is a regex fragment matched against lower-cased text.
//! The default vocabulary covers a third-party risk and compliance graph;
//! callers with a different schema build their own.

use cypherloom_core::{AggregationKind, EntityTag, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synonyms that identify one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub tag: EntityTag,
    /// Regex fragments, joined with `|` and wrapped in word boundaries.
    pub synonyms: Vec<String>,
}

/// A fixed vocabulary of values for one filterable field.
///
/// Values are tried in order; the first that matches wins, so list the more
/// specific phrase first (`non-compliant` before `compliant`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityTag>,
    pub values: Vec<(String, Value)>,
}

/// Keywords that request one aggregate function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationDefinition {
    pub kind: AggregationKind,
    pub keywords: Vec<String>,
}

/// One entry of the ordered operation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRule {
    pub operation: Operation,
    pub pattern: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Checked top to bottom; the first matching rule decides the operation.
    pub operations: Vec<OperationRule>,
    pub entities: Vec<EntityDefinition>,
    pub filters: Vec<FilterDefinition>,
    /// Checked top to bottom; a matched keyword is masked out before the next
    /// definition runs, so `total amount` never also reads as `total`.
    pub aggregations: Vec<AggregationDefinition>,
    /// Candidate fields for non-count aggregates, first present wins.
    pub aggregation_fields: Vec<String>,
    pub descending_words: Vec<String>,
    /// Matched as whole words.
    pub relationship_words: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rule(operation: Operation, pattern: &str, confidence: f64) -> OperationRule {
    OperationRule {
        operation,
        pattern: pattern.to_string(),
        confidence,
    }
}

fn entity(tag: &str, synonyms: &[&str]) -> EntityDefinition {
    EntityDefinition {
        tag: EntityTag::from(tag),
        synonyms: strings(synonyms),
    }
}

fn filter(field: &str, entity: Option<&str>, values: &[(&str, Value)]) -> FilterDefinition {
    FilterDefinition {
        field: field.to_string(),
        entity: entity.map(EntityTag::from),
        values: values
            .iter()
            .map(|(pattern, value)| (pattern.to_string(), value.clone()))
            .collect(),
    }
}

fn aggregation(kind: AggregationKind, keywords: &[&str]) -> AggregationDefinition {
    AggregationDefinition {
        kind,
        keywords: strings(keywords),
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            operations: vec![
                rule(Operation::Compare, r"\b(compare|comparison|versus|vs)\b", 0.9),
                rule(Operation::Compare, r"\bdifference between\b", 0.9),
                // "top 5 vendors by risk" is a ranked listing, not a filter
                rule(Operation::List, r"\b(top|first)\s+\d+\b.*\bby\b", 0.9),
                rule(Operation::Aggregate, r"\b(how many|number of|count)\b", 0.95),
                rule(Operation::Aggregate, r"\b(total|sum|average|avg|mean|maximum|minimum)\b", 0.9),
                rule(Operation::Details, r"\b(details?|information|info)\s+(about|for|on|of)\b", 0.95),
                rule(Operation::Details, r"\b\w+\s+(details|profile)\b", 0.9),
                rule(Operation::Details, r"\bdescribe\b", 0.85),
                rule(Operation::Relationship, r"\b(relationships?|connections?|connected|linked|related)\b", 0.9),
                rule(Operation::Relationship, r"\b(depend\w*|blast radius|impact)\b", 0.85),
                rule(Operation::Filter, r"\b(with|having|where|that have)\b.*\b(critical|high|medium|low)[\s-]+risks?\b", 0.95),
                rule(Operation::Filter, r"\b(critical|high|medium|low)[\s-]+risks?\b", 0.9),
                rule(Operation::Filter, r"\b(active|inactive|pending|compliant|non-compliant|effective|ineffective)\b", 0.85),
                rule(Operation::Filter, r"\b(with|having|where)\b", 0.8),
                rule(Operation::Analyze, r"\b(analy[sz]e|analysis|assess\w*|trends?|concentration|coverage|gaps?|breakdown)\b", 0.85),
                rule(Operation::List, r"\b(list|show|display|get|find|give me)\b", 0.85),
                rule(Operation::List, r"\ball\b", 0.7),
            ],
            entities: vec![
                entity("vendor", &[r"vendors?", r"suppliers?", r"third[\s-]part(?:y|ies)", r"providers?"]),
                entity("control", &[r"controls?", r"safeguards?", r"measures?"]),
                entity(
                    "regulation",
                    &[r"regulations?", r"rules?", r"requirements?", r"laws?", r"bsa", r"aml", r"fcra", r"ecoa", r"fair lending"],
                ),
                entity("risk", &[r"risks?", r"threats?", r"exposures?", r"vulnerabilit(?:y|ies)"]),
                entity("issue", &[r"issues?", r"findings?", r"exceptions?", r"deficienc(?:y|ies)"]),
                entity("assessment", &[r"assessments?", r"evaluations?", r"reviews?"]),
                entity("business_unit", &[r"business units?", r"departments?", r"divisions?"]),
                entity("technology", &[r"technolog(?:y|ies)", r"systems?", r"applications?"]),
            ],
            filters: vec![
                filter(
                    "riskLevel",
                    Some("vendor"),
                    &[
                        (r"\bcritical[\s-]+risks?\b", Value::from("Critical")),
                        (r"\bhigh[\s-]+risks?\b", Value::from("High")),
                        (r"\bmedium[\s-]+risks?\b", Value::from("Medium")),
                        (r"\blow[\s-]+risks?\b", Value::from("Low")),
                    ],
                ),
                filter(
                    "status",
                    None,
                    &[
                        (r"\binactive\b", Value::from("Inactive")),
                        (r"\bactive\b", Value::from("Active")),
                        (r"\bpending\b", Value::from("Pending")),
                    ],
                ),
                filter(
                    "compliant",
                    None,
                    &[
                        (r"\b(non-?compliant|not compliant)\b", Value::Bool(false)),
                        (r"\bcompliant\b", Value::Bool(true)),
                    ],
                ),
                filter(
                    "effectiveness",
                    Some("control"),
                    &[
                        (r"\bineffective\b", Value::from("Ineffective")),
                        (r"\beffective\b", Value::from("Effective")),
                    ],
                ),
            ],
            aggregations: vec![
                aggregation(AggregationKind::Sum, &["total amount", "add up", "sum"]),
                aggregation(AggregationKind::Avg, &["average", "mean", "avg"]),
                aggregation(AggregationKind::Max, &["maximum", "max"]),
                aggregation(AggregationKind::Min, &["minimum", "min"]),
                aggregation(AggregationKind::Count, &["how many", "number of", "count", "total"]),
            ],
            aggregation_fields: strings(&["risk", "score", "count", "amount", "value", "rating"]),
            descending_words: strings(&["descending", "desc", "highest", "most", "top"]),
            relationship_words: strings(&[
                "relationships?",
                "connections?",
                "dependency",
                "dependencies",
                "impacts?",
                "related",
                "connected",
                "linked",
            ]),
        }
    }
}

impl Vocabulary {
    /// Entity tags in declaration order.
    pub fn entity_tags(&self) -> impl Iterator<Item = &EntityTag> {
        self.entities.iter().map(|e| &e.tag)
    }
}
