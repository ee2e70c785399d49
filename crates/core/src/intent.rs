//! Intent: the structured form of a free-text analytic question.
//!
//! Operation, operator and aggregation tags are closed enums so that adding a
//! new tag is a compile-checked change at every `match` site. Entity tags are
//! open: the set of entities is defined by the caller's graph schema.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

/// Metadata key under which the original question text is recorded.
pub const ORIGINAL_QUERY_KEY: &str = "original_query";

/// Metadata key holding the justification strings of learned filters.
pub const PATTERN_ENHANCEMENTS_KEY: &str = "pattern_enhancements";

/// Metadata key holding entity tags inherited from conversation context.
pub const CONTEXT_ENTITIES_KEY: &str = "context_entities";

// ── Tags ──────────────────────────────────────────────────────────────────

/// What the question asks the graph to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Filter,
    Details,
    Relationship,
    Aggregate,
    Compare,
    Analyze,
    Unknown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Filter => "filter",
            Operation::Details => "details",
            Operation::Relationship => "relationship",
            Operation::Aggregate => "aggregate",
            Operation::Compare => "compare",
            Operation::Analyze => "analyze",
            Operation::Unknown => "unknown",
        }
    }

    /// Parse the `as_str` form back into a tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Operation::List),
            "filter" => Some(Operation::Filter),
            "details" => Some(Operation::Details),
            "relationship" => Some(Operation::Relationship),
            "aggregate" => Some(Operation::Aggregate),
            "compare" => Some(Operation::Compare),
            "analyze" => Some(Operation::Analyze),
            "unknown" => Some(Operation::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schema-defined entity kind, e.g. `vendor` or `control`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityTag(String);

impl EntityTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Comparison applied by a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "notEquals",
            FilterOperator::GreaterThan => "greaterThan",
            FilterOperator::LessThan => "lessThan",
            FilterOperator::GreaterOrEqual => "greaterOrEqual",
            FilterOperator::LessOrEqual => "lessOrEqual",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "startsWith",
            FilterOperator::EndsWith => "endsWith",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "notIn",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate function applied in the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::Sum => "sum",
            AggregationKind::Avg => "avg",
            AggregationKind::Max => "max",
            AggregationKind::Min => "min",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

// ── Clauses ───────────────────────────────────────────────────────────────

/// A single `field <operator> value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
    /// Entity the filter was extracted for, if the vocabulary ties it to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityTag>,
}

impl FilterCondition {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Equals,
            value: value.into(),
            entity: None,
        }
    }

    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            entity: None,
        }
    }

    pub fn for_entity(mut self, entity: EntityTag) -> Self {
        self.entity = Some(entity);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl Aggregation {
    /// An aggregation aliased `{kind}_result`.
    pub fn new(kind: AggregationKind, field: Option<String>) -> Self {
        Self {
            kind,
            field,
            alias: format!("{}_result", kind.as_str()),
            group_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

// ── Intent ────────────────────────────────────────────────────────────────

/// The classified goal of one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub operation: Operation,
    /// Entities in order of first mention; the first is the primary entity.
    #[serde(default)]
    pub entities: Vec<EntityTag>,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<NonZeroU32>,
    #[serde(default)]
    pub include_relationships: bool,
    #[serde(deserialize_with = "deserialize_confidence")]
    confidence: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Intent {
    /// Create an intent with no extracted clauses. Confidence is clamped to [0, 1].
    pub fn new(operation: Operation, confidence: f64) -> Self {
        Self {
            operation,
            entities: Vec::new(),
            filters: Vec::new(),
            aggregations: Vec::new(),
            sort: None,
            limit: None,
            include_relationships: false,
            confidence: clamp_confidence(confidence),
            metadata: BTreeMap::new(),
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }

    pub fn primary_entity(&self) -> Option<&EntityTag> {
        self.entities.first()
    }

    pub fn has_filter_on(&self, field: &str) -> bool {
        self.filters.iter().any(|f| f.field == field)
    }

    pub fn original_query(&self) -> Option<&str> {
        self.metadata.get(ORIGINAL_QUERY_KEY).and_then(Value::as_str)
    }

    /// Justification strings recorded by learned-filter enhancement.
    pub fn enhancements(&self) -> Vec<String> {
        self.metadata
            .get(PATTERN_ENHANCEMENTS_KEY)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn deserialize_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    f64::deserialize(deserializer).map(clamp_confidence)
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(Intent::new(Operation::List, 1.7).confidence(), 1.0);
        assert_eq!(Intent::new(Operation::List, -0.2).confidence(), 0.0);
        assert_eq!(Intent::new(Operation::List, f64::NAN).confidence(), 0.0);

        let mut intent = Intent::new(Operation::Filter, 0.9);
        intent.set_confidence(3.0);
        assert_eq!(intent.confidence(), 1.0);
    }

    #[test]
    fn zero_limit_is_rejected_on_deserialize() {
        let json = r#"{"operation":"list","confidence":0.9,"limit":0}"#;
        assert!(serde_json::from_str::<Intent>(json).is_err());

        let json = r#"{"operation":"list","confidence":0.9,"limit":5}"#;
        let intent: Intent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.limit.map(NonZeroU32::get), Some(5));
    }

    #[test]
    fn tags_serialize_in_wire_form() {
        let filter = FilterCondition::new("name", FilterOperator::StartsWith, "Acme");
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"startsWith\""));

        let agg = Aggregation::new(AggregationKind::Count, None);
        assert_eq!(agg.alias, "count_result");
        assert_eq!(serde_json::to_value(Operation::Aggregate).unwrap(), "aggregate");
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in [
            Operation::List,
            Operation::Filter,
            Operation::Details,
            Operation::Relationship,
            Operation::Aggregate,
            Operation::Compare,
            Operation::Analyze,
            Operation::Unknown,
        ] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("vendor_risk"), None);
    }

    #[test]
    fn enhancements_read_from_metadata() {
        let mut intent = Intent::new(Operation::List, 0.8);
        assert!(intent.enhancements().is_empty());
        intent.metadata.insert(
            PATTERN_ENHANCEMENTS_KEY.into(),
            serde_json::json!(["You often use this filter for list queries"]),
        );
        assert_eq!(intent.enhancements().len(), 1);
    }
}
