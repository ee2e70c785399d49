//! Cypher generator: [`Intent`] to query text plus bound parameters.
//!
//! Clauses are built in a fixed order (MATCH, WHERE, OPTIONAL MATCH, RETURN,
//! ORDER BY, LIMIT) and joined with newlines. Filter values are only ever
//! emitted as `$name` references; identifiers (labels, fields, aliases) are
//! checked against a strict pattern. Every check runs before any text is
//! assembled, so a failing intent produces an error and no partial query.

use crate::schema::GraphSchema;
use cypherloom_core::{
    Aggregation, AggregationKind, FilterCondition, FilterOperator, GeneratedQuery,
    GenerationError, Intent, Operation, Params,
};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// Relationship and neighbour variables used when an intent asks for links.
const REL_VAR: &str = "rel";
const OTHER_VAR: &str = "other";

/// Generates Cypher from intents against a [`GraphSchema`].
#[derive(Debug, Clone, Default)]
pub struct QueryGenerator {
    schema: GraphSchema,
}

impl QueryGenerator {
    pub fn new(schema: GraphSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    /// Build the query for `intent`. Deterministic: equal intents give
    /// byte-identical text and parameter maps.
    pub fn generate(&self, intent: &Intent) -> Result<GeneratedQuery, GenerationError> {
        if intent.operation == Operation::Unknown {
            return Err(GenerationError::UnknownOperation);
        }

        let entity = intent
            .primary_entity()
            .or(self.schema.default_entity())
            .ok_or(GenerationError::MissingEntity)?;
        let label = self
            .schema
            .label_for(entity)
            .ok_or_else(|| GenerationError::UnknownEntity(entity.to_string()))?;
        ensure_identifier(label)?;
        let var = variable_for(label);

        let mut lines = vec![format!("MATCH ({var}:{label})")];
        let mut params = Params::new();

        if !intent.filters.is_empty() {
            let mut used = BTreeSet::new();
            let mut predicates = Vec::with_capacity(intent.filters.len());
            for filter in &intent.filters {
                let name = parameter_name(&filter.field, &mut used);
                predicates.push(predicate(&var, filter, &name)?);
                params.insert(name, filter.value.clone());
            }
            lines.push(format!("WHERE {}", predicates.join(" AND ")));
        }

        let expand = intent.include_relationships && intent.aggregations.is_empty();
        if expand {
            lines.push(format!("OPTIONAL MATCH ({var})-[{REL_VAR}]-({OTHER_VAR})"));
        }

        let (projection, projected) = projection(&var, &intent.aggregations, expand)?;
        lines.push(format!("RETURN {projection}"));

        if let Some(sort) = &intent.sort {
            ensure_identifier(&sort.field)?;
            let target = if intent.aggregations.is_empty() {
                format!("{var}.{}", sort.field)
            } else if projected.contains(&sort.field) {
                sort.field.clone()
            } else {
                // After aggregation only projected names are in scope.
                intent.aggregations[0].alias.clone()
            };
            lines.push(format!("ORDER BY {target} {}", sort.direction.as_str()));
        }

        if let Some(limit) = intent.limit {
            lines.push(format!("LIMIT {limit}"));
        }

        let text = lines.join("\n");
        debug!(
            entity = %entity,
            params = ?params.keys().collect::<Vec<_>>(),
            "Generated query"
        );
        Ok(GeneratedQuery { text, params })
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ensure_identifier(s: &str) -> Result<(), GenerationError> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(GenerationError::InvalidIdentifier(s.to_string()))
    }
}

/// First letter of the label, lower-cased.
fn variable_for(label: &str) -> String {
    label
        .chars()
        .next()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_lowercase().to_string())
        .unwrap_or_else(|| "x".to_string())
}

/// The field name, suffixed `_2`, `_3`, ... when already taken.
fn parameter_name(field: &str, used: &mut BTreeSet<String>) -> String {
    let mut name = field.to_string();
    let mut n = 2;
    while used.contains(&name) {
        name = format!("{field}_{n}");
        n += 1;
    }
    used.insert(name.clone());
    name
}

fn predicate(var: &str, filter: &FilterCondition, param: &str) -> Result<String, GenerationError> {
    ensure_identifier(&filter.field)?;
    check_value(filter)?;

    let target = format!("{var}.{}", filter.field);
    let clause = match filter.operator {
        FilterOperator::Equals => format!("{target} = ${param}"),
        FilterOperator::NotEquals => format!("{target} <> ${param}"),
        FilterOperator::GreaterThan => format!("{target} > ${param}"),
        FilterOperator::LessThan => format!("{target} < ${param}"),
        FilterOperator::GreaterOrEqual => format!("{target} >= ${param}"),
        FilterOperator::LessOrEqual => format!("{target} <= ${param}"),
        FilterOperator::Contains => format!("{target} CONTAINS ${param}"),
        FilterOperator::StartsWith => format!("{target} STARTS WITH ${param}"),
        FilterOperator::EndsWith => format!("{target} ENDS WITH ${param}"),
        FilterOperator::In => format!("{target} IN ${param}"),
        FilterOperator::NotIn => format!("NOT {target} IN ${param}"),
    };
    Ok(clause)
}

/// Reject values the operator cannot be applied to.
fn check_value(filter: &FilterCondition) -> Result<(), GenerationError> {
    let invalid = |reason: &str| GenerationError::InvalidFilterValue {
        field: filter.field.clone(),
        operator: filter.operator.to_string(),
        reason: reason.to_string(),
    };
    match filter.operator {
        FilterOperator::In | FilterOperator::NotIn if !filter.value.is_array() => {
            Err(invalid("expects a list value"))
        }
        FilterOperator::Contains | FilterOperator::StartsWith | FilterOperator::EndsWith
            if !filter.value.is_string() =>
        {
            Err(invalid("expects a string value"))
        }
        _ => Ok(()),
    }
}

/// The RETURN list and the names it brings into scope.
fn projection(
    var: &str,
    aggregations: &[Aggregation],
    expand: bool,
) -> Result<(String, BTreeSet<String>), GenerationError> {
    let mut projected = BTreeSet::new();

    if aggregations.is_empty() {
        let items = if expand {
            format!("{var}, {REL_VAR}, {OTHER_VAR}")
        } else {
            var.to_string()
        };
        return Ok((items, projected));
    }

    let mut items = Vec::new();
    for group in aggregations.iter().filter_map(|a| a.group_by.as_deref()) {
        ensure_identifier(group)?;
        if projected.insert(group.to_string()) {
            items.push(format!("{var}.{group} AS {group}"));
        }
    }

    for agg in aggregations {
        ensure_identifier(&agg.alias)?;
        let target = match (&agg.kind, agg.field.as_deref()) {
            (AggregationKind::Count, None) => var.to_string(),
            (_, Some(field)) => {
                ensure_identifier(field)?;
                format!("{var}.{field}")
            }
            (kind, None) => return Err(GenerationError::MissingAggregationField(kind.to_string())),
        };
        items.push(format!("{}({target}) AS {}", agg.kind.as_str(), agg.alias));
        projected.insert(agg.alias.clone());
    }

    Ok((items.join(", "), projected))
}
