//! Generated queries and normalized execution results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named query parameters, ordered for deterministic output.
pub type Params = BTreeMap<String, Value>;

/// One flat result row: column (or dotted path) to value.
pub type Row = BTreeMap<String, Value>;

/// Query text plus its bound parameters.
///
/// The text never contains a filter value; every value lives in `params`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub text: String,
    pub params: Params,
}

/// Whether a query may mutate the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

/// Write counters reported by the graph store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounters {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub labels_removed: u64,
}

impl WriteCounters {
    pub fn contains_updates(&self) -> bool {
        *self != Self::default()
    }
}

/// Timing and bookkeeping captured around one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub query: String,
    pub params: Params,
    pub mode: AccessMode,
    /// Wall-clock time measured by the client, permit wait included.
    pub elapsed_ms: u64,
    /// Server-reported time until the first record was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_after_ms: Option<u64>,
    #[serde(default)]
    pub counters: WriteCounters,
}

/// The normalized outcome of running a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub metadata: ExecutionMetadata,
    pub summary: String,
}

impl ExecutionResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `key` in the first row, if any (handy for scalar aggregates).
    pub fn first_value(&self, key: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_detect_updates() {
        assert!(!WriteCounters::default().contains_updates());
        let counters = WriteCounters {
            labels_added: 1,
            ..WriteCounters::default()
        };
        assert!(counters.contains_updates());
    }

    #[test]
    fn first_value_reads_scalar_aggregate() {
        let mut row = Row::new();
        row.insert("count_result".into(), Value::from(42));
        let result = ExecutionResult {
            columns: vec!["count_result".into()],
            rows: vec![row],
            metadata: ExecutionMetadata {
                query: "MATCH (v:vendor) RETURN count(v) AS count_result".into(),
                params: Params::new(),
                mode: AccessMode::Read,
                elapsed_ms: 3,
                available_after_ms: None,
                counters: WriteCounters::default(),
            },
            summary: "Found 1 result".into(),
        };
        assert_eq!(result.first_value("count_result"), Some(&Value::from(42)));
        assert_eq!(result.row_count(), 1);
    }
}
