//! Bounded, in-process record of queries run through the orchestrator.

use chrono::{DateTime, Utc};
use cypherloom_core::{EntityTag, Intent, Params};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of records kept.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// One query, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub natural_language: String,
    /// Absent when classification itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Empty when generation did not get that far.
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub parameters: Params,
    pub result_count: usize,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Records in the order they were added; reads come back most recent first.
#[derive(Debug, Clone)]
pub struct QueryHistory {
    records: VecDeque<QueryRecord>,
    max_size: usize,
}

impl QueryHistory {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            records: VecDeque::with_capacity(max_size.min(DEFAULT_MAX_HISTORY)),
            max_size,
        }
    }

    /// Append a record, dropping the oldest beyond `max_size`.
    pub fn add(&mut self, record: QueryRecord) {
        self.records.push_back(record);
        while self.records.len() > self.max_size {
            self.records.pop_front();
        }
    }

    pub fn history(&self, limit: usize) -> Vec<QueryRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn last(&self) -> Option<&QueryRecord> {
        self.records.back()
    }

    pub fn successful(&self, limit: usize) -> Vec<QueryRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.success)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Records whose intent mentions `entity`, most recent first.
    pub fn search_by_entity(&self, entity: &EntityTag, limit: usize) -> Vec<QueryRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.intent.as_ref().is_some_and(|i| i.entities.contains(entity)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for QueryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}
