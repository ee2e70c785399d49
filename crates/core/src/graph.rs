//! Graph driver trait: the seam between the pipeline and the graph engine.
//!
//! A driver speaks the store's own client protocol and hands back native
//! values. Normalizing those values into flat rows is the executor's job.

use crate::error::GraphError;
use crate::query::{AccessMode, Params, WriteCounters};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value as returned by the graph store, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GraphValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<GraphValue>),
    Map(BTreeMap<String, GraphValue>),
    Node(Node),
    Relationship(Relationship),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, GraphValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub start_node: String,
    pub end_node: String,
    pub properties: BTreeMap<String, GraphValue>,
}

/// One record: values in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub values: Vec<GraphValue>,
}

/// Everything a driver returns for one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub columns: Vec<String>,
    pub records: Vec<GraphRecord>,
    pub counters: WriteCounters,
    pub available_after_ms: Option<u64>,
}

/// A client for the graph store.
///
/// Implementations: Neo4j HTTP transactional API, scripted drivers in tests.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// The driver name (e.g., "neo4j-http").
    fn name(&self) -> &str;

    /// Run one parameterized statement in its own transaction.
    async fn run(
        &self,
        query: &str,
        params: &Params,
        mode: AccessMode,
    ) -> std::result::Result<DriverResponse, GraphError>;

    /// Check that the store is reachable and the credentials are accepted.
    async fn verify_connectivity(&self) -> std::result::Result<(), GraphError>;
}
