//! Neo4j HTTP transactional driver.
//!
//! Every statement runs in its own auto-committed transaction via
//! `POST {uri}/db/{database}/tx/commit`. Results are requested in both
//! `row` and `graph` form: rows carry the values in column order, `meta`
//! says which of them are nodes or relationships, and the graph section
//! supplies their labels, types and endpoints.

use async_trait::async_trait;
use cypherloom_config::GraphConfig;
use cypherloom_core::{
    AccessMode, DriverResponse, GraphDriver, GraphError, GraphRecord, GraphValue, Node, Params,
    Relationship, WriteCounters,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// A [`GraphDriver`] speaking the Neo4j HTTP API.
pub struct HttpGraphDriver {
    name: String,
    base_url: String,
    database: String,
    username: String,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpGraphDriver {
    pub fn new(
        base_url: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: "neo4j-http".into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            username: username.into(),
            password,
            client,
        }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self::new(
            &config.uri,
            &config.database,
            &config.username,
            config.password.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn commit_url(&self) -> String {
        format!("{}/db/{}/tx/commit", self.base_url, self.database)
    }
}

#[async_trait]
impl GraphDriver for HttpGraphDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        query: &str,
        params: &Params,
        mode: AccessMode,
    ) -> Result<DriverResponse, GraphError> {
        let body = serde_json::json!({
            "statements": [{
                "statement": query,
                "parameters": params,
                "resultDataContents": ["row", "graph"],
                "includeStats": true,
            }]
        });

        debug!(driver = %self.name, mode = mode.as_str(), "Sending statement");

        let access_mode = match mode {
            AccessMode::Read => "READ",
            AccessMode::Write => "WRITE",
        };

        let response = self
            .client
            .post(self.commit_url())
            .basic_auth(&self.username, self.password.as_ref())
            .header("Accept", "application/json")
            .header("Access-Mode", access_mode)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GraphError::Connection(format!("request timed out: {e}"))
                } else {
                    GraphError::Connection(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 401 || status == 403 {
            return Err(GraphError::Connection(
                "Authentication failed or access denied".into(),
            ));
        }

        if !(200..300).contains(&status) {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Graph store returned error");
            return Err(GraphError::execution(
                format!("HTTP {status}: {error_body}"),
                query,
                params,
            ));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| GraphError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        if let Some(error) = api_response.errors.into_iter().next() {
            return Err(classify_error(error, query, params));
        }

        let result = api_response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::MalformedResponse("No results in response".into()))?;

        let records = result.data.into_iter().map(decode_record).collect();

        Ok(DriverResponse {
            columns: result.columns,
            records,
            counters: result.stats.into(),
            // The HTTP API does not report server-side timing.
            available_after_ms: None,
        })
    }

    async fn verify_connectivity(&self) -> Result<(), GraphError> {
        self.run("RETURN 1", &Params::new(), AccessMode::Read)
            .await
            .map(|_| ())
    }
}

/// Security and transient failures mean the store cannot serve us right
/// now; everything else is a problem with the statement itself.
fn classify_error(error: ApiError, query: &str, params: &Params) -> GraphError {
    let message = format!("{}: {}", error.code, error.message);
    if error.code.starts_with("Neo.ClientError.Security.")
        || error.code.starts_with("Neo.TransientError.")
    {
        GraphError::Connection(message)
    } else {
        GraphError::execution(message, query, params)
    }
}

// ── Decoding ────────────────────────────────────────────────────────────

fn decode_record(data: ApiData) -> GraphRecord {
    let nodes: HashMap<String, &ApiNode> = data
        .graph
        .nodes
        .iter()
        .map(|n| (id_string(&n.id), n))
        .collect();
    let relationships: HashMap<String, &ApiRelationship> = data
        .graph
        .relationships
        .iter()
        .map(|r| (id_string(&r.id), r))
        .collect();
    let lookup = GraphLookup {
        nodes,
        relationships,
    };

    let values = data
        .row
        .iter()
        .enumerate()
        .map(|(i, value)| lookup.decode(value, data.meta.get(i).unwrap_or(&Value::Null)))
        .collect();
    GraphRecord { values }
}

struct GraphLookup<'a> {
    nodes: HashMap<String, &'a ApiNode>,
    relationships: HashMap<String, &'a ApiRelationship>,
}

impl GraphLookup<'_> {
    fn decode(&self, value: &Value, meta: &Value) -> GraphValue {
        match (value, meta) {
            (Value::Object(props), Value::Object(m)) => {
                let id = m.get("id").map(id_string).unwrap_or_default();
                match m.get("type").and_then(Value::as_str) {
                    Some("node") => {
                        let labels = self
                            .nodes
                            .get(&id)
                            .map(|n| n.labels.clone())
                            .unwrap_or_default();
                        GraphValue::Node(Node {
                            id,
                            labels,
                            properties: plain_map(props),
                        })
                    }
                    Some("relationship") => {
                        let rel = self.relationships.get(&id);
                        GraphValue::Relationship(Relationship {
                            rel_type: rel.map(|r| r.rel_type.clone()).unwrap_or_default(),
                            start_node: rel.map(|r| id_string(&r.start_node)).unwrap_or_default(),
                            end_node: rel.map(|r| id_string(&r.end_node)).unwrap_or_default(),
                            id,
                            properties: plain_map(props),
                        })
                    }
                    _ => GraphValue::Map(plain_map(props)),
                }
            }
            (Value::Array(items), Value::Array(metas)) => GraphValue::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.decode(item, metas.get(i).unwrap_or(&Value::Null)))
                    .collect(),
            ),
            _ => plain(value),
        }
    }
}

fn plain(value: &Value) -> GraphValue {
    match value {
        Value::Null => GraphValue::Null,
        Value::Bool(b) => GraphValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => GraphValue::Int(i),
            None => GraphValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => GraphValue::String(s.clone()),
        Value::Array(items) => GraphValue::List(items.iter().map(plain).collect()),
        Value::Object(map) => GraphValue::Map(plain_map(map)),
    }
}

fn plain_map(map: &serde_json::Map<String, Value>) -> BTreeMap<String, GraphValue> {
    map.iter().map(|(k, v)| (k.clone(), plain(v))).collect()
}

/// Ids arrive as numbers in `meta` and as strings in `graph`.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── API types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    results: Vec<ApiResult>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<ApiData>,
    #[serde(default)]
    stats: ApiStats,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    row: Vec<Value>,
    #[serde(default)]
    meta: Vec<Value>,
    #[serde(default)]
    graph: ApiGraph,
}

#[derive(Debug, Default, Deserialize)]
struct ApiGraph {
    #[serde(default)]
    nodes: Vec<ApiNode>,
    #[serde(default)]
    relationships: Vec<ApiRelationship>,
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    id: Value,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRelationship {
    id: Value,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(rename = "startNode")]
    start_node: Value,
    #[serde(rename = "endNode")]
    end_node: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ApiStats {
    #[serde(default)]
    nodes_created: u64,
    #[serde(default)]
    nodes_deleted: u64,
    #[serde(default)]
    relationships_created: u64,
    #[serde(default)]
    relationship_deleted: u64,
    #[serde(default)]
    properties_set: u64,
    #[serde(default)]
    labels_added: u64,
    #[serde(default)]
    labels_removed: u64,
}

impl From<ApiStats> for WriteCounters {
    fn from(s: ApiStats) -> Self {
        Self {
            nodes_created: s.nodes_created,
            nodes_deleted: s.nodes_deleted,
            relationships_created: s.relationships_created,
            relationships_deleted: s.relationship_deleted,
            properties_set: s.properties_set,
            labels_added: s.labels_added,
            labels_removed: s.labels_removed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn driver(url: &str) -> HttpGraphDriver {
        HttpGraphDriver::new(url, "neo4j", "neo4j", Some("pw".into()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn decodes_nodes_relationships_and_stats() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/db/neo4j/tx/commit")
            .match_header("access-mode", "READ")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_body(Matcher::Regex(r#""riskLevel":"Critical""#.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "results": [{
                    "columns": ["v", "rel", "n"],
                    "data": [{
                        "row": [{"name": "Acme"}, {"since": 2020}, 3],
                        "meta": [{"id": 1, "type": "node", "deleted": false},
                                 {"id": 7, "type": "relationship", "deleted": false},
                                 null],
                        "graph": {
                            "nodes": [{"id": "1", "labels": ["Vendor"], "properties": {"name": "Acme"}}],
                            "relationships": [{"id": "7", "type": "SUPPLIES", "startNode": "1",
                                               "endNode": "2", "properties": {"since": 2020}}]
                        }
                    }],
                    "stats": {"contains_updates": false, "nodes_created": 0}
                }],
                "errors": []
            }"#,
            )
            .create_async()
            .await;

        let params = Params::from([("riskLevel".to_string(), Value::from("Critical"))]);
        let response = driver(&server.url())
            .run("MATCH (v:Vendor) RETURN v", &params, AccessMode::Read)
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(response.columns, vec!["v", "rel", "n"]);
        let values = &response.records[0].values;
        match &values[0] {
            GraphValue::Node(node) => {
                assert_eq!(node.id, "1");
                assert_eq!(node.labels, vec!["Vendor"]);
                assert_eq!(node.properties["name"], GraphValue::String("Acme".into()));
            }
            other => panic!("expected node, got {other:?}"),
        }
        match &values[1] {
            GraphValue::Relationship(rel) => {
                assert_eq!(rel.rel_type, "SUPPLIES");
                assert_eq!(rel.start_node, "1");
                assert_eq!(rel.end_node, "2");
            }
            other => panic!("expected relationship, got {other:?}"),
        }
        assert_eq!(values[2], GraphValue::Int(3));
        assert!(!response.counters.contains_updates());
    }

    #[tokio::test]
    async fn write_mode_reports_counters() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .match_header("access-mode", "WRITE")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":[{"columns":[],"data":[],
                    "stats":{"nodes_created":2,"relationship_deleted":1,"properties_set":4}}],
                    "errors":[]}"#,
            )
            .create_async()
            .await;

        let response = driver(&server.url())
            .run("CREATE (:A), (:B)", &Params::new(), AccessMode::Write)
            .await
            .unwrap();
        assert_eq!(response.counters.nodes_created, 2);
        assert_eq!(response.counters.relationships_deleted, 1);
        assert_eq!(response.counters.properties_set, 4);
    }

    #[tokio::test]
    async fn syntax_error_carries_query_and_params() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":[],"errors":[{"code":"Neo.ClientError.Statement.SyntaxError",
                    "message":"Invalid input 'RETRUN'"}]}"#,
            )
            .create_async()
            .await;

        let params = Params::from([("name".to_string(), Value::from("x"))]);
        let err = driver(&server.url())
            .run("MATCH (n) RETRUN n", &params, AccessMode::Read)
            .await
            .unwrap_err();
        match err {
            GraphError::Execution {
                message,
                query,
                params: carried,
            } => {
                assert!(message.contains("SyntaxError"));
                assert_eq!(query, "MATCH (n) RETRUN n");
                assert_eq!(carried, params);
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn security_and_auth_failures_are_connection_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":[],"errors":[{"code":"Neo.ClientError.Security.Unauthorized",
                    "message":"bad credentials"}]}"#,
            )
            .create_async()
            .await;
        let err = driver(&server.url())
            .run("RETURN 1", &Params::new(), AccessMode::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Connection(_)));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(401)
            .create_async()
            .await;
        let err = driver(&server.url()).verify_connectivity().await.unwrap_err();
        assert!(matches!(err, GraphError::Connection(_)));
    }

    #[tokio::test]
    async fn unreachable_store_is_connection_error() {
        // Nothing listens on port 9 locally.
        let err = driver("http://127.0.0.1:9")
            .run("RETURN 1", &Params::new(), AccessMode::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Connection(_)));
    }

    #[tokio::test]
    async fn server_error_status_is_execution_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let err = driver(&server.url())
            .run("RETURN 1", &Params::new(), AccessMode::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Execution { .. }));
    }
}
