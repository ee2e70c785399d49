//! Flatten native graph values into rows of plain JSON.
//!
//! A row maps column names, or dotted paths below them, to scalars, arrays
//! or null. Nodes and relationships spread into `_`-prefixed identity keys
//! plus one key per property; nested maps spread with dotted keys. Lists keep
//! their shape, with graph entities inside them rendered as small objects.

use cypherloom_core::{GraphRecord, GraphValue, Row, WriteCounters};
use serde_json::{Map, Number, Value};

/// One flat row for `record`, keyed by `columns`. Missing trailing values
/// read as null.
pub fn normalize_record(columns: &[String], record: &GraphRecord) -> Row {
    let mut row = Row::new();
    for (i, column) in columns.iter().enumerate() {
        let value = record.values.get(i).unwrap_or(&GraphValue::Null);
        flatten_into(&mut row, column, value);
    }
    row
}

fn flatten_into(row: &mut Row, key: &str, value: &GraphValue) {
    match value {
        GraphValue::Node(node) => {
            row.insert(format!("{key}._id"), Value::from(node.id.clone()));
            row.insert(format!("{key}._labels"), Value::from(node.labels.join(":")));
            for (prop, v) in &node.properties {
                flatten_into(row, &format!("{key}.{prop}"), v);
            }
        }
        GraphValue::Relationship(rel) => {
            row.insert(format!("{key}._id"), Value::from(rel.id.clone()));
            row.insert(format!("{key}._type"), Value::from(rel.rel_type.clone()));
            row.insert(format!("{key}._start"), Value::from(rel.start_node.clone()));
            row.insert(format!("{key}._end"), Value::from(rel.end_node.clone()));
            for (prop, v) in &rel.properties {
                flatten_into(row, &format!("{key}.{prop}"), v);
            }
        }
        GraphValue::Map(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(row, &format!("{key}.{k}"), v);
            }
        }
        other => {
            row.insert(key.to_string(), to_json(other));
        }
    }
}

/// Nested JSON rendering of a value, used inside lists.
pub fn to_json(value: &GraphValue) -> Value {
    match value {
        GraphValue::Null => Value::Null,
        GraphValue::Bool(b) => Value::Bool(*b),
        GraphValue::Int(i) => Value::from(*i),
        // NaN and infinities have no JSON form.
        GraphValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        GraphValue::String(s) => Value::String(s.clone()),
        GraphValue::List(items) => Value::Array(items.iter().map(to_json).collect()),
        GraphValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        GraphValue::Node(node) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::from(node.id.clone()));
            obj.insert("labels".into(), Value::from(node.labels.clone()));
            obj.insert("properties".into(), properties_json(&node.properties));
            Value::Object(obj)
        }
        GraphValue::Relationship(rel) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::from(rel.id.clone()));
            obj.insert("type".into(), Value::from(rel.rel_type.clone()));
            obj.insert("properties".into(), properties_json(&rel.properties));
            Value::Object(obj)
        }
    }
}

fn properties_json(props: &std::collections::BTreeMap<String, GraphValue>) -> Value {
    Value::Object(props.iter().map(|(k, v)| (k.clone(), to_json(v))).collect())
}

/// Human-readable one-liner for an execution.
pub fn summarize(counters: &WriteCounters, row_count: usize) -> String {
    if counters.contains_updates() {
        let parts: Vec<String> = [
            (counters.nodes_created, "nodes created"),
            (counters.nodes_deleted, "nodes deleted"),
            (counters.relationships_created, "relationships created"),
            (counters.relationships_deleted, "relationships deleted"),
            (counters.properties_set, "properties set"),
            (counters.labels_added, "labels added"),
            (counters.labels_removed, "labels removed"),
        ]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, what)| format!("{n} {what}"))
        .collect();
        return format!("Query executed: {}", parts.join(", "));
    }

    match row_count {
        0 => "No results found".to_string(),
        1 => "Found 1 result".to_string(),
        n => format!("Found {n} results"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypherloom_core::{Node, Relationship};
    use std::collections::BTreeMap;

    fn vendor() -> GraphValue {
        GraphValue::Node(Node {
            id: "4".into(),
            labels: vec!["Vendor".into(), "Critical".into()],
            properties: BTreeMap::from([
                ("name".into(), GraphValue::String("Acme".into())),
                ("score".into(), GraphValue::Float(8.5)),
            ]),
        })
    }

    #[test]
    fn node_flattens_to_identity_and_properties() {
        let record = GraphRecord {
            values: vec![vendor()],
        };
        let row = normalize_record(&["v".into()], &record);
        assert_eq!(row["v._id"], Value::from("4"));
        assert_eq!(row["v._labels"], Value::from("Vendor:Critical"));
        assert_eq!(row["v.name"], Value::from("Acme"));
        assert_eq!(row["v.score"], Value::from(8.5));
        assert!(!row.contains_key("v"));
    }

    #[test]
    fn relationship_and_null_neighbour() {
        let rel = GraphValue::Relationship(Relationship {
            id: "9".into(),
            rel_type: "SUPPLIES".into(),
            start_node: "4".into(),
            end_node: "5".into(),
            properties: BTreeMap::from([("since".into(), GraphValue::Int(2019))]),
        });
        let record = GraphRecord {
            values: vec![vendor(), rel, GraphValue::Null],
        };
        let row = normalize_record(&["v".into(), "rel".into(), "other".into()], &record);
        assert_eq!(row["rel._type"], Value::from("SUPPLIES"));
        assert_eq!(row["rel._start"], Value::from("4"));
        assert_eq!(row["rel._end"], Value::from("5"));
        assert_eq!(row["rel.since"], Value::from(2019));
        assert_eq!(row["other"], Value::Null);
    }

    #[test]
    fn maps_flatten_with_dotted_keys() {
        let map = GraphValue::Map(BTreeMap::from([
            ("a".into(), GraphValue::Int(1)),
            (
                "b".into(),
                GraphValue::Map(BTreeMap::from([("c".into(), GraphValue::Bool(true))])),
            ),
        ]));
        let row = normalize_record(
            &["m".into()],
            &GraphRecord {
                values: vec![map],
            },
        );
        assert_eq!(row["m.a"], Value::from(1));
        assert_eq!(row["m.b.c"], Value::Bool(true));
    }

    #[test]
    fn lists_keep_nested_entities_as_objects() {
        let list = GraphValue::List(vec![vendor(), GraphValue::String("x".into())]);
        let row = normalize_record(
            &["items".into()],
            &GraphRecord {
                values: vec![list],
            },
        );
        let items = row["items"].as_array().unwrap();
        assert_eq!(items[0]["id"], Value::from("4"));
        assert_eq!(items[0]["labels"][0], Value::from("Vendor"));
        assert_eq!(items[0]["properties"]["name"], Value::from("Acme"));
        assert_eq!(items[1], Value::from("x"));
    }

    #[test]
    fn missing_values_read_as_null() {
        let row = normalize_record(&["a".into(), "b".into()], &GraphRecord::default());
        assert_eq!(row["a"], Value::Null);
        assert_eq!(row["b"], Value::Null);
    }

    #[test]
    fn nan_becomes_null() {
        assert_eq!(to_json(&GraphValue::Float(f64::NAN)), Value::Null);
    }

    #[test]
    fn summaries() {
        let none = WriteCounters::default();
        assert_eq!(summarize(&none, 0), "No results found");
        assert_eq!(summarize(&none, 1), "Found 1 result");
        assert_eq!(summarize(&none, 12), "Found 12 results");

        let writes = WriteCounters {
            nodes_created: 2,
            relationships_created: 1,
            properties_set: 6,
            ..WriteCounters::default()
        };
        assert_eq!(
            summarize(&writes, 0),
            "Query executed: 2 nodes created, 1 relationships created, 6 properties set"
        );
    }
}
