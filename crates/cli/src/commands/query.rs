//! `cypherloom query`: answer a question against the configured graph.

use super::{generator, load_config};
use cypherloom_executor::QueryExecutor;
use cypherloom_memory::MemoryManager;
use cypherloom_pipeline::{Orchestrator, QueryOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn run(
    config_path: Option<&Path>,
    text: &str,
    write: bool,
    enhance: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let memory = MemoryManager::from_config(&config).await?;
    let executor = Arc::new(QueryExecutor::from_config(&config.graph));
    info!(uri = %config.graph.uri, database = %config.graph.database, "Connecting to graph");

    let orchestrator =
        Orchestrator::new(config.orchestrator.clone(), generator(&config), executor)?
            .with_memory(&memory);

    let mut options = if write {
        QueryOptions::write()
    } else {
        QueryOptions::default()
    };
    if !enhance {
        options = options.without_enhancements();
    }

    let result = orchestrator.query(text, options).await?;

    if let Some(intent) = orchestrator.last_query().and_then(|r| r.intent) {
        for reason in intent.enhancements() {
            println!("+ {reason}");
        }
    }
    println!("{}", result.metadata.query);
    println!("{}", result.summary);
    if !result.rows.is_empty() {
        println!("{}", serde_json::to_string_pretty(&result.rows)?);
    }
    Ok(())
}
