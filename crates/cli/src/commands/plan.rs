//! `cypherloom plan`: classify and generate, nothing is executed.

use super::{generator, load_config};
use cypherloom_planning::IntentClassifier;
use std::path::Path;

pub fn run(config_path: Option<&Path>, text: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let intent = IntentClassifier::new()?.classify(text);
    println!("{}", serde_json::to_string_pretty(&intent)?);

    let query = generator(&config).generate(&intent)?;
    println!();
    println!("{}", query.text);
    if !query.params.is_empty() {
        println!();
        println!("{}", serde_json::to_string_pretty(&query.params)?);
    }
    Ok(())
}
