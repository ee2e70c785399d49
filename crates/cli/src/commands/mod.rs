pub mod config_cmd;
pub mod init;
pub mod plan;
pub mod query;

use anyhow::Context;
use cypherloom_config::AppConfig;
use cypherloom_planning::{GraphSchema, QueryGenerator, Vocabulary};
use std::path::Path;

/// The default config file, or `path` when given. Environment overrides
/// apply either way.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let Some(path) = path else {
        return AppConfig::load().context("Failed to load config");
    };

    let mut config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Generator over the default vocabulary with `[schema]` label overrides.
pub fn generator(config: &AppConfig) -> QueryGenerator {
    let mut schema = GraphSchema::from_vocabulary(&Vocabulary::default())
        .override_labels(&config.schema.labels);
    if let Some(entity) = &config.schema.default_entity {
        schema = schema.with_default_entity(entity.as_str());
    }
    QueryGenerator::new(schema)
}
