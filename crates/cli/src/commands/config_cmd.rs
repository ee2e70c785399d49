//! `cypherloom config`: show the effective configuration.

use super::load_config;
use std::path::Path;

pub fn show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}
