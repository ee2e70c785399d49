//! `cypherloom init`: print a default configuration.

use cypherloom_config::AppConfig;

pub fn run() -> anyhow::Result<()> {
    let path = AppConfig::config_dir().join("config.toml");
    println!("# Save as {}", path.display());
    println!("{}", AppConfig::default_toml());
    Ok(())
}
