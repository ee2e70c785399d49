//! Configuration loading, validation, and management for cypherloom.
//!
//! Loads configuration from `~/.cypherloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.cypherloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Graph store connection
    #[serde(default)]
    pub graph: GraphConfig,

    /// Working cache limits
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable memory backend
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Pipeline behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Entity tag to node label mapping
    #[serde(default)]
    pub schema: SchemaConfig,
}

// ── Graph ───────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_uri")]
    pub uri: String,

    #[serde(default = "default_graph_username")]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_graph_database")]
    pub database: String,

    /// Maximum concurrent statements in flight.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Per-request timeout handed to the HTTP client.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_graph_uri() -> String {
    "http://localhost:7474".into()
}
fn default_graph_username() -> String {
    "neo4j".into()
}
fn default_graph_database() -> String {
    "neo4j".into()
}
fn default_max_pool_size() -> usize {
    50
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            username: default_graph_username(),
            password: None,
            database: default_graph_database(),
            max_pool_size: default_max_pool_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("database", &self.database)
            .field("max_pool_size", &self.max_pool_size)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// ── Cache ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_capacity() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

// ── Memory ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// `sqlite` or `in_memory`
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// Database file; defaults to `~/.cypherloom/memory.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: None,
        }
    }
}

impl MemoryConfig {
    pub const BACKENDS: [&'static str; 2] = ["sqlite", "in_memory"];

    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("memory.db"))
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_true")]
    pub enable_history: bool,

    /// Cache read results in the working cache.
    #[serde(default = "default_true")]
    pub enable_caching: bool,

    /// Resolve follow-up questions against the conversation so far.
    #[serde(default = "default_true")]
    pub enable_context: bool,

    /// Feed results back into pattern memory.
    #[serde(default = "default_true")]
    pub enable_learning: bool,

    #[serde(default = "default_true")]
    pub apply_enhancements: bool,

    #[serde(default = "default_result_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Observations needed before a filter is suggested.
    #[serde(default = "default_min_filter_occurrences")]
    pub min_filter_occurrences: u64,

    /// Fixed session id; a random one is generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_result_cache_ttl_secs() -> u64 {
    300
}
fn default_max_history_size() -> usize {
    100
}
fn default_min_filter_occurrences() -> u64 {
    2
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enable_history: true,
            enable_caching: true,
            enable_context: true,
            enable_learning: true,
            apply_enhancements: true,
            cache_ttl_secs: default_result_cache_ttl_secs(),
            max_history_size: default_max_history_size(),
            min_filter_occurrences: default_min_filter_occurrences(),
            session_id: None,
        }
    }
}

// ── Schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Entity tag to node label. Tags not listed use the tag as the label.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Entity matched when a question names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_entity: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Falls back to defaults if the config file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides (highest priority). The project
    /// prefix wins over the vendor's own variable names.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |ours: &str, vendor: &str| lookup(ours).or_else(|| lookup(vendor));

        if let Some(uri) = var("CYPHERLOOM_GRAPH_URI", "NEO4J_URI") {
            self.graph.uri = uri;
        }
        if let Some(username) = var("CYPHERLOOM_GRAPH_USERNAME", "NEO4J_USERNAME") {
            self.graph.username = username;
        }
        if let Some(password) = var("CYPHERLOOM_GRAPH_PASSWORD", "NEO4J_PASSWORD") {
            self.graph.password = Some(password);
        }
        if let Some(database) = var("CYPHERLOOM_GRAPH_DATABASE", "NEO4J_DATABASE") {
            self.graph.database = database;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".cypherloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("graph.uri", &self.graph.uri),
            ("graph.username", &self.graph.username),
            ("graph.database", &self.graph.database),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{name} must not be empty")));
            }
        }

        if !(self.graph.uri.starts_with("http://") || self.graph.uri.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "graph.uri must start with http:// or https://, got {}",
                self.graph.uri
            )));
        }

        if self.graph.max_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "graph.max_pool_size must be at least 1".into(),
            ));
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.capacity must be at least 1".into(),
            ));
        }

        if self.orchestrator.max_history_size == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_history_size must be at least 1".into(),
            ));
        }

        if !MemoryConfig::BACKENDS.contains(&self.memory.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "memory.backend must be one of {:?}, got {}",
                MemoryConfig::BACKENDS,
                self.memory.backend
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// A copy safe to print: secrets replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.graph.password.is_some() {
            config.graph.password = Some(redact(&self.graph.password).to_string());
        }
        config
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.graph.uri, "http://localhost:7474");
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.memory.backend, "sqlite");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.graph.database, config.graph.database);
        assert_eq!(parsed.orchestrator.cache_ttl_secs, config.orchestrator.cache_ttl_secs);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [graph]
            uri = "https://graph.internal:7473"

            [schema.labels]
            vendor = "Vendor"
            "#,
        )
        .unwrap();
        assert_eq!(config.graph.uri, "https://graph.internal:7473");
        assert_eq!(config.graph.username, "neo4j");
        assert_eq!(config.schema.labels["vendor"], "Vendor");
        assert!(config.orchestrator.enable_learning);
    }

    #[test]
    fn invalid_settings_rejected() {
        let mut config = AppConfig::default();
        config.graph.uri = "bolt://localhost:7687".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.graph.max_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.memory.backend = "redis".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.graph.database, "neo4j");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[orchestrator]\nmax_history_size = 7\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.orchestrator.max_history_size, 7);

        std::fs::write(&path, "[orchestrator\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_prefer_project_names() {
        let env = HashMap::from([
            ("CYPHERLOOM_GRAPH_URI", "https://a:7473"),
            ("NEO4J_URI", "https://b:7473"),
            ("NEO4J_PASSWORD", "s3cret"),
        ]);
        let mut config = AppConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.graph.uri, "https://a:7473");
        assert_eq!(config.graph.password.as_deref(), Some("s3cret"));
        assert_eq!(config.graph.database, "neo4j");
    }

    #[test]
    fn redacted_copy_hides_password() {
        let mut config = AppConfig::default();
        config.graph.password = Some("hunter2".into());
        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("[REDACTED]"));
        assert_eq!(config.graph.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn debug_redacts_password() {
        let mut config = AppConfig::default();
        config.graph.password = Some("hunter2".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("localhost:7474"));
        assert!(toml_str.contains("[orchestrator]"));
    }
}
