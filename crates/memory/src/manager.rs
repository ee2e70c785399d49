//! One handle over every memory tier.

use crate::in_memory::{InMemoryEpisodicStore, InMemoryPatternStore, InMemorySemanticStore};
use crate::sqlite::SqliteStore;
use crate::working::{CacheStats, WorkingCache};
use cypherloom_config::{AppConfig, CacheConfig};
use cypherloom_core::{EpisodicStore, MemoryError, PatternStore, SemanticStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Sizes of each tier at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub backend: String,
    pub working: CacheStats,
    pub sessions: usize,
    pub rule_versions: usize,
    pub patterns: usize,
}

/// The working cache plus the three durable tiers, all sharing one backend.
#[derive(Clone)]
pub struct MemoryManager {
    working: Arc<WorkingCache>,
    episodic: Arc<dyn EpisodicStore>,
    semantic: Arc<dyn SemanticStore>,
    patterns: Arc<dyn PatternStore>,
}

impl MemoryManager {
    pub fn new(
        working: Arc<WorkingCache>,
        episodic: Arc<dyn EpisodicStore>,
        semantic: Arc<dyn SemanticStore>,
        patterns: Arc<dyn PatternStore>,
    ) -> Self {
        Self {
            working,
            episodic,
            semantic,
            patterns,
        }
    }

    /// Everything in process memory; gone when the process exits.
    pub fn in_memory(cache: &CacheConfig) -> Self {
        Self::new(
            Arc::new(WorkingCache::from_config(cache)),
            Arc::new(InMemoryEpisodicStore::new()),
            Arc::new(InMemorySemanticStore::new()),
            Arc::new(InMemoryPatternStore::new()),
        )
    }

    /// Durable tiers in the SQLite file at `path`, created if missing.
    pub async fn sqlite(path: &Path, cache: &CacheConfig) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::Storage(format!("Create {}: {e}", parent.display()))
            })?;
        }
        let store = SqliteStore::new(&path.to_string_lossy()).await?;
        Ok(Self::from_sqlite(&store, cache))
    }

    pub fn from_sqlite(store: &SqliteStore, cache: &CacheConfig) -> Self {
        Self::new(
            Arc::new(WorkingCache::from_config(cache)),
            Arc::new(store.episodic()),
            Arc::new(store.semantic()),
            Arc::new(store.patterns()),
        )
    }

    /// Build the backend named by `[memory].backend`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, MemoryError> {
        match config.memory.backend.as_str() {
            "in_memory" => {
                info!("Using in-memory memory backend");
                Ok(Self::in_memory(&config.cache))
            }
            "sqlite" => {
                let path = config.memory.resolved_path();
                info!(path = %path.display(), "Using SQLite memory backend");
                Self::sqlite(&path, &config.cache).await
            }
            other => Err(MemoryError::validation(
                "memory.backend",
                format!("unknown backend '{other}'"),
            )),
        }
    }

    pub fn working(&self) -> &Arc<WorkingCache> {
        &self.working
    }

    pub fn episodic(&self) -> &Arc<dyn EpisodicStore> {
        &self.episodic
    }

    pub fn semantic(&self) -> &Arc<dyn SemanticStore> {
        &self.semantic
    }

    pub fn patterns(&self) -> &Arc<dyn PatternStore> {
        &self.patterns
    }

    pub async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        Ok(MemoryStats {
            backend: self.episodic.name().to_string(),
            working: self.working.stats(),
            sessions: self.episodic.count().await?,
            rule_versions: self.semantic.count().await?,
            patterns: self.patterns.count().await?,
        })
    }

    /// Empty every tier. Returns the number of entries removed.
    pub async fn clear_all(&self) -> Result<usize, MemoryError> {
        let mut removed = self.working.clear();
        removed += self.episodic.clear().await?;
        removed += self.semantic.clear().await?;
        removed += self.patterns.clear().await?;
        info!(removed, "Cleared all memory tiers");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypherloom_core::{EntityTag, NewRule, Operation, Session};
    use serde_json::{Value, json};

    async fn populate(manager: &MemoryManager) {
        manager
            .working()
            .set("conversation:s1:history", json!([]), None)
            .unwrap();
        manager
            .episodic()
            .save_session(Session::new("s1", "nl_query"))
            .await
            .unwrap();
        manager
            .semantic()
            .store_rule(NewRule::new("R1", "aml", Value::Null))
            .await
            .unwrap();
        manager
            .semantic()
            .store_rule(NewRule::new("R1", "aml", Value::Null))
            .await
            .unwrap();
        manager
            .patterns()
            .record_query_pattern(Operation::List, &[EntityTag::from("vendor")], &[], 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn in_memory_stats_and_clear() {
        let manager = MemoryManager::in_memory(&CacheConfig::default());
        populate(&manager).await;

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.backend, "in_memory");
        assert_eq!(stats.working.size, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.rule_versions, 2);
        assert_eq!(stats.patterns, 1);

        assert_eq!(manager.clear_all().await.unwrap(), 5);
        let stats = manager.stats().await.unwrap();
        assert_eq!((stats.sessions, stats.rule_versions, stats.patterns), (0, 0, 0));
    }

    #[tokio::test]
    async fn sqlite_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.memory.path = Some(dir.path().join("nested").join("memory.db"));

        let manager = MemoryManager::from_config(&config).await.unwrap();
        populate(&manager).await;
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.backend, "sqlite");
        assert_eq!(stats.rule_versions, 2);
        assert!(dir.path().join("nested").join("memory.db").exists());
    }

    #[tokio::test]
    async fn unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.memory.backend = "redis".into();
        assert!(matches!(
            MemoryManager::from_config(&config).await,
            Err(MemoryError::Validation { .. })
        ));
    }
}
