use super::{begin_write, column, parse_json, parse_timestamp, timestamp_text, to_json_text};
use async_trait::async_trait;
use chrono::Utc;
use cypherloom_core::{MemoryError, NewRule, Rule, SemanticStore};
use sqlx::sqlite::SqliteRow;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::debug;

const NAME: &str = "sqlite";

const RULE_SELECT: &str = r#"
    SELECT r.id, r.version, r.category, r.content, r.metadata, r.active, r.created_at,
           r.previous_version,
           (SELECT json_group_array(t.tag) FROM rule_tags t
             WHERE t.rule_id = r.id AND t.version = r.version) AS tags,
           (SELECT json_group_array(d.depends_on) FROM rule_dependencies d
             WHERE d.rule_id = r.id AND d.version = r.version) AS dependencies
    FROM rules r
"#;

/// Versioned rule base on SQLite.
///
/// A partial unique index keeps at most one active version per rule id.
#[derive(Clone)]
pub struct SqliteSemanticStore {
    pool: SqlitePool,
}

impl SqliteSemanticStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_rule(row: &SqliteRow) -> Result<Rule, MemoryError> {
        let version: i64 = column(row, "version")?;
        let previous_version: Option<i64> = column(row, "previous_version")?;
        let content: String = column(row, "content")?;
        let metadata: String = column(row, "metadata")?;
        let created_at: String = column(row, "created_at")?;
        let tags: String = column(row, "tags")?;
        let dependencies: String = column(row, "dependencies")?;

        Ok(Rule {
            id: column(row, "id")?,
            version: version as u32,
            category: column(row, "category")?,
            content: parse_json("content", &content)?,
            tags: parse_json("tags", &tags)?,
            dependencies: parse_json("dependencies", &dependencies)?,
            metadata: parse_json("metadata", &metadata)?,
            active: column(row, "active")?,
            created_at: parse_timestamp(&created_at)?,
            previous_version: previous_version.map(|v| v as u32),
        })
    }

    async fn fetch_rules(&self, sql: &str, binds: &[&str]) -> Result<Vec<Rule>, MemoryError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Rule lookup: {e}")))?;
        rows.iter().map(Self::row_to_rule).collect()
    }
}

#[async_trait]
impl SemanticStore for SqliteSemanticStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn store_rule(&self, rule: NewRule) -> Result<Rule, MemoryError> {
        rule.validate()?;
        let content = to_json_text("Rule content", &rule.content)?;
        let metadata = to_json_text("Rule metadata", &rule.metadata)?;
        let created_at = Utc::now();
        let previous = rule.previous_version.map(i64::from);

        let mut tx = begin_write(&self.pool).await?;

        if let Some(prev) = previous {
            let (has_prev, has_next): (bool, bool) = sqlx::query_as(
                r#"
                SELECT EXISTS(SELECT 1 FROM rules WHERE id = ?1 AND version = ?2),
                       EXISTS(SELECT 1 FROM rules WHERE id = ?1 AND version = ?2 + 1)
                "#,
            )
            .bind(&rule.id)
            .bind(prev)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Rule version lookup: {e}")))?;

            if !has_prev {
                return Err(MemoryError::validation(
                    "previous_version",
                    format!("rule '{}' has no version {prev}", rule.id),
                ));
            }
            if prev >= i64::from(u32::MAX) {
                return Err(MemoryError::validation("previous_version", "version overflow"));
            }
            if has_next {
                return Err(MemoryError::validation(
                    "previous_version",
                    format!("version {} of rule '{}' already exists", prev + 1, rule.id),
                ));
            }
        }

        // Dependencies resolve against the active set before this rule joins it.
        let mut dependencies = BTreeSet::new();
        for dep in rule.dependencies.iter().filter(|dep| **dep != rule.id) {
            let active: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM rules WHERE id = ?1 AND active = 1)")
                    .bind(dep)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| MemoryError::QueryFailed(format!("Dependency lookup: {e}")))?;
            if active {
                dependencies.insert(dep.clone());
            }
        }

        sqlx::query("UPDATE rules SET active = 0 WHERE id = ?1 AND active = 1")
            .bind(&rule.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Deactivate previous version: {e}")))?;

        // Version assignment happens inside the INSERT so two writers cannot
        // compute the same number.
        let row = sqlx::query(
            r#"
            INSERT INTO rules (id, version, category, content, metadata, active, created_at,
                               previous_version)
            SELECT ?1,
                   COALESCE(?2 + 1, COALESCE(MAX(version), 0) + 1),
                   ?3, ?4, ?5, 1, ?6,
                   COALESCE(?2, MAX(version))
            FROM rules WHERE id = ?1
            RETURNING version, previous_version
            "#,
        )
        .bind(&rule.id)
        .bind(previous)
        .bind(&rule.category)
        .bind(&content)
        .bind(&metadata)
        .bind(timestamp_text(&created_at))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| MemoryError::Storage(format!("INSERT rule failed: {e}")))?;

        let version: i64 = column(&row, "version")?;
        let previous_version: Option<i64> = column(&row, "previous_version")?;

        for tag in &rule.tags {
            sqlx::query("INSERT OR IGNORE INTO tags (name) VALUES (?1)")
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(|e| MemoryError::Storage(format!("INSERT tag failed: {e}")))?;
            sqlx::query("INSERT INTO rule_tags (rule_id, version, tag) VALUES (?1, ?2, ?3)")
                .bind(&rule.id)
                .bind(version)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(|e| MemoryError::Storage(format!("INSERT rule tag failed: {e}")))?;
        }

        for dep in &dependencies {
            sqlx::query(
                "INSERT INTO rule_dependencies (rule_id, version, depends_on) VALUES (?1, ?2, ?3)",
            )
            .bind(&rule.id)
            .bind(version)
            .bind(dep)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("INSERT rule dependency failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit rule: {e}")))?;

        debug!(rule = %rule.id, version, "Stored rule version");

        Ok(Rule {
            id: rule.id,
            version: version as u32,
            category: rule.category,
            content: rule.content,
            tags: rule.tags,
            dependencies,
            metadata: rule.metadata,
            active: true,
            created_at,
            previous_version: previous_version.map(|v| v as u32),
        })
    }

    async fn get_current_rule(&self, id: &str) -> Result<Option<Rule>, MemoryError> {
        let sql = format!("{RULE_SELECT} WHERE r.id = ?1 AND r.active = 1");
        Ok(self.fetch_rules(&sql, &[id]).await?.into_iter().next())
    }

    async fn get_rule_version(&self, id: &str, version: u32) -> Result<Option<Rule>, MemoryError> {
        let sql = format!("{RULE_SELECT} WHERE r.id = ?1 AND r.version = ?2");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(i64::from(version))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Rule version lookup: {e}")))?;
        row.as_ref().map(Self::row_to_rule).transpose()
    }

    async fn get_rule_history(&self, id: &str) -> Result<Vec<Rule>, MemoryError> {
        let sql = format!("{RULE_SELECT} WHERE r.id = ?1 ORDER BY r.version");
        self.fetch_rules(&sql, &[id]).await
    }

    async fn get_rules_by_category(
        &self,
        category: &str,
        active_only: bool,
    ) -> Result<Vec<Rule>, MemoryError> {
        let active = if active_only { " AND r.active = 1" } else { "" };
        let sql = format!("{RULE_SELECT} WHERE r.category = ?1{active} ORDER BY r.id, r.version");
        self.fetch_rules(&sql, &[category]).await
    }

    async fn get_rules_by_tag(&self, tag: &str, active_only: bool) -> Result<Vec<Rule>, MemoryError> {
        let active = if active_only { " AND r.active = 1" } else { "" };
        let sql = format!(
            r#"{RULE_SELECT}
            WHERE EXISTS (SELECT 1 FROM rule_tags t
                           WHERE t.rule_id = r.id AND t.version = r.version AND t.tag = ?1){active}
            ORDER BY r.id, r.version"#
        );
        self.fetch_rules(&sql, &[tag]).await
    }

    async fn deactivate_rule(&self, id: &str) -> Result<bool, MemoryError> {
        let result = sqlx::query("UPDATE rules SET active = 0 WHERE id = ?1 AND active = 1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("Deactivate rule: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, id: &str) -> Result<bool, MemoryError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM rules WHERE id = ?1) AS found")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Rule exists: {e}")))?;
        column(&row, "found")
    }

    async fn list_rule_ids(&self, category_pattern: Option<&str>) -> Result<Vec<String>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT id FROM rules
            WHERE ?1 IS NULL OR instr(category, ?1) > 0
            ORDER BY id
            "#,
        )
        .bind(category_pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("List rules: {e}")))?;
        rows.iter().map(|row| column(row, "id")).collect()
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rules")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Count rules: {e}")))?;
        let n: i64 = column(&row, "n")?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut tx = begin_write(&self.pool).await?;
        for table in ["rule_tags", "rule_dependencies"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| MemoryError::Storage(format!("Clear {table}: {e}")))?;
        }
        let removed = sqlx::query("DELETE FROM rules")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear rules: {e}")))?
            .rows_affected();
        sqlx::query("DELETE FROM tags")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear tags: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit clear: {e}")))?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use serde_json::{Value, json};

    async fn test_store() -> SqliteSemanticStore {
        SqliteStore::new("sqlite::memory:").await.unwrap().semantic()
    }

    #[tokio::test]
    async fn versions_increase_with_one_active() {
        let store = test_store().await;
        for k in 1..=3u32 {
            let rule = store
                .store_rule(
                    NewRule::new("DTI", "lending", json!({"max_dti_pct": 40 + k}))
                        .with_tags(["underwriting"]),
                )
                .await
                .unwrap();
            assert_eq!(rule.version, k);
        }

        let history = store.get_rule_history("DTI").await.unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
        assert_eq!(history[0].previous_version, None);
        assert_eq!(history[2].previous_version, Some(2));

        let current = store.get_current_rule("DTI").await.unwrap().unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.content["max_dti_pct"], json!(43));
        assert!(current.tags.contains("underwriting"));
    }

    #[tokio::test]
    async fn explicit_previous_version_checks() {
        let store = test_store().await;
        store
            .store_rule(NewRule::new("R1", "aml", Value::from("v1")))
            .await
            .unwrap();
        let v2 = store
            .store_rule(NewRule::new("R1", "aml", Value::from("v2")).after_version(1))
            .await
            .unwrap();
        assert_eq!((v2.version, v2.previous_version), (2, Some(1)));

        assert!(matches!(
            store
                .store_rule(NewRule::new("R1", "aml", Value::Null).after_version(1))
                .await,
            Err(MemoryError::Validation { .. })
        ));
        assert!(matches!(
            store
                .store_rule(NewRule::new("R1", "aml", Value::Null).after_version(7))
                .await,
            Err(MemoryError::Validation { .. })
        ));
        // The failed writes left version 2 active.
        let current = store.get_current_rule("R1").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert!(!store.get_rule_version("R1", 1).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn dependencies_and_tag_queries() {
        let store = test_store().await;
        store
            .store_rule(NewRule::new("BASE", "aml", Value::Null).with_tags(["kyc"]))
            .await
            .unwrap();
        store
            .store_rule(NewRule::new("OLD", "aml", Value::Null))
            .await
            .unwrap();
        assert!(store.deactivate_rule("OLD").await.unwrap());
        assert!(!store.deactivate_rule("OLD").await.unwrap());

        let child = store
            .store_rule(
                NewRule::new("CHILD", "aml_daily", Value::Null)
                    .with_tags(["kyc"])
                    .with_dependencies(["BASE", "OLD", "CHILD", "MISSING"]),
            )
            .await
            .unwrap();
        assert_eq!(child.dependencies, BTreeSet::from(["BASE".to_string()]));

        let loaded = store.get_current_rule("CHILD").await.unwrap().unwrap();
        assert_eq!(loaded.dependencies, child.dependencies);

        assert_eq!(store.get_rules_by_tag("kyc", true).await.unwrap().len(), 2);
        assert_eq!(store.get_rules_by_category("aml", true).await.unwrap().len(), 1);
        assert_eq!(store.get_rules_by_category("aml", false).await.unwrap().len(), 2);
        assert_eq!(
            store.list_rule_ids(Some("aml")).await.unwrap(),
            vec!["BASE", "CHILD", "OLD"]
        );
        assert!(store.exists("OLD").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.clear().await.unwrap(), 3);
        assert!(!store.exists("BASE").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_writers_get_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.db");
        let store = SqliteStore::new(&path.to_string_lossy())
            .await
            .unwrap()
            .semantic();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .store_rule(NewRule::new("R1", "c", Value::from(i)))
                        .await
                        .unwrap()
                        .version
                })
            })
            .collect();

        let mut versions = BTreeSet::new();
        for handle in handles {
            versions.insert(handle.await.unwrap());
        }
        assert_eq!(versions, (1..=6).collect());
        let history = store.get_rule_history("R1").await.unwrap();
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
    }
}
