use super::{begin_write, column, parse_json, parse_timestamp, timestamp_text, to_json_text};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use cypherloom_core::{EpisodicStore, MemoryError, Session};
use sqlx::sqlite::SqliteRow;
use sqlx::SqlitePool;
use tracing::debug;

const NAME: &str = "sqlite";

/// Session columns plus the entity ids folded into a JSON array.
const SESSION_SELECT: &str = r#"
    SELECT s.id, s.workflow, s.timestamp, s.result, s.metadata, s.previous_session_id,
           (SELECT json_group_array(e.entity_id) FROM session_entities e
             WHERE e.session_id = s.id) AS entity_ids
    FROM sessions s
"#;

/// Append-only session log on SQLite.
#[derive(Clone)]
pub struct SqliteEpisodicStore {
    pool: SqlitePool,
}

impl SqliteEpisodicStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_session(row: &SqliteRow) -> Result<Session, MemoryError> {
        let timestamp: String = column(row, "timestamp")?;
        let result: String = column(row, "result")?;
        let metadata: String = column(row, "metadata")?;
        let entity_ids: String = column(row, "entity_ids")?;

        Ok(Session {
            id: column(row, "id")?,
            workflow: column(row, "workflow")?,
            timestamp: parse_timestamp(&timestamp)?,
            entity_ids: parse_json("entity_ids", &entity_ids)?,
            result: parse_json("result", &result)?,
            metadata: parse_json("metadata", &metadata)?,
            previous_session_id: column(row, "previous_session_id")?,
        })
    }

    async fn fetch_sessions<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        what: &str,
    ) -> Result<Vec<Session>, MemoryError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("{what}: {e}")))?;
        rows.iter().map(Self::row_to_session).collect()
    }
}

#[async_trait]
impl EpisodicStore for SqliteEpisodicStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn save_session(&self, session: Session) -> Result<String, MemoryError> {
        session.validate()?;
        let result = to_json_text("Session result", &session.result)?;
        let metadata = to_json_text("Session metadata", &session.metadata)?;

        let mut tx = begin_write(&self.pool).await?;

        let (exists, previous_exists): (bool, bool) = sqlx::query_as(
            r#"
            SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1),
                   ?2 IS NULL OR EXISTS(SELECT 1 FROM sessions WHERE id = ?2)
            "#,
        )
        .bind(&session.id)
        .bind(&session.previous_session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("Session lookup: {e}")))?;

        if exists {
            return Err(MemoryError::unsupported(NAME, "overwrite_session"));
        }
        if !previous_exists {
            return Err(MemoryError::validation(
                "previous_session_id",
                format!(
                    "unknown session '{}'",
                    session.previous_session_id.as_deref().unwrap_or_default()
                ),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO sessions (id, workflow, timestamp, result, metadata, previous_session_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&session.id)
        .bind(&session.workflow)
        .bind(timestamp_text(&session.timestamp))
        .bind(&result)
        .bind(&metadata)
        .bind(&session.previous_session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| MemoryError::Storage(format!("INSERT session failed: {e}")))?;

        for (position, entity_id) in session.entity_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO session_entities (session_id, position, entity_id) VALUES (?1, ?2, ?3)",
            )
            .bind(&session.id)
            .bind(position as i64)
            .bind(entity_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("INSERT session entity failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit session: {e}")))?;

        debug!(session = %session.id, workflow = %session.workflow, "Saved session");
        Ok(session.id)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, MemoryError> {
        let sql = format!("{SESSION_SELECT} WHERE s.id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Get session: {e}")))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn get_sessions_by_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let sql = format!(
            r#"{SESSION_SELECT}
            WHERE EXISTS (SELECT 1 FROM session_entities e
                           WHERE e.session_id = s.id AND e.entity_id = ?1)
            ORDER BY s.timestamp DESC, s.id DESC
            LIMIT ?2"#
        );
        let query = sqlx::query(&sql).bind(entity_id).bind(limit as i64);
        self.fetch_sessions(query, "Sessions by entity").await
    }

    async fn get_recent_sessions(
        &self,
        since_days: u32,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(since_days));
        let sql = format!(
            r#"{SESSION_SELECT}
            WHERE s.timestamp >= ?1 AND (?2 IS NULL OR s.workflow = ?2)
            ORDER BY s.timestamp DESC, s.id DESC
            LIMIT ?3"#
        );
        let query = sqlx::query(&sql)
            .bind(timestamp_text(&cutoff))
            .bind(workflow)
            .bind(limit as i64);
        self.fetch_sessions(query, "Recent sessions").await
    }

    async fn get_session_chain(
        &self,
        id: &str,
        max_depth: usize,
    ) -> Result<Vec<Session>, MemoryError> {
        let sql = r#"
            WITH RECURSIVE chain(id, depth) AS (
                SELECT id, 0 FROM sessions WHERE id = ?1
                UNION ALL
                SELECT s.previous_session_id, c.depth + 1
                FROM sessions s JOIN chain c ON s.id = c.id
                WHERE s.previous_session_id IS NOT NULL AND c.depth < ?2
            )
            SELECT s.id, s.workflow, s.timestamp, s.result, s.metadata, s.previous_session_id,
                   (SELECT json_group_array(e.entity_id) FROM session_entities e
                     WHERE e.session_id = s.id) AS entity_ids
            FROM chain c JOIN sessions s ON s.id = c.id
            ORDER BY c.depth DESC
        "#;
        let query = sqlx::query(sql).bind(id).bind(max_depth as i64);
        self.fetch_sessions(query, "Session chain").await
    }

    async fn exists(&self, id: &str) -> Result<bool, MemoryError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1) AS found")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Session exists: {e}")))?;
        column(&row, "found")
    }

    async fn list_session_ids(
        &self,
        workflow_pattern: Option<&str>,
    ) -> Result<Vec<String>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM sessions
            WHERE ?1 IS NULL OR instr(workflow, ?1) > 0
            ORDER BY timestamp, id
            "#,
        )
        .bind(workflow_pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("List sessions: {e}")))?;
        rows.iter().map(|row| column(row, "id")).collect()
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Count sessions: {e}")))?;
        let n: i64 = column(&row, "n")?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut tx = begin_write(&self.pool).await?;
        sqlx::query("DELETE FROM session_entities")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear session entities: {e}")))?;
        let removed = sqlx::query("DELETE FROM sessions")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear sessions: {e}")))?
            .rows_affected();
        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit clear: {e}")))?;
        Ok(removed as usize)
    }
}
