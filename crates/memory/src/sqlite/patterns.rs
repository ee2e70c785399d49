use super::{begin_write, column, parse_json, parse_timestamp, timestamp_text, to_json_text};
use crate::in_memory::value_key;
use async_trait::async_trait;
use chrono::Utc;
use cypherloom_core::memory::{most_frequent_values, pattern_signature};
use cypherloom_core::{EntityTag, FilterCondition, MemoryError, Operation, Pattern, PatternStore};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const NAME: &str = "sqlite";

/// Query signature statistics on SQLite.
#[derive(Clone)]
pub struct SqlitePatternStore {
    pool: SqlitePool,
}

impl SqlitePatternStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_pattern(
        row: &SqliteRow,
        filter_counts: BTreeMap<String, BTreeMap<String, u64>>,
    ) -> Result<Pattern, MemoryError> {
        let operation: String = column(row, "operation")?;
        let entities: String = column(row, "entities")?;
        let frequency: i64 = column(row, "frequency")?;
        let success_count: i64 = column(row, "success_count")?;
        let last_updated: String = column(row, "last_updated")?;

        Ok(Pattern {
            signature: column(row, "signature")?,
            operation: Operation::parse(&operation)
                .ok_or_else(|| MemoryError::QueryFailed(format!("Unknown operation '{operation}'")))?,
            entities: parse_json("entities", &entities)?,
            frequency: frequency as u64,
            success_count: success_count as u64,
            filter_counts,
            last_updated: parse_timestamp(&last_updated)?,
        })
    }

    async fn load_filter_counts(
        conn: &mut SqliteConnection,
        signature: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, u64>>, MemoryError> {
        let rows = sqlx::query(
            "SELECT field, value, occurrences FROM pattern_filters WHERE signature = ?1",
        )
        .bind(signature)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("Pattern filters: {e}")))?;

        let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for row in &rows {
            let field: String = column(row, "field")?;
            let value: String = column(row, "value")?;
            let occurrences: i64 = column(row, "occurrences")?;
            counts
                .entry(field)
                .or_default()
                .insert(value, occurrences as u64);
        }
        Ok(counts)
    }

    async fn load_pattern(
        conn: &mut SqliteConnection,
        signature: &str,
    ) -> Result<Option<Pattern>, MemoryError> {
        let row = sqlx::query(
            r#"
            SELECT signature, operation, entities, frequency, success_count, last_updated
            FROM patterns WHERE signature = ?1
            "#,
        )
        .bind(signature)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("Pattern lookup: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let filter_counts = Self::load_filter_counts(conn, signature).await?;
        Self::row_to_pattern(&row, filter_counts).map(Some)
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, MemoryError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| MemoryError::Storage(format!("Acquire connection: {e}")))
    }
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn record_query_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
        filters: &[FilterCondition],
        result_count: usize,
    ) -> Result<Pattern, MemoryError> {
        let signature = pattern_signature(operation, entities);
        let sorted: Vec<&EntityTag> = entities.iter().collect::<BTreeSet<_>>().into_iter().collect();
        let entities_json = to_json_text("Pattern entities", &sorted)?;
        let success = i64::from(result_count > 0);

        let mut tx = begin_write(&self.pool).await?;

        sqlx::query(
            r#"
            INSERT INTO patterns (signature, operation, entities, frequency, success_count, last_updated)
            VALUES (?1, ?2, ?3, 1, ?4, ?5)
            ON CONFLICT(signature) DO UPDATE SET
                frequency     = frequency + 1,
                success_count = success_count + excluded.success_count,
                last_updated  = excluded.last_updated
            "#,
        )
        .bind(&signature)
        .bind(operation.as_str())
        .bind(&entities_json)
        .bind(success)
        .bind(timestamp_text(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|e| MemoryError::Storage(format!("Upsert pattern failed: {e}")))?;

        for filter in filters {
            sqlx::query(
                r#"
                INSERT INTO pattern_filters (signature, field, value, occurrences)
                VALUES (?1, ?2, ?3, 1)
                ON CONFLICT(signature, field, value) DO UPDATE SET occurrences = occurrences + 1
                "#,
            )
            .bind(&signature)
            .bind(&filter.field)
            .bind(value_key(&filter.value)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Upsert pattern filter failed: {e}")))?;
        }

        let pattern = Self::load_pattern(&mut tx, &signature)
            .await?
            .ok_or_else(|| MemoryError::Storage(format!("Pattern '{signature}' vanished")))?;

        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit pattern: {e}")))?;

        debug!(signature = %signature, frequency = pattern.frequency, "Recorded query pattern");
        Ok(pattern)
    }

    async fn get_pattern(
        &self,
        operation: Operation,
        entities: &[EntityTag],
    ) -> Result<Option<Pattern>, MemoryError> {
        let signature = pattern_signature(operation, entities);
        let mut conn = self.acquire().await?;
        Self::load_pattern(&mut conn, &signature).await
    }

    async fn get_common_filters(
        &self,
        operation: Operation,
        entity: Option<&EntityTag>,
        min_occurrences: u64,
    ) -> Result<BTreeMap<String, Value>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT f.field, f.value, SUM(f.occurrences) AS occurrences
            FROM pattern_filters f JOIN patterns p ON p.signature = f.signature
            WHERE p.operation = ?1
              AND (?2 IS NULL OR EXISTS (SELECT 1 FROM json_each(p.entities) je
                                          WHERE je.value = ?2))
            GROUP BY f.field, f.value
            "#,
        )
        .bind(operation.as_str())
        .bind(entity.map(EntityTag::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("Common filters: {e}")))?;

        let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for row in &rows {
            let field: String = column(row, "field")?;
            let value: String = column(row, "value")?;
            let occurrences: i64 = column(row, "occurrences")?;
            counts
                .entry(field)
                .or_default()
                .insert(value, occurrences as u64);
        }
        Ok(most_frequent_values(&counts, min_occurrences))
    }

    async fn top_patterns(&self, limit: usize) -> Result<Vec<Pattern>, MemoryError> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT signature, operation, entities, frequency, success_count, last_updated
            FROM patterns
            ORDER BY frequency DESC, signature
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("Top patterns: {e}")))?;

        let mut patterns = Vec::with_capacity(rows.len());
        for row in &rows {
            let signature: String = column(row, "signature")?;
            let filter_counts = Self::load_filter_counts(&mut conn, &signature).await?;
            patterns.push(Self::row_to_pattern(row, filter_counts)?);
        }
        Ok(patterns)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM patterns")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Count patterns: {e}")))?;
        let n: i64 = column(&row, "n")?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<usize, MemoryError> {
        let mut tx = begin_write(&self.pool).await?;
        sqlx::query("DELETE FROM pattern_filters")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear pattern filters: {e}")))?;
        let removed = sqlx::query("DELETE FROM patterns")
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("Clear patterns: {e}")))?
            .rows_affected();
        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit clear: {e}")))?;
        Ok(removed as usize)
    }
}
