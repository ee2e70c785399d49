//! SQLite backend for the durable memory tiers.
//!
//! One database file holds every tier:
//! - `sessions`, `session_entities`: the episodic log
//! - `rules`, `tags`, `rule_tags`, `rule_dependencies`: versioned rules
//! - `patterns`, `pattern_filters`: query signature statistics
//!
//! Timestamps are stored as RFC 3339 text in UTC with fixed microsecond
//! precision, so they sort correctly as strings.

mod episodic;
mod patterns;
mod semantic;

pub use episodic::SqliteEpisodicStore;
pub use patterns::SqlitePatternStore;
pub use semantic::SqliteSemanticStore;

use chrono::{DateTime, SecondsFormat, Utc};
use cypherloom_core::MemoryError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// An open memory database. Hands out one store per tier; they share the
/// connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite memory store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn episodic(&self) -> SqliteEpisodicStore {
        SqliteEpisodicStore::new(self.pool.clone())
    }

    pub fn semantic(&self) -> SqliteSemanticStore {
        SqliteSemanticStore::new(self.pool.clone())
    }

    pub fn patterns(&self) -> SqlitePatternStore {
        SqlitePatternStore::new(self.pool.clone())
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        const MIGRATIONS: &[(&str, &str)] = &[
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id                  TEXT PRIMARY KEY,
                    workflow            TEXT NOT NULL,
                    timestamp           TEXT NOT NULL,
                    result              TEXT NOT NULL DEFAULT 'null',
                    metadata            TEXT NOT NULL DEFAULT 'null',
                    previous_session_id TEXT REFERENCES sessions(id)
                )
                "#,
            ),
            (
                "sessions timestamp index",
                "CREATE INDEX IF NOT EXISTS idx_sessions_timestamp ON sessions(timestamp DESC)",
            ),
            (
                "sessions workflow index",
                "CREATE INDEX IF NOT EXISTS idx_sessions_workflow ON sessions(workflow)",
            ),
            (
                "session_entities table",
                r#"
                CREATE TABLE IF NOT EXISTS session_entities (
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    position   INTEGER NOT NULL,
                    entity_id  TEXT NOT NULL,
                    PRIMARY KEY (session_id, position)
                )
                "#,
            ),
            (
                "session_entities entity index",
                "CREATE INDEX IF NOT EXISTS idx_session_entities_entity ON session_entities(entity_id)",
            ),
            (
                "rules table",
                r#"
                CREATE TABLE IF NOT EXISTS rules (
                    id               TEXT NOT NULL,
                    version          INTEGER NOT NULL CHECK (version > 0),
                    category         TEXT NOT NULL,
                    content          TEXT NOT NULL,
                    metadata         TEXT NOT NULL DEFAULT 'null',
                    active           INTEGER NOT NULL DEFAULT 1,
                    created_at       TEXT NOT NULL,
                    previous_version INTEGER,
                    PRIMARY KEY (id, version)
                )
                "#,
            ),
            (
                "rules single active index",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_active ON rules(id) WHERE active = 1",
            ),
            (
                "rules category index",
                "CREATE INDEX IF NOT EXISTS idx_rules_category ON rules(category)",
            ),
            (
                "tags table",
                "CREATE TABLE IF NOT EXISTS tags (name TEXT PRIMARY KEY)",
            ),
            (
                "rule_tags table",
                r#"
                CREATE TABLE IF NOT EXISTS rule_tags (
                    rule_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    tag     TEXT NOT NULL REFERENCES tags(name),
                    PRIMARY KEY (rule_id, version, tag),
                    FOREIGN KEY (rule_id, version) REFERENCES rules(id, version) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "rule_tags tag index",
                "CREATE INDEX IF NOT EXISTS idx_rule_tags_tag ON rule_tags(tag)",
            ),
            (
                "rule_dependencies table",
                r#"
                CREATE TABLE IF NOT EXISTS rule_dependencies (
                    rule_id    TEXT NOT NULL,
                    version    INTEGER NOT NULL,
                    depends_on TEXT NOT NULL,
                    PRIMARY KEY (rule_id, version, depends_on),
                    FOREIGN KEY (rule_id, version) REFERENCES rules(id, version) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "patterns table",
                r#"
                CREATE TABLE IF NOT EXISTS patterns (
                    signature     TEXT PRIMARY KEY,
                    operation     TEXT NOT NULL,
                    entities      TEXT NOT NULL DEFAULT '[]',
                    frequency     INTEGER NOT NULL DEFAULT 0,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    last_updated  TEXT NOT NULL
                )
                "#,
            ),
            (
                "patterns operation index",
                "CREATE INDEX IF NOT EXISTS idx_patterns_operation ON patterns(operation)",
            ),
            (
                "pattern_filters table",
                r#"
                CREATE TABLE IF NOT EXISTS pattern_filters (
                    signature   TEXT NOT NULL REFERENCES patterns(signature) ON DELETE CASCADE,
                    field       TEXT NOT NULL,
                    value       TEXT NOT NULL,
                    occurrences INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (signature, field, value)
                )
                "#,
            ),
        ];

        for (what, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }
}

pub(crate) fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::QueryFailed(format!("Bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, MemoryError> {
    serde_json::from_str(raw).map_err(|e| MemoryError::QueryFailed(format!("{column} column: {e}")))
}

pub(crate) fn to_json_text<T: serde::Serialize>(what: &str, value: &T) -> Result<String, MemoryError> {
    serde_json::to_string(value).map_err(|e| MemoryError::Storage(format!("{what} serialization: {e}")))
}

/// Transaction that holds the write lock from its first statement.
pub(crate) async fn begin_write(
    pool: &SqlitePool,
) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, MemoryError> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| MemoryError::Storage(format!("Begin transaction: {e}")))
}

/// Read a column, mapping failure to a storage error naming the column.
pub(crate) fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, MemoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    use sqlx::Row;
    row.try_get(name)
        .map_err(|e| MemoryError::QueryFailed(format!("{name} column: {e}")))
}
