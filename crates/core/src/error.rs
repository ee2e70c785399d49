//! Error types for the cypherloom pipeline.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context (planning, graph execution, memory) has its own enum;
//! the top-level [`Error`] wraps them so the orchestrator can surface one type.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// The top-level error type for all cypherloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Input validation ---
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    // --- Query generation ---
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    // --- Graph execution ---
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    // --- Memory tiers ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an input validation failure.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    ///
    /// Only connectivity failures qualify. Nothing in the pipeline retries on
    /// its own; this is a hint for the caller's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Graph(GraphError::Connection(_)))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures turning an [`Intent`](crate::intent::Intent) into query text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Cannot generate a query for an unknown operation")]
    UnknownOperation,

    #[error("Intent names no entity to match on")]
    MissingEntity,

    #[error("Entity tag '{0}' is not defined in the graph schema")]
    UnknownEntity(String),

    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    #[error("Operator {operator} cannot be applied to field '{field}': {reason}")]
    InvalidFilterValue {
        field: String,
        operator: String,
        reason: String,
    },

    #[error("Aggregation {0} requires a field")]
    MissingAggregationField(String),
}

/// Failures talking to the graph store.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("Graph store unreachable: {0}")]
    Connection(String),

    #[error("Query failed: {message}")]
    Execution {
        message: String,
        query: String,
        params: BTreeMap<String, Value>,
    },

    #[error("Invalid graph configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed response from graph store: {0}")]
    MalformedResponse(String),
}

impl GraphError {
    /// Build an execution error carrying the offending query for diagnosis.
    pub fn execution(
        message: impl Into<String>,
        query: &str,
        params: &BTreeMap<String, Value>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            query: query.to_string(),
            params: params.clone(),
        }
    }
}

/// Failures in the working, episodic, semantic and pattern tiers.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Entry '{key}' has expired")]
    Expired { key: String },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("{operation} is not supported by the {store} store")]
    UnsupportedOperation { store: String, operation: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl MemoryError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(store: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            store: store.into(),
            operation: operation.into(),
        }
    }
}
