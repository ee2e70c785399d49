//! # cypherloom core
//!
//! Domain types, traits, and error definitions for the cypherloom query
//! pipeline. Every collaborator the pipeline talks to (graph driver, memory
//! tiers, suggestion sources) is a trait here; implementations live in their
//! own crates and all of them depend inward on this one.

pub mod error;
pub mod intent;
pub mod query;
pub mod graph;
pub mod memory;
pub mod classify;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, GenerationError, GraphError, MemoryError, Result};
pub use intent::{
    Aggregation, AggregationKind, EntityTag, FilterCondition, FilterOperator, Intent, Operation,
    Sort, SortDirection,
};
pub use query::{AccessMode, ExecutionMetadata, ExecutionResult, GeneratedQuery, Params, Row, WriteCounters};
pub use graph::{DriverResponse, GraphDriver, GraphRecord, GraphValue, Node, Relationship};
pub use memory::{EpisodicStore, NewRule, Pattern, PatternStore, Rule, SemanticStore, Session};
pub use classify::{Classify, Suggestion, SuggestionKind, SuggestionSource};
pub use event::{EventBus, PipelineEvent};
