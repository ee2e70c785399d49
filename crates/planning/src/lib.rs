//! # cypherloom planning
//!
//! Turns a natural-language question into a structured [`Intent`] and the
//! intent into a parameterized Cypher query. Both steps are pure and
//! deterministic; nothing here touches the network or a store.
//!
//! [`Intent`]: cypherloom_core::Intent

pub mod classifier;
pub mod generator;
pub mod schema;
pub mod vocabulary;

pub use classifier::{IntentClassifier, VocabularyError, UNKNOWN_CONFIDENCE};
pub use generator::{is_identifier, QueryGenerator};
pub use schema::GraphSchema;
pub use vocabulary::{
    AggregationDefinition, EntityDefinition, FilterDefinition, OperationRule, Vocabulary,
};
