//! Classification capability and the suggestion collaborator it can consult.

use crate::error::Result;
use crate::intent::Intent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Turns free text into an [`Intent`].
///
/// The base classifier is pure and never suspends; wrappers that consult
/// durable memory may.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Intent>;
}

/// What a suggestion proposes to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    AddFilter,
}

/// A candidate change to an intent, with the reason shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub field: String,
    pub value: Value,
    pub reason: String,
}

/// Produces learned suggestions for an intent.
#[async_trait]
pub trait SuggestionSource: Send + Sync {
    /// Ordered suggestions. Never proposes a field already filtered on.
    async fn suggest_enhancements(&self, intent: &Intent) -> Result<Vec<Suggestion>>;
}
