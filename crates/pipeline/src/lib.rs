//! # cypherloom pipeline
//!
//! The adaptive layer over planning, execution and memory: a preference
//! tracker that learns which filters a session keeps using, a classifier
//! that applies them, conversation context for follow-up questions, and
//! the [`Orchestrator`] that runs a question end to end.

pub mod context;
pub mod enhancer;
pub mod history;
pub mod orchestrator;
pub mod preferences;

pub use context::{ContextAwareClassifier, ConversationContext, ConversationTurn};
pub use enhancer::{EnhancementStats, EnhancingClassifier};
pub use history::{QueryHistory, QueryRecord};
pub use orchestrator::{Orchestrator, QueryOptions};
pub use preferences::{PreferenceTracker, SessionStats};
