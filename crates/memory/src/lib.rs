//! # cypherloom memory
//!
//! The four memory tiers the pipeline learns from:
//!
//! - [`WorkingCache`]: in-process key/value cache with TTL and LRU eviction
//! - episodic: append-only session log
//! - semantic: versioned rule base
//! - patterns: frequency and filter statistics per query signature
//!
//! The durable tiers come in an in-memory flavour and a SQLite flavour;
//! [`MemoryManager`] bundles one of each tier.

pub mod in_memory;
pub mod manager;
pub mod sqlite;
pub mod working;

pub use in_memory::{InMemoryEpisodicStore, InMemoryPatternStore, InMemorySemanticStore};
pub use manager::{MemoryManager, MemoryStats};
pub use sqlite::{SqliteEpisodicStore, SqlitePatternStore, SqliteSemanticStore, SqliteStore};
pub use working::{CacheStats, WorkingCache};
