//! # cypherloom executor
//!
//! Runs generated queries against the graph store and normalizes what comes
//! back into flat rows with metadata and a summary line.

pub mod executor;
pub mod http;
pub mod normalize;

pub use executor::QueryExecutor;
pub use http::HttpGraphDriver;
pub use normalize::{normalize_record, summarize, to_json};
