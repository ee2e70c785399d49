//! Pipeline events: observable milestones of a query's lifecycle.
//!
//! The orchestrator publishes as it goes; subscribers (loggers, UIs, tests)
//! react without the pipeline knowing about them.

use crate::intent::Operation;
use crate::query::AccessMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Text was classified (after any enhancement)
    QueryClassified {
        query_id: String,
        operation: Operation,
        confidence: f64,
        enhancements: usize,
        timestamp: DateTime<Utc>,
    },

    /// A generated query ran successfully
    QueryExecuted {
        query_id: String,
        mode: AccessMode,
        row_count: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A read was answered from the working cache
    CacheHit {
        query_id: String,
        cache_key: String,
        timestamp: DateTime<Utc>,
    },

    /// Usage was fed back into pattern memory
    PatternRecorded {
        signature: String,
        frequency: u64,
        timestamp: DateTime<Utc>,
    },

    /// Some stage of the pipeline failed
    QueryFailed {
        query_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for pipeline events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<PipelineEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PipelineEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(PipelineEvent::QueryExecuted {
            query_id: "q1".into(),
            mode: AccessMode::Read,
            row_count: 3,
            elapsed_ms: 12,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            PipelineEvent::QueryExecuted { query_id, row_count, .. } => {
                assert_eq!(query_id, "q1");
                assert_eq!(*row_count, 3);
            }
            _ => panic!("Expected QueryExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(PipelineEvent::QueryFailed {
            query_id: "q2".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
