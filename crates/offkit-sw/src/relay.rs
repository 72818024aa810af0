//! Deferred writes and the queue they wait in.
//!
//! Writes captured while offline sit in a queue owned by the host. On a
//! background-sync signal the worker drains the queue once and replays
//! every item as a single POST; it never re-enqueues failures.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::debug;

/// A write captured while offline, waiting for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredWrite {
    /// Absolute URL the write is POSTed to.
    pub endpoint: String,
    /// JSON body of the write.
    pub payload: JsonValue,
}

impl DeferredWrite {
    pub fn new(endpoint: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload,
        }
    }
}

/// Storage seam for the deferred-write queue.
///
/// The host owns persistence; the worker only drains. Implementations
/// must make `drain` take everything in one step so that a concurrent
/// second sync signal cannot replay the same item twice.
pub trait WriteQueue: Send + Sync {
    fn enqueue(&self, write: DeferredWrite) -> BoxFuture<'_, ()>;

    /// Remove and return every queued write.
    fn drain(&self) -> BoxFuture<'_, Vec<DeferredWrite>>;

    fn len(&self) -> BoxFuture<'_, usize>;

    fn is_empty(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.len().await == 0 })
    }
}

/// In-memory queue for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<Vec<DeferredWrite>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteQueue for MemoryQueue {
    fn enqueue(&self, write: DeferredWrite) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(endpoint = %write.endpoint, "write deferred");
            self.items.lock().await.push(write);
        })
    }

    fn drain(&self) -> BoxFuture<'_, Vec<DeferredWrite>> {
        Box::pin(async move { std::mem::take(&mut *self.items.lock().await) })
    }

    fn len(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.items.lock().await.len() })
    }
}

/// What a sync signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tag was not recognized; the queue was not touched.
    Ignored,
    /// The queue was drained and every item sent once.
    Drained { delivered: usize, failed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_drain_empties_the_queue() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(DeferredWrite::new(
                "https://app.test/api/sync",
                json!({"name": "soup"}),
            ))
            .await;
        queue
            .enqueue(DeferredWrite::new(
                "https://app.test/api/sync",
                json!({"name": "bread"}),
            ))
            .await;
        assert_eq!(queue.len().await, 2);

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload["name"], "soup");

        assert!(queue.is_empty().await);
        assert!(queue.drain().await.is_empty());
    }

    #[test]
    fn test_deferred_write_round_trips_through_json() {
        let write = DeferredWrite::new("https://app.test/api/sync", json!({"id": 7}));
        let encoded = serde_json::to_string(&write).unwrap();
        let back: DeferredWrite = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.endpoint, write.endpoint);
        assert_eq!(back.payload, write.payload);
    }
}
