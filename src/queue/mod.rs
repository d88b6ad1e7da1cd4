// src/queue/mod.rs
//
// =============================================================================
// REELFORGE: SUBMISSION QUEUE (v 0.1 ) -- Component B
// =============================================================================
//
// Ordered, cross-replica FIFO of pending job ids, §4.3. `try_claim` is the
// critical atomic primitive the whole lifecycle state machine depends on.

pub mod redis_queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    /// Idempotent: re-enqueuing an id already present is a no-op.
    async fn enqueue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Atomically removes and returns the head (highest priority, earliest
    /// submission). Returns `None` if the queue is empty.
    async fn try_claim(&self) -> Result<Option<Uuid>, QueueError>;

    /// Restores an element at its original order key (used when a claim is
    /// rolled back, or by the reconciler).
    async fn requeue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Best-effort removal, used by the cancel path.
    async fn remove(&self, id: Uuid) -> Result<(), QueueError>;

    async fn len(&self) -> Result<u64, QueueError>;
}

fn order_key(priority: i32, submitted_at: DateTime<Utc>) -> (i64, i64) {
    (-(priority as i64), submitted_at.timestamp_millis())
}

#[derive(Default)]
struct QueueState {
    entries: BTreeSet<(i64, i64, Uuid)>,
    index: HashMap<Uuid, (i64, i64)>,
}

#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, id: Uuid, priority: i32, submitted_at: DateTime<Utc>, replace: bool) {
        let mut state = self.inner.lock().await;
        if !replace && state.index.contains_key(&id) {
            return;
        }
        let key = order_key(priority, submitted_at);
        if let Some(old_key) = state.index.insert(id, key) {
            state.entries.remove(&(old_key.0, old_key.1, id));
        }
        state.entries.insert((key.0, key.1, id));
    }
}

#[async_trait]
impl SubmissionQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.insert(id, priority, submitted_at, false).await;
        Ok(())
    }

    async fn try_claim(&self) -> Result<Option<Uuid>, QueueError> {
        let mut state = self.inner.lock().await;
        let head = state.entries.iter().next().copied();
        match head {
            Some(entry) => {
                state.entries.remove(&entry);
                state.index.remove(&entry.2);
                Ok(Some(entry.2))
            }
            None => Ok(None),
        }
    }

    async fn requeue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.insert(id, priority, submitted_at, true).await;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let mut state = self.inner.lock().await;
        if let Some(key) = state.index.remove(&id) {
            state.entries.remove(&(key.0, key.1, id));
        }
        Ok(())
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let state = self.inner.lock().await;
        Ok(state.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn higher_priority_overtakes_earlier_submission() {
        let q = InMemoryQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(a, 0, now()).await.unwrap();
        q.enqueue(b, 5, now() + chrono::Duration::milliseconds(10))
            .await
            .unwrap();

        let claimed = q.try_claim().await.unwrap().unwrap();
        assert_eq!(claimed, b);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let q = InMemoryQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(a, 0, now()).await.unwrap();
        q.enqueue(b, 0, now() + chrono::Duration::milliseconds(10))
            .await
            .unwrap();

        assert_eq!(q.try_claim().await.unwrap().unwrap(), a);
        assert_eq!(q.try_claim().await.unwrap().unwrap(), b);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let q = InMemoryQueue::new();
        let a = Uuid::new_v4();
        q.enqueue(a, 0, now()).await.unwrap();
        q.enqueue(a, 9, now()).await.unwrap(); // ignored, already present
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn try_claim_on_empty_queue_returns_none() {
        let q = InMemoryQueue::new();
        assert!(q.try_claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_best_effort_noop_if_absent() {
        let q = InMemoryQueue::new();
        q.remove(Uuid::new_v4()).await.unwrap();
    }
}
