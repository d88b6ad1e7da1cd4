// src/queue/redis_queue.rs
//
// Realized as a Redis sorted set `queue:pending`. The ordering key packs
// priority (descending) ahead of submission time (ascending) into a single
// score: priority dominates because it is scaled far above the millisecond
// range submitted_at occupies.

use super::{QueueError, SubmissionQueue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

const QUEUE_KEY: &str = "queue:pending";
const PRIORITY_SCALE: f64 = 1e15;

fn score(priority: i32, submitted_at: DateTime<Utc>) -> f64 {
    (-priority as f64) * PRIORITY_SCALE + submitted_at.timestamp_millis() as f64
}

pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SubmissionQueue for RedisQueue {
    async fn enqueue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        // NX: a second enqueue of the same id is a no-op, satisfying the
        // idempotence law of §8.
        let _: () = redis::cmd("ZADD")
            .arg(QUEUE_KEY)
            .arg("NX")
            .arg(score(priority, submitted_at))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn try_claim(&self) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn
            .zpopmin(QUEUE_KEY, 1)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        match popped.into_iter().next() {
            Some((id_str, _)) => Uuid::parse_str(&id_str)
                .map(Some)
                .map_err(|e| QueueError::Unavailable(e.to_string())),
            None => Ok(None),
        }
    }

    async fn requeue(
        &self,
        id: Uuid,
        priority: i32,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.zadd(QUEUE_KEY, id.to_string(), score(priority, submitted_at))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zrem(QUEUE_KEY, id.to_string())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        conn.zcard(QUEUE_KEY)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }
}
