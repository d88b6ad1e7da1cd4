// src/store/redis_store.rs
//
// The shared, cross-replica Job Store. A job record is kept as a single JSON
// blob under `job:{id}`; a sorted set `jobs:index` (score = submitted_at_ms)
// gives stable pagination, and per-status sets `jobs:status:{status}` give
// O(1) filtering without a full scan. CAS is implemented with Redis
// WATCH/MULTI/EXEC: the record is optimistically re-read, mutated
// client-side, and written back inside a transaction that aborts if another
// replica touched the key first -- the retry loop below turns that abort
// into the same `Conflict` the in-memory double reports.

use super::{JobStore, PageResult, PatchFn, StoreError};
use crate::job::{Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

const MAX_CAS_RETRIES: u32 = 8;

pub struct RedisJobStore {
    conn: ConnectionManager,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn job_key(id: Uuid) -> String {
        format!("job:{id}")
    }

    fn status_key(status: JobStatus) -> String {
        format!("jobs:status:{}", status.as_str())
    }

    async fn index_jobs(&self) -> redis::RedisResult<ConnectionManager> {
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::job_key(job.id);

        let exists: bool = conn
            .exists(&key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if exists {
            return Err(StoreError::AlreadyExists(job.id));
        }

        let payload =
            serde_json::to_string(&job).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let score = job.submitted_at.timestamp_millis();

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("NX")
            .zadd("jobs:index", job.id.to_string(), score)
            .sadd(Self::status_key(job.status), job.id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::job_key(id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let raw = raw.ok_or(StoreError::NotFound(id))?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn patch(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        mutate: PatchFn,
    ) -> Result<Job, StoreError> {
        let key = Self::job_key(id);
        let mut conn = self.index_jobs().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;

        for _ in 0..MAX_CAS_RETRIES {
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let raw = match raw {
                Some(r) => r,
                None => {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    return Err(StoreError::NotFound(id));
                }
            };

            let mut job: Job =
                serde_json::from_str(&raw).map_err(|e| StoreError::Unavailable(e.to_string()))?;

            if job.status != expected_status {
                let _: () = redis::cmd("UNWATCH")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                return Err(StoreError::Conflict(id));
            }

            let old_status = job.status;
            mutate(&mut job);
            let new_status = job.status;
            let payload =
                serde_json::to_string(&job).map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let mut pipe = redis::pipe();
            pipe.atomic().set(&key, &payload);
            if old_status != new_status {
                pipe.srem(Self::status_key(old_status), id.to_string())
                    .sadd(Self::status_key(new_status), id.to_string());
            }

            let result: Option<()> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            match result {
                Some(_) => return Ok(job),
                None => continue, // another replica raced us; retry
            }
        }

        Err(StoreError::Conflict(id))
    }

    async fn list(
        &self,
        filter: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<PageResult, StoreError> {
        let mut conn = self.conn.clone();

        let ids: Vec<String> = match filter {
            Some(status) => conn
                .smembers(Self::status_key(status))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
            None => conn
                .zrange("jobs:index", 0, -1)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id_str in ids {
            if let Ok(id) = Uuid::parse_str(&id_str) {
                if let Ok(job) = self.get(id).await {
                    jobs.push(job);
                }
            }
        }

        // Redis sorted-set order only gives us submitted_at ascending across
        // the whole index; re-impose the exact ordering contract client-side
        // so filtered listings (built from a set, unordered) are consistent too.
        jobs.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = jobs.len() as u64;
        let page_size_u = page_size.max(1) as usize;
        let total_pages = ((total as usize + page_size_u - 1) / page_size_u).max(1) as u32;
        let start = ((page.max(1) - 1) as usize) * page_size_u;
        let page_jobs = jobs.into_iter().skip(start).take(page_size_u).collect();

        Ok(PageResult {
            jobs: page_jobs,
            page: page.max(1),
            page_size,
            total_pages,
            total,
        })
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut deleted = 0u64;

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            let ids: Vec<String> = conn
                .smembers(Self::status_key(status))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            for id_str in ids {
                let Ok(id) = Uuid::parse_str(&id_str) else {
                    continue;
                };
                let Ok(job) = self.get(id).await else {
                    continue;
                };
                if job.completed_at.map(|c| c < cutoff).unwrap_or(false) {
                    let _: () = redis::pipe()
                        .atomic()
                        .del(Self::job_key(id))
                        .zrem("jobs:index", id.to_string())
                        .srem(Self::status_key(status), id.to_string())
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    deleted += 1;
                }
            }
        }

        Ok(deleted)
    }
}
