// src/store/mod.rs
//
// =============================================================================
// REELFORGE: JOB STORE (v 0.1 ) -- Component A
// =============================================================================
//
// Durable mapping of job id -> job record. The trait is the design contract
// of spec §4.2; `InMemoryJobStore` is a test double used by unit and
// integration tests, `redis_store::RedisJobStore` is the real shared-store
// backend used in production (one replica's view of a Redis instance
// reachable by every other replica).

pub mod redis_store;

use crate::job::{Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    AlreadyExists(Uuid),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is not in the expected state")]
    Conflict(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A boxed mutation applied to a job record inside a CAS. Boxed (rather than
/// a bare generic) so the trait stays object-safe.
pub type PatchFn = Box<dyn FnOnce(&mut Job) + Send>;

#[derive(Debug, Clone)]
pub struct PageResult {
    pub jobs: Vec<Job>,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Atomic compare-and-set: `mutate` only runs, and is only persisted, if
    /// the record's current status equals `expected_status`.
    async fn patch(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        mutate: PatchFn,
    ) -> Result<Job, StoreError>;

    async fn list(
        &self,
        filter: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<PageResult, StoreError>;

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory double used by tests and by any single-replica deployment that
/// does not need cross-replica sharing (e.g. component unit tests).
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        map.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let map = self.inner.lock().await;
        map.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn patch(
        &self,
        id: Uuid,
        expected_status: JobStatus,
        mutate: PatchFn,
    ) -> Result<Job, StoreError> {
        let mut map = self.inner.lock().await;
        let job = map.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected_status {
            return Err(StoreError::Conflict(id));
        }
        mutate(job);
        Ok(job.clone())
    }

    async fn list(
        &self,
        filter: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<PageResult, StoreError> {
        let map = self.inner.lock().await;
        let mut jobs: Vec<Job> = map
            .values()
            .filter(|j| filter.map(|f| f == j.status).unwrap_or(true))
            .cloned()
            .collect();

        // Stable ordering: submitted_at desc, id asc (§4.2).
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
        let mut map = self.inner.lock().await;
        let doomed: Vec<Uuid> = map
            .values()
            .filter(|j| {
                j.status.is_terminal() && j.completed_at.map(|c| c < cutoff).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            map.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
