// src/reconciler.rs
//
// =============================================================================
// REELFORGE: RECONCILER (v 0.1 )
// =============================================================================
//
// The periodic sweep that keeps the fleet honest: a dead replica's claimed
// jobs must not sit in `processing` forever, and terminal records must not
// accumulate past their retention window. A cooperative Redis lease makes
// sure only one replica runs a given tick, since the sweep's writes (while
// individually CAS-protected) would otherwise duplicate work across the
// fleet for no benefit.

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::job::JobStatus;
use crate::queue::SubmissionQueue;
use crate::store::JobStore;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;

const LEASE_KEY: &str = "reconciler:leader";
const LIST_PAGE_SIZE: u32 = 200;

#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Attempts to become (or remain) the sole runner of this tick. Returns
    /// false if another replica currently holds the lease.
    async fn try_acquire(&self) -> bool;
}

pub struct RedisLeaderLease {
    conn: ConnectionManager,
    replica_id: String,
    ttl_ms: usize,
}

impl RedisLeaderLease {
    pub fn new(conn: ConnectionManager, replica_id: String, ttl: std::time::Duration) -> Self {
        Self {
            conn,
            replica_id,
            ttl_ms: ttl.as_millis() as usize,
        }
    }
}

#[async_trait]
impl LeaderLease for RedisLeaderLease {
    async fn try_acquire(&self) -> bool {
        let mut conn = self.conn.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(LEASE_KEY)
            .arg(&self.replica_id)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await
            .unwrap_or(None);
        if acquired.is_some() {
            return true;
        }

        let holder: Option<String> = conn.get(LEASE_KEY).await.unwrap_or(None);
        if holder.as_deref() == Some(self.replica_id.as_str()) {
            let _: Result<(), _> = redis::cmd("SET")
                .arg(LEASE_KEY)
                .arg(&self.replica_id)
                .arg("XX")
                .arg("PX")
                .arg(self.ttl_ms)
                .query_async(&mut conn)
                .await;
            return true;
        }

        false
    }
}

/// Always leader. Used for single-process test doubles where no election is
/// needed.
pub struct SoleLease;

#[async_trait]
impl LeaderLease for SoleLease {
    async fn try_acquire(&self) -> bool {
        true
    }
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn SubmissionQueue>,
    artifacts: Arc<ArtifactStore>,
    lease: Arc<dyn LeaderLease>,
    config: Arc<Config>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn SubmissionQueue>,
        artifacts: Arc<ArtifactStore>,
        lease: Arc<dyn LeaderLease>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            lease,
            config,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconciler_interval);
        loop {
            ticker.tick().await;
            if self.lease.try_acquire().await {
                if let Err(e) = self.tick().await {
                    log::warn!("reconciler tick failed: {e}");
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.expire_stale_leases().await?;
        self.sweep_retention().await?;
        Ok(())
    }

    /// Runs one sweep unconditionally, bypassing the leader lease. Exercises
    /// the same `tick` path `run`'s ticker calls once the lease is held.
    pub async fn tick_for_test(&self) -> anyhow::Result<()> {
        self.tick().await
    }

    /// Jobs whose lease has lapsed are presumed abandoned by a crashed or
    /// partitioned replica. §4.7 budgets a fixed number of retries before
    /// giving up with `lost`.
    async fn expire_stale_leases(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut page = 1;
        loop {
            let result = self
                .store
                .list(Some(JobStatus::Processing), page, LIST_PAGE_SIZE)
                .await?;
            if result.jobs.is_empty() {
                break;
            }

            for job in &result.jobs {
                let Some(lease_expires_at) = job.lease_expires_at else {
                    continue;
                };
                if lease_expires_at >= now {
                    continue;
                }

                let retry_count = job.retry_count;
                let n_retry = self.config.n_retry;
                let job_id = job.id;

                if retry_count < n_retry {
                    let patched = self
                        .store
                        .patch(
                            job_id,
                            JobStatus::Processing,
                            Box::new(move |j| {
                                j.status = JobStatus::Pending;
                                j.started_at = None;
                                j.replica_id = None;
                                j.lease_expires_at = None;
                                j.progress = None;
                                j.retry_count += 1;
                            }),
                        )
                        .await;
                    if let Ok(restored) = patched {
                        let _ = self
                            .queue
                            .enqueue(restored.id, restored.priority, restored.submitted_at)
                            .await;
                        log::info!("reconciler: requeued lost job {job_id} (retry {})", retry_count + 1);
                    }
                } else {
                    let _ = self
                        .store
                        .patch(
                            job_id,
                            JobStatus::Processing,
                            Box::new(move |j| {
                                j.status = JobStatus::Failed;
                                j.completed_at = Some(Utc::now());
                                j.error_kind = Some(ErrorKind::Lost);
                                j.error_detail =
                                    Some("lease expired and retry budget exhausted".to_string());
                                j.replica_id = None;
                                j.lease_expires_at = None;
                            }),
                        )
                        .await;
                    log::warn!("reconciler: job {job_id} exhausted retries, marked lost");
                }
            }

            if page >= result.total_pages {
                break;
            }
            page += 1;
        }
        Ok(())
    }

    /// Deletes terminal records (and their artifact files) older than
    /// `T_retain` (§4.7, §6.3).
    async fn sweep_retention(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.t_retain)?;

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            let mut page = 1;
            loop {
                let result = self.store.list(Some(status), page, LIST_PAGE_SIZE).await?;
                if result.jobs.is_empty() {
                    break;
                }
                for job in &result.jobs {
                    if job.completed_at.map(|c| c < cutoff).unwrap_or(false) {
                        if let Err(e) = self.artifacts.remove(job.id) {
                            log::warn!("failed to remove artifact for job {}: {}", job.id, e);
                        }
                    }
                }
                if page >= result.total_pages {
                    break;
                }
                page += 1;
            }
        }

        let deleted = self.store.delete_terminal_older_than(cutoff).await?;
        if deleted > 0 {
            log::info!("reconciler: purged {deleted} terminal job record(s) past retention");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{GenerationParams, Job};
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryJobStore;

    fn config() -> Config {
        Config::from_env()
    }

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "a cat walks".into(),
            num_frames: 84,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            fps: 30,
            width: 848,
            height: 480,
            seed: Some(1),
            priority: 0,
        }
    }

    fn reconciler(store: Arc<dyn JobStore>, dir: std::path::PathBuf) -> Reconciler {
        let queue: Arc<dyn SubmissionQueue> = Arc::new(InMemoryQueue::new());
        let artifacts = Arc::new(ArtifactStore::new(dir).unwrap());
        Reconciler::new(store, queue, artifacts, Arc::new(SoleLease), Arc::new(config()))
    }

    #[tokio::test]
    async fn expired_lease_within_budget_is_requeued() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let dir = std::env::temp_dir().join(format!("reelforge_reconciler_{}", uuid::Uuid::new_v4()));
        let mut job = Job::new(params());
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        job.replica_id = Some("r1".into());
        job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let id = job.id;
        store.create(job).await.unwrap();

        let r = reconciler(store.clone(), dir.clone());
        r.tick().await.unwrap();

        let after = store.get(id).await.unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.retry_count, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn expired_lease_past_budget_is_marked_lost() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let dir = std::env::temp_dir().join(format!("reelforge_reconciler_{}", uuid::Uuid::new_v4()));
        let mut job = Job::new(params());
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        job.replica_id = Some("r1".into());
        job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        job.retry_count = 2; // already at n_retry
        let id = job.id;
        store.create(job).await.unwrap();

        let r = reconciler(store.clone(), dir.clone());
        r.tick().await.unwrap();

        let after = store.get(id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.error_kind, Some(ErrorKind::Lost));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn retention_sweep_purges_old_terminal_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let dir = std::env::temp_dir().join(format!("reelforge_reconciler_{}", uuid::Uuid::new_v4()));
        let mut job = Job::new(params());
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now() - chrono::Duration::days(30));
        let id = job.id;
        store.create(job).await.unwrap();

        let mut cfg = config();
        cfg.t_retain = std::time::Duration::from_secs(60);
        let queue: Arc<dyn SubmissionQueue> = Arc::new(InMemoryQueue::new());
        let artifacts = Arc::new(ArtifactStore::new(dir.clone()).unwrap());
        let r = Reconciler::new(store.clone(), queue, artifacts, Arc::new(SoleLease), Arc::new(cfg));
        r.tick().await.unwrap();

        assert!(store.get(id).await.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
