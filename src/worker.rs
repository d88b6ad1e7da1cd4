// src/worker.rs
//
// =============================================================================
// REELFORGE: DISPATCHER & EXECUTOR (v 0.1 )
// =============================================================================
//
// The per-replica scheduler. `Dispatcher::run` is the main loop: pull a claim
// off the submission queue, try to fit it onto a GPU slot, and if it fits,
// spawn an executor task bounded by a semaphore sized to MAX_CONCURRENT_JOBS.
// Mirrors the claim -> allocate -> spawn -> free shape of a local scheduler,
// adapted from hardware cores/gpus to a GPU-only slot model, and from a
// push-based job argument to a queue-pull design required by a store shared
// across replicas.

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::error::{AppError, ErrorKind};
use crate::generator::{Generator, GeneratorError, GeneratorRequest, ProgressSink};
use crate::gpu::{Acquire, GpuRegistry};
use crate::job::{Job, JobStatus};
use crate::queue::SubmissionQueue;
use crate::store::{JobStore, StoreError};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn store_err_to_app(e: StoreError) -> AppError {
    match e {
        StoreError::NotFound(id) => AppError::NotFound(id.to_string()),
        StoreError::AlreadyExists(id) | StoreError::Conflict(id) => {
            AppError::Conflict(id.to_string())
        }
        StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
    }
}

/// One flag per in-flight job, flipped by the API's cancel handler and
/// polled by that job's `JobProgressSink`. Kept separate from the store so
/// cancellation is observed within a progress tick rather than the next
/// store round-trip.
#[derive(Default)]
pub struct CancellationRegistry {
    flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, job_id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.lock().await.insert(job_id, flag.clone());
        flag
    }

    async fn unregister(&self, job_id: Uuid) {
        self.flags.lock().await.remove(&job_id);
    }

    pub async fn request(&self, job_id: Uuid) {
        if let Some(flag) = self.flags.lock().await.get(&job_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

struct ProgressState {
    last_seen: f64,
    last_written: f64,
    last_write_at: tokio::time::Instant,
}

/// Writes progress through to the store, enforcing strict monotonicity and
/// coalescing writes to at most one per `coalesce_interval` (§4.5) -- except
/// the terminal 1.0 report, which always goes through immediately.
struct JobProgressSink {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
    cancel_flag: Arc<AtomicBool>,
    coalesce_interval: Duration,
    state: Mutex<ProgressState>,
}

impl JobProgressSink {
    fn new(
        job_id: Uuid,
        store: Arc<dyn JobStore>,
        cancel_flag: Arc<AtomicBool>,
        coalesce_interval: Duration,
    ) -> Self {
        Self {
            job_id,
            store,
            cancel_flag,
            coalesce_interval,
            state: Mutex::new(ProgressState {
                last_seen: 0.0,
                last_written: 0.0,
                last_write_at: tokio::time::Instant::now() - coalesce_interval,
            }),
        }
    }
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let should_write = {
            let mut state = self.state.lock().await;
            if fraction <= state.last_seen {
                return;
            }
            state.last_seen = fraction;

            let due = fraction >= 1.0 || state.last_write_at.elapsed() >= self.coalesce_interval;
            if due {
                state.last_written = fraction;
                state.last_write_at = tokio::time::Instant::now();
            }
            due
        };

        if should_write {
            let job_id = self.job_id;
            let _ = self
                .store
                .patch(
                    job_id,
                    JobStatus::Processing,
                    Box::new(move |j| j.progress = Some(fraction)),
                )
                .await;
        }
    }

    async fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn SubmissionQueue>,
    gpu: Arc<GpuRegistry>,
    generator: Arc<dyn Generator>,
    artifacts: Arc<ArtifactStore>,
    cancellations: Arc<CancellationRegistry>,
    config: Arc<Config>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn SubmissionQueue>,
        gpu: Arc<GpuRegistry>,
        generator: Arc<dyn Generator>,
        artifacts: Arc<ArtifactStore>,
        cancellations: Arc<CancellationRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            store,
            queue,
            gpu,
            generator,
            artifacts,
            cancellations,
            config,
            semaphore,
        }
    }

    pub fn cancellations(&self) -> Arc<CancellationRegistry> {
        self.cancellations.clone()
    }

    /// Requests cooperative cancellation of a job (§4.6). Pending jobs are
    /// cancelled immediately and dropped from the queue; processing jobs are
    /// flagged and transition to `cancelled` the next time the generator
    /// checks in.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, AppError> {
        let job = self.store.get(job_id).await.map_err(store_err_to_app)?;

        if job.status.is_terminal() {
            return Ok(job);
        }

        if job.status == JobStatus::Pending {
            let patched = self
                .store
                .patch(
                    job_id,
                    JobStatus::Pending,
                    Box::new(|j| {
                        j.status = JobStatus::Cancelled;
                        j.completed_at = Some(Utc::now());
                        j.cancel_requested = true;
                    }),
                )
                .await
                .map_err(store_err_to_app)?;
            let _ = self.queue.remove(job_id).await;
            return Ok(patched);
        }

        let patched = self
            .store
            .patch(
                job_id,
                JobStatus::Processing,
                Box::new(|j| j.cancel_requested = true),
            )
            .await
            .map_err(store_err_to_app)?;
        self.cancellations.request(job_id).await;
        Ok(patched)
    }

    /// Runs until the process is torn down. Intended to be spawned as its
    /// own task per replica.
    pub async fn run(self: Arc<Self>) {
        loop {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            let claimed = match self.queue.try_claim().await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("queue unavailable while claiming: {e}");
                    drop(permit);
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.try_start(claimed, permit).await;
            });
        }
    }

    /// Acquires a concurrency slot without claiming anything, for callers
    /// that want to observe backpressure directly rather than through the
    /// poll loop.
    pub fn try_acquire_permit_for_test(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Runs a single claimed job to completion synchronously, acquiring its
    /// own concurrency permit. Exercises the same `try_start` path `run`
    /// spawns, without the poll loop around it.
    pub async fn try_start_for_test(&self, job_id: Uuid) {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .expect("concurrency slot available for test-driven dispatch");
        self.try_start(job_id, permit).await;
    }

    async fn try_start(&self, job_id: Uuid, permit: OwnedSemaphorePermit) {
        let job = match self.store.get(job_id).await {
            Ok(j) => j,
            Err(e) => {
                log::warn!("claimed job {job_id} vanished from the store: {e}");
                drop(permit);
                return;
            }
        };

        if job.cancel_requested {
            let _ = self
                .store
                .patch(
                    job_id,
                    JobStatus::Pending,
                    Box::new(|j| {
                        j.status = JobStatus::Cancelled;
                        j.completed_at = Some(Utc::now());
                    }),
                )
                .await;
            drop(permit);
            return;
        }

        let device_id = match self.gpu.acquire(job_id).await {
            Acquire::Device(d) => d,
            Acquire::Full => {
                // Every replica may be momentarily out of slots; put the job
                // back exactly where it was and let the next poll retry.
                let _ = self.queue.requeue(job_id, job.priority, job.submitted_at).await;
                drop(permit);
                return;
            }
        };

        let now = Utc::now();
        let lease_expires_at = now
            + chrono::Duration::from_std(self.config.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(45));
        let replica_id = self.config.replica_id.clone();

        let started = self
            .store
            .patch(
                job_id,
                JobStatus::Pending,
                Box::new(move |j| {
                    j.status = JobStatus::Processing;
                    j.started_at = Some(now);
                    j.replica_id = Some(replica_id);
                    j.lease_expires_at = Some(lease_expires_at);
                }),
            )
            .await;

        let job = match started {
            Ok(j) => j,
            Err(e) => {
                log::warn!("failed to claim job {job_id} for processing: {e}");
                self.gpu.release(job_id).await;
                drop(permit);
                return;
            }
        };

        self.run_executor(job, device_id, permit).await;
    }

    async fn run_executor(&self, job: Job, device_id: usize, permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        let cancel_flag = self.cancellations.register(job_id).await;
        let sink: Arc<dyn ProgressSink> = Arc::new(JobProgressSink::new(
            job_id,
            self.store.clone(),
            cancel_flag,
            self.config.progress_coalesce_interval,
        ));

        let seed = job.params.resolved_seed();
        let scratch_path = self.artifacts.scratch_path(job_id);
        let req = GeneratorRequest {
            job_id,
            params: job.params.clone(),
            seed,
            device_id,
            output_tmp_path: scratch_path,
            model_cache_dir: self.config.model_cache_dir.clone(),
        };

        let lease_task = {
            let store = self.store.clone();
            let lease_duration = self.config.lease_duration;
            tokio::spawn(async move {
                let renew_every = lease_duration / 3;
                loop {
                    tokio::time::sleep(renew_every).await;
                    let new_lease = Utc::now()
                        + chrono::Duration::from_std(lease_duration)
                            .unwrap_or_else(|_| chrono::Duration::seconds(45));
                    let _ = store
                        .patch(
                            job_id,
                            JobStatus::Processing,
                            Box::new(move |j| j.lease_expires_at = Some(new_lease)),
                        )
                        .await;
                }
            })
        };

        let outcome = tokio::time::timeout(self.config.t_job_max, self.generator.generate(req, sink)).await;
        lease_task.abort();

        match outcome {
            Ok(Ok(scratch)) => match self.artifacts.commit(&scratch, job_id) {
                Ok(final_path) => {
                    let now = Utc::now();
                    let _ = self
                        .store
                        .patch(
                            job_id,
                            JobStatus::Processing,
                            Box::new(move |j| {
                                j.status = JobStatus::Completed;
                                j.completed_at = Some(now);
                                j.artifact_path = Some(final_path);
                                j.progress = Some(1.0);
                                j.replica_id = None;
                                j.lease_expires_at = None;
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    self.fail_job(job_id, ErrorKind::Generator, e.to_string())
                        .await;
                }
            },
            Ok(Err(GeneratorError::Cancelled)) => {
                let now = Utc::now();
                let _ = self
                    .store
                    .patch(
                        job_id,
                        JobStatus::Processing,
                        Box::new(move |j| {
                            j.status = JobStatus::Cancelled;
                            j.completed_at = Some(now);
                            j.replica_id = None;
                            j.lease_expires_at = None;
                        }),
                    )
                    .await;
            }
            Ok(Err(e)) => {
                let kind = e.error_kind();
                let detail = e.detail();
                self.retry_or_fail(job_id, job.retry_count, kind, detail)
                    .await;
            }
            Err(_elapsed) => {
                // Generation ran past T_job_max (§5); the generator's own
                // process is reaped by `kill_on_drop` when this future drops.
                self.fail_job(
                    job_id,
                    ErrorKind::Timeout,
                    format!("generation exceeded {:?}", self.config.t_job_max),
                )
                .await;
            }
        }

        self.gpu.release(job_id).await;
        self.cancellations.unregister(job_id).await;
        drop(permit);
    }

    /// Oom is granted exactly one retry (§7); anything else fails outright.
    async fn retry_or_fail(&self, job_id: Uuid, retry_count: u32, kind: ErrorKind, detail: String) {
        if kind.retryable_once() && retry_count == 0 {
            let patched = self
                .store
                .patch(
                    job_id,
                    JobStatus::Processing,
                    Box::new(|j| {
                        j.status = JobStatus::Pending;
                        j.started_at = None;
                        j.replica_id = None;
                        j.lease_expires_at = None;
                        j.progress = None;
                        j.retry_count += 1;
                    }),
                )
                .await;

            if let Ok(job) = patched {
                let _ = self.queue.enqueue(job.id, job.priority, job.submitted_at).await;
                return;
            }
        }

        self.fail_job(job_id, kind, detail).await;
    }

    async fn fail_job(&self, job_id: Uuid, kind: ErrorKind, detail: String) {
        let now = Utc::now();
        let _ = self
            .store
            .patch(
                job_id,
                JobStatus::Processing,
                Box::new(move |j| {
                    j.status = JobStatus::Failed;
                    j.completed_at = Some(now);
                    j.error_kind = Some(kind);
                    j.error_detail = Some(detail);
                    j.replica_id = None;
                    j.lease_expires_at = None;
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScriptedGenerator;
    use crate::job::GenerationParams;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryJobStore;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.max_concurrent_jobs = 1;
        cfg.progress_coalesce_interval = Duration::from_millis(0);
        cfg
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

    fn dispatcher(generator: ScriptedGenerator, output_dir: std::path::PathBuf) -> Arc<Dispatcher> {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue: Arc<dyn SubmissionQueue> = Arc::new(InMemoryQueue::new());
        let gpu = Arc::new(GpuRegistry::new(vec![0]));
        let artifacts = Arc::new(ArtifactStore::new(output_dir).unwrap());
        let cancellations = Arc::new(CancellationRegistry::new());
        let config = Arc::new(test_config());
        Arc::new(Dispatcher::new(
            store,
            queue,
            gpu,
            Arc::new(generator),
            artifacts,
            cancellations,
            config,
        ))
    }

    #[tokio::test]
    async fn happy_path_job_completes() {
        let dir = std::env::temp_dir().join(format!("reelforge_worker_test_{}", Uuid::new_v4()));
        let generator = ScriptedGenerator {
            progress_steps: vec![0.25, 0.5, 1.0],
            final_path: None,
            failure: None,
        };
        let d = dispatcher(generator, dir.clone());

        let job = Job::new(params());
        let job_id = job.id;
        d.store.create(job.clone()).await.unwrap();
        d.queue.enqueue(job_id, 0, job.submitted_at).await.unwrap();

        d.try_start(job_id, d.semaphore.clone().try_acquire_owned().unwrap())
            .await;

        let fetched = d.store.get(job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.progress, Some(1.0));
        assert!(fetched.artifact_path.is_some());
        assert_eq!(d.gpu.free_count().await, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn oom_is_retried_exactly_once() {
        let dir = std::env::temp_dir().join(format!("reelforge_worker_test_{}", Uuid::new_v4()));
        let generator = ScriptedGenerator {
            progress_steps: vec![],
            final_path: None,
            failure: Some(crate::generator::GeneratorErrorSpec::Oom("vram exhausted".into())),
        };
        let d = dispatcher(generator, dir.clone());

        let job = Job::new(params());
        let job_id = job.id;
        d.store.create(job.clone()).await.unwrap();
        d.queue.enqueue(job_id, 0, job.submitted_at).await.unwrap();

        d.try_start(job_id, d.semaphore.clone().try_acquire_owned().unwrap())
            .await;

        let after_first = d.store.get(job_id).await.unwrap();
        assert_eq!(after_first.status, JobStatus::Pending);
        assert_eq!(after_first.retry_count, 1);

        let reclaimed = d.queue.try_claim().await.unwrap().unwrap();
        assert_eq!(reclaimed, job_id);
        d.try_start(job_id, d.semaphore.clone().try_acquire_owned().unwrap())
            .await;

        let after_second = d.store.get(job_id).await.unwrap();
        assert_eq!(after_second.status, JobStatus::Failed);
        assert_eq!(after_second.error_kind, Some(ErrorKind::Oom));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cancel_pending_job_short_circuits_to_cancelled() {
        let dir = std::env::temp_dir().join(format!("reelforge_worker_test_{}", Uuid::new_v4()));
        let generator = ScriptedGenerator {
            progress_steps: vec![],
            final_path: None,
            failure: None,
        };
        let d = dispatcher(generator, dir.clone());

        let job = Job::new(params());
        let job_id = job.id;
        d.store.create(job.clone()).await.unwrap();
        d.queue.enqueue(job_id, 0, job.submitted_at).await.unwrap();

        let cancelled = d.cancel(job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(d.queue.len().await.unwrap(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
