// src/api/handlers.rs
//
// HTTP handlers for the job submission and status surface (§6.2). Each
// handler does the minimum translation between the wire shape and the
// internal store/queue/gpu calls; all actual policy (validation, CAS,
// scheduling) lives in the components it calls into.

use super::dto::{
    GpuSlotResponse, HealthResponse, JobResponse, ListJobsQuery, ListJobsResponse, SystemLoad,
    SystemStatusResponse,
};
use super::state::AppState;
use crate::error::AppError;
use crate::job::{GenerationParams, Job, JobStatus};
use crate::store::StoreError;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

fn store_err_to_app(e: StoreError) -> AppError {
    match e {
        StoreError::NotFound(id) => AppError::NotFound(id.to_string()),
        StoreError::AlreadyExists(id) | StoreError::Conflict(id) => {
            AppError::Conflict(id.to_string())
        }
        StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
    }
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(params): Json<GenerationParams>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    params.validate().map_err(AppError::Validation)?;

    let job = Job::new(params);
    let (id, priority, submitted_at) = (job.id, job.priority, job.submitted_at);

    state
        .store
        .create(job.clone())
        .await
        .map_err(store_err_to_app)?;
    state
        .queue
        .enqueue(id, priority, submitted_at)
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.store.get(id).await.map_err(store_err_to_app)?;
    Ok(Json(job.into()))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, AppError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);

    let result = state
        .store
        .list(query.status_filter, page, page_size)
        .await
        .map_err(store_err_to_app)?;

    Ok(Json(ListJobsResponse {
        jobs: result.jobs.into_iter().map(Into::into).collect(),
        page: result.page,
        page_size: result.page_size,
        total_pages: result.total_pages,
        total: result.total,
    }))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.dispatcher.cancel(id).await?;
    Ok(Json(job.into()))
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.store.get(id).await.map_err(store_err_to_app)?;

    if job.status != JobStatus::Completed {
        return Err(AppError::Conflict(format!(
            "job {id} is {} (download requires completed)",
            job.status.as_str()
        )));
    }

    let path = job
        .artifact_path
        .ok_or_else(|| AppError::NotFound(format!("job {id} has no artifact yet")))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::NotFound(format!("artifact for job {id} is missing: {e}")))?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let filename = format!("{id}.mp4");
    let headers = [
        (header::CONTENT_TYPE, "video/mp4".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];

    Ok((headers, body))
}

pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatusResponse> {
    let slots: Vec<GpuSlotResponse> = state
        .gpu
        .snapshot()
        .await
        .into_iter()
        .map(Into::into)
        .collect();
    let available_gpus = state.gpu.free_count().await;
    let n_devices = state.gpu.n_devices().await;
    let queue_length = state.queue.len().await.unwrap_or(0);

    let active_jobs = state
        .store
        .list(Some(JobStatus::Processing), 1, 1)
        .await
        .map(|r| r.total)
        .unwrap_or(0);

    let gpu_utilization = if n_devices == 0 {
        0.0
    } else {
        (n_devices - available_gpus) as f64 / n_devices as f64
    };
    let queue_pressure = if state.config.max_concurrent_jobs == 0 {
        0.0
    } else {
        queue_length as f64 / state.config.max_concurrent_jobs as f64
    };

    Json(SystemStatusResponse {
        replica_id: state.config.replica_id.clone(),
        active_jobs,
        queue_length,
        available_gpus,
        gpu_slots: slots,
        system_load: SystemLoad {
            gpu_utilization,
            queue_pressure,
        },
    })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
