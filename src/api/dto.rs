// src/api/dto.rs
//
// Wire-facing request/response shapes, kept distinct from the internal
// `Job` record so the persisted schema can evolve independently of the
// HTTP surface (§6.2).

use crate::error::ErrorKind;
use crate::gpu::{GpuSlot, SlotState};
use crate::job::{GenerationParams, Job, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub params: GenerationParams,
    pub progress: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub download_url: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(j: Job) -> Self {
        let download_url = if j.status == JobStatus::Completed {
            Some(format!("/api/jobs/{}/download", j.id))
        } else {
            None
        };
        Self {
            id: j.id,
            status: j.status,
            params: j.params,
            progress: j.progress,
            submitted_at: j.submitted_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
            error_kind: j.error_kind,
            error_detail: j.error_detail,
            download_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub status_filter: Option<JobStatus>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobResponse>,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct GpuSlotResponse {
    pub device_id: usize,
    pub allocated: bool,
    pub job_id: Option<Uuid>,
}

impl From<GpuSlot> for GpuSlotResponse {
    fn from(s: GpuSlot) -> Self {
        Self {
            device_id: s.device_id,
            allocated: s.state == SlotState::Allocated,
            job_id: s.job_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SystemLoad {
    pub gpu_utilization: f64,
    pub queue_pressure: f64,
}

#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub replica_id: String,
    pub active_jobs: u64,
    pub queue_length: u64,
    pub available_gpus: usize,
    pub gpu_slots: Vec<GpuSlotResponse>,
    pub system_load: SystemLoad,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
