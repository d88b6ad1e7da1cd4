// src/job.rs
//
// =============================================================================
// REELFORGE: JOB RECORD & GENERATION PARAMETERS (v 0.1 )
// =============================================================================
//
// The typed record at the center of the orchestrator. Defines the single sum
// type for status and the closed record shape persisted by the store.
// Unknown fields encountered on read (a rolling-upgrade concern) are kept in
// `extra` and re-serialized rather than dropped.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Generation parameters, §6.1. Immutable once a job is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParams {
    pub prompt: String,

    #[serde(default = "defaults::num_frames")]
    pub num_frames: u32,

    #[serde(default = "defaults::num_inference_steps")]
    pub num_inference_steps: u32,

    #[serde(default = "defaults::guidance_scale")]
    pub guidance_scale: f64,

    #[serde(default = "defaults::fps")]
    pub fps: u32,

    #[serde(default = "defaults::width")]
    pub width: u32,

    #[serde(default = "defaults::height")]
    pub height: u32,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub priority: i32,
}

mod defaults {
    pub fn num_frames() -> u32 {
        84
    }
    pub fn num_inference_steps() -> u32 {
        50
    }
    pub fn guidance_scale() -> f64 {
        7.5
    }
    pub fn fps() -> u32 {
        30
    }
    pub fn width() -> u32 {
        848
    }
    pub fn height() -> u32 {
        480
    }
}

impl GenerationParams {
    /// Validates all constraints, accumulating every violation rather than
    /// short-circuiting on the first one (§6.1).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.prompt.is_empty() || self.prompt.chars().count() > 2000 {
            errors.push("prompt must have length in [1, 2000]".to_string());
        }
        if !(1..=163).contains(&self.num_frames) {
            errors.push("num_frames must be in [1, 163]".to_string());
        }
        if !(10..=100).contains(&self.num_inference_steps) {
            errors.push("num_inference_steps must be in [10, 100]".to_string());
        }
        if !(1.0..=20.0).contains(&self.guidance_scale) {
            errors.push("guidance_scale must be in [1.0, 20.0]".to_string());
        }
        if !(1..=60).contains(&self.fps) {
            errors.push("fps must be in [1, 60]".to_string());
        }
        if !(256..=1024).contains(&self.width) || self.width % 64 != 0 {
            errors.push("width must be in [256, 1024] and a multiple of 64".to_string());
        }
        if !(256..=1024).contains(&self.height) || self.height % 64 != 0 {
            errors.push("height must be in [256, 1024] and a multiple of 64".to_string());
        }
        if !(-10..=10).contains(&self.priority) {
            errors.push("priority must be in [-10, 10]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolves the seed, choosing one at random and recording it when the
    /// caller left it null (§6.1).
    pub fn resolved_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub params: GenerationParams,

    #[serde(default)]
    pub progress: Option<f64>,

    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub replica_id: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub artifact_path: Option<PathBuf>,

    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_detail: Option<String>,

    pub priority: i32,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub retry_count: u32,

    /// Unknown fields from a newer schema version, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, serde_json::Value>,
}

impl Job {
    pub fn new(params: GenerationParams) -> Self {
        let priority = params.priority;
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            params,
            progress: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            replica_id: None,
            lease_expires_at: None,
            artifact_path: None,
            error_kind: None,
            error_detail: None,
            priority,
            cancel_requested: false,
            retry_count: 0,
            extra: Map::new(),
        }
    }

    /// Checks the status-dependent field predicates of §3.1. Used by tests
    /// and by the reconciler's own self-checks.
    pub fn invariants_hold(&self) -> bool {
        match self.status {
            JobStatus::Pending => {
                self.replica_id.is_none() && self.started_at.is_none() && self.artifact_path.is_none()
            }
            JobStatus::Processing => {
                self.replica_id.is_some()
                    && self.started_at.is_some()
                    && self.lease_expires_at.is_some()
            }
            JobStatus::Completed => {
                self.completed_at.is_some()
                    && self.lease_expires_at.is_none()
                    && self.replica_id.is_none()
                    && self.artifact_path.is_some()
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at.is_some()
                    && self.lease_expires_at.is_none()
                    && self.replica_id.is_none()
            }
        }
    }
}
