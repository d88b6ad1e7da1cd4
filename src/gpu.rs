// src/gpu.rs
//
// =============================================================================
// REELFORGE: GPU REGISTRY (v 0.1 ) -- Component C
// =============================================================================
//
// Per-replica, in-memory accounting of GPU slots (§3.2, §4.4). Guarded by a
// single mutex around acquire/release, matching the single-mutex-per-ledger
// idiom used elsewhere for replica-local resource bookkeeping.

use serde::Serialize;
use std::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Allocated,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuSlot {
    pub device_id: usize,
    pub state: SlotState,
    pub job_id: Option<Uuid>,
}

pub enum Acquire {
    Device(usize),
    Full,
}

pub struct GpuRegistry {
    slots: Mutex<Vec<GpuSlot>>,
}

impl GpuRegistry {
    pub fn new(device_ids: Vec<usize>) -> Self {
        let slots = device_ids
            .into_iter()
            .map(|device_id| GpuSlot {
                device_id,
                state: SlotState::Free,
                job_id: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Builds the registry from configuration: an explicit device-id list
    /// wins; otherwise probe `nvidia-smi`; otherwise fall back to a single
    /// simulated device so the service is runnable on GPU-less dev hosts.
    pub fn detect(explicit: Option<Vec<usize>>) -> Self {
        if let Some(ids) = explicit {
            log::info!("GPU registry: using configured device ids {:?}", ids);
            return Self::new(ids);
        }

        let probed = Self::probe_nvidia_smi();
        let ids: Vec<usize> = if probed > 0 {
            (0..probed).collect()
        } else {
            log::warn!("No GPUs detected via nvidia-smi; falling back to 1 simulated device");
            vec![0]
        };
        log::info!("GPU registry: detected {} device(s)", ids.len());
        Self::new(ids)
    }

    fn probe_nvidia_smi() -> usize {
        Command::new("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn n_devices(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn acquire(&self, job_id: Uuid) -> Acquire {
        let mut slots = self.slots.lock().await;
        match slots.iter_mut().find(|s| s.state == SlotState::Free) {
            Some(slot) => {
                slot.state = SlotState::Allocated;
                slot.job_id = Some(job_id);
                Acquire::Device(slot.device_id)
            }
            None => Acquire::Full,
        }
    }

    /// Idempotent: a no-op if `job_id` does not currently hold a slot.
    pub async fn release(&self, job_id: Uuid) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.job_id == Some(job_id)) {
            slot.state = SlotState::Free;
            slot.job_id = None;
        }
    }

    pub async fn snapshot(&self) -> Vec<GpuSlot> {
        self.slots.lock().await.clone()
    }

    pub async fn free_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .iter()
            .filter(|s| s.state == SlotState::Free)
            .count()
    }
}
