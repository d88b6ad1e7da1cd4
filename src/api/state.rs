// src/api/state.rs
//
// The axum `State` shared across handlers: one clone per connection, all of
// it cheap `Arc` clones underneath.

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::gpu::GpuRegistry;
use crate::queue::SubmissionQueue;
use crate::store::JobStore;
use crate::worker::Dispatcher;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn SubmissionQueue>,
    pub gpu: Arc<GpuRegistry>,
    pub artifacts: Arc<ArtifactStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<Config>,
}
