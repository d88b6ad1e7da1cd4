// src/main.rs
//
// =============================================================================
// REELFORGE: ENTRY POINT (v 0.1 )
// =============================================================================
//
// Boots a single replica: wires the shared Redis-backed store and queue, the
// local GPU registry, the external generator adapter, and the dispatcher and
// reconciler background tasks, then serves the HTTP API until interrupted.

mod api;
mod artifact;
mod config;
mod error;
mod generator;
mod gpu;
mod job;
mod queue;
mod reconciler;
mod store;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use crate::api::AppState;
use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::generator::{Generator, ProcessGenerator};
use crate::gpu::GpuRegistry;
use crate::queue::redis_queue::RedisQueue;
use crate::queue::SubmissionQueue;
use crate::reconciler::{Reconciler, RedisLeaderLease};
use crate::store::redis_store::RedisJobStore;
use crate::store::JobStore;
use crate::worker::{CancellationRegistry, Dispatcher};

#[derive(Parser)]
#[command(name = "reelforge", version, about = "Async job orchestrator for GPU-backed text-to-video generation")]
struct Cli {
    /// Override HOST for this invocation.
    #[arg(long)]
    host: Option<String>,

    /// Override PORT for this invocation.
    #[arg(long)]
    port: Option<u16>,

    /// Override REPLICA_ID for this invocation.
    #[arg(long)]
    replica_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(replica_id) = cli.replica_id {
        config.replica_id = replica_id;
    }
    let config = Arc::new(config);

    log::info!(
        "booting replica {} (redis={}, max_concurrent_jobs={})",
        config.replica_id,
        config.redis_url,
        config.max_concurrent_jobs
    );

    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::connect(&config.redis_url)
            .await
            .context("connecting job store to redis")?,
    );
    let queue: Arc<dyn SubmissionQueue> = Arc::new(
        RedisQueue::connect(&config.redis_url)
            .await
            .context("connecting submission queue to redis")?,
    );
    let gpu = Arc::new(GpuRegistry::detect(config.gpu_device_ids.clone()));
    let artifacts = Arc::new(ArtifactStore::new(&config.output_dir)?);
    let generator: Arc<dyn Generator> = Arc::new(ProcessGenerator::new(config.generator_cmd.clone()));
    let cancellations = Arc::new(CancellationRegistry::new());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        queue.clone(),
        gpu.clone(),
        generator,
        artifacts.clone(),
        cancellations,
        config.clone(),
    ));

    let lease_client = redis::Client::open(config.redis_url.as_str())?;
    let lease_conn = redis::aio::ConnectionManager::new(lease_client)
        .await
        .context("connecting reconciler leader lease to redis")?;
    let lease = Arc::new(RedisLeaderLease::new(
        lease_conn,
        config.replica_id.clone(),
        config.reconciler_interval * 2,
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        queue.clone(),
        artifacts.clone(),
        lease,
        config.clone(),
    ));

    tokio::spawn(dispatcher.clone().run());
    tokio::spawn(reconciler.run());

    let state = AppState {
        store,
        queue,
        gpu,
        artifacts,
        dispatcher,
        config: config.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    log::info!("listening on {}", config.bind_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http api")?;

    log::info!("replica {} shut down", config.replica_id);
    Ok(())
}

async fn shutdown_signal() {
    signal::ctrl_c().await.ok();
    log::warn!("interrupt received, shutting down");
    // Give in-flight requests a moment to drain before axum tears down the
    // listener.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
