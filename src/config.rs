// src/config.rs
//
// =============================================================================
// REELFORGE: REPLICA CONFIGURATION (v 0.1 )
// =============================================================================
//
// Assembled once from the environment at process start and threaded through
// every component by explicit construction. No component reaches for an env
// var of its own after boot.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub max_concurrent_jobs: usize,
    pub model_cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub replica_id: String,
    pub gpu_device_ids: Option<Vec<usize>>,
    pub generator_cmd: String,
    pub t_retain: Duration,

    // Constants not exposed as env vars in §6.4 but named by the spec body.
    pub lease_duration: Duration,
    pub reconciler_interval: Duration,
    pub progress_coalesce_interval: Duration,
    pub n_retry: u32,
    pub t_job_max: Duration,
    pub t_cancel_grace: Duration,
    pub t_store_retry: Duration,
}

impl Config {
    /// Builds configuration from the process environment, applying the
    /// defaults of §6.4 wherever a variable is unset.
    pub fn from_env() -> Self {
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let max_concurrent_jobs = env_parse("MAX_CONCURRENT_JOBS", 2usize);
        let model_cache_dir =
            PathBuf::from(env::var("MODEL_CACHE_DIR").unwrap_or_else(|_| "/app/model_cache".into()));
        let output_dir =
            PathBuf::from(env::var("OUTPUT_DIR").unwrap_or_else(|_| "/app/outputs".into()));
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT", 8000u16);

        let replica_id = env::var("REPLICA_ID").unwrap_or_else(|_| generate_replica_id());

        let gpu_device_ids = env::var("GPU_DEVICE_IDS").ok().map(|raw| {
            raw.split(',')
                .filter_map(|s| s.trim().parse::<usize>().ok())
                .collect()
        });

        let generator_cmd = env::var("GENERATOR_CMD").unwrap_or_else(|_| "model_runner".to_string());
        let t_retain = Duration::from_secs(env_parse("T_RETAIN_SECS", 604_800u64));

        Self {
            redis_url,
            max_concurrent_jobs,
            model_cache_dir,
            output_dir,
            host,
            port,
            replica_id,
            gpu_device_ids,
            generator_cmd,
            t_retain,
            lease_duration: Duration::from_secs(45),
            reconciler_interval: Duration::from_secs(30),
            progress_coalesce_interval: Duration::from_millis(500),
            n_retry: 2,
            t_job_max: Duration::from_secs(30 * 60),
            t_cancel_grace: Duration::from_secs(10),
            t_store_retry: Duration::from_secs(20),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn generate_replica_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "replica".to_string());
    let suffix: u32 = rand::random();
    format!("{host}-{:08x}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_joins_host_and_port() {
        let mut cfg = Config::from_env();
        cfg.host = "127.0.0.1".into();
        cfg.port = 9001;
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9001");
    }

    #[test]
    fn replica_id_is_nonempty_when_unset() {
        let cfg = Config::from_env();
        assert!(!cfg.replica_id.is_empty());
    }
}
