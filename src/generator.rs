// src/generator.rs
//
// =============================================================================
// REELFORGE: EXTERNAL GENERATOR ADAPTER (v 0.1 )
// =============================================================================
//
// The video model is an opaque generator (§1, §9): given parameters and a
// GPU index it produces a media file and emits progress fractions. Addressed
// as a child process over a line-delimited protocol: one request per
// invocation, streaming `{"progress":0.xx}` lines, and a final
// `{"ok":true,"path":...}` or `{"ok":false,"kind":...,"detail":...}` line.
//
// The progress callback and cancellation check are unified behind
// `ProgressSink` so the executor's logic does not care whether the
// generator runs in-process or out-of-process (§4.6, §9).

use crate::error::ErrorKind;
use crate::job::GenerationParams;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persists progress, subject to coalescing and monotonicity rules the
    /// implementor enforces (§4.5). `fraction` is clamped to [0,1] by callers.
    async fn report(&self, fraction: f64);

    async fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct GeneratorRequest {
    pub job_id: Uuid,
    pub params: GenerationParams,
    pub seed: u64,
    pub device_id: usize,
    pub output_tmp_path: PathBuf,
    pub model_cache_dir: PathBuf,
}

#[derive(Debug)]
pub enum GeneratorError {
    Generator(String),
    Oom(String),
    Cancelled,
}

impl GeneratorError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            GeneratorError::Generator(_) => ErrorKind::Generator,
            GeneratorError::Oom(_) => ErrorKind::Oom,
            GeneratorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            GeneratorError::Generator(d) | GeneratorError::Oom(d) => d.clone(),
            GeneratorError::Cancelled => "cooperative cancellation honored".to_string(),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Runs the model to completion, returning the path of the file it
    /// wrote. The executor is responsible for the final atomic rename into
    /// the artifact layout (§6.3); the generator only needs a scratch path.
    async fn generate(
        &self,
        req: GeneratorRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PathBuf, GeneratorError>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    job_id: String,
    prompt: &'a str,
    num_frames: u32,
    num_inference_steps: u32,
    guidance_scale: f64,
    fps: u32,
    width: u32,
    height: u32,
    seed: u64,
    device_id: usize,
    output_path: String,
    model_cache_dir: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireLine {
    Progress {
        progress: f64,
    },
    Done {
        ok: bool,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    },
}

/// Spawns `generator_cmd` as a one-shot child process per job. A persistent,
/// kernel-style daemon (holding the model resident in VRAM across jobs)
/// would reduce per-job load latency but is not required for correctness;
/// this adapter keeps the simpler one-process-per-invocation contract of §9.
pub struct ProcessGenerator {
    generator_cmd: String,
}

impl ProcessGenerator {
    pub fn new(generator_cmd: String) -> Self {
        Self { generator_cmd }
    }
}

#[async_trait]
impl Generator for ProcessGenerator {
    async fn generate(
        &self,
        req: GeneratorRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PathBuf, GeneratorError> {
        let wire = WireRequest {
            job_id: req.job_id.to_string(),
            prompt: &req.params.prompt,
            num_frames: req.params.num_frames,
            num_inference_steps: req.params.num_inference_steps,
            guidance_scale: req.params.guidance_scale,
            fps: req.params.fps,
            width: req.params.width,
            height: req.params.height,
            seed: req.seed,
            device_id: req.device_id,
            output_path: req.output_tmp_path.to_string_lossy().to_string(),
            model_cache_dir: req.model_cache_dir.to_string_lossy().to_string(),
        };

        let request_json = serde_json::to_string(&wire)
            .map_err(|e| GeneratorError::Generator(format!("failed to encode request: {e}")))?;

        let mut cmd = Command::new(&self.generator_cmd);
        apply_device_isolation(&mut cmd, req.device_id);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GeneratorError::Generator(format!("failed to spawn generator: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(request_json.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[generator] {line}");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GeneratorError::Generator("generator stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut last_progress = 0.0f64;
        let mut outcome: Option<Result<PathBuf, GeneratorError>> = None;

        while let Ok(Some(line)) = lines
            .next_line()
            .await
            .map_err(|e| GeneratorError::Generator(e.to_string()))
        {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: WireLine = match serde_json::from_str(&line) {
                Ok(p) => p,
                Err(_) => continue, // tolerate stray non-protocol output
            };

            match parsed {
                WireLine::Progress { progress } => {
                    if progress > last_progress {
                        last_progress = progress;
                        sink.report(progress).await;
                    }
                    if sink.is_cancelled().await {
                        let _ = child.start_kill();
                        outcome = Some(Err(GeneratorError::Cancelled));
                        break;
                    }
                }
                WireLine::Done {
                    ok,
                    path,
                    kind,
                    detail,
                } => {
                    if ok {
                        let path = path.map(PathBuf::from).ok_or_else(|| {
                            GeneratorError::Generator("missing path on success".into())
                        });
                        outcome = Some(path);
                    } else {
                        let detail = detail.unwrap_or_default();
                        outcome = Some(Err(match kind.as_deref() {
                            Some("oom") => GeneratorError::Oom(detail),
                            _ => GeneratorError::Generator(detail),
                        }));
                    }
                    break;
                }
            }
        }

        let _ = child.wait().await;

        outcome.unwrap_or_else(|| {
            Err(GeneratorError::Generator(
                "generator exited without a terminal protocol line".into(),
            ))
        })
    }
}

fn apply_device_isolation(cmd: &mut Command, device_id: usize) {
    cmd.env("CUDA_VISIBLE_DEVICES", device_id.to_string());
    cmd.env("ROCR_VISIBLE_DEVICES", device_id.to_string());
}

/// Test double: emits a scripted progress sequence then a fixed outcome.
/// Used by executor/dispatcher tests that do not want a real subprocess.
pub struct ScriptedGenerator {
    pub progress_steps: Vec<f64>,
    pub final_path: Option<PathBuf>,
    pub failure: Option<GeneratorErrorSpec>,
}

#[derive(Clone)]
pub enum GeneratorErrorSpec {
    Generator(String),
    Oom(String),
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        req: GeneratorRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PathBuf, GeneratorError> {
        for &p in &self.progress_steps {
            if sink.is_cancelled().await {
                return Err(GeneratorError::Cancelled);
            }
            sink.report(p).await;
        }

        if let Some(spec) = &self.failure {
            return Err(match spec {
                GeneratorErrorSpec::Generator(d) => GeneratorError::Generator(d.clone()),
                GeneratorErrorSpec::Oom(d) => GeneratorError::Oom(d.clone()),
            });
        }

        match &self.final_path {
            Some(p) => Ok(p.clone()),
            None => {
                // Fall back to the requested scratch path, simulating a
                // generator that wrote directly where it was told to.
                let _ = tokio::fs::write(&req.output_tmp_path, b"fake-mp4-bytes").await;
                Ok(req.output_tmp_path)
            }
        }
    }
}

pub fn is_executable_path(path: &Path) -> bool {
    path.exists()
}
