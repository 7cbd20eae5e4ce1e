//! LLM server supervisor
//!
//! Owns one long-lived llama-server child bound to a loopback port.
//! State machine: stopped → starting → ready → unhealthy → stopped.
//! The extractor gates every request on `ready` and converts an
//! unhealthy server into a retryable job failure, so the queue's
//! backoff absorbs transient outages.

mod client;
pub mod model;

pub use client::{ChatMessage, ChatParams, LlmClient};
#[cfg(test)]
pub use client::FakeLlmClient;
pub use model::{LlmModelManager, LlmModelStatus};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long the child may take to answer its first health check.
const STARTUP_DEADLINE: Duration = Duration::from_secs(60);
/// Poll cadence while starting.
const STARTUP_POLL: Duration = Duration::from_millis(500);
/// Health probe timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmState {
    Stopped,
    Starting,
    Ready,
    Unhealthy,
}

/// Spawn-time knobs forwarded to llama-server.
#[derive(Debug, Clone)]
pub struct LlmStartOptions {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub threads: u32,
    pub batch_size: u32,
    pub gpu_layers: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmStatus {
    pub state: LlmState,
    pub uptime_secs: Option<u64>,
    pub last_health_ok: Option<bool>,
    pub model_path: Option<String>,
}

struct Inner {
    state: LlmState,
    child: Option<Child>,
    started_at: Option<Instant>,
    last_health_ok: Option<bool>,
    model_path: Option<PathBuf>,
}

pub struct LlmSupervisor {
    inner: Mutex<Inner>,
    http: reqwest::Client,
    base_url: String,
    server_bin: String,
    port: u16,
}

impl LlmSupervisor {
    pub fn new(server_bin: impl Into<String>, port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            inner: Mutex::new(Inner {
                state: LlmState::Stopped,
                child: None,
                started_at: None,
                last_health_ok: None,
                model_path: None,
            }),
            http,
            base_url: format!("http://127.0.0.1:{}", port),
            server_bin: server_bin.into(),
            port,
        }
    }

    pub async fn state(&self) -> LlmState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> LlmStatus {
        let inner = self.inner.lock().await;
        LlmStatus {
            state: inner.state,
            uptime_secs: inner.started_at.map(|t| t.elapsed().as_secs()),
            last_health_ok: inner.last_health_ok,
            model_path: inner
                .model_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// Spawn the server child and wait until its health endpoint answers
    /// 200 or the start-up deadline passes (in which case the child is
    /// killed and the supervisor returns to stopped).
    pub async fn start(&self, opts: LlmStartOptions) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, LlmState::Starting | LlmState::Ready) {
            return Ok(());
        }
        // An unhealthy child is still a child; replace it cleanly.
        if inner.child.is_some() {
            Self::terminate(&mut inner).await;
        }

        tracing::info!(
            model = %opts.model_path.display(),
            port = self.port,
            "Starting LLM server"
        );

        let child = Command::new(&self.server_bin)
            .arg("-m")
            .arg(&opts.model_path)
            .args(["--host", "127.0.0.1"])
            .args(["--port", &self.port.to_string()])
            .args(["-c", &opts.context_size.to_string()])
            .args(["-t", &opts.threads.to_string()])
            .args(["-b", &opts.batch_size.to_string()])
            .args(["-ngl", &opts.gpu_layers.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.server_bin))?;

        inner.state = LlmState::Starting;
        inner.child = Some(child);
        inner.model_path = Some(opts.model_path.clone());

        let deadline = Instant::now() + STARTUP_DEADLINE;
        loop {
            // Bail out early if the child already exited.
            if let Some(child) = inner.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    inner.state = LlmState::Stopped;
                    inner.child = None;
                    return Err(anyhow!("LLM server exited during start-up: {}", status));
                }
            }

            if self.probe_health().await {
                inner.state = LlmState::Ready;
                inner.started_at = Some(Instant::now());
                inner.last_health_ok = Some(true);
                tracing::info!("LLM server ready on {}", self.base_url);
                return Ok(());
            }

            if Instant::now() >= deadline {
                Self::terminate(&mut inner).await;
                return Err(anyhow!(
                    "LLM server failed to become healthy within {:?}",
                    STARTUP_DEADLINE
                ));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace period.
    /// Idempotent when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.child.is_none() {
            inner.state = LlmState::Stopped;
            return Ok(());
        }
        tracing::info!("Stopping LLM server");
        Self::terminate(&mut inner).await;
        Ok(())
    }

    pub async fn restart(&self, opts: LlmStartOptions) -> Result<()> {
        self.stop().await?;
        self.start(opts).await
    }

    /// Probe the health endpoint, caching the verdict. Ready ↔ unhealthy
    /// transitions happen here; a stopped supervisor stays stopped.
    pub async fn check_health(&self) -> Result<LlmStatus> {
        let healthy = self.probe_health().await;
        let mut inner = self.inner.lock().await;
        inner.last_health_ok = Some(healthy);
        match (inner.state, healthy) {
            (LlmState::Ready, false) => {
                tracing::warn!("LLM server became unhealthy");
                inner.state = LlmState::Unhealthy;
            }
            (LlmState::Unhealthy, true) => {
                tracing::info!("LLM server recovered");
                inner.state = LlmState::Ready;
            }
            _ => {}
        }
        drop(inner);
        Ok(self.status().await)
    }

    async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn terminate(inner: &mut Inner) {
        if let Some(mut child) = inner.child.take() {
            graceful_kill(&mut child, KILL_GRACE).await;
        }
        inner.state = LlmState::Stopped;
        inner.started_at = None;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Keep the supervisor's cached health verdict fresh so ready/unhealthy
/// transitions happen even while no extraction is running.
pub async fn run_health_monitor(
    supervisor: std::sync::Arc<LlmSupervisor>,
    cadence: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if supervisor.state().await != LlmState::Stopped {
                    let _ = supervisor.check_health().await;
                }
            }
        }
    }
}

/// Ask a child to exit (SIGTERM on unix), escalating to a hard kill
/// after `grace`.
pub(crate) async fn graceful_kill(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!("Child ignored SIGTERM, force-killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
    let _ = child.wait().await;
}
