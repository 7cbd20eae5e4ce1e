//! TTL sweeper
//!
//! Transcripts live for a fixed number of days; after that the text and
//! the original audio are purged. The scheduler enqueues a `ttl_cleanup`
//! job on its cadence so sweeps flow through the queue and the run log
//! like every other pipeline step. Audio deletion is best-effort: errors
//! are collected per file and never abort the sweep.

use crate::queue::{EnqueueOptions, Job, JobPayload, JobQueue};
use crate::runner::{Worker, WorkerContext, WorkerOutcome};
use crate::store::runs::RunRecord;
use crate::store::types::{now_rfc3339, RunStatus};
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
pub struct AudioError {
    pub event_id: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub expired_events: Vec<String>,
    pub audio_deleted: usize,
    pub audio_errors: Vec<AudioError>,
    pub dry_run: bool,
}

/// One sweep pass: expire transcripts, remove their audio, clear the
/// paths, record one run row per affected event.
pub fn sweep_once(store: &Store, dry_run: bool) -> Result<SweepReport> {
    let started = Instant::now();
    let now = now_rfc3339();

    if dry_run {
        let events = store.list_transcripts(10_000)?;
        let expired: Vec<String> = events
            .into_iter()
            .filter(|e| {
                e.transcript_expires_at
                    .as_deref()
                    .map(|exp| exp < now.as_str())
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();
        return Ok(SweepReport {
            expired_events: expired,
            audio_deleted: 0,
            audio_errors: Vec::new(),
            dry_run: true,
        });
    }

    let expired = store.expire_transcripts(&now)?;
    let mut audio_deleted = 0usize;
    let mut audio_errors = Vec::new();

    for event_id in &expired {
        let audio_path = store.get_event(event_id)?.and_then(|e| e.audio_path);
        let mut event_error: Option<String> = None;

        if let Some(path) = &audio_path {
            match std::fs::remove_file(Path::new(path)) {
                Ok(()) => audio_deleted += 1,
                Err(e) => {
                    let error = e.to_string();
                    tracing::warn!(event_id = %event_id, path = %path, "Audio cleanup failed: {}", error);
                    audio_errors.push(AudioError {
                        event_id: event_id.clone(),
                        path: path.clone(),
                        error: error.clone(),
                    });
                    event_error = Some(error);
                }
            }
            // The file is gone or unrecoverable either way; the path no
            // longer refers to usable audio.
            store.clear_audio_path(event_id)?;
        }

        let _ = store.record_run(&RunRecord {
            event_id,
            job_type: "ttl_cleanup",
            status: if event_error.is_some() {
                RunStatus::Error
            } else {
                RunStatus::Success
            },
            input_snapshot: audio_path.as_deref(),
            output_snapshot: None,
            error_message: event_error.as_deref(),
            duration_ms: Some(started.elapsed().as_millis() as i64),
        });
    }

    tracing::info!(
        expired = expired.len(),
        audio_deleted,
        audio_errors = audio_errors.len(),
        "TTL sweep finished"
    );

    Ok(SweepReport {
        expired_events: expired,
        audio_deleted,
        audio_errors,
        dry_run: false,
    })
}

/// Queue worker for `ttl_cleanup` jobs.
pub struct TtlWorker {
    store: Arc<Store>,
}

impl TtlWorker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Worker for TtlWorker {
    async fn run(&self, _job: &Job, payload: JobPayload, _ctx: &WorkerContext) -> WorkerOutcome {
        let JobPayload::TtlCleanup { dry_run } = payload else {
            return WorkerOutcome::fatal("ttl worker received a non-ttl payload");
        };
        match sweep_once(&self.store, dry_run) {
            Ok(report) => WorkerOutcome::Success(serde_json::to_value(&report).ok()),
            Err(e) => WorkerOutcome::retryable(format!("sweep failed: {}", e)),
        }
    }
}

/// Enqueue a `ttl_cleanup` job at start-up and then on the configured
/// cadence until shutdown.
pub async fn run_scheduler(
    queue: Arc<JobQueue>,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = queue.enqueue(
                    None,
                    &JobPayload::TtlCleanup { dry_run: false },
                    EnqueueOptions::default(),
                ) {
                    tracing::error!("Failed to enqueue TTL sweep: {}", e);
                }
            }
        }
    }
    tracing::debug!("TTL scheduler stopped");
}
