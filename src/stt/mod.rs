//! STT subprocess supervisor and worker
//!
//! Owns the models directory and one whisper CLI child per job. The
//! worker drives the event through transcribing → transcribed, hands the
//! transcript to the extract stage, and records a run row either way.

pub mod model;
pub mod transcribe;

pub use model::{ModelManager, ModelStatus, MODEL_CATALOGUE};

use crate::queue::{EnqueueOptions, Job, JobPayload, JobQueue};
use crate::runner::{Worker, WorkerContext, WorkerOutcome};
use crate::store::runs::RunRecord;
use crate::store::types::{EventStatus, RunStatus};
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub cli_path: Option<String>,
    pub models_dir: PathBuf,
    pub model: String,
    pub threads: u32,
}

pub struct SttSupervisor {
    cli: PathBuf,
    models: ModelManager,
    model_size: String,
    threads: u32,
    ffmpeg_available: bool,
}

impl SttSupervisor {
    /// Locate and probe the CLI, set up the models directory, and note
    /// whether ffmpeg is around for container transcoding.
    pub async fn initialize(config: &SttConfig) -> Result<Self> {
        let cli = transcribe::locate_cli(config.cli_path.as_deref())?;
        transcribe::probe_cli(&cli)
            .await
            .with_context(|| format!("whisper CLI at {} failed its probe", cli.display()))?;

        let models = ModelManager::new(&config.models_dir)?;
        let ffmpeg_available = transcribe::probe_ffmpeg().await;
        if !ffmpeg_available {
            tracing::warn!(
                "ffmpeg not found; non-WAV uploads will be passed to the CLI unconverted"
            );
        }

        tracing::info!(cli = %cli.display(), model = %config.model, "STT supervisor ready");
        Ok(Self {
            cli,
            models,
            model_size: config.model.clone(),
            threads: config.threads,
            ffmpeg_available,
        })
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    /// Transcribe one audio file, transcoding to 16 kHz mono WAV first
    /// when the container needs it and ffmpeg is available. Without
    /// ffmpeg the original file is passed through best-effort.
    pub async fn transcribe(&self, audio: &Path, language: Option<&str>) -> Result<String> {
        let model = self.models.ensure_model(&self.model_size).await?;

        let needs_transcode = audio
            .extension()
            .map(|ext| !ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(true);

        let mut side_file: Option<PathBuf> = None;
        let input = if needs_transcode && self.ffmpeg_available {
            let wav = audio.with_extension("16k.wav");
            transcribe::transcode_to_wav(audio, &wav).await?;
            side_file = Some(wav.clone());
            wav
        } else {
            audio.to_path_buf()
        };

        let result = transcribe::run_cli(
            &self.cli,
            &transcribe::TranscribeRequest {
                audio: &input,
                model: &model,
                language,
                threads: self.threads,
            },
        )
        .await;

        if let Some(wav) = side_file {
            let _ = tokio::fs::remove_file(&wav).await;
        }

        result
    }
}

/// Queue worker for `stt` jobs.
pub struct SttWorker {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    supervisor: Arc<SttSupervisor>,
    transcript_ttl_days: i64,
}

impl SttWorker {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        supervisor: Arc<SttSupervisor>,
        transcript_ttl_days: i64,
    ) -> Self {
        Self {
            store,
            queue,
            supervisor,
            transcript_ttl_days,
        }
    }

    /// Whether this was the job's final attempt, so the event should be
    /// surfaced as failed rather than silently retried.
    fn final_attempt(job: &Job) -> bool {
        job.attempts >= job.max_attempts
    }
}

#[async_trait]
impl Worker for SttWorker {
    async fn run(&self, job: &Job, payload: JobPayload, ctx: &WorkerContext) -> WorkerOutcome {
        let started = Instant::now();
        let JobPayload::Stt {
            audio_path,
            language,
        } = payload
        else {
            return WorkerOutcome::fatal("stt worker received a non-stt payload");
        };
        let Some(event_id) = job.event_id.as_deref() else {
            return WorkerOutcome::fatal("stt job has no event id");
        };

        if ctx.cancelled() {
            return WorkerOutcome::retryable("cancelled before start");
        }

        let input_snapshot =
            serde_json::json!({ "audio_path": audio_path, "language": language }).to_string();

        // Missing audio is an input error; no amount of retrying will
        // conjure the file back.
        if !Path::new(&audio_path).exists() {
            let message = format!("audio file missing: {}", audio_path);
            let _ = self
                .store
                .set_event_status(event_id, EventStatus::Failed, Some(&message));
            let _ = self.store.record_run(&RunRecord {
                event_id,
                job_type: "stt",
                status: RunStatus::Error,
                input_snapshot: Some(&input_snapshot),
                output_snapshot: None,
                error_message: Some(&message),
                duration_ms: Some(started.elapsed().as_millis() as i64),
            });
            return WorkerOutcome::fatal(message);
        }

        if let Err(e) = self
            .store
            .set_event_status(event_id, EventStatus::Transcribing, None)
        {
            return WorkerOutcome::fatal(format!("cannot transition event: {}", e));
        }

        match self
            .supervisor
            .transcribe(Path::new(&audio_path), language.as_deref())
            .await
        {
            Ok(transcript) => {
                let expires_at = (Utc::now()
                    + ChronoDuration::days(self.transcript_ttl_days))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

                if let Err(e) = self
                    .store
                    .set_transcript(event_id, &transcript, &expires_at)
                {
                    return WorkerOutcome::fatal(format!("cannot store transcript: {}", e));
                }
                if let Err(e) =
                    self.store
                        .set_event_status(event_id, EventStatus::Transcribed, None)
                {
                    return WorkerOutcome::fatal(format!("cannot transition event: {}", e));
                }

                if let Err(e) = self.queue.enqueue(
                    Some(event_id),
                    &JobPayload::Extract {
                        transcript: transcript.clone(),
                        language: language.clone(),
                    },
                    EnqueueOptions::default(),
                ) {
                    return WorkerOutcome::retryable(format!("cannot enqueue extract: {}", e));
                }

                let output_snapshot =
                    serde_json::json!({ "transcript_chars": transcript.chars().count() })
                        .to_string();
                let _ = self.store.record_run(&RunRecord {
                    event_id,
                    job_type: "stt",
                    status: RunStatus::Success,
                    input_snapshot: Some(&input_snapshot),
                    output_snapshot: Some(&output_snapshot),
                    error_message: None,
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                });
                WorkerOutcome::Success(Some(serde_json::json!({
                    "transcript_chars": transcript.chars().count()
                })))
            }
            Err(e) => {
                let message = e.to_string();
                let run_status = if Self::final_attempt(job) {
                    // Last try: surface the failure on the event itself.
                    let _ = self.store.set_event_status(
                        event_id,
                        EventStatus::Failed,
                        Some(&message),
                    );
                    RunStatus::Error
                } else {
                    RunStatus::Retry
                };
                let _ = self.store.record_run(&RunRecord {
                    event_id,
                    job_type: "stt",
                    status: run_status,
                    input_snapshot: Some(&input_snapshot),
                    output_snapshot: None,
                    error_message: Some(&message),
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                });
                WorkerOutcome::retryable(message)
            }
        }
    }
}
