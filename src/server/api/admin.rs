// Admin endpoints - queue, models, LLM lifecycle, TTL, stats

use super::ApiError;
use crate::llm::{LlmModelStatus, LlmStartOptions, LlmStatus};
use crate::queue::{DeadLetterEntry, Job, JobStatus, QueueStats};
use crate::server::AppState;
use crate::stt::ModelStatus;
use crate::sweeper::{self, SweepReport};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/admin/queue
pub async fn admin_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            JobStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown job status: {}", s)))?,
        ),
    };
    Ok(Json(
        state.queue.list_jobs(status, query.limit.unwrap_or(100).min(1000))?,
    ))
}

/// GET /api/admin/queue/dead-letter
pub async fn admin_dead_letter(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetterEntry>>, ApiError> {
    Ok(Json(state.queue.list_dead_letters(100)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub job_id: String,
}

/// POST /api/admin/queue/dead-letter/:id/retry
pub async fn admin_dead_letter_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let job = state
        .queue
        .retry_dead_letter(&id)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(RetryResponse { job_id: job.id }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// POST /api/admin/queue/jobs/:id/cancel
pub async fn admin_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.queue.cancel(&id, "operator")?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub older_than_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: usize,
}

/// POST /api/admin/queue/purge
pub async fn admin_purge_jobs(
    State(state): State<AppState>,
    Json(body): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let deleted = state.queue.purge_old_jobs(body.older_than_days.unwrap_or(30))?;
    Ok(Json(PurgeResponse { deleted }))
}

// ─────────────────────────────────────────────────────────────────────────────
// STT models
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/admin/models
pub async fn admin_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelStatus>>, ApiError> {
    Ok(Json(state.stt.models().list()))
}

#[derive(Debug, Deserialize)]
pub struct ModelDownloadRequest {
    pub size: String,
}

/// POST /api/admin/models/download
pub async fn admin_model_download(
    State(state): State<AppState>,
    Json(body): Json<ModelDownloadRequest>,
) -> Result<Json<Vec<ModelStatus>>, ApiError> {
    state
        .stt
        .models()
        .ensure_model(&body.size)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.stt.models().list()))
}

#[derive(Debug, Serialize)]
pub struct ModelDeleteResponse {
    pub deleted: bool,
}

/// DELETE /api/admin/models/:size
pub async fn admin_model_delete(
    State(state): State<AppState>,
    Path(size): Path<String>,
) -> Result<Json<ModelDeleteResponse>, ApiError> {
    let deleted = state
        .stt
        .models()
        .delete(&size)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(ModelDeleteResponse { deleted }))
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/admin/llm/status - probes the health endpoint and returns
/// the refreshed status.
pub async fn admin_llm_status(
    State(state): State<AppState>,
) -> Result<Json<LlmStatus>, ApiError> {
    let status = state
        .llm
        .check_health()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(status))
}

fn llm_options(state: &AppState) -> LlmStartOptions {
    LlmStartOptions {
        model_path: state.config.llm.model_path(),
        context_size: state.config.llm.context_size,
        threads: state.config.llm.threads,
        batch_size: state.config.llm.batch_size,
        gpu_layers: state.config.llm.gpu_layers,
    }
}

/// POST /api/admin/llm/start
pub async fn admin_llm_start(
    State(state): State<AppState>,
) -> Result<Json<LlmStatus>, ApiError> {
    state
        .llm
        .start(llm_options(&state))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(state.llm.status().await))
}

/// POST /api/admin/llm/stop
pub async fn admin_llm_stop(
    State(state): State<AppState>,
) -> Result<Json<LlmStatus>, ApiError> {
    state
        .llm
        .stop()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(state.llm.status().await))
}

/// POST /api/admin/llm/restart
pub async fn admin_llm_restart(
    State(state): State<AppState>,
) -> Result<Json<LlmStatus>, ApiError> {
    state
        .llm
        .restart(llm_options(&state))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(state.llm.status().await))
}

/// GET /api/admin/llm/models
pub async fn admin_llm_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<LlmModelStatus>>, ApiError> {
    Ok(Json(state.llm_models.list()))
}

#[derive(Debug, Deserialize)]
pub struct LlmModelDownloadRequest {
    pub name: String,
}

/// POST /api/admin/llm/models/download
pub async fn admin_llm_model_download(
    State(state): State<AppState>,
    Json(body): Json<LlmModelDownloadRequest>,
) -> Result<Json<Vec<LlmModelStatus>>, ApiError> {
    state
        .llm_models
        .ensure_model(&body.name)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.llm_models.list()))
}

/// DELETE /api/admin/llm/models/:name
pub async fn admin_llm_model_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelDeleteResponse>, ApiError> {
    let deleted = state
        .llm_models
        .delete(&name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(ModelDeleteResponse { deleted }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcripts / TTL
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRow {
    pub event_id: String,
    pub expires_at: Option<String>,
    pub transcript_chars: usize,
}

/// GET /api/admin/transcripts
pub async fn admin_transcripts(
    State(state): State<AppState>,
) -> Result<Json<Vec<TranscriptRow>>, ApiError> {
    let events = state.store.list_transcripts(500)?;
    Ok(Json(
        events
            .into_iter()
            .map(|e| TranscriptRow {
                event_id: e.id,
                expires_at: e.transcript_expires_at,
                transcript_chars: e.transcript.map(|t| t.chars().count()).unwrap_or(0),
            })
            .collect(),
    ))
}

/// POST /api/admin/purge-expired - run one sweep pass now.
pub async fn admin_purge_expired(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, ApiError> {
    let report = sweeper::sweep_once(&state.store, false)?;
    Ok(Json(report))
}

/// POST /api/admin/search/rebuild - repopulate the FTS index from the
/// source tables.
pub async fn admin_rebuild_search(
    State(state): State<AppState>,
) -> Result<axum::http::StatusCode, ApiError> {
    state.store.rebuild_search_index()?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RunStatRow {
    pub job_type: String,
    pub status: String,
    pub count: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub runs: Vec<RunStatRow>,
}

/// GET /api/admin/stats
pub async fn admin_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let queue = state.queue.stats()?;
    let runs = state
        .store
        .run_stats()?
        .into_iter()
        .map(|(job_type, status, count, avg_duration_ms)| RunStatRow {
            job_type,
            status,
            count,
            avg_duration_ms,
        })
        .collect();
    Ok(Json(StatsResponse { queue, runs }))
}
