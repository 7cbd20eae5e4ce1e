// Event endpoints - upload, list, detail, epic assignment

use super::ApiError;
use crate::queue::{EnqueueOptions, Job, JobPayload};
use crate::server::AppState;
use crate::store::types::{new_id, Epic, EpicCandidate, Event, EventStatus};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Response for POST /api/events
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub event_id: String,
    pub job_id: String,
    pub status: String,
}

/// POST /api/events - multipart upload: `audio` file plus optional
/// `language` field. Stores the audio, creates the event and enqueues
/// the first pipeline stage.
pub async fn upload_event(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut audio: Option<(String, Vec<u8>)> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("audio") => {
                let filename = field
                    .file_name()
                    .map(sanitize_filename)
                    .unwrap_or_else(|| "memo.bin".to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read audio: {}", e)))?;
                audio = Some((filename, bytes.to_vec()));
            }
            Some("language") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read language: {}", e)))?;
                if !value.is_empty() {
                    language = Some(value);
                }
            }
            _ => {}
        }
    }

    let (filename, bytes) = audio.ok_or_else(|| {
        ApiError::BadRequest("multipart field 'audio' is required".to_string())
    })?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("audio file is empty".to_string()));
    }

    let event_id = new_id();
    let uploads = state.config.uploads_dir();
    tokio::fs::create_dir_all(&uploads)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot create uploads dir: {}", e)))?;
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let audio_path = uploads.join(format!("{}_{}_{}", event_id, stamp, filename));
    tokio::fs::write(&audio_path, &bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot store audio: {}", e)))?;

    let audio_path_str = audio_path.display().to_string();
    state
        .store
        .create_event(&event_id, &audio_path_str, language.as_deref())?;
    let job = state.queue.enqueue(
        Some(&event_id),
        &JobPayload::Stt {
            audio_path: audio_path_str,
            language,
        },
        EnqueueOptions::default(),
    )?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            event_id,
            job_id: job.id,
            status: "queued".to_string(),
        }),
    ))
}

/// Keep only the basename and drop path separators from client names.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Listing row with a short transcript preview.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: String,
    pub status: EventStatus,
    pub status_reason: Option<String>,
    pub epic_id: Option<String>,
    pub transcript_preview: Option<String>,
    pub created_at: String,
}

const PREVIEW_CHARS: usize = 200;

impl From<Event> for EventSummary {
    fn from(event: Event) -> Self {
        let preview = event.transcript.map(|t| {
            if t.chars().count() > PREVIEW_CHARS {
                let cut: String = t.chars().take(PREVIEW_CHARS - 1).collect();
                format!("{}…", cut)
            } else {
                t
            }
        });
        Self {
            id: event.id,
            status: event.status,
            status_reason: event.status_reason,
            epic_id: event.epic_id,
            transcript_preview: preview,
            created_at: event.created_at,
        }
    }
}

/// GET /api/events?status=&limit=&offset=
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<EventSummary>>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            EventStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", s)))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);

    let events = state.store.list_events(status, limit, offset)?;
    Ok(Json(events.into_iter().map(EventSummary::from).collect()))
}

/// Full event plus its jobs, candidate list and projections.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    #[serde(flatten)]
    pub event: Event,
    pub jobs: Vec<Job>,
    pub candidates: Vec<EpicCandidate>,
    pub actions: Vec<crate::store::types::Action>,
    pub blockers: Vec<crate::store::types::TrackedNote>,
    pub dependencies: Vec<crate::store::types::TrackedNote>,
    pub issues: Vec<crate::store::types::TrackedNote>,
    pub knowledge_items: Vec<crate::store::types::KnowledgeItem>,
}

/// GET /api/events/:id
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EventDetail>, ApiError> {
    use crate::store::types::NoteKind;

    let event = state
        .store
        .get_event(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such event: {}", id)))?;
    let jobs = state.queue.jobs_for_event(&id)?;
    let candidates = state.store.candidates_for_event(&id)?;
    Ok(Json(EventDetail {
        event,
        jobs,
        candidates,
        actions: state.store.actions_for_event(&id)?,
        blockers: state.store.notes_for_event(NoteKind::Blocker, &id)?,
        dependencies: state.store.notes_for_event(NoteKind::Dependency, &id)?,
        issues: state.store.notes_for_event(NoteKind::Issue, &id)?,
        knowledge_items: state.store.knowledge_for_event(&id)?,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignEpicRequest {
    pub epic_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignEpicResponse {
    pub job_id: String,
    pub status: String,
}

/// POST /api/events/:id/epic - operator override: enqueue a reprocess
/// with a forced epic, replacing all prior projections.
pub async fn assign_epic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignEpicRequest>,
) -> Result<(StatusCode, Json<AssignEpicResponse>), ApiError> {
    let event = state
        .store
        .get_event(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such event: {}", id)))?;
    state
        .store
        .get_epic(&body.epic_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such epic: {}", body.epic_id)))?;
    if event.transcript.is_none() {
        return Err(ApiError::BadRequest(
            "event has no transcript to reprocess".to_string(),
        ));
    }
    if state.queue.has_open_extract_jobs(&id)? {
        return Err(ApiError::BadRequest(
            "event already has an extract or reprocess in flight".to_string(),
        ));
    }

    let job = state.queue.enqueue(
        Some(&id),
        &JobPayload::Reprocess {
            epic_id: body.epic_id,
            transcript: None,
        },
        EnqueueOptions::default(),
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AssignEpicResponse {
            job_id: job.id,
            status: "queued".to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateEpicRequest {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// POST /api/epics
pub async fn create_epic(
    State(state): State<AppState>,
    Json(body): Json<CreateEpicRequest>,
) -> Result<(StatusCode, Json<Epic>), ApiError> {
    if body.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    let epic = state
        .store
        .create_epic(&new_id(), body.title.trim(), body.description.as_deref())?;
    for alias in &body.aliases {
        state.store.add_epic_alias(&epic.id, alias)?;
    }
    Ok((StatusCode::CREATED, Json(epic)))
}

/// GET /api/epics
pub async fn list_epics(
    State(state): State<AppState>,
) -> Result<Json<Vec<Epic>>, ApiError> {
    Ok(Json(state.store.list_epics(None)?))
}

#[derive(Debug, Deserialize)]
pub struct AddAliasRequest {
    pub alias: String,
}

/// POST /api/notes/:kind/:id/resolve - close a blocker, dependency or
/// issue.
pub async fn resolve_note(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let kind = match kind.as_str() {
        "blockers" => crate::store::types::NoteKind::Blocker,
        "dependencies" => crate::store::types::NoteKind::Dependency,
        "issues" => crate::store::types::NoteKind::Issue,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown note kind: {}",
                other
            )))
        }
    };
    state
        .store
        .resolve_note(kind, &id)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/epics/:id/archive - archived epics drop out of matching
/// but keep their projections.
pub async fn archive_epic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Epic>, ApiError> {
    state
        .store
        .set_epic_status(&id, crate::store::types::EpicStatus::Archived)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    let epic = state
        .store
        .get_epic(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such epic: {}", id)))?;
    Ok(Json(epic))
}

/// POST /api/epics/:id/aliases
pub async fn add_alias(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddAliasRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .get_epic(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such epic: {}", id)))?;
    state
        .store
        .add_epic_alias(&id, &body.alias)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::CREATED)
}
