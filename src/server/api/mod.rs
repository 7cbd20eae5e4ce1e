// HTTP API module - REST endpoints over the pipeline state
//
// All endpoints return JSON and are designed for local consumption only.
// Security: binds to 127.0.0.1 by default (localhost only).

mod admin;
mod events;
mod push;
mod search;

pub use admin::{
    admin_cancel_job, admin_dead_letter, admin_dead_letter_retry, admin_llm_model_delete,
    admin_llm_model_download, admin_llm_models, admin_llm_restart, admin_llm_start,
    admin_llm_status, admin_llm_stop, admin_model_delete, admin_model_download, admin_models,
    admin_purge_expired, admin_purge_jobs, admin_queue, admin_rebuild_search, admin_stats,
    admin_transcripts,
};
pub use events::{
    add_alias, archive_epic, assign_epic, create_epic, get_event, list_epics, list_events,
    resolve_note, upload_event,
};
pub use push::push_subscribe;
pub use search::search;

use axum::{http::StatusCode, response::IntoResponse};

/// API error responses
/// Converted to HTTP status codes via IntoResponse
#[derive(Debug)]
pub enum ApiError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        tracing::error!("API error: {} - {}", status, message);

        (status, message).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}
