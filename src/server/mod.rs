//! HTTP surface
//!
//! Thin axum layer over the store, queue and supervisors. Handlers only
//! translate between JSON and repository calls; everything with
//! behaviour lives in the components they front.

pub mod api;

use crate::config::Config;
use crate::llm::{LlmModelManager, LlmSupervisor};
use crate::queue::JobQueue;
use crate::store::Store;
use crate::stt::SttSupervisor;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shared handles threaded into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub stt: Arc<SttSupervisor>,
    pub llm: Arc<LlmSupervisor>,
    pub llm_models: Arc<LlmModelManager>,
    pub config: Arc<Config>,
}

/// Voice memos run long; the default 2 MB body cap would reject most
/// uploads.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    use axum::extract::DefaultBodyLimit;
    use axum::routing::{delete, get, post};

    Router::new()
        // Events
        .route("/api/events", post(api::upload_event).get(api::list_events))
        .route("/api/events/:id", get(api::get_event))
        .route("/api/events/:id/epic", post(api::assign_epic))
        // Epics
        .route("/api/epics", post(api::create_epic).get(api::list_epics))
        .route("/api/epics/:id/aliases", post(api::add_alias))
        .route("/api/epics/:id/archive", post(api::archive_epic))
        // Projections
        .route("/api/notes/:kind/:id/resolve", post(api::resolve_note))
        // Search
        .route("/api/search", get(api::search))
        // Push subscriptions
        .route("/api/push/subscribe", post(api::push_subscribe))
        // Admin: queue
        .route("/api/admin/queue", get(api::admin_queue))
        .route("/api/admin/queue/dead-letter", get(api::admin_dead_letter))
        .route(
            "/api/admin/queue/dead-letter/:id/retry",
            post(api::admin_dead_letter_retry),
        )
        .route("/api/admin/queue/jobs/:id/cancel", post(api::admin_cancel_job))
        .route("/api/admin/queue/purge", post(api::admin_purge_jobs))
        // Admin: STT models
        .route("/api/admin/models", get(api::admin_models))
        .route("/api/admin/models/download", post(api::admin_model_download))
        .route("/api/admin/models/:size", delete(api::admin_model_delete))
        // Admin: LLM
        .route("/api/admin/llm/status", get(api::admin_llm_status))
        .route("/api/admin/llm/start", post(api::admin_llm_start))
        .route("/api/admin/llm/stop", post(api::admin_llm_stop))
        .route("/api/admin/llm/restart", post(api::admin_llm_restart))
        .route("/api/admin/llm/models", get(api::admin_llm_models))
        .route(
            "/api/admin/llm/models/download",
            post(api::admin_llm_model_download),
        )
        .route(
            "/api/admin/llm/models/:name",
            delete(api::admin_llm_model_delete),
        )
        // Admin: transcripts / TTL
        .route("/api/admin/transcripts", get(api::admin_transcripts))
        .route("/api/admin/purge-expired", post(api::admin_purge_expired))
        // Admin: search index
        .route("/api/admin/search/rebuild", post(api::admin_rebuild_search))
        // Admin: stats
        .route("/api/admin/stats", get(api::admin_stats))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind and serve until the shutdown flag flips.
pub async fn start_server(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("API listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("API server shut down gracefully");
    Ok(())
}
