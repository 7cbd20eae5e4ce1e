// Push subscription endpoint

use super::ApiError;
use crate::server::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

/// Browser PushSubscription JSON shape.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// POST /api/push/subscribe
pub async fn push_subscribe(
    State(state): State<AppState>,
    Json(body): Json<SubscribeRequest>,
) -> Result<StatusCode, ApiError> {
    if body.endpoint.is_empty() {
        return Err(ApiError::BadRequest("endpoint must not be empty".to_string()));
    }
    state.store.save_push_subscription(
        &body.endpoint,
        &body.keys.p256dh,
        &body.keys.auth,
        body.user_agent.as_deref(),
    )?;
    Ok(StatusCode::CREATED)
}
