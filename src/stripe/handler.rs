//! Stripe webhook endpoint
//!
//! `POST /webhooks/stripe` verifies the signature, deduplicates the event id,
//! queues the event and answers `200 {"received": true}` without waiting for
//! reconciliation. Only verification failures (400) and a full queue (503)
//! produce anything else.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use crate::stripe::config::StripeWebhookConfig;
use crate::stripe::error::StripeWebhookResult;
use crate::stripe::idempotency::{IdempotencyStore, RecordOutcome};
use crate::stripe::processor::{EventHandler, EventProcessor};
use crate::stripe::signature::SignatureVerifier;

/// Header Stripe puts the signature in
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Route the webhook is served on
pub const WEBHOOK_PATH: &str = "/webhooks/stripe";

/// Shared state of the webhook endpoint
pub struct StripeWebhookState<H: EventHandler, S: IdempotencyStore> {
    verifier: SignatureVerifier,
    processor: Arc<EventProcessor<H, S>>,
}

impl<H: EventHandler, S: IdempotencyStore> StripeWebhookState<H, S> {
    /// Create the endpoint state
    pub fn new(config: &StripeWebhookConfig, processor: Arc<EventProcessor<H, S>>) -> Self {
        Self {
            verifier: SignatureVerifier::new(&config.webhook_secret, config.signature_tolerance),
            processor,
        }
    }

    /// The processor events are queued on
    pub fn processor(&self) -> &Arc<EventProcessor<H, S>> {
        &self.processor
    }

    async fn receive(&self, headers: &HeaderMap, body: &[u8]) -> StripeWebhookResult<()> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        let event = self.verifier.construct_event(body, signature)?;

        let stats = self.processor.stats();
        stats.record_received();

        let store = self.processor.idempotency_store();
        let recorded = store.check_and_record(&event.id).await?;
        if !recorded.should_process() {
            stats.record_duplicate();
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook delivery acknowledged"
            );
            return Ok(());
        }
        if recorded == RecordOutcome::Retry {
            tracing::info!(event_id = %event.id, "Re-processing previously failed event");
        }

        let event_id = event.id.clone();
        tracing::debug!(event_id = %event_id, event_type = %event.event_type, "Queueing event");
        if let Err(e) = self.processor.queue_event(event) {
            // Let Stripe redeliver it later
            if let Err(release_err) = store.release(&event_id).await {
                tracing::error!(
                    event_id = %event_id,
                    error = %release_err,
                    "Failed to release idempotency record"
                );
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Axum handler for Stripe webhook deliveries
pub async fn stripe_webhook_handler<H: EventHandler, S: IdempotencyStore>(
    State(state): State<Arc<StripeWebhookState<H, S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.receive(&headers, &body).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "received": true }))).into_response(),
        Err(e) => {
            if e.is_rejection() {
                tracing::warn!(error = %e, "Rejected webhook delivery");
            } else {
                tracing::error!(error = %e, "Could not accept webhook delivery");
            }
            e.into_response()
        }
    }
}

/// Router serving the webhook endpoint
pub fn stripe_webhook_router<H: EventHandler, S: IdempotencyStore>(
    state: Arc<StripeWebhookState<H, S>>,
) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(stripe_webhook_handler::<H, S>))
        .with_state(state)
}
