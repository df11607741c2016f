//! Axum webhook endpoint: verify, acknowledge, defer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use murmur_slack::verify_signature;
use serde_json::json;
use tokio::net::TcpListener;

use crate::event::{EventContext, WebhookPayload};
use crate::pipeline::Pipeline;
use crate::supervisor::TaskSupervisor;

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
/// Tells Slack not to redeliver this event; retries are handled by the
/// background task, not by replaying the webhook.
const NO_RETRY_HEADER: &str = "x-slack-no-retry";

pub struct AppState {
    pub signing_secret: String,
    pub pipeline: Arc<Pipeline>,
    pub supervisor: Arc<TaskSupervisor>,
}

pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn build_webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/slack/events", post(handle_slack_events))
        .route("/healthz", get(handle_health))
        .with_state(state)
}

/// Binds the listener and serves the webhook router until ctrl-c.
pub async fn run_webhook_server(bind: &str, state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind webhook listener on {bind}"))?;
    let addr = listener
        .local_addr()
        .context("failed to read webhook listener address")?;
    tracing::info!(%addr, "webhook server listening");

    axum::serve(listener, build_webhook_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server terminated unexpectedly")
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.supervisor.snapshot();
    Json(json!({
        "ok": true,
        "tasks": {
            "submitted": snapshot.submitted,
            "completed": snapshot.completed,
            "failed": snapshot.failed,
        },
    }))
    .into_response()
}

/// Single Events API endpoint. Signature rejection happens before any
/// body parsing; event callbacks are acknowledged immediately and the
/// rest of the work runs in a supervised task after the response.
async fn handle_slack_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);
    if !verify_signature(
        &state.signing_secret,
        signature,
        timestamp,
        &body,
        current_unix_timestamp(),
    ) {
        tracing::warn!("rejected webhook with missing or invalid signature");
        return json_error(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(error = %error, "rejected malformed webhook body");
            return json_error(StatusCode::BAD_REQUEST, "malformed payload");
        }
    };

    match payload.payload_type.as_str() {
        "url_verification" => match payload.challenge {
            Some(challenge) => Json(json!({ "challenge": challenge })).into_response(),
            None => json_error(StatusCode::BAD_REQUEST, "missing challenge"),
        },
        "event_callback" => {
            let Some(event) = payload.event else {
                return json_error(StatusCode::BAD_REQUEST, "missing event");
            };
            let context = EventContext::from_event(payload.event_id.as_deref(), &event);
            tracing::info!(
                event_id = %context.event_id,
                event_type = %event.event_type,
                channel = %context.channel,
                "acknowledged event callback",
            );
            let pipeline = Arc::clone(&state.pipeline);
            state.supervisor.spawn(context, async move {
                pipeline.process_event(event).await.map(|_| ())
            });
            (
                StatusCode::OK,
                [(NO_RETRY_HEADER, "1")],
                Json(json!({ "ok": true })),
            )
                .into_response()
        }
        other => {
            tracing::warn!(payload_type = other, "rejected unsupported payload type");
            json_error(StatusCode::BAD_REQUEST, "unsupported payload type")
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
