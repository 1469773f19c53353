// src/gateway/mod.rs
// Inbound/outbound gateway surface (C2's webhook boundary + health/metrics),
// per spec §5/§6. Grounded on the teacher's proxy/server.rs axum-Router
// shape and session/manager.rs per-conversation serialization, generalized
// here into a bounded, overflow-dropping mailbox per `conversation_id`.

pub mod dispatch;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{warn, Instrument};

use crate::preprocess::{PreprocessOutcome, RawWebhookMessage};
use crate::state::AppState;

pub use dispatch::ConversationDispatcher;

pub fn router(state: Arc<AppState>, dispatcher: Arc<ConversationDispatcher>) -> Router {
    let request_timeout = Duration::from_secs(state.config.workflow.turn_deadline_secs + 5);
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state((state, dispatcher))
}

/// Mirrors the Evolution-API-style webhook envelope named in spec §6:
/// `instance`, `event`, and a `data` envelope carrying the WhatsApp message.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    instance: String,
    #[serde(default)]
    event: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    key: WebhookKey,
    #[serde(default)]
    message: Option<WebhookMessage>,
    #[serde(rename = "messageTimestamp")]
    message_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WebhookKey {
    #[serde(rename = "remoteJid")]
    remote_jid: String,
    id: String,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookMessage {
    conversation: Option<String>,
    #[serde(rename = "extendedTextMessage")]
    extended_text_message: Option<WebhookExtendedText>,
}

#[derive(Debug, Deserialize)]
struct WebhookExtendedText {
    text: String,
}

const SECRET_HEADER: &str = "x-webhook-secret";
const CORRELATION_HEADER: &str = "x-request-id";

async fn webhook_handler(
    State((state, dispatcher)): State<(Arc<AppState>, Arc<ConversationDispatcher>)>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    // Reuse the caller's request id when the gateway forwards one (so a
    // redelivery can be correlated across both hops); otherwise mint one
    // here, since this is the first point the turn exists at all.
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let provided_secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let span = tracing::info_span!("webhook", correlation_id = %correlation_id);
    handle_webhook(state, dispatcher, payload, provided_secret, correlation_id)
        .instrument(span)
        .await
}

async fn handle_webhook(
    state: Arc<AppState>,
    dispatcher: Arc<ConversationDispatcher>,
    payload: WebhookPayload,
    provided_secret: String,
    correlation_id: String,
) -> axum::response::Response {
    // `connection.update` and other non-message events carry no text to
    // process; acknowledge them without entering C2.
    if payload.event != "messages.upsert" {
        return (StatusCode::OK, "ignored").into_response();
    }

    let text = payload
        .data
        .message
        .as_ref()
        .and_then(|m| {
            m.conversation
                .clone()
                .or_else(|| m.extended_text_message.as_ref().map(|e| e.text.clone()))
        })
        .unwrap_or_default();

    let ts = payload
        .data
        .message_timestamp
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let raw = RawWebhookMessage {
        conversation_id: payload.data.key.remote_jid.clone(),
        peer_id: payload.data.key.remote_jid,
        instance: payload.instance,
        text,
        message_id: payload.data.key.id,
        ts,
        provided_secret,
        correlation_id,
    };

    match state.preprocessor.process(raw) {
        PreprocessOutcome::Accepted(turn) => {
            dispatcher.dispatch(turn).await;
            (StatusCode::OK, "accepted").into_response()
        }
        PreprocessOutcome::Dropped {
            reason,
            conversation_id,
            instance,
        } => {
            if let Some(hint) = reason.template_hint() {
                dispatcher.reply_without_turn(conversation_id, instance, hint).await;
            }
            match reason {
                crate::preprocess::DropReason::Unauthenticated => {
                    (StatusCode::UNAUTHORIZED, "unauthenticated").into_response()
                }
                crate::preprocess::DropReason::RateLimited => {
                    (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response()
                }
                _ => (StatusCode::OK, "dropped").into_response(),
            }
        }
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State((state, _)): State<(Arc<AppState>, Arc<ConversationDispatcher>)>) -> impl IntoResponse {
    if state.degraded_features.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready", "degraded": [] }))).into_response()
    } else {
        warn!(features = ?state.degraded_features, "readiness check reporting degraded features");
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "degraded", "degraded": state.degraded_features })),
        )
            .into_response()
    }
}
