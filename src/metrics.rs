// src/metrics.rs
// Observability (C11), per spec §4.11: structured per-turn traces plus the
// Prometheus counters/histograms required by §4.10/§4.5/§4.8. Grounded on
// the teacher's metrics/mod.rs (`PrometheusBuilder::install_recorder`
// stashed in a `OnceLock`, an axum `metrics_handler`, a `Drop`-based timer)
// generalized from Mira's request/LLM-call metrics to this crate's turn,
// delivery and cost equivalents.

use std::sync::OnceLock;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-global Prometheus recorder. Must run once at
/// startup (C12, Critical phase) before any `metrics::counter!`/`histogram!`
/// call anywhere else in the crate.
pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");
    info!("metrics exporter initialized");
}

/// GET /metrics, exposed by the gateway's axum router.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()),
    }
}

/// The structured per-turn trace required by spec §4.11: one event per
/// completed turn carrying everything needed to reconstruct what happened
/// without replaying the conversation.
pub struct TurnTrace<'a> {
    pub conversation_id: &'a str,
    pub turn_id: &'a str,
    pub stage_from: &'a str,
    pub stage_to: &'a str,
    pub turn_duration_ms: u64,
    pub intent_label: &'a str,
    pub intent_confidence: f32,
    pub validator_action: &'a str,
    pub outbox_outcome: &'a str,
}

pub fn record_turn_trace(trace: &TurnTrace) {
    info!(
        conversation_id = trace.conversation_id,
        turn_id = trace.turn_id,
        stage_from = trace.stage_from,
        stage_to = trace.stage_to,
        turn_duration_ms = trace.turn_duration_ms,
        intent_label = trace.intent_label,
        intent_confidence = trace.intent_confidence,
        validator_action = trace.validator_action,
        outbox_outcome = trace.outbox_outcome,
        "turn completed"
    );
    metrics::histogram!("workflow_turn_duration_ms").record(trace.turn_duration_ms as f64);
}

/// Times an arbitrary in-flight operation and records it to a named
/// histogram on drop, regardless of which exit path is taken (panics
/// excepted). Used where a `?`-heavy function makes manual start/stop
/// bookkeeping error-prone.
pub struct StageTimer {
    start: Instant,
    histogram: &'static str,
}

impl StageTimer {
    pub fn start(histogram: &'static str) -> Self {
        Self { start: Instant::now(), histogram }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        metrics::histogram!(self.histogram).record(self.start.elapsed().as_millis() as f64);
    }
}
