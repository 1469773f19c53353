// src/outbox/delivery.rs
// Delivery worker and gateway sender (C10), per spec §4.10: per-conversation
// serialized, seq-ordered delivery with instance pinning, retry-with-backoff,
// and back-pressure. Grounded on the teacher's llm/provider.rs reqwest-client
// shape for the outbound HTTP call, and retry.rs (already shared with C5)
// for the retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::config::gateway::GatewayConfig;
use crate::config::workflow::OutboxConfig;
use crate::retry::retry_with_backoff;
use crate::workflow::{EnqueueTurn, OutboxEnqueuer, WorkflowError};

use super::{OutboxEntry, OutboxError, OutboxState, OutboxStore};

#[async_trait]
pub trait GatewaySender: Send + Sync {
    /// Sends one text message under the pinned `instance`, tagged with an
    /// idempotency key equal to `(conversation_id, turn_id, seq)` (spec §6).
    /// Returns the gateway's message id on success.
    async fn send_text(
        &self,
        instance: &str,
        peer_id: &str,
        text: &str,
        idempotency_key: &str,
        correlation_id: &str,
    ) -> Result<String, OutboxError>;
}

/// Real outbound client, POSTing to the configured gateway's send endpoint.
pub struct HttpGatewaySender {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGatewaySender {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl GatewaySender for HttpGatewaySender {
    async fn send_text(
        &self,
        instance: &str,
        peer_id: &str,
        text: &str,
        idempotency_key: &str,
        correlation_id: &str,
    ) -> Result<String, OutboxError> {
        let response = self
            .client
            .post(format!("{}/instances/{instance}/messages/send-text", self.config.send_base_url))
            .header("apikey", &self.config.send_auth_key)
            .header("Idempotency-Key", idempotency_key)
            .header("x-request-id", correlation_id)
            .json(&serde_json::json!({
                "number": peer_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OutboxError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(OutboxError::Fatal(format!("status {status}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;
        let gateway_msg_id = payload
            .get("key")
            .and_then(|k| k.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(gateway_msg_id)
    }
}

/// Used when no real gateway is wired up (local development, or tests that
/// exercise the orchestrator without a live WhatsApp bridge).
pub struct NullGatewaySender;

#[async_trait]
impl GatewaySender for NullGatewaySender {
    async fn send_text(
        &self,
        _instance: &str,
        _peer_id: &str,
        _text: &str,
        _idempotency_key: &str,
        _correlation_id: &str,
    ) -> Result<String, OutboxError> {
        Ok(Uuid::new_v4().to_string())
    }
}

/// Implements `OutboxEnqueuer` for C8. Owns planning, the handoff gate, and
/// in-process delivery; a per-gateway semaphore caps concurrency and a
/// per-conversation last-sent timestamp enforces the minimum inter-message
/// delay (spec §4.10 Back-pressure).
pub struct DeliveryCoordinator {
    store: Arc<OutboxStore>,
    sender: Arc<dyn GatewaySender>,
    config: OutboxConfig,
    allowed_instances: Vec<String>,
    gateway_semaphore: Arc<Semaphore>,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<OutboxStore>,
        sender: Arc<dyn GatewaySender>,
        config: OutboxConfig,
        allowed_instances: Vec<String>,
    ) -> Self {
        let permits = config.per_gateway_concurrency.max(1);
        Self {
            store,
            sender,
            config,
            allowed_instances,
            gateway_semaphore: Arc::new(Semaphore::new(permits)),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    async fn handle_turn(&self, turn: EnqueueTurn) -> Result<(), OutboxError> {
        if !self.allowed_instances.iter().any(|i| i == &turn.instance) {
            metrics::counter!("instance_violations_total").increment(1);
            return Err(OutboxError::InstanceNotAllowed(turn.instance));
        }

        let (entries, is_new) = self
            .store
            .plan_turn(&turn.conversation_id, &turn.turn_id, &turn.entries)
            .await?;
        if is_new {
            metrics::counter!("outbox_enqueued_total").increment(entries.len() as u64);
        }

        match self.store.admit_handoff(&turn.turn_id).await {
            Ok(()) => {}
            // A replay of a turn already fully handed off is a no-op, not a
            // violation (spec §4.10: "re-enqueue with the same key is a no-op").
            Err(OutboxError::AlreadyHandedOff) if !is_new => return Ok(()),
            Err(OutboxError::AlreadyHandedOff) => {
                metrics::counter!("outbox_handoff_violations_total").increment(1);
                return Err(OutboxError::AlreadyHandedOff);
            }
            Err(e) => return Err(e),
        }

        self.deliver(&turn, entries).await
    }

    async fn deliver(&self, turn: &EnqueueTurn, entries: Vec<OutboxEntry>) -> Result<(), OutboxError> {
        let _permit = self
            .gateway_semaphore
            .acquire()
            .await
            .expect("gateway semaphore is never closed");

        for entry in entries {
            if entry.state == OutboxState::Delivered {
                continue;
            }

            self.wait_for_min_delay(&turn.conversation_id).await;

            let idempotency_key = format!("{}:{}:{}", entry.conversation_id, entry.turn_id, entry.seq);
            self.store.mark_in_flight(&entry.id).await?;

            let started = Instant::now();
            let outcome = retry_with_backoff(
                self.config.delivery_retry.clone(),
                || {
                    self.sender.send_text(
                        &turn.instance,
                        &turn.peer_id,
                        &entry.payload,
                        &idempotency_key,
                        &turn.correlation_id,
                    )
                },
                |e: &OutboxError| matches!(e, OutboxError::Transient(_)),
            )
            .await;
            metrics::histogram!("delivery_latency_ms").record(started.elapsed().as_millis() as f64);

            match outcome {
                Ok(gateway_msg_id) => {
                    self.store.mark_delivered(&entry.id, &gateway_msg_id).await?;
                    metrics::counter!("outbox_delivered_total").increment(1);
                    self.touch_last_sent(&turn.conversation_id).await;
                }
                Err(e) => {
                    self.store.mark_failed(&entry.id, &e.to_string()).await?;
                    metrics::counter!("outbox_failed_total").increment(1);
                    warn!(
                        conversation_id = %turn.conversation_id,
                        turn_id = %turn.turn_id,
                        seq = entry.seq,
                        error = %e,
                        "delivery failed, later entries in this turn left undelivered"
                    );
                    // Never silently retry the remaining entries here; the
                    // conversation's state is already advanced and the next
                    // turn's routing decides whether to recover (spec §4.10).
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn wait_for_min_delay(&self, conversation_id: &str) {
        let min_delay = Duration::from_millis(self.config.min_inter_message_delay_ms);
        if min_delay.is_zero() {
            return;
        }
        let wait = {
            let last_sent = self.last_sent.lock().await;
            last_sent
                .get(conversation_id)
                .map(|t| min_delay.saturating_sub(t.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    async fn touch_last_sent(&self, conversation_id: &str) {
        self.last_sent.lock().await.insert(conversation_id.to_string(), Instant::now());
    }
}

#[async_trait]
impl OutboxEnqueuer for DeliveryCoordinator {
    async fn enqueue_turn(&self, turn: EnqueueTurn) -> Result<(), WorkflowError> {
        let span = tracing::info_span!("deliver_turn", correlation_id = %turn.correlation_id);
        self.handle_turn(turn)
            .instrument(span)
            .await
            .map_err(|e| WorkflowError::Outbox(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::OutboxEntryDraft;
    use sqlx::SqlitePool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSender {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GatewaySender for RecordingSender {
        async fn send_text(
            &self,
            _instance: &str,
            _peer_id: &str,
            _text: &str,
            _idempotency_key: &str,
            _correlation_id: &str,
        ) -> Result<String, OutboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("gw-{}", self.calls.load(Ordering::SeqCst)))
        }
    }

    struct AlwaysFailingSender;

    #[async_trait]
    impl GatewaySender for AlwaysFailingSender {
        async fn send_text(
            &self,
            _instance: &str,
            _peer_id: &str,
            _text: &str,
            _idempotency_key: &str,
            _correlation_id: &str,
        ) -> Result<String, OutboxError> {
            Err(OutboxError::Fatal("simulated rejection".into()))
        }
    }

    #[tokio::test]
    async fn http_gateway_sender_posts_idempotency_and_correlation_headers() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances/inst-1/messages/send-text"))
            .and(header("apikey", "secret-key"))
            .and(header("Idempotency-Key", "c1:t1:1"))
            .and(header("x-request-id", "corr-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "key": { "id": "gw-msg-1" }
            })))
            .mount(&server)
            .await;

        let sender = HttpGatewaySender::new(GatewayConfig {
            webhook_shared_secret: "s".into(),
            send_base_url: server.uri(),
            send_auth_key: "secret-key".into(),
            allowed_instances: vec!["inst-1".into()],
            startup_deadline_secs: 10,
        });

        let gateway_msg_id = sender
            .send_text("inst-1", "+5511999999999", "oi!", "c1:t1:1", "corr-abc")
            .await
            .unwrap();
        assert_eq!(gateway_msg_id, "gw-msg-1");
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            per_gateway_concurrency: 4,
            min_inter_message_delay_ms: 0,
            delivery_retry: crate::config::llm::RetryConfig {
                base_delay_ms: 1,
                factor: 1.0,
                jitter_pct: 0.0,
                max_attempts: 1,
                max_wall_ms: 1_000,
            },
        }
    }

    async fn turn_store() -> Arc<OutboxStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        OutboxStore::migrate(&pool).await.unwrap();
        Arc::new(OutboxStore::new(pool))
    }

    fn enqueue(conversation_id: &str, turn_id: &str) -> EnqueueTurn {
        EnqueueTurn {
            conversation_id: conversation_id.into(),
            turn_id: turn_id.into(),
            instance: "inst-1".into(),
            peer_id: "5511999999999".into(),
            entries: vec![
                OutboxEntryDraft { seq: 1, text: "oi!".into() },
                OutboxEntryDraft { seq: 2, text: "tudo bem?".into() },
            ],
            correlation_id: "corr-test".into(),
        }
    }

    #[tokio::test]
    async fn delivers_entries_in_order_and_marks_them_delivered() {
        let coordinator = DeliveryCoordinator::new(
            turn_store().await,
            Arc::new(RecordingSender { calls: AtomicUsize::new(0) }),
            config(),
            vec!["inst-1".into()],
        );

        coordinator.enqueue_turn(enqueue("c1", "t1")).await.unwrap();
        let entries = coordinator.store.list_for_turn("c1", "t1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.state == OutboxState::Delivered));
    }

    #[tokio::test]
    async fn rejects_instance_outside_allow_list() {
        let coordinator = DeliveryCoordinator::new(
            turn_store().await,
            Arc::new(NullGatewaySender),
            config(),
            vec!["other-instance".into()],
        );
        let err = coordinator.enqueue_turn(enqueue("c1", "t1")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Outbox(_)));
    }

    #[tokio::test]
    async fn reenqueue_of_same_turn_is_a_no_op() {
        let coordinator = DeliveryCoordinator::new(
            turn_store().await,
            Arc::new(RecordingSender { calls: AtomicUsize::new(0) }),
            config(),
            vec!["inst-1".into()],
        );
        coordinator.enqueue_turn(enqueue("c1", "t1")).await.unwrap();
        coordinator.enqueue_turn(enqueue("c1", "t1")).await.unwrap();
    }

    #[tokio::test]
    async fn persistent_failure_marks_entry_failed_and_stops_the_turn() {
        let coordinator = DeliveryCoordinator::new(
            turn_store().await,
            Arc::new(AlwaysFailingSender),
            config(),
            vec!["inst-1".into()],
        );
        let result = coordinator.enqueue_turn(enqueue("c1", "t1")).await;
        assert!(result.is_err());
        let entries = coordinator.store.list_for_turn("c1", "t1").await.unwrap();
        assert_eq!(entries[0].state, OutboxState::Failed);
        assert_eq!(entries[1].state, OutboxState::Ready);
    }
}
