// tests/end_to_end.rs
// End-to-end scenarios seeded from spec §8 (S1-S6), exercised against the
// real node catalogue and conversation store, with a null LLM/RAG/calendar
// stack and an in-memory recording outbox standing in for delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use kumon_receptionist::calendar::{BookingConfirmation, CalendarAdapter, CalendarError, NullCalendar, Slot};
use kumon_receptionist::config::business::{BusinessHoursConfig, HourWindow, PricingConfig, ScopeConfig};
use kumon_receptionist::config::gateway::GatewayConfig;
use kumon_receptionist::config::llm::{CircuitBreakerConfig, LlmConfig, RetryConfig};
use kumon_receptionist::config::rate_limit::RateLimitConfig;
use kumon_receptionist::config::server::{DatabaseConfig, LoggingConfig, ServerConfig};
use kumon_receptionist::config::workflow::{ConfidenceThresholds, OutboxConfig, WorkflowConfig};
use kumon_receptionist::config::Config;
use kumon_receptionist::conversation::store::ConversationStore;
use kumon_receptionist::conversation::{Conversation, Stage, Step};
use kumon_receptionist::intent::HeuristicClassifier;
use kumon_receptionist::llm::budget::BudgetTracker;
use kumon_receptionist::llm::LlmGateway;
use kumon_receptionist::preprocess::{AcceptedTurn, DropReason, Preprocessor, PreprocessOutcome, RawWebhookMessage};
use kumon_receptionist::rag::NullRag;
use kumon_receptionist::rules::BusinessRules;
use kumon_receptionist::template::{BundledRegistry, TemplateResolver};
use kumon_receptionist::validate::ResponseValidator;
use kumon_receptionist::workflow::nodes::{
    ConfirmationNode, FallbackLevel1Node, GreetingNode, HandoffNode, InformationGatheringNode, QualificationNode,
    SchedulingNode,
};
use kumon_receptionist::workflow::{EnqueueTurn, Node, Orchestrator, OutboxEnqueuer, Services, WorkflowError};

const SECRET: &str = "test-shared-secret";

struct RecordingOutbox {
    turns: Mutex<Vec<EnqueueTurn>>,
}

impl RecordingOutbox {
    fn new() -> Self {
        Self { turns: Mutex::new(Vec::new()) }
    }

    fn batches(&self) -> Vec<EnqueueTurn> {
        self.turns.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboxEnqueuer for RecordingOutbox {
    async fn enqueue_turn(&self, turn: EnqueueTurn) -> Result<(), WorkflowError> {
        self.turns.lock().unwrap().push(turn);
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        server: ServerConfig { host: "0.0.0.0".into(), port: 8080 },
        database: DatabaseConfig { url: "sqlite::memory:".into(), max_connections: 5 },
        logging: LoggingConfig { level: "info".into(), json: false },
        hours: BusinessHoursConfig {
            timezone: "America/Sao_Paulo".into(),
            windows: vec![
                HourWindow { start_minute: 8 * 60, end_minute: 12 * 60 },
                HourWindow { start_minute: 14 * 60, end_minute: 17 * 60 },
            ],
        },
        pricing: PricingConfig { monthly_amount: "R$ 375".into(), material_amount: "R$ 100".into() },
        scope: ScopeConfig {
            allowed_topics: vec![
                "greeting".into(),
                "qualification".into(),
                "method".into(),
                "pricing".into(),
                "scheduling".into(),
                "confirmation".into(),
                "handoff".into(),
                "fallback".into(),
            ],
        },
        llm: LlmConfig {
            daily_budget_limit: 5.0,
            retry: RetryConfig::llm_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: vec![],
        },
        rate_limit: RateLimitConfig { per_peer_per_minute: 100, per_peer_burst: 20, global_per_minute: 10_000 },
        workflow: WorkflowConfig {
            turn_deadline_secs: 20,
            turn_queue_depth: 8,
            max_failed_attempts: 5,
            max_consecutive_confusion: 3,
            validator_max_retries: 3,
            confidence: ConfidenceThresholds::default(),
            checkpoint_retention: 50,
        },
        outbox: OutboxConfig {
            per_gateway_concurrency: 4,
            min_inter_message_delay_ms: 0,
            delivery_retry: RetryConfig::delivery_default(),
        },
        gateway: GatewayConfig {
            webhook_shared_secret: SECRET.into(),
            send_base_url: "http://localhost:9000".into(),
            send_auth_key: String::new(),
            allowed_instances: vec!["inst-1".into()],
            startup_deadline_secs: 10,
        },
        rag_enabled: false,
        calendar_enabled: false,
    }
}

async fn build_orchestrator() -> (Orchestrator, Arc<ConversationStore>, Arc<RecordingOutbox>) {
    let config = test_config();

    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    ConversationStore::migrate(&pool).await.unwrap();
    let store = Arc::new(ConversationStore::new(pool));

    let budget_pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    BudgetTracker::migrate(&budget_pool).await.unwrap();
    let budget = Arc::new(BudgetTracker::new(budget_pool, config.llm.daily_budget_limit));
    let llm = Arc::new(LlmGateway::new(&config.llm, budget, vec![]));

    let rules = Arc::new(BusinessRules::new(config.hours.clone(), config.pricing.clone(), config.scope.clone()));
    let validator = Arc::new(ResponseValidator::new(rules.clone()));
    let templates = Arc::new(TemplateResolver::new(vec![Box::new(BundledRegistry::new())]));

    let services = Services {
        llm,
        rag: Arc::new(NullRag),
        templates,
        rules,
        calendar: Arc::new(NullCalendar),
    };

    let mut nodes: HashMap<Stage, Box<dyn Node>> = HashMap::new();
    nodes.insert(Stage::Greeting, Box::new(GreetingNode));
    nodes.insert(Stage::Qualification, Box::new(QualificationNode));
    nodes.insert(Stage::InformationGathering, Box::new(InformationGatheringNode));
    nodes.insert(Stage::Scheduling, Box::new(SchedulingNode));
    nodes.insert(Stage::Confirmation, Box::new(ConfirmationNode));
    nodes.insert(Stage::Fallback, Box::new(FallbackLevel1Node));
    nodes.insert(Stage::Handoff, Box::new(HandoffNode));

    let outbox = Arc::new(RecordingOutbox::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(HeuristicClassifier::new()),
        validator,
        nodes,
        services,
        config.workflow.clone(),
        outbox.clone(),
    );
    (orchestrator, store, outbox)
}

fn turn(conversation_id: &str, message_id: &str, text: &str) -> AcceptedTurn {
    AcceptedTurn {
        conversation_id: conversation_id.to_string(),
        peer_id: "+5551999999999".to_string(),
        instance: "inst-1".to_string(),
        text: text.to_string(),
        normalized_text: text.to_lowercase(),
        message_id: message_id.to_string(),
        ts: Utc::now(),
        correlation_id: "corr-test".to_string(),
    }
}

// S1 — Greeting -> qualification.
#[tokio::test]
async fn s1_greeting_then_qualification() {
    let (orchestrator, _store, _outbox) = build_orchestrator().await;

    let first = orchestrator.run_turn(turn("s1", "m1", "Oi")).await.unwrap();
    assert_eq!(first.emissions.len(), 1);
    assert!(first.emissions[0].text.contains("nome"));
    assert_eq!(first.conversation.stage, Stage::Greeting);
    assert_eq!(first.conversation.step, Step::CollectParentName);

    let second = orchestrator.run_turn(turn("s1", "m2", "Maria")).await.unwrap();
    assert_eq!(second.conversation.collected_data.parent_name.as_deref(), Some("Maria"));
    assert_eq!(second.conversation.stage, Stage::Qualification);
    assert_eq!(second.emissions.len(), 1);
}

// S2 — Pricing question.
#[tokio::test]
async fn s2_pricing_question_quotes_exact_amounts() {
    let (orchestrator, store, _outbox) = build_orchestrator().await;

    let mut conv = Conversation::new("s2".into(), "+5551999999999".into(), "inst-1".into());
    conv.stage = Stage::InformationGathering;
    conv.collected_data.parent_name = Some("Maria".into());
    conv.collected_data.child_name = Some("Joao".into());
    conv.collected_data.child_age = Some(9);
    store.create(conv).await.unwrap();

    let result = orchestrator.run_turn(turn("s2", "m1", "Quanto custa?")).await.unwrap();
    assert_eq!(result.emissions.len(), 1);
    let text = &result.emissions[0].text;
    assert!(text.contains("R$ 375"));
    assert!(text.contains("R$ 100"));
    let money_mentions: Vec<&str> = text.matches("R$").collect();
    assert_eq!(money_mentions.len(), 2, "only the two allowed amounts should appear: {text}");
}

// S3 — Out-of-hours: the preprocessor drops the turn before the workflow
// ever sees it, so it never creates or advances conversation state.
#[tokio::test]
async fn s3_out_of_hours_drops_before_reaching_the_workflow() {
    let config = test_config();
    let preprocessor = Preprocessor::new(&config);
    let (orchestrator, store, _outbox) = build_orchestrator().await;

    // 22:30 on a weekday, outside both configured windows.
    let after_hours = Utc.with_ymd_and_hms(2026, 8, 4, 22, 30, 0).unwrap();
    let raw = RawWebhookMessage {
        conversation_id: "s3".into(),
        peer_id: "+5551999999999".into(),
        instance: "inst-1".into(),
        text: "Oi, alguém aí?".into(),
        message_id: "m1".into(),
        ts: after_hours,
        provided_secret: SECRET.into(),
        correlation_id: "corr-s3".into(),
    };

    // Mirrors the gateway handler: only an Accepted outcome ever reaches
    // `run_turn`, so a Dropped turn never creates or advances a conversation.
    match preprocessor.process(raw) {
        PreprocessOutcome::Dropped { reason, .. } => {
            assert_eq!(reason, DropReason::DeferredToHours);
            assert_eq!(reason.template_hint(), Some("kumon:fallback:error:after_hours"));
        }
        PreprocessOutcome::Accepted(turn) => {
            let _ = orchestrator.run_turn(turn).await;
            panic!("expected the after-hours gate to drop the turn");
        }
    }

    assert!(store.load("s3").await.unwrap().is_none(), "an out-of-hours drop must never create conversation state");
}

// S4 — Scope refusal.
#[tokio::test]
async fn s4_scope_refusal_redirects_without_advancing() {
    let (orchestrator, _store, _outbox) = build_orchestrator().await;

    let result = orchestrator.run_turn(turn("s4", "m1", "Qual a capital da França?")).await.unwrap();
    assert_eq!(result.emissions.len(), 1);
    assert!(result.emissions[0].text.contains("Kumon"));
    assert!(!result.emissions[0].is_llm_generated);
    assert_eq!(result.conversation.stage, Stage::Greeting, "a scope refusal must not move the conversation forward");
}

// S5 — Duplicate webhook.
#[tokio::test]
async fn s5_duplicate_webhook_delivers_exactly_once() {
    let config = test_config();
    let preprocessor = Preprocessor::new(&config);
    let (orchestrator, _store, outbox) = build_orchestrator().await;

    let raw = RawWebhookMessage {
        conversation_id: "s5".into(),
        peer_id: "+5551999999999".into(),
        instance: "inst-1".into(),
        text: "Oi".into(),
        message_id: "m1".into(),
        ts: Utc::now(),
        provided_secret: SECRET.into(),
        correlation_id: "corr-s5".into(),
    };

    let first_outcome = preprocessor.process(raw.clone());
    let accepted = match first_outcome {
        PreprocessOutcome::Accepted(turn) => turn,
        PreprocessOutcome::Dropped { .. } => panic!("first delivery must be accepted"),
    };
    orchestrator.run_turn(accepted).await.unwrap();

    // The gateway replays the exact same payload (same message_id).
    match preprocessor.process(raw) {
        PreprocessOutcome::Dropped { reason, .. } => assert_eq!(reason, DropReason::Duplicate),
        PreprocessOutcome::Accepted(_) => panic!("replay must be caught by dedupe"),
    }

    assert_eq!(outbox.batches().len(), 1, "exactly one outbox batch must be delivered");
}

// Confirmation stage splits a booking into two sequenced entries instead of
// folding the address into the confirmation template.
#[tokio::test]
async fn confirmation_emits_booking_and_address_as_two_entries() {
    let (orchestrator, store, _outbox) = build_orchestrator().await;

    let mut conv = Conversation::new("confirm-1".into(), "+5551999999999".into(), "inst-1".into());
    conv.stage = Stage::Confirmation;
    conv.step = Step::BookSlot;
    conv.collected_data.parent_name = Some("Maria".into());
    conv.collected_data.contact_email = Some("maria@example.com".into());
    conv.collected_data.selected_slot = Some(Utc::now().to_rfc3339());
    store.create(conv).await.unwrap();

    let result = orchestrator.run_turn(turn("confirm-1", "m1", "Confirmo")).await.unwrap();
    assert_eq!(result.emissions.len(), 2, "booking + address must be two separate entries");
    assert!(result.emissions[0].text.contains("Visita confirmada"));
    assert!(result.emissions[1].text.contains("Rua das Flores"));
}

struct AlwaysContentionCalendar;

#[async_trait]
impl CalendarAdapter for AlwaysContentionCalendar {
    async fn list_free_slots(
        &self,
        date_range: (chrono::DateTime<Utc>, chrono::DateTime<Utc>),
        duration: chrono::Duration,
    ) -> Result<Vec<Slot>, CalendarError> {
        let (from, _to) = date_range;
        Ok(vec![Slot { start: from, end: from + duration }])
    }

    async fn book_slot(&self, slot: Slot, _attendee: &str, _notes: &str) -> Result<BookingConfirmation, CalendarError> {
        Err(CalendarError::Contention(slot))
    }
}

// A slot taken on both the original attempt and the single retry escalates
// to the clarification ladder with a scoped apology, not a raw error.
#[tokio::test]
async fn confirmation_escalates_to_fallback_after_repeated_contention() {
    let config = test_config();

    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    ConversationStore::migrate(&pool).await.unwrap();
    let store = Arc::new(ConversationStore::new(pool));

    let budget_pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    BudgetTracker::migrate(&budget_pool).await.unwrap();
    let budget = Arc::new(BudgetTracker::new(budget_pool, config.llm.daily_budget_limit));
    let llm = Arc::new(LlmGateway::new(&config.llm, budget, vec![]));

    let rules = Arc::new(BusinessRules::new(config.hours.clone(), config.pricing.clone(), config.scope.clone()));
    let validator = Arc::new(ResponseValidator::new(rules.clone()));
    let templates = Arc::new(TemplateResolver::new(vec![Box::new(BundledRegistry::new())]));
    let services = Services {
        llm,
        rag: Arc::new(NullRag),
        templates,
        rules,
        calendar: Arc::new(AlwaysContentionCalendar),
    };

    let mut nodes: HashMap<Stage, Box<dyn Node>> = HashMap::new();
    nodes.insert(Stage::Confirmation, Box::new(ConfirmationNode));
    nodes.insert(Stage::Fallback, Box::new(FallbackLevel1Node));

    let outbox = Arc::new(RecordingOutbox::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(HeuristicClassifier::new()),
        validator,
        nodes,
        services,
        config.workflow.clone(),
        outbox,
    );

    let mut conv = Conversation::new("confirm-2".into(), "+5551999999999".into(), "inst-1".into());
    conv.stage = Stage::Confirmation;
    conv.step = Step::BookSlot;
    conv.collected_data.parent_name = Some("Maria".into());
    conv.collected_data.contact_email = Some("maria@example.com".into());
    conv.collected_data.selected_slot = Some(Utc::now().to_rfc3339());
    store.create(conv).await.unwrap();

    let result = orchestrator.run_turn(turn("confirm-2", "m1", "Confirmo")).await.unwrap();
    assert_eq!(result.emissions.len(), 1);
    assert_eq!(result.conversation.stage, Stage::Fallback, "repeated contention must escalate to the fallback ladder, not error out or jump to handoff");
}

// S6 — Handoff escalation.
#[tokio::test]
async fn s6_five_low_confidence_turns_reach_handoff() {
    let (orchestrator, _store, _outbox) = build_orchestrator().await;

    let gibberish = ["xyz123", "qwe456", "asd789", "zxc012", "vbn345"];
    let mut last = None;
    for (i, text) in gibberish.iter().enumerate() {
        let result = orchestrator.run_turn(turn("s6", &format!("m{i}"), text)).await.unwrap();
        last = Some(result);
        if last.as_ref().unwrap().conversation.stage == Stage::Handoff {
            break;
        }
    }
    let last = last.unwrap();
    assert_eq!(last.conversation.stage, Stage::Handoff, "5 consecutive low-confidence turns must reach handoff");
    assert_eq!(last.emissions.len(), 1);

    // Subsequent inbound messages stay pinned to the handoff closing template.
    let followup = orchestrator.run_turn(turn("s6", "m-followup", "oi de novo")).await.unwrap();
    assert_eq!(followup.conversation.stage, Stage::Handoff);
    assert_eq!(followup.emissions.len(), 1);
}
