// src/workflow/mod.rs
// Workflow orchestrator (C8), per spec §4.8: a state graph parameterized
// over the conversation state model. Grounded on the teacher's
// operations/engine/orchestration.rs shape (a facade composing the other
// services, one `run_operation`-style entry point with an error-handling
// wrapper) and session/manager.rs for per-conversation turn sequencing.

pub mod nodes;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::CalendarAdapter;
use crate::config::workflow::{ConfidenceThresholds, WorkflowConfig};
use crate::conversation::{Conversation, ConversationError, Message, Role, Stage, Step};
use crate::conversation::store::ConversationStore;
use crate::intent::{ClassifyContext, ConfidenceBand, Intent, IntentClassifier};
use crate::llm::LlmGateway;
use crate::preprocess::AcceptedTurn;
use crate::rag::RagRetriever;
use crate::rules::BusinessRules;
use crate::template::TemplateResolver;
use crate::validate::{ResponseValidator, ValidateContext, ValidatorAction};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),
    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),
    #[error("calendar error: {0}")]
    Calendar(#[from] crate::calendar::CalendarError),
    #[error("outbox enqueue failed: {0}")]
    Outbox(String),
    #[error("turn deadline exceeded")]
    DeadlineExceeded,
}

/// Sparse overwrite of `CollectedData`; `None` fields are left untouched,
/// matching the "nodes are pure given their inputs" contract without
/// threading arbitrary mutation closures through replay.
#[derive(Debug, Clone, Default)]
pub struct CollectedDataPatch {
    pub parent_name: Option<String>,
    pub child_name: Option<String>,
    pub child_age: Option<u8>,
    pub contact_email: Option<String>,
    pub selected_slot: Option<String>,
    pub program_of_interest: Option<String>,
    pub date_preference: Option<String>,
}

impl CollectedDataPatch {
    fn apply(self, data: &mut crate::conversation::CollectedData) {
        if let Some(v) = self.parent_name {
            data.parent_name = Some(v);
        }
        if let Some(v) = self.child_name {
            data.child_name = Some(v);
        }
        if let Some(v) = self.child_age {
            data.child_age = Some(v);
        }
        if let Some(v) = self.contact_email {
            data.contact_email = Some(v);
        }
        if let Some(v) = self.selected_slot {
            data.selected_slot = Some(v);
        }
        if let Some(v) = self.program_of_interest {
            data.programs_of_interest.insert(v);
        }
        if let Some(v) = self.date_preference {
            data.date_preferences.push(v);
        }
    }
}

/// A candidate outbound message, not yet sent (spec §4.8 node contract).
#[derive(Debug, Clone)]
pub struct Emission {
    pub text: String,
    pub topic: String,
    pub is_llm_generated: bool,
}

/// Whether this turn's interaction should be scored as a capture success,
/// confusion, or failure — feeds the Handoff thresholds (spec §3 invariant v).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Success,
    Confusion,
    Failure,
    Neutral,
}

#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub patch: CollectedDataPatch,
    pub emissions: Vec<Emission>,
    pub next_edge_hint: Option<Stage>,
    pub outcome: TurnOutcome,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            patch: CollectedDataPatch::default(),
            emissions: Vec::new(),
            next_edge_hint: None,
            outcome: TurnOutcome::Neutral,
        }
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NodeContext<'a> {
    pub conversation: &'a Conversation,
    pub accepted: &'a AcceptedTurn,
    pub intent: &'a Intent,
    /// Set when C9 requested a retry of the draft reply with a hint
    /// (spec §4.8 step 6); `None` on the first attempt.
    pub retry_hint: Option<&'a str>,
}

pub struct Services {
    pub llm: Arc<LlmGateway>,
    pub rag: Arc<dyn RagRetriever>,
    pub templates: Arc<TemplateResolver>,
    pub rules: Arc<BusinessRules>,
    pub calendar: Arc<dyn CalendarAdapter>,
}

#[async_trait]
pub trait Node: Send + Sync {
    fn stage(&self) -> Stage;
    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError>;
}

#[derive(Debug, Clone)]
pub struct OutboxEntryDraft {
    pub seq: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct EnqueueTurn {
    pub conversation_id: String,
    pub turn_id: String,
    pub instance: String,
    pub peer_id: String,
    pub entries: Vec<OutboxEntryDraft>,
    pub correlation_id: String,
}

/// The single consumer of a turn's emissions (C10, built separately). The
/// orchestrator depends only on this trait so it can be built and tested
/// before the delivery coordinator exists.
#[async_trait]
pub trait OutboxEnqueuer: Send + Sync {
    async fn enqueue_turn(&self, turn: EnqueueTurn) -> Result<(), WorkflowError>;
}

pub struct TurnResult {
    pub conversation: Conversation,
    pub emissions: Vec<Emission>,
}

pub struct Orchestrator {
    store: Arc<ConversationStore>,
    classifier: Arc<dyn IntentClassifier>,
    validator: Arc<ResponseValidator>,
    nodes: HashMap<Stage, Box<dyn Node>>,
    services: Services,
    config: WorkflowConfig,
    outbox: Arc<dyn OutboxEnqueuer>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        classifier: Arc<dyn IntentClassifier>,
        validator: Arc<ResponseValidator>,
        nodes: HashMap<Stage, Box<dyn Node>>,
        services: Services,
        config: WorkflowConfig,
        outbox: Arc<dyn OutboxEnqueuer>,
    ) -> Self {
        Self {
            store,
            classifier,
            validator,
            nodes,
            services,
            config,
            outbox,
        }
    }

    /// Exposes the conversation store so the gateway can write an expiry
    /// checkpoint when a turn blows its deadline without re-entering `run_turn`.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Executes the ten-step turn loop of spec §4.8 for one accepted inbound
    /// message. Idempotent on `message_id`: a replayed turn is caught by
    /// `Conversation::append_message`'s duplicate check and returns the
    /// conversation unchanged rather than re-emitting.
    pub async fn run_turn(&self, accepted: AcceptedTurn) -> Result<TurnResult, WorkflowError> {
        // The caller (`ConversationDispatcher::run_one`) wraps this whole call
        // in a span carrying `correlation_id`, so every `info!`/`warn!`/
        // `error!` below inherits it without repeating it at each call site.
        let turn_started = std::time::Instant::now();

        // 1. Load or create state (C1).
        let existing = self.store.load(&accepted.conversation_id).await?;
        if existing.is_none() {
            let conv = Conversation::new(
                accepted.conversation_id.clone(),
                accepted.peer_id.clone(),
                accepted.instance.clone(),
            );
            self.store.create(conv).await?;
        }

        // 2. Append user message (invariant-checked, idempotent on message_id).
        let conv = match self
            .store
            .append_message(
                &accepted.conversation_id,
                Message {
                    role: Role::User,
                    text: accepted.text.clone(),
                    ts: accepted.ts,
                    message_id: accepted.message_id.clone(),
                },
                "user_message",
            )
            .await
        {
            Ok(conv) => conv,
            Err(ConversationError::InvariantViolation { which }) if which.contains("duplicate") => {
                info!(conversation_id = %accepted.conversation_id, "turn already applied, no-op replay");
                let conv = self.store.load(&accepted.conversation_id).await?.ok_or_else(|| {
                    ConversationError::NotFound(accepted.conversation_id.clone())
                })?;
                return Ok(TurnResult { conversation: conv, emissions: vec![] });
            }
            Err(e) => return Err(e.into()),
        };

        // 3. (C2 gates already ran at the webhook boundary.)

        // 4. Classify (C3).
        let ctx = ClassifyContext {
            stage: conv.stage,
            recent_messages: &conv.messages,
        };
        let intent = self.classifier.classify(&accepted.normalized_text, &ctx);
        let stage_from = conv.stage;

        // Handoff / fallback routing takes priority over normal dispatch.
        let routed_stage = self.route(&conv, &intent);

        // 5-6. Dispatch the node, validating any LLM-generated draft (C9).
        let (patch, emissions, outcome, next_hint, validator_action) =
            self.dispatch_with_validation(&conv, &accepted, &intent, routed_stage).await?;

        // 7. Select the next edge; update stage/step. The stage-complete
        // predicate looks at the state *after* this turn's delta, not the
        // state the node was dispatched against.
        let mut projected_data = conv.collected_data.clone();
        patch.clone().apply(&mut projected_data);
        let next_stage = self.next_stage(conv.stage, &projected_data, &intent, routed_stage, next_hint);

        let turn_id = uuid::Uuid::new_v4().to_string();
        let reason = format!("turn:{turn_id}");
        let emissions_for_mutation = emissions.clone();
        let turn_id_for_mutation = turn_id.clone();
        let conv = self
            .store
            .mutate(&accepted.conversation_id, &reason.clone(), move |c| {
                patch.apply(&mut c.collected_data);
                match outcome {
                    TurnOutcome::Success => c.record_success(),
                    TurnOutcome::Confusion => c.record_confusion(),
                    TurnOutcome::Failure => c.record_failure(),
                    TurnOutcome::Neutral => {}
                }
                if c.stage != next_stage {
                    c.transition(next_stage, reason.clone());
                }
                c.step = step_for(next_stage);
                for emission in &emissions_for_mutation {
                    c.append_message(Message {
                        role: Role::Assistant,
                        text: emission.text.clone(),
                        ts: chrono::Utc::now(),
                        message_id: format!("{turn_id_for_mutation}-{}", c.messages.len()),
                    })?;
                }
                Ok(())
            })
            .await?;

        // 8. Checkpoint already written as part of `mutate` (C1 invariant).

        let turn_id_for_trace = turn_id.clone();

        // 9-10. Enqueue emissions atomically to the outbox, then signal ready.
        let outbox_outcome = if emissions.is_empty() {
            "none"
        } else {
            let entries = emissions
                .iter()
                .enumerate()
                .map(|(i, e)| OutboxEntryDraft {
                    seq: i as u32 + 1,
                    text: e.text.clone(),
                })
                .collect();
            self.outbox
                .enqueue_turn(EnqueueTurn {
                    conversation_id: accepted.conversation_id.clone(),
                    turn_id,
                    instance: accepted.instance.clone(),
                    peer_id: accepted.peer_id.clone(),
                    entries,
                    correlation_id: accepted.correlation_id.clone(),
                })
                .await?;
            "enqueued"
        };

        metrics::counter!("workflow_stage_transitions_total", "to" => next_stage.as_str()).increment(1);
        crate::metrics::record_turn_trace(&crate::metrics::TurnTrace {
            conversation_id: &accepted.conversation_id,
            turn_id: &turn_id_for_trace,
            stage_from: stage_from.as_str(),
            stage_to: next_stage.as_str(),
            turn_duration_ms: turn_started.elapsed().as_millis() as u64,
            intent_label: intent.label.as_str(),
            intent_confidence: intent.confidence,
            validator_action: validator_action.as_str(),
            outbox_outcome,
        });
        Ok(TurnResult { conversation: conv, emissions })
    }

    /// Escalation and fallback routing per spec §4.8's conditional-edge
    /// examples, evaluated before the stage's own node runs.
    fn route(&self, conv: &Conversation, intent: &Intent) -> Stage {
        if conv.metrics.failed_attempts >= self.config.max_failed_attempts
            || conv.metrics.consecutive_confusion >= self.config.max_consecutive_confusion
            || matches!(intent.label, crate::intent::IntentLabel::HumanHandoffRequest)
        {
            return Stage::Handoff;
        }
        // An out-of-scope ask is routed on the label itself, not confidence:
        // the classifier is highly confident the question is out of scope,
        // which is exactly why it must not reach a stage node (spec §4.7's
        // scope refusal, tested by S4).
        if matches!(intent.label, crate::intent::IntentLabel::OutOfScope) {
            return Stage::Fallback;
        }
        match ConfidenceBand::of(intent.confidence, &self.config.confidence) {
            ConfidenceBand::Floor => Stage::Fallback,
            ConfidenceBand::Low => Stage::Fallback,
            ConfidenceBand::Medium | ConfidenceBand::High => conv.stage,
        }
    }

    async fn dispatch_with_validation(
        &self,
        conv: &Conversation,
        accepted: &AcceptedTurn,
        intent: &Intent,
        stage: Stage,
    ) -> Result<(CollectedDataPatch, Vec<Emission>, TurnOutcome, Option<Stage>, ValidatorAction), WorkflowError> {
        let node = self
            .nodes
            .get(&stage)
            .ok_or_else(|| WorkflowError::Outbox(format!("no node registered for stage {stage:?}")))?;

        let mut retry_hint: Option<String> = None;
        let mut retry_count = 0u32;

        loop {
            let node_ctx = NodeContext {
                conversation: conv,
                accepted,
                intent,
                retry_hint: retry_hint.as_deref(),
            };
            let mut output = node.run(&node_ctx, &self.services).await?;

            let llm_emission_idx = output.emissions.iter().position(|e| e.is_llm_generated);
            let Some(idx) = llm_emission_idx else {
                return Ok((
                    output.patch,
                    output.emissions,
                    output.outcome,
                    output.next_edge_hint,
                    ValidatorAction::Approve,
                ));
            };

            let verdict = self.validator.validate(
                &output.emissions[idx].text,
                &ValidateContext {
                    topic: &output.emissions[idx].topic,
                    last_user_message: &accepted.text,
                    retry_count,
                    max_retries: self.config.validator_max_retries,
                },
            );

            match verdict.action {
                ValidatorAction::Approve => {
                    return Ok((
                        output.patch,
                        output.emissions,
                        output.outcome,
                        output.next_edge_hint,
                        ValidatorAction::Approve,
                    ))
                }
                ValidatorAction::Retry => {
                    warn!(conversation_id = %conv.conversation_id, retry_count, "validator requested retry");
                    retry_hint = Some(
                        verdict
                            .issues
                            .first()
                            .map(|i| i.message.clone())
                            .unwrap_or_else(|| "please rephrase".to_string()),
                    );
                    retry_count += 1;
                    continue;
                }
                ValidatorAction::Block => {
                    let refusal = self.services.templates.resolve("kumon:fallback:error:scope_refusal", "prod")?;
                    let text = self
                        .services
                        .templates
                        .render(&refusal, &HashMap::new(), &conv.collected_data)?;
                    output.emissions[idx] = Emission {
                        text,
                        topic: "fallback".to_string(),
                        is_llm_generated: false,
                    };
                    return Ok((
                        output.patch,
                        output.emissions,
                        TurnOutcome::Failure,
                        output.next_edge_hint,
                        ValidatorAction::Block,
                    ));
                }
                ValidatorAction::Escalate => {
                    let closing = self.services.templates.resolve("kumon:fallback:handoff:closing", "prod")?;
                    let text = self
                        .services
                        .templates
                        .render(&closing, &HashMap::new(), &conv.collected_data)?;
                    return Ok((
                        CollectedDataPatch::default(),
                        vec![Emission { text, topic: "handoff".to_string(), is_llm_generated: false }],
                        TurnOutcome::Failure,
                        Some(Stage::Handoff),
                        ValidatorAction::Escalate,
                    ));
                }
            }
        }
    }

    fn next_stage(
        &self,
        current_stage: Stage,
        projected_data: &crate::conversation::CollectedData,
        intent: &Intent,
        routed: Stage,
        hint: Option<Stage>,
    ) -> Stage {
        if let Some(hint) = hint {
            return hint;
        }
        if routed == Stage::Handoff || routed == Stage::Fallback {
            return routed;
        }
        match (current_stage, intent.label) {
            (Stage::Greeting, _) if projected_data.parent_name.is_some() => Stage::Qualification,
            (Stage::Qualification, _)
                if projected_data.child_name.is_some() && projected_data.child_age.is_some() =>
            {
                Stage::InformationGathering
            }
            (Stage::InformationGathering, crate::intent::IntentLabel::AskScheduling) => Stage::Scheduling,
            (Stage::Scheduling, _)
                if projected_data.selected_slot.is_some() && projected_data.contact_email.is_some() =>
            {
                Stage::Confirmation
            }
            (Stage::Confirmation, crate::intent::IntentLabel::ConfirmBooking) => Stage::Completed,
            (stage, _) => stage,
        }
    }
}

fn step_for(stage: Stage) -> Step {
    match stage {
        Stage::Greeting => Step::CollectParentName,
        Stage::Qualification => Step::CollectChildAge,
        Stage::InformationGathering => Step::AnsweringQuestions,
        Stage::Scheduling => Step::OfferSlots,
        Stage::Confirmation => Step::BookSlot,
        Stage::Completed => Step::Done,
        Stage::Handoff => Step::HandoffClosing,
        Stage::Fallback => Step::FallbackLevel1,
        Stage::Validation => Step::AnsweringQuestions,
    }
}
