// src/conversation/mod.rs
// Canonical per-conversation state model (C1), grounded on the teacher's
// session/types.rs enum conventions and checkpoint/mod.rs persistence idiom.

pub mod checkpoint;
pub mod store;

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse location in the conversation state machine, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    Qualification,
    InformationGathering,
    Scheduling,
    Confirmation,
    Validation,
    Completed,
    Handoff,
    Fallback,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Handoff)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::Qualification => "qualification",
            Stage::InformationGathering => "information",
            Stage::Scheduling => "scheduling",
            Stage::Confirmation => "confirmation",
            Stage::Validation => "validation",
            Stage::Completed => "completed",
            Stage::Handoff => "handoff",
            Stage::Fallback => "fallback",
        }
    }
}

/// Fine-grained location within a stage, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Welcome,
    CollectParentName,
    CollectChildName,
    CollectChildAge,
    CollectEducationLevel,
    AnsweringQuestions,
    OfferSlots,
    CollectEmail,
    BookSlot,
    ClosingConfirmation,
    FallbackLevel1,
    FallbackLevel2,
    HandoffClosing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub ts: DateTime<Utc>,
    pub message_id: String,
}

/// Sparse business-domain data captured over the life of the conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectedData {
    pub parent_name: Option<String>,
    pub child_name: Option<String>,
    pub child_age: Option<u8>,
    pub programs_of_interest: HashSet<String>,
    pub contact_email: Option<String>,
    pub date_preferences: Vec<String>,
    pub selected_slot: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub message_count: u32,
    pub failed_attempts: u32,
    pub consecutive_confusion: u32,
    pub same_question_count: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub score: f32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrailEntry {
    pub ts: DateTime<Utc>,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub reason: String,
}

const DECISION_TRAIL_CAPACITY: usize = 20;

/// The canonical per-conversation record, owned exclusively by C1 (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub peer_id: String,
    pub instance: String,
    pub stage: Stage,
    pub step: Step,
    pub messages: Vec<Message>,
    pub collected_data: CollectedData,
    pub metrics: ConversationMetrics,
    pub validation: ValidationVerdict,
    pub decision_trail: VecDeque<DecisionTrailEntry>,
    pub version: i64,
    pub schema_version: i32,
    pub pending_deletion: bool,
}

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("invariant violated: {which}")]
    InvariantViolation { which: String },
    #[error("stale version for conversation {0}")]
    StaleVersion(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("conversation {0} is pending LGPD deletion")]
    PendingDeletion(String),
}

impl Conversation {
    pub fn new(conversation_id: String, peer_id: String, instance: String) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            peer_id,
            instance,
            stage: Stage::Greeting,
            step: Step::Welcome,
            messages: Vec::new(),
            collected_data: CollectedData::default(),
            metrics: ConversationMetrics {
                created_at: Some(now),
                last_activity: Some(now),
                ..Default::default()
            },
            validation: ValidationVerdict::default(),
            decision_trail: VecDeque::new(),
            version: 0,
            schema_version: CURRENT_SCHEMA_VERSION,
            pending_deletion: false,
        }
    }

    /// Appends a message, rejecting duplicates by `message_id` (idempotency, spec §4.8).
    pub fn append_message(&mut self, msg: Message) -> Result<(), ConversationError> {
        if self.messages.iter().any(|m| m.message_id == msg.message_id) {
            return Err(ConversationError::InvariantViolation {
                which: "duplicate message_id".into(),
            });
        }
        self.metrics.last_activity = Some(msg.ts);
        self.messages.push(msg);
        self.metrics.message_count = self.messages.len() as u32;
        Ok(())
    }

    pub fn transition(&mut self, to: Stage, reason: impl Into<String>) {
        let entry = DecisionTrailEntry {
            ts: Utc::now(),
            from_stage: self.stage,
            to_stage: to,
            reason: reason.into(),
        };
        self.decision_trail.push_back(entry);
        while self.decision_trail.len() > DECISION_TRAIL_CAPACITY {
            self.decision_trail.pop_front();
        }
        self.stage = to;
    }

    pub fn record_success(&mut self) {
        self.metrics.failed_attempts = 0;
        self.metrics.consecutive_confusion = 0;
    }

    pub fn record_confusion(&mut self) {
        self.metrics.consecutive_confusion += 1;
    }

    pub fn record_failure(&mut self) {
        self.metrics.failed_attempts += 1;
    }

    /// Checks the invariants of spec §3. Called after every mutation.
    pub fn check_invariants(&self) -> Result<(), ConversationError> {
        if self.metrics.message_count as usize != self.messages.len() {
            return Err(ConversationError::InvariantViolation {
                which: "message_count != len(messages)".into(),
            });
        }
        if self.collected_data.selected_slot.is_some()
            && self.collected_data.contact_email.is_none()
        {
            return Err(ConversationError::InvariantViolation {
                which: "selected_slot set without contact_email".into(),
            });
        }
        let mut seen = HashSet::with_capacity(self.messages.len());
        for m in &self.messages {
            if !seen.insert(&m.message_id) {
                return Err(ConversationError::InvariantViolation {
                    which: "duplicate message_id".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Conversation {
        Conversation::new("c1".into(), "+5551999999999".into(), "inst-1".into())
    }

    #[test]
    fn new_conversation_starts_at_greeting() {
        let conv = sample();
        assert_eq!(conv.stage, Stage::Greeting);
        assert_eq!(conv.step, Step::Welcome);
        assert_eq!(conv.metrics.message_count, 0);
    }

    #[test]
    fn append_message_updates_count_and_rejects_duplicates() {
        let mut conv = sample();
        let msg = Message {
            role: Role::User,
            text: "Oi".into(),
            ts: Utc::now(),
            message_id: "m1".into(),
        };
        conv.append_message(msg.clone()).unwrap();
        assert_eq!(conv.metrics.message_count, 1);
        assert!(conv.append_message(msg).is_err());
        assert_eq!(conv.metrics.message_count, 1);
        conv.check_invariants().unwrap();
    }

    #[test]
    fn selected_slot_without_email_violates_invariant() {
        let mut conv = sample();
        conv.collected_data.selected_slot = Some("2026-08-03T09:00".into());
        assert!(conv.check_invariants().is_err());
        conv.collected_data.contact_email = Some("a@b.com".into());
        assert!(conv.check_invariants().is_ok());
    }

    #[test]
    fn record_success_resets_failure_counters() {
        let mut conv = sample();
        conv.record_failure();
        conv.record_confusion();
        conv.record_success();
        assert_eq!(conv.metrics.failed_attempts, 0);
        assert_eq!(conv.metrics.consecutive_confusion, 0);
    }

    #[test]
    fn transition_bounds_decision_trail() {
        let mut conv = sample();
        for _ in 0..(DECISION_TRAIL_CAPACITY + 5) {
            conv.transition(Stage::Qualification, "test");
        }
        assert_eq!(conv.decision_trail.len(), DECISION_TRAIL_CAPACITY);
    }
}
