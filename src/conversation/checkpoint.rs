// src/conversation/checkpoint.rs
// Durable checkpoints permitting crash recovery and replay (spec §3, §4.1).
// Grounded on the teacher's checkpoint/mod.rs (sha256-free variant: the
// payload here is the full conversation snapshot, not a file diff).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Conversation, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub stage: Stage,
    pub payload: Conversation,
    pub reason: String,
}

impl Checkpoint {
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            stage: self.stage,
            reason: self.reason.clone(),
        }
    }
}
