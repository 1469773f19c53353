// src/config/workflow.rs
// Turn execution knobs: deadlines, concurrency caps, thresholds.

use serde::{Deserialize, Serialize};

/// Confidence band cut points, per spec §9: configurable, fail-closed (stricter) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.70,
            low: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub turn_deadline_secs: u64,
    pub turn_queue_depth: usize,
    pub max_failed_attempts: u32,
    pub max_consecutive_confusion: u32,
    pub validator_max_retries: u32,
    pub confidence: ConfidenceThresholds,
    pub checkpoint_retention: usize,
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        Self {
            turn_deadline_secs: super::helpers::env_u64("TURN_DEADLINE_SECS", 20),
            turn_queue_depth: super::helpers::env_usize("TURN_QUEUE_DEPTH", 8),
            max_failed_attempts: super::helpers::env_usize("MAX_FAILED_ATTEMPTS", 5) as u32,
            max_consecutive_confusion: super::helpers::env_usize("MAX_CONSECUTIVE_CONFUSION", 3) as u32,
            validator_max_retries: super::helpers::env_usize("VALIDATOR_MAX_RETRIES", 3) as u32,
            confidence: ConfidenceThresholds::default(),
            checkpoint_retention: super::helpers::env_usize("CHECKPOINT_RETENTION", 50),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub per_gateway_concurrency: usize,
    pub min_inter_message_delay_ms: u64,
    pub delivery_retry: super::llm::RetryConfig,
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        Self {
            per_gateway_concurrency: super::helpers::env_usize("OUTBOX_GATEWAY_CONCURRENCY", 8),
            min_inter_message_delay_ms: super::helpers::env_u64("OUTBOX_MIN_INTER_MESSAGE_MS", 250),
            delivery_retry: super::llm::RetryConfig::delivery_default(),
        }
    }
}
