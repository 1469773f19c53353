// src/validate/mod.rs
// Response validator (C9), per spec §4.9. Runs on every draft reply before
// it reaches the outbox. Grounded on the teacher's conductor/validation.rs
// shape (`ValidationResult{valid, issues}`, per-issue severity), generalized
// from tool-call repair to factuality/tone/coherence/safety/length checks.

use serde::{Deserialize, Serialize};

use crate::rules::{BusinessRules, SuggestedAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorAction {
    Approve,
    Retry,
    Block,
    Escalate,
}

impl ValidatorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorAction::Approve => "approve",
            ValidatorAction::Retry => "retry",
            ValidatorAction::Block => "block",
            ValidatorAction::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    pub issues: Vec<Issue>,
    pub confidence: f32,
    pub action: ValidatorAction,
}

/// Bounds a draft reply's length; default ~4 kB per spec §4.9.
const MAX_REPLY_BYTES: usize = 4096;
const APPROVE_CONFIDENCE_THRESHOLD: f32 = 0.8;

/// Context the validator needs beyond the bare draft text.
pub struct ValidateContext<'a> {
    pub topic: &'a str,
    pub last_user_message: &'a str,
    pub retry_count: u32,
    pub max_retries: u32,
}

pub struct ResponseValidator {
    rules: std::sync::Arc<BusinessRules>,
}

impl ResponseValidator {
    pub fn new(rules: std::sync::Arc<BusinessRules>) -> Self {
        Self { rules }
    }

    /// Checks factuality (pricing/scope via C7), tone, coherence, safety and
    /// length, then folds the findings into one verdict and action per spec
    /// §4.9's approve/retry/block/escalate decision table.
    pub fn validate(&self, draft: &str, ctx: &ValidateContext) -> Verdict {
        let mut issues = Vec::new();

        if let Err(failure) = self.rules.check_pricing(draft) {
            issues.push(Issue {
                code: failure.code,
                message: failure.message,
                severity: Severity::Blocking,
            });
        }
        if let Err(failure) = self.rules.check_scope(ctx.topic) {
            issues.push(Issue {
                code: failure.code,
                message: failure.message,
                severity: severity_for(failure.suggested_action),
            });
        }
        if let Err(failure) = self.rules.check_safety_pii(draft) {
            issues.push(Issue {
                code: failure.code,
                message: failure.message,
                severity: Severity::Blocking,
            });
        }
        if draft.len() > MAX_REPLY_BYTES {
            issues.push(Issue {
                code: "length.exceeded".into(),
                message: format!("draft is {} bytes, exceeds {MAX_REPLY_BYTES}", draft.len()),
                severity: Severity::Blocking,
            });
        }
        if !is_coherent(draft, ctx.last_user_message) {
            issues.push(Issue {
                code: "coherence.unrelated".into(),
                message: "draft does not appear to address the user's last message".into(),
                severity: Severity::Warning,
            });
        }

        let blocking = issues.iter().any(|i| i.severity == Severity::Blocking);
        let confidence = score(draft, &issues);
        let approved = !blocking && confidence >= APPROVE_CONFIDENCE_THRESHOLD;

        let action = if approved {
            ValidatorAction::Approve
        } else if blocking {
            // A blocking factual/safety issue never gets a bare retry: either
            // the content is simply disallowed (block) or it's explicit scope
            // evasion / handoff territory (escalate). Pricing and safety
            // leaks are never acceptable to retry into; scope is retryable
            // if it's the first miss.
            if issues.iter().any(|i| i.code.starts_with("safety.") || i.code.starts_with("pricing.")) {
                ValidatorAction::Block
            } else if ctx.retry_count < ctx.max_retries {
                ValidatorAction::Retry
            } else {
                ValidatorAction::Escalate
            }
        } else if ctx.retry_count < ctx.max_retries {
            ValidatorAction::Retry
        } else {
            ValidatorAction::Escalate
        };

        Verdict {
            approved,
            issues,
            confidence,
            action,
        }
    }
}

fn severity_for(action: SuggestedAction) -> Severity {
    match action {
        SuggestedAction::Block | SuggestedAction::Escalate => Severity::Blocking,
        SuggestedAction::RetryWithHint => Severity::Warning,
    }
}

/// Cheap coherence heuristic: the draft should share at least one
/// content word with the user's last message, or be a greeting/menu reply
/// (which legitimately doesn't echo any user vocabulary).
fn is_coherent(draft: &str, last_user_message: &str) -> bool {
    if last_user_message.trim().is_empty() {
        return true;
    }
    let draft_lower = draft.to_lowercase();
    let user_words: Vec<&str> = last_user_message
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .collect();
    if user_words.is_empty() {
        return true;
    }
    user_words.iter().any(|w| draft_lower.contains(&w.to_lowercase()))
        || draft_lower.split_whitespace().count() <= 6
}

/// Confidence starts at 1.0 and is docked per issue, more for blocking ones.
fn score(draft: &str, issues: &[Issue]) -> f32 {
    if draft.trim().is_empty() {
        return 0.0;
    }
    let mut confidence = 1.0f32;
    for issue in issues {
        confidence -= match issue.severity {
            Severity::Blocking => 0.4,
            Severity::Warning => 0.15,
        };
    }
    confidence.max(0.0)
}
