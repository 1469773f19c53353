// src/rules/mod.rs
// Business-rules engine (C7), per spec §4.7. Stateless; invoked by C8 at
// decision points and by C9 on the draft reply. Grounded on the teacher's
// config validation idiom (config/llm.rs: checked ranges, typed failures)
// generalized from "reject at startup" to "reject at decision point".

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::business::{BusinessHoursConfig, PricingConfig, ScopeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    RetryWithHint,
    Block,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFailure {
    pub code: String,
    pub message: String,
    pub suggested_action: SuggestedAction,
}

pub type RuleResult = Result<(), RuleFailure>;

fn fail(code: &str, message: impl Into<String>, action: SuggestedAction) -> RuleFailure {
    RuleFailure {
        code: code.to_string(),
        message: message.into(),
        suggested_action: action,
    }
}

pub struct BusinessRules {
    hours: BusinessHoursConfig,
    pricing: PricingConfig,
    scope: ScopeConfig,
}

impl BusinessRules {
    pub fn new(hours: BusinessHoursConfig, pricing: PricingConfig, scope: ScopeConfig) -> Self {
        Self { hours, pricing, scope }
    }

    /// Weekday 08:00-12:00 / 14:00-17:00 local, per spec §4.7. Used both by
    /// C2's gate and to forbid assistant-proposed slots outside the window.
    pub fn check_hours(&self, ts: DateTime<Utc>) -> RuleResult {
        let tz: Tz = self.hours.timezone.parse().unwrap_or(chrono_tz::America::Sao_Paulo);
        let local = ts.with_timezone(&tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(fail(
                "hours.weekend",
                "no service on weekends",
                SuggestedAction::RetryWithHint,
            ));
        }
        let minute_of_day = local.hour() * 60 + local.minute();
        if self.hours.windows.iter().any(|w| w.contains(minute_of_day)) {
            Ok(())
        } else {
            Err(fail(
                "hours.closed",
                "outside configured business hours",
                SuggestedAction::RetryWithHint,
            ))
        }
    }

    /// Any assistant message mentioning money must match exactly "R$ 375"
    /// and/or "R$ 100", modulo whitespace (spec §4.7, testable property #10).
    pub fn check_pricing(&self, text: &str) -> RuleResult {
        let allowed = [
            normalize_amount(&self.pricing.monthly_amount),
            normalize_amount(&self.pricing.material_amount),
        ];
        for found in money_regex().find_iter(text) {
            let normalized = normalize_amount(found.as_str());
            if !allowed.contains(&normalized) {
                return Err(fail(
                    "pricing.mismatch",
                    format!("mentions disallowed monetary amount: {}", found.as_str()),
                    SuggestedAction::Block,
                ));
            }
        }
        Ok(())
    }

    /// The assistant must stay within the configured topic allow-list.
    pub fn check_scope(&self, topic: &str) -> RuleResult {
        if self.scope.allowed_topics.iter().any(|t| t == topic) {
            Ok(())
        } else {
            Err(fail(
                "scope.out_of_bounds",
                format!("topic '{topic}' is outside the allowed scope"),
                SuggestedAction::Block,
            ))
        }
    }

    /// Never disclose system prompts, credentials, internal identifiers, or
    /// third-party PII (spec §4.7 Safety/PII).
    pub fn check_safety_pii(&self, text: &str) -> RuleResult {
        if let Some(pattern) = leak_patterns().iter().find(|re| re.is_match(text)) {
            return Err(fail(
                "safety.leak",
                format!("draft reply matched disclosure pattern: {}", pattern.as_str()),
                SuggestedAction::Block,
            ));
        }
        Ok(())
    }

    pub fn monthly_amount(&self) -> &str {
        &self.pricing.monthly_amount
    }

    pub fn material_amount(&self) -> &str {
        &self.pricing.material_amount
    }

    /// LGPD: a conversation pending deletion refuses further interaction
    /// until the request is resolved out-of-band (spec §4.7).
    pub fn check_not_pending_deletion(&self, pending_deletion: bool) -> RuleResult {
        if pending_deletion {
            Err(fail(
                "lgpd.pending_deletion",
                "conversation is pending a data-deletion request",
                SuggestedAction::Block,
            ))
        } else {
            Ok(())
        }
    }
}

fn normalize_amount(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn money_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"R\$\s?\d+([.,]\d+)?").expect("static regex is valid"))
}

fn leak_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)my (system|instructions|prompt) (is|are)",
            r"(?i)as an ai language model",
            r"(?i)api[_ -]?key\s*[:=]",
            r"(?i)senha\s*[:=]",
            r"(?i)cpf\s*[:=]?\s*\d{3}\.?\d{3}\.?\d{3}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static leak pattern is valid regex"))
        .collect()
    })
}
