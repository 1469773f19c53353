// src/intent/mod.rs
// Intent/threshold classifier (C3), per spec §4.3. Grounded on the teacher's
// llm/router.rs TaskAnalysis: keyword-heuristic classification with a
// deterministic, version-tagged result, generalized from routing reasoning
// effort to routing conversation intent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::workflow::ConfidenceThresholds;

pub const CLASSIFIER_VERSION: &str = "heuristic-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Greeting,
    ProvideParentName,
    ProvideChildInfo,
    AskMethod,
    AskPricing,
    AskHours,
    AskScheduling,
    SelectSlot,
    ProvideEmail,
    ConfirmBooking,
    HumanHandoffRequest,
    OutOfScope,
    Unclear,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Greeting => "greeting",
            IntentLabel::ProvideParentName => "provide_parent_name",
            IntentLabel::ProvideChildInfo => "provide_child_info",
            IntentLabel::AskMethod => "ask_method",
            IntentLabel::AskPricing => "ask_pricing",
            IntentLabel::AskHours => "ask_hours",
            IntentLabel::AskScheduling => "ask_scheduling",
            IntentLabel::SelectSlot => "select_slot",
            IntentLabel::ProvideEmail => "provide_email",
            IntentLabel::ConfirmBooking => "confirm_booking",
            IntentLabel::HumanHandoffRequest => "human_handoff_request",
            IntentLabel::OutOfScope => "out_of_scope",
            IntentLabel::Unclear => "unclear",
        }
    }
}

/// Discretization of classifier confidence used for routing, spec §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    Floor,
}

impl ConfidenceBand {
    pub fn of(confidence: f32, thresholds: &ConfidenceThresholds) -> Self {
        if confidence >= thresholds.high {
            ConfidenceBand::High
        } else if confidence >= thresholds.medium {
            ConfidenceBand::Medium
        } else if confidence >= thresholds.low {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Floor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub label: IntentLabel,
    pub confidence: f32,
    pub features: HashMap<String, String>,
}

/// Context the classifier may use beyond the bare utterance: which stage the
/// conversation is in shapes what a given phrase most likely means.
pub struct ClassifyContext<'a> {
    pub stage: crate::conversation::Stage,
    pub recent_messages: &'a [crate::conversation::Message],
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str, ctx: &ClassifyContext) -> Intent;
}

/// Deterministic keyword-heuristic classifier (spec §4.3: "for this
/// specification only its contract matters"). A rules-/LLM-backed classifier
/// can replace this behind the same trait without touching callers.
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }

    fn handoff_signatures(text: &str) -> bool {
        const SIGNATURES: &[&str] = &[
            "falar com uma pessoa",
            "falar com atendente",
            "quero um humano",
            "atendente humano",
        ];
        SIGNATURES.iter().any(|s| text.contains(s))
    }

    fn scope_signatures(text: &str) -> bool {
        const OUT_OF_SCOPE: &[&str] = &[
            "capital da frança",
            "previsão do tempo",
            "piada",
            "quem é você de verdade",
        ];
        OUT_OF_SCOPE.iter().any(|s| text.contains(s))
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier for HeuristicClassifier {
    fn classify(&self, text: &str, ctx: &ClassifyContext) -> Intent {
        let lower = text.to_lowercase();
        let mut features = HashMap::new();
        features.insert("model".to_string(), CLASSIFIER_VERSION.to_string());
        features.insert("stage".to_string(), ctx.stage.as_str().to_string());

        let (label, confidence) = if Self::handoff_signatures(&lower) {
            (IntentLabel::HumanHandoffRequest, 0.97)
        } else if Self::scope_signatures(&lower) {
            (IntentLabel::OutOfScope, 0.9)
        } else if lower.contains("quanto custa") || lower.contains("valor") || lower.contains("preço")
        {
            (IntentLabel::AskPricing, 0.92)
        } else if lower.contains("como funciona") || lower.contains("método") || lower.contains("metodo")
        {
            (IntentLabel::AskMethod, 0.88)
        } else if lower.contains("horário") || lower.contains("horario") || lower.contains("que horas")
        {
            (IntentLabel::AskHours, 0.88)
        } else if lower.contains("agendar") || lower.contains("marcar") || lower.contains("visita") {
            (IntentLabel::AskScheduling, 0.86)
        } else if lower.contains("@") && lower.contains('.') {
            (IntentLabel::ProvideEmail, 0.9)
        } else if lower.contains("confirmo") || lower.contains("confirmar") || lower == "sim" {
            (IntentLabel::ConfirmBooking, 0.8)
        } else if is_greeting(&lower) {
            (IntentLabel::Greeting, 0.95)
        } else if looks_like_a_name(&lower) {
            match ctx.stage {
                crate::conversation::Stage::Greeting => (IntentLabel::ProvideParentName, 0.75),
                crate::conversation::Stage::Qualification => (IntentLabel::ProvideChildInfo, 0.72),
                _ => (IntentLabel::Unclear, 0.5),
            }
        } else {
            (IntentLabel::Unclear, 0.2)
        };

        Intent {
            label,
            confidence,
            features,
        }
    }
}

pub(crate) fn is_greeting(text: &str) -> bool {
    const GREETINGS: &[&str] = &["oi", "olá", "ola", "bom dia", "boa tarde", "boa noite"];
    GREETINGS.iter().any(|g| text.trim_start().starts_with(g))
}

fn looks_like_a_name(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    !words.is_empty() && words.len() <= 4 && words.iter().all(|w| w.chars().all(|c| c.is_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Stage;

    fn ctx(stage: Stage) -> ClassifyContext<'static> {
        ClassifyContext {
            stage,
            recent_messages: &[],
        }
    }

    #[test]
    fn greeting_is_high_confidence() {
        let classifier = HeuristicClassifier::new();
        let intent = classifier.classify("Oi, boa tarde", &ctx(Stage::Greeting));
        assert_eq!(intent.label, IntentLabel::Greeting);
        assert!(intent.confidence >= 0.85);
    }

    #[test]
    fn pricing_question_is_detected() {
        let classifier = HeuristicClassifier::new();
        let intent = classifier.classify("Quanto custa a mensalidade?", &ctx(Stage::InformationGathering));
        assert_eq!(intent.label, IntentLabel::AskPricing);
    }

    #[test]
    fn handoff_signature_overrides_everything() {
        let classifier = HeuristicClassifier::new();
        let intent = classifier.classify("Quero falar com uma pessoa, por favor", &ctx(Stage::Scheduling));
        assert_eq!(intent.label, IntentLabel::HumanHandoffRequest);
    }

    #[test]
    fn confidence_band_thresholds_match_spec_defaults() {
        let thresholds = ConfidenceThresholds::default();
        assert_eq!(ConfidenceBand::of(0.9, &thresholds), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::of(0.75, &thresholds), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::of(0.5, &thresholds), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::of(0.1, &thresholds), ConfidenceBand::Floor);
    }
}
