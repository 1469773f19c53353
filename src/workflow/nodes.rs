// src/workflow/nodes.rs
// The node catalogue of spec §4.8: one node per stage plus the Fallback and
// Handoff auxiliaries. Each node is pure given its `NodeContext` — no
// interior mutable state, only calls out to the C4/C5/C6/C7 services handed
// to `run`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::conversation::Stage;
use crate::intent::IntentLabel;
use crate::llm::{ChatMessage, LlmRequest};

use super::{CollectedDataPatch, Emission, Node, NodeContext, NodeOutput, Services, TurnOutcome, WorkflowError};

async fn render(
    services: &Services,
    name: &str,
    vars: &HashMap<String, String>,
    collected: &crate::conversation::CollectedData,
) -> Result<String, WorkflowError> {
    let template = services.templates.resolve(name, "prod")?;
    Ok(services.templates.render(&template, vars, collected)?)
}

pub struct GreetingNode;

#[async_trait]
impl Node for GreetingNode {
    fn stage(&self) -> Stage {
        Stage::Greeting
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let collected = &ctx.conversation.collected_data;

        if collected.parent_name.is_none() {
            // A bare greeting ("Oi", "Boa tarde") is alphabetic and short
            // enough to pass `looks_like_a_name` on its own; the welcome
            // prompt must still go out rather than treating the greeting
            // itself as the parent's name.
            if !crate::intent::is_greeting(&ctx.accepted.text.to_lowercase()) && looks_like_a_name(&ctx.accepted.text) {
                out.patch.parent_name = Some(title_case(&ctx.accepted.text));
                out.outcome = TurnOutcome::Success;
                let mut vars = HashMap::new();
                vars.insert("parent_name".to_string(), title_case(&ctx.accepted.text));
                let text = render(services, "kumon:greeting:collection:parent_name", &vars, collected).await?;
                out.emissions.push(Emission { text, topic: "greeting".to_string(), is_llm_generated: false });
            } else {
                out.outcome = TurnOutcome::Confusion;
                let text = render(services, "kumon:greeting:welcome:initial", &HashMap::new(), collected).await?;
                out.emissions.push(Emission { text, topic: "greeting".to_string(), is_llm_generated: false });
            }
        }
        Ok(out)
    }
}

pub struct QualificationNode;

#[async_trait]
impl Node for QualificationNode {
    fn stage(&self) -> Stage {
        Stage::Qualification
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let collected = &ctx.conversation.collected_data;

        // Every branch below must pick a template: a checkpointed data
        // advance with no reply leaves the user hanging until an unrelated
        // later message happens to dispatch the next stage's node.
        let template_name = if collected.child_name.is_none() {
            if looks_like_a_name(&ctx.accepted.text) {
                out.patch.child_name = Some(title_case(&ctx.accepted.text));
                out.outcome = TurnOutcome::Success;
                "kumon:qualification:collection:child_age"
            } else {
                out.outcome = TurnOutcome::Confusion;
                "kumon:qualification:collection:child_info"
            }
        } else if collected.child_age.is_none() {
            if let Some(age) = extract_age(&ctx.accepted.normalized_text) {
                out.patch.child_age = Some(age);
                out.outcome = TurnOutcome::Success;
                "kumon:qualification:confirmation:complete"
            } else {
                out.outcome = TurnOutcome::Confusion;
                "kumon:qualification:collection:child_age"
            }
        } else {
            // Both already collected; an out-of-order message landed here
            // before the conversation advanced to the next stage.
            out.outcome = TurnOutcome::Neutral;
            "kumon:qualification:confirmation:complete"
        };

        let text = render(services, template_name, &HashMap::new(), collected).await?;
        out.emissions.push(Emission { text, topic: "qualification".to_string(), is_llm_generated: false });
        Ok(out)
    }
}

/// Answers method/pricing/hours questions, optionally enriched with C6
/// snippets and a C5-generated elaboration (spec §4.8 InformationGathering).
pub struct InformationGatheringNode;

#[async_trait]
impl Node for InformationGatheringNode {
    fn stage(&self) -> Stage {
        Stage::InformationGathering
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let collected = &ctx.conversation.collected_data;

        let (template_name, topic) = match ctx.intent.label {
            IntentLabel::AskPricing => ("kumon:information:response:pricing", "pricing"),
            IntentLabel::AskMethod => ("kumon:information:response:method", "method"),
            _ => ("kumon:information:response:method", "method"),
        };

        let mut vars = HashMap::new();
        if topic == "pricing" {
            vars.insert("monthly_amount".to_string(), services.rules.monthly_amount().to_string());
            vars.insert("material_amount".to_string(), services.rules.material_amount().to_string());
        }

        let rag = services.rag.retrieve(&ctx.accepted.normalized_text, Some(Stage::InformationGathering), 3, 300).await;
        if rag.degraded {
            metrics::counter!("rag_degraded_total").increment(1);
        }

        let text = render(services, template_name, &vars, collected).await?;
        let text = if rag.snippets.is_empty() {
            text
        } else {
            let extra = rag.snippets.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");
            format!("{text} {extra}")
        };

        out.outcome = TurnOutcome::Success;
        out.emissions.push(Emission { text, topic: topic.to_string(), is_llm_generated: false });
        Ok(out)
    }
}

pub struct SchedulingNode;

#[async_trait]
impl Node for SchedulingNode {
    fn stage(&self) -> Stage {
        Stage::Scheduling
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let collected = &ctx.conversation.collected_data;

        if collected.selected_slot.is_none() {
            let now = Utc::now();
            let slots = services
                .calendar
                .list_free_slots((now, now + ChronoDuration::days(14)), ChronoDuration::minutes(30))
                .await?;
            let slot_list = slots
                .iter()
                .take(3)
                .map(|s| s.start.format("%d/%m %H:%M").to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if is_slot_selection(&ctx.accepted.normalized_text) {
                if let Some(chosen) = slots.first() {
                    out.patch.selected_slot = Some(chosen.start.to_rfc3339());
                }
            }
            let mut vars = HashMap::new();
            vars.insert("slot_list".to_string(), slot_list);
            let text = render(services, "kumon:scheduling:suggestion:slots", &vars, collected).await?;
            out.emissions.push(Emission { text, topic: "scheduling".to_string(), is_llm_generated: false });
            out.outcome = TurnOutcome::Success;
        } else if collected.contact_email.is_none() {
            if let Some(email) = extract_email(&ctx.accepted.text) {
                out.patch.contact_email = Some(email);
                out.outcome = TurnOutcome::Success;
                // The stage advances to Confirmation on this turn's data
                // advance, but booking only happens once the user actually
                // confirms — this turn still owes them a reply of its own.
                let text =
                    render(services, "kumon:scheduling:confirmation:email_received", &HashMap::new(), collected).await?;
                out.emissions.push(Emission { text, topic: "scheduling".to_string(), is_llm_generated: false });
            } else {
                let text = render(services, "kumon:scheduling:collection:email", &HashMap::new(), collected).await?;
                out.emissions.push(Emission { text, topic: "scheduling".to_string(), is_llm_generated: false });
                out.outcome = TurnOutcome::Confusion;
            }
        }
        Ok(out)
    }
}

pub struct ConfirmationNode;

#[async_trait]
impl Node for ConfirmationNode {
    fn stage(&self) -> Stage {
        Stage::Confirmation
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let collected = &ctx.conversation.collected_data;

        let slot_rfc3339 = collected.selected_slot.clone().unwrap_or_default();
        let start = chrono::DateTime::parse_from_rfc3339(&slot_rfc3339)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let slot = crate::calendar::Slot { start, end: start + ChronoDuration::minutes(30) };
        let attendee = collected.contact_email.as_deref().unwrap_or("");

        let booked = match services.calendar.book_slot(slot, attendee, "").await {
            Ok(confirmation) => confirmation,
            Err(crate::calendar::CalendarError::Contention(_)) => {
                // Retry once against a freshly listed slot, per the
                // escalation policy owned here rather than in the adapter.
                let retry_range = (start, start + ChronoDuration::days(7));
                let fresh = services.calendar.list_free_slots(retry_range, ChronoDuration::minutes(30)).await?;
                match fresh.first().copied() {
                    Some(alternate) => match services.calendar.book_slot(alternate, attendee, "").await {
                        Ok(confirmation) => confirmation,
                        Err(_) => return Ok(Self::escalate(services, collected).await?),
                    },
                    None => return Ok(Self::escalate(services, collected).await?),
                }
            }
            Err(e) => return Err(e.into()),
        };

        // Two separate entries in the same turn: the booking itself, then
        // the address as a short follow-up rather than folded into one
        // message.
        let mut slot_vars = HashMap::new();
        slot_vars.insert("selected_slot".to_string(), booked.slot.start.format("%d/%m %H:%M").to_string());
        let booked_text = render(services, "kumon:confirmation:confirmation:booked", &slot_vars, collected).await?;

        let mut address_vars = HashMap::new();
        address_vars.insert("unit_address".to_string(), "Rua das Flores, 123".to_string());
        let address_text = render(services, "kumon:confirmation:confirmation:address", &address_vars, collected).await?;

        out.outcome = TurnOutcome::Success;
        out.emissions.push(Emission { text: booked_text, topic: "confirmation".to_string(), is_llm_generated: false });
        out.emissions.push(Emission { text: address_text, topic: "confirmation".to_string(), is_llm_generated: false });
        Ok(out)
    }
}

impl ConfirmationNode {
    /// Slot taken twice in a row: apologize and hand the turn back to the
    /// clarification ladder rather than straight to a human handoff, since a
    /// booking conflict isn't the repeated-confusion Handoff is meant for.
    async fn escalate(services: &Services, collected: &crate::conversation::CollectedData) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let text = render(services, "kumon:fallback:error:level2", &HashMap::new(), collected).await?;
        out.emissions.push(Emission { text, topic: "confirmation".to_string(), is_llm_generated: false });
        out.outcome = TurnOutcome::Neutral;
        out.next_edge_hint = Some(Stage::Fallback);
        Ok(out)
    }
}

pub struct FallbackLevel1Node;

#[async_trait]
impl Node for FallbackLevel1Node {
    fn stage(&self) -> Stage {
        Stage::Fallback
    }

    async fn run(&self, ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();

        // An out-of-scope ask always gets the scoped refusal, not the
        // generic confusion ladder (spec §4.7, tested by S4).
        if ctx.intent.label == IntentLabel::OutOfScope {
            let text = render(services, "kumon:fallback:error:scope_refusal", &HashMap::new(), &ctx.conversation.collected_data).await?;
            out.emissions.push(Emission { text, topic: "fallback".to_string(), is_llm_generated: false });
            out.outcome = TurnOutcome::Neutral;
            out.next_edge_hint = Some(ctx.conversation.stage);
            return Ok(out);
        }

        let template_name = if ctx.conversation.metrics.consecutive_confusion >= 1 {
            "kumon:fallback:error:level2"
        } else {
            "kumon:fallback:clarification:level1"
        };
        let text = render(services, template_name, &HashMap::new(), &ctx.conversation.collected_data).await?;
        out.emissions.push(Emission { text, topic: "fallback".to_string(), is_llm_generated: false });
        out.outcome = TurnOutcome::Confusion;
        Ok(out)
    }
}

pub struct HandoffNode;

#[async_trait]
impl Node for HandoffNode {
    fn stage(&self) -> Stage {
        Stage::Handoff
    }

    async fn run(&self, _ctx: &NodeContext<'_>, services: &Services) -> Result<NodeOutput, WorkflowError> {
        let mut out = NodeOutput::new();
        let text = render(services, "kumon:fallback:handoff:closing", &HashMap::new(), &_ctx.conversation.collected_data).await?;
        out.emissions.push(Emission { text, topic: "handoff".to_string(), is_llm_generated: false });
        out.outcome = TurnOutcome::Neutral;
        out.next_edge_hint = Some(Stage::Handoff);
        Ok(out)
    }
}

fn looks_like_a_name(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    !words.is_empty() && words.len() <= 4 && words.iter().all(|w| w.chars().all(|c| c.is_alphabetic()))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_age(text: &str) -> Option<u8> {
    text.split_whitespace().find_map(|w| w.parse::<u8>().ok()).filter(|age| *age > 0 && *age < 100)
}

fn extract_email(text: &str) -> Option<String> {
    text.split_whitespace().find(|w| w.contains('@') && w.contains('.')).map(|s| s.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.').to_string())
}

fn is_slot_selection(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit()) || text.contains("primeiro") || text.contains("esse") || text.contains("este")
}
