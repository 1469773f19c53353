// src/template/registry.rs
// Local bundled fallback registry (spec §4.4 lookup order, tier ii) plus the
// generic-stage-default tier (tier iii). Ships with the binary so resolution
// never hard-fails for a core stage even if a remote registry is unreachable.

use super::{Template, TemplateRegistry};

struct Entry {
    name: &'static str,
    body: &'static str,
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

const CATALOG: &[Entry] = &[
    Entry {
        name: "kumon:greeting:welcome:initial",
        body: "Olá! Seja bem-vindo(a) ao Kumon. Para começar, qual é o seu nome?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:greeting:collection:parent_name",
        body: "Prazer, {parent_name}! Você está buscando o Kumon para {gender_pronoun} ou para seu filho(a)?",
        required: &["parent_name"],
        optional: &["gender_pronoun"],
    },
    Entry {
        name: "kumon:qualification:collection:child_info",
        body: "Qual é o nome e a idade da criança que fará o Kumon?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:qualification:collection:child_age",
        body: "Obrigado! E qual é a idade da criança?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:qualification:confirmation:complete",
        body: "Perfeito, anotei os dados da criança!",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:information:response:method",
        body: "O método Kumon desenvolve a autonomia do aluno com material individualizado, em ritmo próprio.",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:information:response:pricing",
        body: "A mensalidade é {monthly_amount} e o material didático é {material_amount} (pagamento único).",
        required: &["monthly_amount", "material_amount"],
        optional: &[],
    },
    Entry {
        name: "kumon:scheduling:suggestion:slots",
        body: "Temos estes horários disponíveis: {slot_list}. Qual prefere?",
        required: &["slot_list"],
        optional: &[],
    },
    Entry {
        name: "kumon:scheduling:collection:email",
        body: "Ótimo! Para confirmar, pode me informar um e-mail de contato?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:scheduling:confirmation:email_received",
        body: "Perfeito, recebi seu e-mail! Para confirmar a visita, responda \"confirmo\".",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:confirmation:confirmation:booked",
        body: "Visita confirmada para {selected_slot}! Até lá!",
        required: &["selected_slot"],
        optional: &[],
    },
    Entry {
        name: "kumon:confirmation:confirmation:address",
        body: "O endereço é {unit_address}.",
        required: &["unit_address"],
        optional: &[],
    },
    Entry {
        name: "kumon:fallback:clarification:level1",
        body: "Desculpe, não entendi bem. Você pode reformular sua mensagem?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:fallback:error:level2",
        body: "Vamos recomeçar: posso ajudar com informações sobre o método, valores, horários ou agendamento de visita. O que você precisa?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:fallback:error:after_hours",
        body: "Nosso atendimento funciona de segunda a sexta, das 08:00 às 12:00 e das 14:00 às 17:00. Assim que reabrirmos, responderemos sua mensagem!",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:fallback:error:scope_refusal",
        body: "Posso ajudar apenas com assuntos sobre o Kumon: método, valores, horários, agendamento e matrícula. Em que posso ajudar?",
        required: &[],
        optional: &[],
    },
    Entry {
        name: "kumon:fallback:handoff:closing",
        body: "Vou transferir você para um de nossos atendentes, que continuará por aqui em instantes.",
        required: &[],
        optional: &[],
    },
];

/// Stage-level defaults used when no specific `type:variant` matches
/// (spec §4.4 tier iii: "generic stage default").
const STAGE_DEFAULTS: &[(&str, &str)] = &[
    ("greeting", "Olá! Como posso ajudar com sua matrícula no Kumon?"),
    ("qualification", "Pode me contar um pouco mais sobre quem fará o Kumon?"),
    ("information", "Posso explicar o método, valores ou horários. O que gostaria de saber?"),
    ("scheduling", "Vamos agendar sua visita? Me diga um período que prefere."),
    ("confirmation", "Vou confirmar os detalhes da sua visita."),
    ("followup", "Ainda posso ajudar com mais alguma coisa?"),
    ("completed", "Obrigado pelo contato!"),
    ("fallback", "Desculpe, não entendi. Pode repetir, por favor?"),
];

pub struct BundledRegistry;

impl BundledRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BundledRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry for BundledRegistry {
    fn lookup(&self, name: &str, tag: &str) -> Option<Template> {
        if let Some(entry) = CATALOG.iter().find(|e| e.name == name) {
            return Some(Template {
                name: entry.name.to_string(),
                body: entry.body.to_string(),
                required_vars: entry.required.iter().map(|s| s.to_string()).collect(),
                optional_vars: entry.optional.iter().map(|s| s.to_string()).collect(),
                tags: vec![tag.to_string()],
                version: 1,
            });
        }
        // Tier iii: fall back to the generic stage default embedded in `name`.
        let stage = name.split(':').nth(1)?;
        let body = STAGE_DEFAULTS.iter().find(|(s, _)| *s == stage).map(|(_, b)| *b)?;
        Some(Template {
            name: format!("kumon:{stage}:response:default"),
            body: body.to_string(),
            required_vars: vec![],
            optional_vars: vec![],
            tags: vec![tag.to_string()],
            version: 1,
        })
    }
}
