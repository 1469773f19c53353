// src/template/mod.rs
// Prompt/template resolver (C4), per spec §4.4 and the naming grammar in §6.
// Grounded on the teacher's prompt/ split (several focused submodules feeding
// one facade) and on cache.rs for the TTL layer the teacher itself lacks.

pub mod registry;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TtlCache;
use crate::conversation::CollectedData;

pub use registry::BundledRegistry;

/// `kumon:{stage}:{type}:{variant}`, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub body: String,
    pub required_vars: Vec<String>,
    pub optional_vars: Vec<String>,
    pub tags: Vec<String>,
    pub version: u32,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("template {name} missing required variable {var}")]
    VariableMissing { name: String, var: String },
}

/// A source of templates. Multiple registries are tried in order (spec §4.4:
/// remote registry, then local bundled fallback, then generic stage default).
pub trait TemplateRegistry: Send + Sync {
    fn lookup(&self, name: &str, tag: &str) -> Option<Template>;
}

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct TemplateResolver {
    registries: Vec<Box<dyn TemplateRegistry>>,
    cache: TtlCache<Template>,
}

impl TemplateResolver {
    /// `registries` are consulted in priority order; the bundled catalog and
    /// the generic-stage-default registry should always be included last so
    /// resolution never hard-fails for a core stage.
    pub fn new(registries: Vec<Box<dyn TemplateRegistry>>) -> Self {
        Self {
            registries,
            cache: TtlCache::new(CACHE_TTL),
        }
    }

    pub fn resolve(&self, name: &str, tag: &str) -> Result<Template, TemplateError> {
        let cache_key = format!("{name}@{tag}");
        if let Some(template) = self.cache.get(&cache_key) {
            return Ok(template);
        }
        for registry in &self.registries {
            if let Some(template) = registry.lookup(name, tag) {
                self.cache.insert(cache_key, template.clone());
                return Ok(template);
            }
        }
        Err(TemplateError::NotFound(name.to_string()))
    }

    /// Renders `template` against `vars`, filling gender-aware placeholders
    /// from `collected_data` with inclusive defaults when unknown (spec §4.4).
    pub fn render(
        &self,
        template: &Template,
        vars: &HashMap<String, String>,
        collected_data: &CollectedData,
    ) -> Result<String, TemplateError> {
        let mut merged = gender_defaults(collected_data);
        merged.extend(vars.clone());

        for required in &template.required_vars {
            if !merged.contains_key(required) {
                return Err(TemplateError::VariableMissing {
                    name: template.name.clone(),
                    var: required.clone(),
                });
            }
        }

        let mut rendered = template.body.clone();
        for (key, value) in &merged {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        Ok(rendered)
    }
}

/// Inclusive defaults for gender-aware placeholders, overridden once the
/// conversation actually learns a preference (spec §4.4: "default to
/// inclusive forms otherwise"). Nothing in `collected_data` currently records
/// a pronoun preference, so these are always the inclusive defaults today;
/// the hook exists so a future field can widen this without touching render().
fn gender_defaults(_collected_data: &CollectedData) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("gender_pronoun".to_string(), "você".to_string());
    vars.insert("gender_self_suffix".to_string(), "".to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            name: "kumon:greeting:welcome:initial".into(),
            body: "Olá {parent_name}! Bem-vindo(a) ao Kumon.".into(),
            required_vars: vec!["parent_name".to_string()],
            optional_vars: vec![],
            tags: vec!["prod".to_string()],
            version: 1,
        }
    }

    #[test]
    fn render_substitutes_required_variable() {
        let resolver = TemplateResolver::new(vec![]);
        let mut vars = HashMap::new();
        vars.insert("parent_name".to_string(), "Maria".to_string());
        let rendered = resolver
            .render(&template(), &vars, &CollectedData::default())
            .unwrap();
        assert_eq!(rendered, "Olá Maria! Bem-vindo(a) ao Kumon.");
    }

    #[test]
    fn render_fails_on_missing_required_variable() {
        let resolver = TemplateResolver::new(vec![]);
        let err = resolver
            .render(&template(), &HashMap::new(), &CollectedData::default())
            .unwrap_err();
        assert!(matches!(err, TemplateError::VariableMissing { .. }));
    }

    #[test]
    fn resolve_falls_through_registries_in_order() {
        let resolver = TemplateResolver::new(vec![Box::new(BundledRegistry::new())]);
        let resolved = resolver.resolve("kumon:greeting:welcome:initial", "prod").unwrap();
        assert_eq!(resolved.name, "kumon:greeting:welcome:initial");
    }

    #[test]
    fn resolve_caches_across_calls() {
        let resolver = TemplateResolver::new(vec![Box::new(BundledRegistry::new())]);
        let first = resolver.resolve("kumon:greeting:welcome:initial", "prod").unwrap();
        let second = resolver.resolve("kumon:greeting:welcome:initial", "prod").unwrap();
        assert_eq!(first.version, second.version);
    }
}
