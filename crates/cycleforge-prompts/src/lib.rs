//! # cycleforge-prompts
//!
//! The prompt compiler (component C2): compiles system/user/criteria
//! templates once per cycle against `tera`, auto-converting single-brace
//! placeholders to `tera`'s double-brace form, and discovers each
//! template's required variables so the row processor can validate before
//! (or instead of) rendering.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use cycleforge_core::model::ValueMap;
use regex::Regex;

/// Raised by prompt compilation or rendering. Both variants convert to a
/// per-row [`cycleforge_core::model::Failure`] — the cycle continues.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PromptError {
    /// A required variable was undefined at render time.
    #[error("prompt rendering failed: {0}")]
    Rendering(String),
    /// A pre-render check detected an unsatisfiable template.
    #[error("prompt validation failed: {0}")]
    Validation(String),
}

/// A compiled template: its declared required variables (discovered by
/// parsing, minus any keys the caller supplied as defaults) alongside the
/// raw source and the defaults themselves.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub raw: String,
    pub required_fields: Vec<String>,
    pub defaults: ValueMap,
}

/// Compiles raw template strings against an internal `tera::Tera`
/// instance, tracking each template under a caller-chosen name.
pub struct PromptEngine {
    tera: tera::Tera,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        Self { tera: tera::Tera::default() }
    }

    /// Compiles `source` under `name`, auto-converting `{field}` to
    /// `{{ field }}` when no engine control syntax (`{{`/`{%`) is already
    /// present.
    pub fn compile(
        &mut self,
        source: &str,
        name: &str,
        defaults: &ValueMap,
    ) -> Result<PromptTemplate, PromptError> {
        let normalized = auto_convert(source);
        self.tera
            .add_raw_template(name, &normalized)
            .map_err(|e| PromptError::Validation(format!("template '{name}' failed to parse: {e}")))?;
        let required_fields = required_fields(&normalized, defaults);
        Ok(PromptTemplate {
            name: name.to_string(),
            raw: source.to_string(),
            required_fields,
            defaults: defaults.clone(),
        })
    }

    /// Checks that every required field is covered by `template`'s
    /// defaults, `context`, or `extra`, without rendering.
    pub fn validate(
        &self,
        template: &PromptTemplate,
        context: &ValueMap,
        extra: &ValueMap,
    ) -> Result<(), PromptError> {
        let provided: HashSet<&str> = template
            .defaults
            .keys()
            .map(String::as_str)
            .chain(context.keys().map(String::as_str))
            .chain(extra.keys().map(String::as_str))
            .collect();
        let missing: Vec<&str> = template
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|f| !provided.contains(f))
            .collect();
        if !missing.is_empty() {
            return Err(PromptError::Validation(format!(
                "missing fields for prompt '{}': {}",
                template.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Renders `template` against `context` (the row) plus `extra`
    /// (per-criterion additions, e.g. `{criteria: <name>}`), validating
    /// first.
    pub fn render(
        &self,
        template: &PromptTemplate,
        context: &ValueMap,
        extra: &ValueMap,
    ) -> Result<String, PromptError> {
        self.validate(template, context, extra)?;
        let mut ctx = tera::Context::new();
        for (k, v) in &template.defaults {
            ctx.insert(k, v);
        }
        for (k, v) in context {
            ctx.insert(k, v);
        }
        for (k, v) in extra {
            ctx.insert(k, v);
        }
        self.tera
            .render(&template.name, &ctx)
            .map_err(|e| PromptError::Rendering(format!("failed to render '{}': {e}", template.name)))
    }
}

fn auto_convert(text: &str) -> String {
    if text.contains("{{") || text.contains("{%") {
        return text.to_string();
    }
    static SINGLE_BRACE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap());
    SINGLE_BRACE.replace_all(text, "{{ $1 }}").into_owned()
}

fn required_fields(normalized: &str, defaults: &ValueMap) -> Vec<String> {
    static VAR_EXPR: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    let skip: HashSet<&str> = ["loop", "cycler", "namespace"].into_iter().collect();
    let mut found = BTreeSet::new();
    for cap in VAR_EXPR.captures_iter(normalized) {
        let ident = &cap[1];
        if skip.contains(ident) || defaults.contains_key(ident) {
            continue;
        }
        found.insert(ident.to_string());
    }
    found.into_iter().collect()
}

/// One criterion's prompt definition: a name, an optional override
/// template (falling back to the cycle's user prompt), and its own
/// defaults layered on top of the cycle's.
#[derive(Debug, Clone, Default)]
pub struct CriterionDef {
    pub name: Option<String>,
    pub template: Option<String>,
    pub defaults: ValueMap,
}

/// The three compiled artifacts produced by one [`PromptCompiler::compile`] call.
#[derive(Debug, Clone)]
pub struct CompiledPrompts {
    pub system: PromptTemplate,
    pub user: PromptTemplate,
    pub criteria: indexmap::IndexMap<String, PromptTemplate>,
}

/// Compiles a cycle's system/user/criteria templates with cycle-scoped
/// names: `<cycle>:system`, `<cycle>:user`, `<cycle>:criteria:<name>`.
pub struct PromptCompiler<'a> {
    engine: &'a mut PromptEngine,
    system_prompt: String,
    user_prompt: String,
    cycle_name: String,
    defaults: ValueMap,
    criteria: Vec<CriterionDef>,
}

impl<'a> PromptCompiler<'a> {
    pub fn new(
        engine: &'a mut PromptEngine,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        cycle_name: impl Into<String>,
        defaults: ValueMap,
        criteria: Vec<CriterionDef>,
    ) -> Self {
        Self {
            engine,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            cycle_name: cycle_name.into(),
            defaults,
            criteria,
        }
    }

    pub fn compile(&mut self) -> Result<CompiledPrompts, PromptError> {
        let system = self.engine.compile(
            &self.system_prompt,
            &format!("{}:system", self.cycle_name),
            &self.defaults,
        )?;
        let user = self.engine.compile(
            &self.user_prompt,
            &format!("{}:user", self.cycle_name),
            &self.defaults,
        )?;

        let mut criteria = indexmap::IndexMap::new();
        for crit in &self.criteria {
            let template_text = crit.template.clone().unwrap_or_else(|| self.user_prompt.clone());
            let crit_name = crit.name.clone().unwrap_or_else(|| template_text.clone());
            let mut crit_defaults = self.defaults.clone();
            for (k, v) in &crit.defaults {
                crit_defaults.insert(k.clone(), v.clone());
            }
            let name = format!("{}:criteria:{}", self.cycle_name, crit_name);
            let compiled = self.engine.compile(&template_text, &name, &crit_defaults)?;
            criteria.insert(crit_name, compiled);
        }

        Ok(CompiledPrompts { system, user, criteria })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> ValueMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn single_brace_auto_converts() {
        assert_eq!(auto_convert("Hello {name}!"), "Hello {{ name }}!");
    }

    #[test]
    fn already_tera_syntax_is_left_alone() {
        let text = "Hello {{ name }}, {% if vip %}VIP{% endif %}";
        assert_eq!(auto_convert(text), text);
    }

    #[test]
    fn required_fields_excludes_defaults() {
        let mut engine = PromptEngine::new();
        let defaults = map(&[("tone", json!("formal"))]);
        let template = engine.compile("Hi {name}, tone: {tone}", "t", &defaults).unwrap();
        assert_eq!(template.required_fields, vec!["name".to_string()]);
    }

    #[test]
    fn render_succeeds_when_all_fields_provided() {
        let mut engine = PromptEngine::new();
        let defaults = ValueMap::new();
        let template = engine.compile("Hello {name}!", "greet", &defaults).unwrap();
        let context = map(&[("name", json!("Ada"))]);
        let rendered = engine.render(&template, &context, &ValueMap::new()).unwrap();
        assert_eq!(rendered, "Hello Ada!");
    }

    #[test]
    fn render_fails_on_missing_required_field() {
        let mut engine = PromptEngine::new();
        let template = engine.compile("Hello {name}!", "greet", &ValueMap::new()).unwrap();
        let err = engine.render(&template, &ValueMap::new(), &ValueMap::new()).unwrap_err();
        assert!(matches!(err, PromptError::Validation(_)));
    }

    #[test]
    fn compiler_names_templates_by_cycle_and_kind() {
        let mut engine = PromptEngine::new();
        let criteria = vec![CriterionDef { name: Some("accuracy".into()), ..Default::default() }];
        let mut compiler = PromptCompiler::new(
            &mut engine,
            "System: {role}",
            "User: {text}",
            "cycle1",
            ValueMap::new(),
            criteria,
        );
        let compiled = compiler.compile().unwrap();
        assert_eq!(compiled.system.name, "cycle1:system");
        assert_eq!(compiled.user.name, "cycle1:user");
        assert!(compiled.criteria.contains_key("accuracy"));
        assert_eq!(compiled.criteria["accuracy"].name, "cycle1:criteria:accuracy");
    }
}
