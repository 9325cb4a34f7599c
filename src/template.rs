use crate::variables::Variables;
use anyhow::Result;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Substitutes placeholders in templated request fields.
pub trait VariableResolver: Send + Sync {
    fn resolve(&self, text: &str, vars: &Variables) -> Result<String>;
}

/// Replaces `{{ name }}` with the matching variable. Unknown names are left in
/// place so the sent request shows what was unresolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, template: &str, vars: &Variables) -> String {
        PLACEHOLDER
            .replace_all(template, |cap: &Captures| match vars.get(cap[1].trim()) {
                Some(value) => value.clone(),
                None => cap[0].to_string(),
            })
            .into_owned()
    }
}

impl VariableResolver for TemplateEngine {
    fn resolve(&self, text: &str, vars: &Variables) -> Result<String> {
        Ok(self.render(text, vars))
    }
}
