//! `${...}` templating for free-form manifests
//!
//! Workloads come from [`crate::manifest::WorkloadBuilder`]; everything else a
//! suite submits (parameter resources, Services, RoleBindings, HelmReleases)
//! is written as a YAML template with `${name}` placeholders:
//!
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//! - Escape: `$${...}` produces a literal `${...}`
//!
//! Undefined variables are an error rather than an empty string, so a typo in
//! a template never silently produces a different object.

use std::collections::BTreeMap;

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::Error;

/// Placeholder for escaped `$${` during preprocessing
const ESCAPED_PLACEHOLDER: &str = "\x00__VAP_ESCAPED_DOLLAR_BRACE__\x00";

/// Values available to a template
pub type TemplateValues = BTreeMap<String, Value>;

/// Template engine with `${...}` syntax and strict undefined handling
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create an engine with the `${...}` syntax
    pub fn new() -> Result<Self, Error> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| Error::manifest(format!("invalid template syntax: {}", e)))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Ok(Self { env })
    }

    /// Render `template` to a string
    pub fn render(&self, template: &str, values: &TemplateValues) -> Result<String, Error> {
        let preprocessed = template.replace("$${", ESCAPED_PLACEHOLDER);
        let rendered = self
            .env
            .render_str(&preprocessed, values)
            .map_err(|e| Error::manifest(format!("template render failed: {:#}", e)))?;
        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }

    /// Render `template` and decode it as a single manifest
    pub fn render_manifest(&self, template: &str, values: &TemplateValues) -> Result<Value, Error> {
        let rendered = self.render(template, values)?;
        match crate::yaml::parse_yaml(&rendered) {
            Ok(Value::Null) => Err(Error::manifest("template rendered to an empty document")),
            Ok(value) => Ok(value),
            Err(e) => Err(Error::manifest(format!("rendered template is not YAML: {}", e))),
        }
    }
}

/// Shorthand for building [`TemplateValues`] from string pairs
pub fn values<'a, I>(pairs: I) -> TemplateValues
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}
