//! Template rendering: turns a record into the text that gets embedded.
//!
//! Templates are registered by name in a [`TemplateRegistry`]. Each entry is a
//! tera (Jinja-like) template plus the top-level record fields it requires.
//! Required fields are checked before rendering so that a record missing one
//! fails with [`TemplateError::MissingField`] rather than an engine error.
//!
//! # Built-in templates
//!
//! | name           | fields               |
//! |----------------|----------------------|
//! | `default`      | `text`               |
//! | `conversation` | `messages`           |
//! | `qa`           | `question`, `answer` |
//!
//! ```ignore
//! use subset_forge::template::TemplateRegistry;
//!
//! let mut registry = TemplateRegistry::with_builtins()?;
//! registry.register("title", "{{ title }}", &["title"])?;
//! let text = registry.render(&record, "conversation")?;
//! ```

use std::collections::BTreeMap;
use std::error::Error as StdError;

use serde_json::Value;
use tera::{Context, Tera};

use crate::error::TemplateError;
use crate::source::Record;

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE: &str = "conversation";

const BUILTIN_TEMPLATES: &[(&str, &str, &[&str])] = &[
    ("default", "{{ text }}", &["text"]),
    (
        "conversation",
        "{% for message in messages %}{% if message.role != \"system\" %}{{ message.role }}: {{ message.content }}\n{% endif %}{% endfor %}",
        &["messages"],
    ),
    (
        "qa",
        "Question: {{ question }}\nAnswer: {{ answer }}",
        &["question", "answer"],
    ),
];

/// A registered rendering rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRule {
    /// Template source.
    pub source: String,
    /// Top-level fields that must be present and non-null.
    pub required_fields: Vec<String>,
}

/// Name -> rendering rule mapping.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    engine: Tera,
    rules: BTreeMap<String, TemplateRule>,
}

impl TemplateRegistry {
    /// Creates a registry with no templates.
    pub fn empty() -> Self {
        Self {
            engine: Tera::default(),
            rules: BTreeMap::new(),
        }
    }

    /// Creates a registry holding the built-in templates.
    pub fn with_builtins() -> Result<Self, TemplateError> {
        let mut registry = Self::empty();
        for &(name, source, fields) in BUILTIN_TEMPLATES {
            registry.register(name, source, fields)?;
        }
        Ok(registry)
    }

    /// Registers (or replaces) a template.
    pub fn register<S: AsRef<str>>(
        &mut self,
        name: &str,
        source: &str,
        required_fields: &[S],
    ) -> Result<(), TemplateError> {
        self.engine
            .add_raw_template(name, source)
            .map_err(|e| TemplateError::Compile {
                name: name.to_string(),
                message: error_chain(&e),
            })?;

        self.rules.insert(
            name.to_string(),
            TemplateRule {
                source: source.to_string(),
                required_fields: required_fields
                    .iter()
                    .map(|f| f.as_ref().to_string())
                    .collect(),
            },
        );
        Ok(())
    }

    /// Returns true if a template with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.rules.keys().map(String::as_str).collect()
    }

    /// Looks up a rule by name.
    pub fn get(&self, name: &str) -> Result<&TemplateRule, TemplateError> {
        self.rules
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Renders a record through the named template.
    pub fn render(&self, record: &Record, name: &str) -> Result<String, TemplateError> {
        let rule = self.get(name)?;

        for field in &rule.required_fields {
            match record.get(field) {
                None | Some(Value::Null) => {
                    return Err(TemplateError::MissingField {
                        template: name.to_string(),
                        field: field.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        let context =
            Context::from_serialize(record.fields()).map_err(|e| TemplateError::Render {
                name: name.to_string(),
                message: error_chain(&e),
            })?;

        self.engine
            .render(name, &context)
            .map_err(|e| TemplateError::Render {
                name: name.to_string(),
                message: error_chain(&e),
            })
    }
}

/// Flattens tera's nested error sources into one line.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
