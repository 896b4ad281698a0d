//! Option templates declared by the core, drivers and plugins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Predicate deciding whether an option is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    /// The named plugin must be active (`core.plugins`).
    Plugin(String),
    /// Every `{section: {key: value}}` pair must match the current config.
    Options(BTreeMap<String, BTreeMap<String, Value>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionTemplate {
    pub value: Value,
    pub docstring: String,
    #[serde(default)]
    pub selectable: bool,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default)]
    pub depends: Option<Dependency>,
}

impl OptionTemplate {
    pub fn new(value: impl Into<Value>, docstring: &str) -> Self {
        Self {
            value: value.into(),
            docstring: docstring.to_string(),
            selectable: false,
            advanced: false,
            depends: None,
        }
    }

    /// An enumeration whose default is the first choice.
    pub fn choice(choices: &[&str], docstring: &str) -> Self {
        Self {
            selectable: true,
            ..Self::new(
                Value::Array(choices.iter().map(|c| Value::from(*c)).collect()),
                docstring,
            )
        }
    }

    pub fn advanced(mut self) -> Self {
        self.advanced = true;
        self
    }

    pub fn depends_on_plugin(mut self, plugin: &str) -> Self {
        self.depends = Some(Dependency::Plugin(plugin.to_string()));
        self
    }

    pub fn depends_on(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        let mut options = match self.depends.take() {
            Some(Dependency::Options(options)) => options,
            _ => BTreeMap::new(),
        };
        options
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self.depends = Some(Dependency::Options(options));
        self
    }

    /// The value seeded into the defaults layer.
    pub fn default_value(&self) -> Value {
        if self.selectable {
            match &self.value {
                Value::Array(choices) => choices.first().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            }
        } else {
            self.value.clone()
        }
    }

    /// Checks a candidate value against the template's type and choices.
    pub fn accepts(&self, candidate: &Value) -> bool {
        if self.selectable {
            return match &self.value {
                Value::Array(choices) => choices.contains(candidate),
                _ => true,
            };
        }
        match (&self.value, candidate) {
            (Value::Null, _) | (_, Value::Null) => true,
            (Value::Bool(_), Value::Bool(_)) => true,
            (Value::Number(_), Value::Number(_)) => true,
            (Value::String(_), Value::String(_)) => true,
            (Value::Array(_), Value::Array(_)) => true,
            (Value::Object(_), Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Ordered option declarations for one section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTemplate {
    options: Vec<(String, OptionTemplate)>,
}

impl ConfigTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, option: OptionTemplate) -> Self {
        self.insert(key, option);
        self
    }

    /// Adds or replaces an option, keeping the original position on replace.
    pub fn insert(&mut self, key: &str, option: OptionTemplate) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = option,
            None => self.options.push((key.to_string(), option)),
        }
    }

    pub fn extend(&mut self, other: &ConfigTemplate) {
        for (key, option) in &other.options {
            self.insert(key, option.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&OptionTemplate> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionTemplate)> {
        self.options.iter().map(|(k, o)| (k.as_str(), o))
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Section defaults as a JSON object.
    pub fn defaults(&self) -> Value {
        Value::Object(
            self.options
                .iter()
                .map(|(k, o)| (k.clone(), o.default_value()))
                .collect(),
        )
    }
}

pub fn core_template() -> ConfigTemplate {
    ConfigTemplate::new()
        .with("driver", OptionTemplate::new("", "Name of the device driver to use"))
        .with(
            "plugins",
            OptionTemplate::new(Value::Array(vec![]), "Active plugins, in pipeline order"),
        )
        .with(
            "loglevel",
            OptionTemplate::choice(&["info", "warning", "error", "debug"], "Logging level"),
        )
}

pub fn device_template() -> ConfigTemplate {
    ConfigTemplate::new()
        .with(
            "parallel_capture",
            OptionTemplate::new(true, "Trigger all devices at the same time"),
        )
        .with(
            "flip_target_pages",
            OptionTemplate::new(false, "Swap the odd and even target page assignment"),
        )
        .with(
            "upside_down",
            OptionTemplate::new(false, "Cameras are mounted upside-down").advanced(),
        )
}
