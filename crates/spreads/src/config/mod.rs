//! Layered configuration.
//!
//! Reads collapse four layers, high to low precedence: command-line
//! overrides, the user file, the per-workflow overlay and the defaults seeded
//! from option templates. Writes go to the single writable layer, which is the
//! user layer for the application configuration and the overlay for a
//! workflow's configuration.

pub mod layered;
pub mod loader;
pub mod template;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ConfigError;

pub use layered::{diff_leaves, merge};
pub use loader::{config_path, load_yaml, write_yaml};
pub use template::{core_template, device_template, ConfigTemplate, Dependency, OptionTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Defaults,
    Workflow,
    User,
    Cli,
}

impl Layer {
    fn name(&self) -> &'static str {
        match self {
            Layer::Defaults => "defaults",
            Layer::Workflow => "workflow",
            Layer::User => "user",
            Layer::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    defaults: Value,
    workflow: Value,
    user: Value,
    cli: Value,
    writable: Layer,
    templates: BTreeMap<String, ConfigTemplate>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    /// Application configuration with the core and device templates seeded
    /// and nothing loaded from disk.
    pub fn new() -> Self {
        let mut config = Self {
            defaults: layered::empty(),
            workflow: layered::empty(),
            user: layered::empty(),
            cli: layered::empty(),
            writable: Layer::User,
            templates: BTreeMap::new(),
        };
        config.set_template("core", &core_template());
        config.set_template("device", &device_template());
        config
    }

    /// Application configuration with the user file at `path` loaded.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        config.user = loader::load_yaml(path)?;
        Ok(config)
    }

    /// Application configuration from the default user file location.
    pub fn load() -> Result<Self, ConfigError> {
        match loader::config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::new()),
        }
    }

    /// Derives a workflow configuration: same defaults, user and CLI layers,
    /// with `overlay` as the writable workflow layer.
    pub fn for_workflow(&self, overlay: Value) -> Self {
        Self {
            workflow: if overlay.is_object() {
                overlay
            } else {
                layered::empty()
            },
            writable: Layer::Workflow,
            ..self.clone()
        }
    }

    /// Registers `template` for `section` and seeds its defaults.
    pub fn set_template(&mut self, section: &str, template: &ConfigTemplate) {
        let entry = self.templates.entry(section.to_string()).or_default();
        entry.extend(template);
        layered::merge(
            &mut self.defaults,
            &serde_json::json!({ section: template.defaults() }),
        );
    }

    pub fn template(&self, section: &str) -> Option<&ConfigTemplate> {
        self.templates.get(section)
    }

    pub fn writable_layer(&self) -> Layer {
        self.writable
    }

    fn layer(&self, layer: Layer) -> &Value {
        match layer {
            Layer::Defaults => &self.defaults,
            Layer::Workflow => &self.workflow,
            Layer::User => &self.user,
            Layer::Cli => &self.cli,
        }
    }

    fn layer_mut(&mut self, layer: Layer) -> &mut Value {
        match layer {
            Layer::Defaults => &mut self.defaults,
            Layer::Workflow => &mut self.workflow,
            Layer::User => &mut self.user,
            Layer::Cli => &mut self.cli,
        }
    }

    /// The raw contents of one layer.
    pub fn layer_value(&self, layer: Layer) -> &Value {
        self.layer(layer)
    }

    /// User-overridden leaves of the writable layer (the workflow's
    /// `config.json`, or the user file).
    pub fn overlay(&self) -> &Value {
        self.layer(self.writable)
    }

    /// All layers collapsed into one tree.
    pub fn merged(&self) -> Value {
        let mut tree = self.defaults.clone();
        for layer in [Layer::Workflow, Layer::User, Layer::Cli] {
            layered::merge(&mut tree, self.layer(layer));
        }
        tree
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let path = layered::split_key(key);
        [Layer::Cli, Layer::User, Layer::Workflow, Layer::Defaults]
            .iter()
            .find_map(|layer| layered::get_path(self.layer(*layer), &path))
            .map(|value| match value {
                // Nested sections still need the lower layers merged in
                Value::Object(_) => layered::get_path(&self.merged(), &path)
                    .cloned()
                    .unwrap_or(Value::Null),
                other => other.clone(),
            })
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key).unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Writes one leaf to the writable layer after checking it against the
    /// section's template, when one exists.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let path = layered::split_key(key);
        if path.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "empty key".to_string(),
            });
        }
        self.check_value(&path, &value)?;
        let writable = self.writable;
        layered::set_path(self.layer_mut(writable), &path, value);
        Ok(())
    }

    fn check_value(&self, path: &[&str], value: &Value) -> Result<(), ConfigError> {
        if let [section, key] = path {
            if let Some(option) = self.templates.get(*section).and_then(|t| t.get(key)) {
                if !option.accepts(value) {
                    return Err(ConfigError::InvalidValue {
                        key: path.join("."),
                        reason: format!("{} does not match the declared option type", value),
                    });
                }
            }
        }
        Ok(())
    }

    /// Deep-merges `changes` into the writable layer and returns the leaves
    /// whose effective value changed.
    pub fn update(&mut self, changes: &Value) -> Result<Value, ConfigError> {
        let Value::Object(sections) = changes else {
            return Err(ConfigError::InvalidValue {
                key: "<root>".to_string(),
                reason: "changes must be an object".to_string(),
            });
        };
        for (section, options) in sections {
            if let Value::Object(options) = options {
                for (key, value) in options {
                    if !value.is_object() {
                        self.check_value(&[section.as_str(), key.as_str()], value)?;
                    }
                }
            }
        }

        let before = self.merged();
        let writable = self.writable;
        layered::merge(self.layer_mut(writable), changes);
        Ok(layered::diff_leaves(&before, &self.merged()))
    }

    /// Applies `--key`/`--plugin.key` style overrides. Bare keys belong to the
    /// `core` section.
    pub fn set_cli_overrides<'a, I>(&mut self, overrides: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        for (key, value) in overrides {
            let dotted = if key.contains('.') {
                key.to_string()
            } else {
                format!("core.{}", key)
            };
            let path = layered::split_key(&dotted);
            self.check_value(&path, &value)?;
            layered::set_path(&mut self.cli, &path, value);
        }
        Ok(())
    }

    /// Whether an option's `depends` predicate holds.
    pub fn is_visible(&self, section: &str, key: &str) -> bool {
        let Some(option) = self.templates.get(section).and_then(|t| t.get(key)) else {
            return true;
        };
        match &option.depends {
            None => true,
            Some(Dependency::Plugin(plugin)) => self.active_plugins().iter().any(|p| p == plugin),
            Some(Dependency::Options(required)) => required.iter().all(|(sec, keys)| {
                keys.iter()
                    .all(|(k, expected)| self.get(&format!("{}.{}", sec, k)).as_ref() == Some(expected))
            }),
        }
    }

    /// The merged tree with hidden options removed.
    pub fn visible(&self) -> Value {
        let mut tree = self.merged();
        for (section, template) in &self.templates {
            for (key, _) in template.iter() {
                if !self.is_visible(section, key) {
                    layered::remove_path(&mut tree, &[section.as_str(), key]);
                }
            }
        }
        tree
    }

    /// Writes the user-visible merged view as YAML.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        loader::write_yaml(path, &self.visible())
    }

    /// Persists the user layer to `path`. Only valid for the application
    /// configuration.
    pub fn save_user<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if self.writable != Layer::User {
            return Err(ConfigError::ReadOnly(Layer::User.name()));
        }
        loader::write_yaml(path, &self.user)
    }

    pub fn driver(&self) -> Result<String, ConfigError> {
        match self.get("core.driver") {
            Some(Value::String(driver)) if !driver.is_empty() => Ok(driver),
            _ => Err(ConfigError::MissingDriver),
        }
    }

    pub fn active_plugins(&self) -> Vec<String> {
        self.get_as::<Vec<String>>("core.plugins").unwrap_or_default()
    }

    pub fn loglevel(&self) -> String {
        self.get_as::<String>("core.loglevel")
            .unwrap_or_else(|_| "info".to_string())
    }

    /// Snapshot scoped to `section`.
    pub fn view(&self, section: &str) -> ConfigView {
        ConfigView {
            section: section.to_string(),
            tree: Arc::new(self.merged()),
        }
    }
}

/// Read-only snapshot of the merged configuration, scoped to one section.
#[derive(Debug, Clone)]
pub struct ConfigView {
    section: String,
    tree: Arc<Value>,
}

impl ConfigView {
    pub fn from_value(section: &str, tree: Value) -> Self {
        Self {
            section: section.to_string(),
            tree: Arc::new(tree),
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut path = vec![self.section.as_str()];
        path.extend(layered::split_key(key));
        layered::get_path(&self.tree, &path)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidValue {
            key: format!("{}.{}", self.section, key),
            reason: e.to_string(),
        })
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Reads a key from another section (`device.upside_down`).
    pub fn lookup(&self, dotted: &str) -> Option<&Value> {
        layered::get_path(&self.tree, &layered::split_key(dotted))
    }

    /// The same snapshot scoped to another section.
    pub fn scoped(&self, section: &str) -> ConfigView {
        ConfigView {
            section: section.to_string(),
            tree: Arc::clone(&self.tree),
        }
    }
}
