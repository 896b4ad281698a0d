//! Plugin contract and registry.
//!
//! A plugin factory declares the hook families it implements up front. The
//! instance it builds is a capability bag holding one trait object per
//! declared family; the engine selects active plugins by that declaration
//! alone.

pub mod hooks;
pub mod intervaltrigger;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigTemplate, ConfigView};
use crate::error::{ConfigError, SpreadsError};

pub use hooks::{
    CaptureHook, NoopProgress, OutputHook, ProcessHook, ProgressReporter, StepContext,
    TriggerEvent, TriggerHandle, TriggerHook,
};
pub use registry::PluginRegistry;

/// Hook families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Capture,
    Trigger,
    Process,
    Output,
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::Capture => "capture",
            Hook::Trigger => "trigger",
            Hook::Process => "process",
            Hook::Output => "output",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registered by name; builds configured instances.
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hook families the built instance provides.
    fn hooks(&self) -> &'static [Hook];

    /// Options for the plugin's own configuration section.
    fn configuration_template(&self) -> ConfigTemplate {
        ConfigTemplate::new()
    }

    /// `config` is scoped to the plugin's section.
    fn build(&self, config: ConfigView) -> Result<PluginInstance, SpreadsError>;

    fn implements(&self, hook: Hook) -> bool {
        self.hooks().contains(&hook)
    }
}

/// A built plugin: one optional trait object per hook family.
#[derive(Clone)]
pub struct PluginInstance {
    name: String,
    capture: Option<Arc<dyn CaptureHook>>,
    trigger: Option<Arc<dyn TriggerHook>>,
    process: Option<Arc<dyn ProcessHook>>,
    output: Option<Arc<dyn OutputHook>>,
}

impl PluginInstance {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capture: None,
            trigger: None,
            process: None,
            output: None,
        }
    }

    pub fn with_capture(mut self, hook: Arc<dyn CaptureHook>) -> Self {
        self.capture = Some(hook);
        self
    }

    pub fn with_trigger(mut self, hook: Arc<dyn TriggerHook>) -> Self {
        self.trigger = Some(hook);
        self
    }

    pub fn with_process(mut self, hook: Arc<dyn ProcessHook>) -> Self {
        self.process = Some(hook);
        self
    }

    pub fn with_output(mut self, hook: Arc<dyn OutputHook>) -> Self {
        self.output = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capture(&self) -> Option<&Arc<dyn CaptureHook>> {
        self.capture.as_ref()
    }

    pub fn trigger(&self) -> Option<&Arc<dyn TriggerHook>> {
        self.trigger.as_ref()
    }

    pub fn process(&self) -> Option<&Arc<dyn ProcessHook>> {
        self.process.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<dyn OutputHook>> {
        self.output.as_ref()
    }

    fn provides(&self, hook: Hook) -> bool {
        match hook {
            Hook::Capture => self.capture.is_some(),
            Hook::Trigger => self.trigger.is_some(),
            Hook::Process => self.process.is_some(),
            Hook::Output => self.output.is_some(),
        }
    }

    /// Every declared family must be backed by a trait object.
    pub fn check_declared(&self, declared: &[Hook]) -> Result<(), ConfigError> {
        match declared.iter().find(|hook| !self.provides(**hook)) {
            Some(missing) => Err(ConfigError::InvalidValue {
                key: format!("{}.hooks", self.name),
                reason: format!("declares the {} hook but does not provide it", missing),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provided: Vec<&str> = [Hook::Capture, Hook::Trigger, Hook::Process, Hook::Output]
            .into_iter()
            .filter(|h| self.provides(*h))
            .map(|h| h.name())
            .collect();
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("hooks", &provided)
            .finish()
    }
}
