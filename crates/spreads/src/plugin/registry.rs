use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::{intervaltrigger, Hook, PluginFactory, PluginInstance};
use crate::config::Configuration;
use crate::device::{dummy, DriverFactory};
use crate::error::{ConfigError, SpreadsError};

/// Driver and hook-plugin factories, keyed by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    drivers: BTreeMap<String, Arc<dyn DriverFactory>>,
    plugins: BTreeMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `dummy` driver and the `intervaltrigger` plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_driver(Arc::new(dummy::DummyDriver));
        registry.register_plugin(Arc::new(intervaltrigger::IntervalTriggerFactory));
        registry
    }

    pub fn register_driver(&mut self, driver: Arc<dyn DriverFactory>) {
        debug!("Registering driver '{}'", driver.name());
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn PluginFactory>) {
        debug!("Registering plugin '{}'", plugin.name());
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn available_drivers(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn available_plugins(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn get_driver(&self, name: &str) -> Result<Arc<dyn DriverFactory>, ConfigError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDriver(name.to_string()))
    }

    /// Factories for `names`, in the given (configuration) order.
    pub fn get_plugins(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Arc<dyn PluginFactory>)>, ConfigError> {
        names
            .iter()
            .map(|name| {
                self.plugins
                    .get(name)
                    .map(|factory| (name.clone(), Arc::clone(factory)))
                    .ok_or_else(|| ConfigError::UnknownPlugin(name.clone()))
            })
            .collect()
    }

    /// The subset of `names` declaring at least one of `hooks`, order kept.
    pub fn get_relevant_extensions(
        &self,
        names: &[String],
        hooks: &[Hook],
    ) -> Result<Vec<(String, Arc<dyn PluginFactory>)>, ConfigError> {
        Ok(self
            .get_plugins(names)?
            .into_iter()
            .filter(|(_, factory)| hooks.iter().any(|h| factory.implements(*h)))
            .collect())
    }

    /// Seeds defaults: every plugin's template under its own section and the
    /// configured driver's template under `device`.
    pub fn seed_templates(&self, config: &mut Configuration) {
        for (name, factory) in &self.plugins {
            let template = factory.configuration_template();
            if !template.is_empty() {
                config.set_template(name, &template);
            }
        }
        if let Ok(driver) = config.driver() {
            if let Some(factory) = self.drivers.get(&driver) {
                config.set_template("device", &factory.configuration_template());
            }
        }
    }

    /// Builds the active plugins that declare any of `hooks`, each with a
    /// view scoped to its section.
    pub fn build_plugins(
        &self,
        config: &Configuration,
        hooks: &[Hook],
    ) -> Result<Vec<PluginInstance>, SpreadsError> {
        let mut instances = Vec::new();
        for (name, factory) in self.get_relevant_extensions(&config.active_plugins(), hooks)? {
            let instance = factory.build(config.view(&name))?;
            instance.check_declared(factory.hooks())?;
            instances.push(instance);
        }
        Ok(instances)
    }
}
