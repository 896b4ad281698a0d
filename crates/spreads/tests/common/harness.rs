//! Engine fixture rooted in a temporary workspace.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use spreads::plugin::PluginFactory;
use spreads::{Configuration, Engine, Event, EventBus, PluginRegistry, Signal, TargetPage, Workflow};

use super::builders::{MockDriver, MockRig, Recorder, MOCK_DRIVER};

/// Test harness owning a temp workspace, an engine wired to the mock
/// driver, and the shared mock state.
pub struct TestHarness {
    pub temp_dir: TempDir,
    pub workspace: PathBuf,
    pub engine: Engine,
    pub rig: Arc<MockRig>,
    pub recorder: Arc<Recorder>,
    plugins: Vec<String>,
    parallel: bool,
    factories: Vec<Arc<dyn PluginFactory>>,
    targets: Vec<Option<TargetPage>>,
    delay: Duration,
    target_pages: bool,
}

impl TestHarness {
    /// Two-device pair rig without plugins.
    pub fn new() -> Self {
        HarnessBuilder::new().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Workflow configuration activating the harness plugins.
    pub fn workflow_config(&self) -> Value {
        json!({
            "core": { "plugins": self.plugins },
            "device": { "parallel_capture": self.parallel },
        })
    }

    pub fn create_workflow(&self, title: &str) -> Arc<Workflow> {
        self.engine
            .create(
                &self.workspace,
                Some(self.workflow_config()),
                Some(json!({ "title": title })),
            )
            .expect("Failed to create workflow")
    }

    /// Creates a workflow and leaves it prepared for capture.
    pub fn prepared_workflow(&self, title: &str) -> Arc<Workflow> {
        let workflow = self.create_workflow(title);
        workflow
            .prepare_capture(false)
            .expect("Failed to prepare capture");
        workflow
    }

    /// Every buffered event of `signal`, oldest first.
    pub fn events(&self, signal: Signal) -> Vec<Event> {
        self.engine
            .bus()
            .since(0)
            .into_iter()
            .filter(|e| e.signal == signal)
            .collect()
    }

    /// Replaces the engine with a fresh one over the same workspace. Callers
    /// must drop their workflow handles first.
    pub fn reopen_engine(&mut self) {
        let engine = build_engine(
            &self.rig,
            &self.factories,
            &self.targets,
            self.delay,
            self.target_pages,
        );
        let old = std::mem::replace(&mut self.engine, engine);
        old.shutdown();
    }
}

pub struct HarnessBuilder {
    targets: Vec<Option<TargetPage>>,
    target_pages: bool,
    delay: Duration,
    parallel: bool,
    plugins: Vec<String>,
    factories: Vec<Box<dyn FnOnce(Arc<Recorder>) -> Arc<dyn PluginFactory>>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            targets: vec![Some(TargetPage::Even), Some(TargetPage::Odd)],
            target_pages: true,
            delay: Duration::ZERO,
            parallel: true,
            plugins: Vec::new(),
            factories: Vec::new(),
        }
    }

    /// Device roles; the driver yields one device per entry.
    pub fn targets(mut self, targets: Vec<Option<TargetPage>>) -> Self {
        self.targets = targets;
        self
    }

    /// Whether the driver requires odd/even target pages.
    pub fn target_pages(mut self, required: bool) -> Self {
        self.target_pages = required;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Registers a plugin built around the shared recorder and activates it
    /// in registration order.
    pub fn plugin<F, P>(mut self, name: &str, build: F) -> Self
    where
        F: FnOnce(Arc<Recorder>) -> P + 'static,
        P: PluginFactory + 'static,
    {
        self.plugins.push(name.to_string());
        self.factories
            .push(Box::new(move |recorder| Arc::new(build(recorder)) as Arc<dyn PluginFactory>));
        self
    }

    /// Activates a plugin that is already registered, e.g. a builtin.
    pub fn activate(mut self, name: &str) -> Self {
        self.plugins.push(name.to_string());
        self
    }

    pub fn build(self) -> TestHarness {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let workspace = temp_dir.path().join("workflows");
        let rig = Arc::new(MockRig::default());
        let recorder = Arc::new(Recorder::default());
        let factories: Vec<Arc<dyn PluginFactory>> = self
            .factories
            .into_iter()
            .map(|build| build(Arc::clone(&recorder)))
            .collect();
        let engine = build_engine(&rig, &factories, &self.targets, self.delay, self.target_pages);
        TestHarness {
            temp_dir,
            workspace,
            engine,
            rig,
            recorder,
            plugins: self.plugins,
            parallel: self.parallel,
            factories,
            targets: self.targets,
            delay: self.delay,
            target_pages: self.target_pages,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_engine(
    rig: &Arc<MockRig>,
    factories: &[Arc<dyn PluginFactory>],
    targets: &[Option<TargetPage>],
    delay: Duration,
    target_pages: bool,
) -> Engine {
    let mut registry = PluginRegistry::with_builtins();
    registry.register_driver(Arc::new(MockDriver {
        rig: Arc::clone(rig),
        targets: targets.to_vec(),
        delay,
        target_pages,
    }));
    for factory in factories {
        registry.register_plugin(Arc::clone(factory));
    }
    let mut config = Configuration::new();
    config
        .set("core.driver", json!(MOCK_DRIVER))
        .expect("Failed to set driver");
    Engine::new(config, registry, Arc::new(EventBus::new()))
}
