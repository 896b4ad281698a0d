//! Owns the workflows of one process: creation, lookup, removal and the
//! background queue for long-running steps.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bag::{Bag, BAGIT_TXT};
use crate::config::Configuration;
use crate::error::{Result, SpreadsError};
use crate::events::{EventBus, Signal};
use crate::metadata::Metadata;
use crate::plugin::PluginRegistry;
use crate::sanitize::workflow_dirname;
use crate::worker::{TaskHandle, TaskQueue};
use crate::workflow::{self, Workflow, WorkflowServices};

/// Key of the mapping returned by [`Engine::find_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindKey {
    #[default]
    Id,
    Name,
}

pub struct Engine {
    services: Arc<WorkflowServices>,
    queue: TaskQueue,
    workflows: Mutex<HashMap<Uuid, Weak<Workflow>>>,
}

impl Engine {
    /// Seeds the plugin and driver templates into `config` and starts the
    /// task queue.
    pub fn new(mut config: Configuration, registry: PluginRegistry, bus: Arc<EventBus>) -> Self {
        registry.seed_templates(&mut config);
        Self {
            services: Arc::new(WorkflowServices {
                bus,
                registry: Arc::new(registry),
                app_config: config,
                prepared: Mutex::new(None),
            }),
            queue: TaskQueue::new(),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.services.registry
    }

    pub fn config(&self) -> &Configuration {
        &self.services.app_config
    }

    /// Creates a workflow below `location`. The directory is named after the
    /// sanitized title, or the UUID when there is none.
    pub fn create(
        &self,
        location: &Path,
        config: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<Arc<Workflow>> {
        let metadata = match metadata {
            Some(value) => Metadata::from_value(value)?,
            None => Metadata::default(),
        };
        std::fs::create_dir_all(location).map_err(|e| SpreadsError::io(location, e))?;
        let dirname = metadata
            .title
            .as_deref()
            .and_then(workflow_dirname)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let workflow = Workflow::create(
            &location.join(dirname),
            config.unwrap_or_else(|| json!({})),
            metadata,
            Arc::clone(&self.services),
        )?;
        self.workflows
            .lock()
            .insert(workflow.id(), Arc::downgrade(&workflow));
        self.services.bus.send(
            Signal::WorkflowCreated,
            &workflow.id().to_string(),
            crate::payload!("workflow" => workflow.snapshot()),
        );
        Ok(workflow)
    }

    /// Opens the workflow at `path`; the same instance is returned for as
    /// long as any caller holds it.
    pub fn open(&self, path: &Path) -> Result<Arc<Workflow>> {
        let bag = Bag::open(path)?;
        let id = workflow::read_id(&bag)?;

        let mut workflows = self.workflows.lock();
        if let Some(existing) = workflows.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let opened = Workflow::open(bag, Arc::clone(&self.services))?;
        workflows.insert(id, Arc::downgrade(&opened));
        workflows.retain(|_, w| w.strong_count() > 0);
        Ok(opened)
    }

    /// Every workflow directly below `location`. Bags that fail to open are
    /// skipped with a warning.
    pub fn find_all(&self, location: &Path, key: FindKey) -> Result<BTreeMap<String, Arc<Workflow>>> {
        let mut found = BTreeMap::new();
        if !location.is_dir() {
            return Ok(found);
        }
        let entries = std::fs::read_dir(location).map_err(|e| SpreadsError::io(location, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.join(BAGIT_TXT).is_file() {
                continue;
            }
            match self.open(&path) {
                Ok(workflow) => {
                    let key = match key {
                        FindKey::Id => workflow.id().to_string(),
                        FindKey::Name => workflow.name(),
                    };
                    found.insert(key, workflow);
                }
                Err(e) => warn!(
                    "Skipping unreadable workflow {}: {}",
                    crate::sanitize::redact_path(&path),
                    e
                ),
            }
        }
        debug!("Found {} workflow(s)", found.len());
        Ok(found)
    }

    pub fn find_by_id(&self, location: &Path, id: Uuid) -> Result<Option<Arc<Workflow>>> {
        Ok(self.find_all(location, FindKey::Id)?.remove(&id.to_string()))
    }

    /// Deletes the workflow's directory. The instance must not be used
    /// afterwards.
    pub fn remove(&self, workflow: &Arc<Workflow>) -> Result<()> {
        workflow.delete()?;
        self.workflows.lock().remove(&workflow.id());
        self.services.bus.send(
            Signal::WorkflowRemoved,
            &workflow.id().to_string(),
            crate::payload!("workflow_id" => workflow.id()),
        );
        Ok(())
    }

    /// Queues `process`. `None` once the engine is shut down.
    pub fn submit_process(&self, workflow: &Arc<Workflow>) -> Option<TaskHandle<Result<()>>> {
        let workflow = Arc::clone(workflow);
        debug!("Queueing process for workflow {}", workflow.id());
        self.queue.submit(move || workflow.process())
    }

    pub fn submit_output(
        &self,
        workflow: &Arc<Workflow>,
        target: Option<String>,
    ) -> Option<TaskHandle<Result<Vec<String>>>> {
        let workflow = Arc::clone(workflow);
        debug!("Queueing output for workflow {}", workflow.id());
        self.queue
            .submit(move || workflow.output(target.as_deref()))
    }

    /// Queues a crop; `workflow.modified` follows its completion.
    pub fn crop_page_async(
        &self,
        workflow: &Arc<Workflow>,
        capture_num: u32,
        crop: (u32, u32, u32, u32),
    ) -> Option<TaskHandle<Result<()>>> {
        let workflow = Arc::clone(workflow);
        let (left, top, width, height) = crop;
        self.queue.submit(move || {
            workflow
                .crop_page(capture_num, left, top, width, height)
                .map(|_| ())
        })
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.pending()
    }

    /// Finishes a running capture session, then drains the task queue.
    pub fn shutdown(&self) {
        let prepared = self
            .services
            .prepared
            .lock()
            .take()
            .and_then(|w| w.upgrade());
        if let Some(workflow) = prepared {
            if let Err(e) = workflow.finish_capture() {
                warn!("Finishing capture on shutdown failed: {}", e);
            }
        }
        self.queue.shutdown();
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}
