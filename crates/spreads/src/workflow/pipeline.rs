//! Process and output steps.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;

use super::state::{Action, Step};
use super::Workflow;
use crate::config::Configuration;
use crate::error::{Result, SpreadsError};
use crate::events::Signal;
use crate::plugin::{Hook, PluginInstance, ProgressReporter, StepContext};

/// Folds one plugin's local progress into the step's global progress.
///
/// Each of `total` plugins owns an equal share. Values at or below the
/// high-water mark are dropped so that `step-progressed` never goes back.
struct StepProgress {
    workflow: Weak<Workflow>,
    step: Step,
    plugin: String,
    index: usize,
    total: usize,
    high: Arc<Mutex<f64>>,
}

impl ProgressReporter for StepProgress {
    fn report(&self, fraction: f64) {
        let Some(workflow) = self.workflow.upgrade() else {
            return;
        };
        let overall = (self.index as f64 + fraction.clamp(0.0, 1.0)) / self.total.max(1) as f64;
        // Held across the emission so concurrent reporters stay ordered
        let mut high = self.high.lock();
        if overall <= *high {
            return;
        }
        *high = overall;
        workflow.state.write().status.step_progress = Some(overall);
        workflow.emit(
            Signal::StepProgressed,
            crate::payload!(
                "step" => self.step.as_str(),
                "plugin_name" => self.plugin,
                "progress" => overall,
            ),
        );
    }
}

impl Workflow {
    /// Runs every active process plugin over the pages, in plugin order.
    /// Derivatives land in `data/done/<plugin>/`.
    pub fn process(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.state.read().check(Action::Process)?;
        self.validate(true)?;
        let config = self.config();
        let plugins = self.services.registry.build_plugins(&config, &[Hook::Process])?;

        self.run_step(Step::Process, &config, &plugins, |plugin, ctx| {
            let Some(hook) = plugin.process() else {
                return Ok(());
            };
            let target = self.data_path("done").join(plugin.name());
            std::fs::create_dir_all(&target).map_err(|e| SpreadsError::io(&target, e))?;

            let mut pages = self.pages();
            let outcome = hook.process(&mut pages, &target, ctx);
            {
                let mut bag = self.bag.lock();
                bag.add_payload(&[&target])?;
                if outcome.is_err() {
                    // Derivatives no page points to are dropped again
                    let referenced: BTreeSet<&str> = pages.iter().flat_map(|p| p.files()).collect();
                    let prefix = format!("{}/", bag.relative(&target)?);
                    let orphans: Vec<String> = bag
                        .payload_files()
                        .into_iter()
                        .filter(|f| f.starts_with(&prefix) && !referenced.contains(f.as_str()))
                        .collect();
                    if !orphans.is_empty() {
                        debug!("Discarding {} unreferenced derivative(s) of '{}'", orphans.len(), plugin.name());
                        bag.remove_payload(&orphans)?;
                    }
                }
            }
            // Committed on failure too
            self.commit_pages(pages)?;
            outcome
        })
    }

    /// Runs every active output plugin and registers the artifacts it wrote
    /// under `data/out/`. Returns the bag-relative paths of this run.
    pub fn output(&self, target: Option<&str>) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        self.state.read().check(Action::Output)?;
        self.validate(true)?;
        let config = self.config();
        let plugins = self.services.registry.build_plugins(&config, &[Hook::Output])?;

        let out = self.data_path("out");
        std::fs::create_dir_all(&out).map_err(|e| SpreadsError::io(&out, e))?;
        let mut produced: Vec<String> = Vec::new();

        self.run_step(Step::Output, &config, &plugins, |plugin, ctx| {
            let Some(hook) = plugin.output() else {
                return Ok(());
            };
            let pages = self.pages();
            let metadata = self.metadata();
            let files = hook.output(&pages, &out, &metadata, target, ctx)?;
            if files.is_empty() {
                warn!("Output plugin '{}' produced no files", plugin.name());
                return Ok(());
            }

            let added = self.bag.lock().add_payload(&files)?;
            let mut out_files = self.out_files.write();
            for rel in added {
                if !out_files.contains(&rel) {
                    out_files.push(rel.clone());
                }
                produced.push(rel);
            }
            Ok(())
        })?;
        Ok(produced)
    }

    fn run_step<F>(
        &self,
        step: Step,
        config: &Configuration,
        plugins: &[PluginInstance],
        mut run: F,
    ) -> Result<()>
    where
        F: FnMut(&PluginInstance, &StepContext) -> Result<()>,
    {
        let _span = tracing::info_span!("step", workflow = %self.id, step = step.as_str()).entered();
        self.state.write().begin_step(step);
        self.emit_modified(json!({ "status": self.status() }));

        let root = self.path();
        let page_count = self.pages.read().len();
        let high = Arc::new(Mutex::new(0.0));
        let mut result = Ok(());
        for (index, plugin) in plugins.iter().enumerate() {
            if let Err(e) = self.check_cancelled() {
                result = Err(e);
                break;
            }
            let reporter = Arc::new(StepProgress {
                workflow: self.me.clone(),
                step,
                plugin: plugin.name().to_string(),
                index,
                total: plugins.len(),
                high: Arc::clone(&high),
            });
            let ctx = StepContext::new(
                &root,
                config.view(plugin.name()),
                self.cancel.clone(),
                reporter.clone(),
                page_count,
            );

            debug!("Running {} plugin '{}'", step.as_str(), plugin.name());
            let _plugin_span = tracing::info_span!("plugin", name = plugin.name()).entered();
            if let Err(e) = run(plugin, &ctx) {
                warn!("{} plugin '{}' failed: {}", step.as_str(), plugin.name(), e);
                result = Err(e);
                break;
            }
            reporter.report(1.0);
        }

        let success = result.is_ok();
        self.state.write().end_step(success);
        if success {
            self.thumbnails.invalidate_all();
            info!("Finished {} of workflow {}", step.as_str(), self.id);
        }
        self.cancel.reset();
        self.emit_modified(json!({ "status": self.status(), "pages": self.pages() }));
        result
    }
}
