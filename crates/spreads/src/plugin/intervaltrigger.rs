//! Triggers a capture every `interval` seconds while capture is prepared.

use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{Hook, PluginFactory, PluginInstance, TriggerHandle, TriggerHook};
use crate::config::{ConfigTemplate, ConfigView, OptionTemplate};
use crate::error::{ConfigError, Result, SpreadsError};

pub const PLUGIN_NAME: &str = "intervaltrigger";

pub struct IntervalTriggerFactory;

impl PluginFactory for IntervalTriggerFactory {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::Trigger]
    }

    fn configuration_template(&self) -> ConfigTemplate {
        ConfigTemplate::new().with(
            "interval",
            OptionTemplate::new(5.0, "Seconds between two captures").depends_on_plugin(PLUGIN_NAME),
        )
    }

    fn build(&self, config: ConfigView) -> Result<PluginInstance> {
        let seconds = config.get_as::<f64>("interval").unwrap_or(5.0);
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.interval", PLUGIN_NAME),
                reason: format!("must be a positive number of seconds, got {}", seconds),
            }
            .into());
        }
        let trigger = IntervalTrigger::new(Duration::from_secs_f64(seconds));
        Ok(PluginInstance::new(PLUGIN_NAME).with_trigger(std::sync::Arc::new(trigger)))
    }
}

pub struct IntervalTrigger {
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalTrigger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            worker: Mutex::new(None),
        }
    }
}

impl TriggerHook for IntervalTrigger {
    fn start_trigger_loop(&self, handle: TriggerHandle) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Interval trigger already running");
            return Ok(());
        }
        let interval = self.interval;
        info!("Starting interval trigger every {:?}", interval);
        let thread = std::thread::Builder::new()
            .name("intervaltrigger".to_string())
            .spawn(move || {
                while !handle.wait_for_shutdown(interval) {
                    handle.trigger();
                }
                debug!("Interval trigger stopped");
            })
            .map_err(|e| SpreadsError::plugin(PLUGIN_NAME, e))?;
        *worker = Some(thread);
        Ok(())
    }

    /// Joins the loop thread. The shutdown channel must already be closed.
    fn stop_trigger_loop(&self) -> Result<()> {
        let Some(thread) = self.worker.lock().take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| SpreadsError::plugin(PLUGIN_NAME, "trigger thread panicked"))
    }
}
