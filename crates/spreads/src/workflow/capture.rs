//! Capture session: device preparation, shots, trigger plugins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, select, Receiver};
use log::{debug, info, warn};
use serde_json::json;

use super::numbering;
use super::state::Action;
use super::{CaptureSession, Workflow};
use crate::device::Device;
use crate::error::{DeviceError, Result, SpreadsError};
use crate::events::Signal;
use crate::page::Page;
use crate::plugin::{Hook, PluginInstance, TriggerEvent, TriggerHandle};
use crate::worker::fan_out;

/// Drivers write here first; files move to `data/raw` once the whole shot
/// succeeded.
pub const STAGING_DIR: &str = ".staging";

/// Pending trigger requests beyond this are dropped.
const TRIGGER_QUEUE: usize = 4;

impl Workflow {
    /// Enumerates and prepares the devices, runs the capture hooks'
    /// `prepare_capture` and starts trigger plugins.
    ///
    /// A second call on a prepared workflow does nothing unless `reset` is
    /// set. Another workflow holding the devices is finished first.
    pub fn prepare_capture(&self, reset: bool) -> Result<()> {
        // The other workflow's lock is only ever taken while ours is free
        let _guard = loop {
            if let Some(other) = self.other_prepared() {
                info!("Finishing capture of workflow {} first", other.id);
                if let Err(e) = other.finish_capture() {
                    warn!("Finishing capture of workflow {} failed: {}", other.id, e);
                }
            }
            let guard = self.lock.lock();
            if self.other_prepared().is_none() {
                break guard;
            }
        };
        self.cancel.reset();
        if self.is_prepared() {
            if !reset {
                debug!("Workflow {} is already prepared", self.id);
                return Ok(());
            }
            self.finish_capture()?;
        }
        self.state.read().check(Action::PrepareCapture)?;

        let config = self.config();
        let driver_name = config.driver()?;
        let driver = self.services.registry.get_driver(&driver_name)?;
        let devices = driver.yield_devices(&config.view("device"))?;
        if devices.is_empty() {
            return Err(DeviceError::NotFound(format!(
                "driver '{}' found no devices",
                driver_name
            ))
            .into());
        }
        if driver.requires_target_pages() {
            let targets: Vec<_> = devices.iter().map(|d| d.target_page()).collect();
            if !numbering::is_pair(&targets) {
                return Err(DeviceError::MissingTargetPage.into());
            }
        }

        let _span = tracing::info_span!("prepare_capture", workflow = %self.id, devices = devices.len())
            .entered();
        fan_out(devices.clone(), devices.len(), |_, device| prepare_device(&device))
            .into_result()?;

        let plugins = self
            .services
            .registry
            .build_plugins(&config, &[Hook::Capture, Hook::Trigger])?;
        for plugin in &plugins {
            if let Some(hook) = plugin.capture() {
                hook.prepare_capture(&devices)?;
            }
        }
        let shutdown = self.start_triggers(&plugins)?;

        *self.session.lock() = Some(CaptureSession {
            devices,
            plugins,
            shutdown,
        });
        self.state.write().begin_capture();
        *self.services.prepared.lock() = Some(self.me.clone());

        info!("Workflow {} is prepared for capture", self.id);
        self.emit_modified(json!({ "status": self.status() }));
        Ok(())
    }

    /// The workflow that holds the devices, when it is not this one.
    fn other_prepared(&self) -> Option<Arc<Workflow>> {
        let other = self
            .services
            .prepared
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)?;
        (other.id != self.id && other.is_prepared()).then_some(other)
    }

    /// Hands every trigger plugin a producer for a bounded queue drained by
    /// a thread that runs `capture`. Returns the shutdown sender.
    fn start_triggers(
        &self,
        plugins: &[PluginInstance],
    ) -> Result<Option<crossbeam_channel::Sender<()>>> {
        let triggers: Vec<&PluginInstance> =
            plugins.iter().filter(|p| p.trigger().is_some()).collect();
        if triggers.is_empty() {
            return Ok(None);
        }

        let (trigger_tx, trigger_rx) = bounded::<TriggerEvent>(TRIGGER_QUEUE);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let workflow = self.me.clone();
        let drainer_shutdown = shutdown_rx.clone();
        std::thread::Builder::new()
            .name(format!("spreads-trigger-{}", self.id))
            .spawn(move || drain_triggers(workflow, trigger_rx, drainer_shutdown))
            .map_err(|e| SpreadsError::plugin("trigger", e))?;

        for (idx, plugin) in triggers.iter().enumerate() {
            let Some(hook) = plugin.trigger() else {
                continue;
            };
            let handle = TriggerHandle::new(trigger_tx.clone(), shutdown_rx.clone());
            if let Err(e) = hook.start_trigger_loop(handle) {
                drop(shutdown_tx);
                for started in &triggers[..idx] {
                    if let Some(started) = started.trigger() {
                        let _ = started.stop_trigger_loop();
                    }
                }
                return Err(e);
            }
            debug!("Started trigger loop of '{}'", plugin.name());
        }
        Ok(Some(shutdown_tx))
    }

    /// Shoots one page per device.
    ///
    /// With `retake` the pages of the previous shot are replaced and their
    /// capture numbers reused. When that shot is no longer whole the latest
    /// complete spread is replaced instead, and with none left the retake
    /// shoots fresh numbers. Pages outside the new shot are never touched. Pages appear, and `capture-executed` is sent,
    /// only after every device succeeded; on failure partial files are
    /// deleted and the workflow stays prepared.
    pub fn capture(&self, retake: bool) -> Result<Vec<Page>> {
        let _guard = self.lock.lock();
        self.state.read().check(Action::Capture)?;
        let result = self.shoot(retake);
        self.cancel.reset();
        result
    }

    fn shoot(&self, retake: bool) -> Result<Vec<Page>> {
        self.check_cancelled()?;
        let (devices, plugins) = match self.session.lock().as_ref() {
            Some(session) => (session.devices.clone(), session.plugins.clone()),
            None => return Err(crate::error::WorkflowError::NotPrepared.into()),
        };
        if let Some(device) = devices.iter().find(|d| !d.connected()) {
            return Err(DeviceError::NotFound(format!("device {} is disconnected", device.id())).into());
        }

        let config = self.config();
        let parallel = config.get_as::<bool>("device.parallel_capture").unwrap_or(true);
        let flip = config.get_as::<bool>("device.flip_target_pages").unwrap_or(false);

        let mut pages = self.pages();
        let targets: Vec<_> = devices.iter().map(|d| d.target_page()).collect();
        let reuse = if retake {
            let present: BTreeSet<u32> = pages.iter().map(|p| p.capture_num).collect();
            numbering::retake_numbers(&present, &self.last_shot.lock(), &targets)
        } else {
            Vec::new()
        };
        let used: BTreeSet<u32> = pages
            .iter()
            .map(|p| p.capture_num)
            .filter(|n| !reuse.contains(n))
            .collect();
        let nums = numbering::assign(&targets, &used, &reuse, flip);
        // A page is replaced only when the new shot takes over its number
        let replaced: Vec<u32> = reuse.into_iter().filter(|n| nums.contains(n)).collect();

        let staging = self.path().join(STAGING_DIR);
        std::fs::create_dir_all(&staging).map_err(|e| SpreadsError::io(&staging, e))?;
        discard_staged(&staging, &nums);

        let _span = tracing::info_span!("capture", workflow = %self.id, retake, parallel).entered();
        let degree = if parallel { devices.len() } else { 1 };
        let jobs: Vec<(Arc<dyn Device>, u32)> =
            devices.iter().cloned().zip(nums.iter().copied()).collect();
        let cancel = self.cancel.clone();
        let outcome = fan_out(jobs, degree, |_, (device, num)| -> Result<PathBuf> {
            if cancel.is_cancelled() {
                return Err(SpreadsError::Cancelled);
            }
            let stem = staging.join(format!("{:03}", num));
            debug!("Capturing {} on {}", stem.display(), device.id());
            Ok(device.capture(&stem)?)
        });
        if let Some((idx, err)) = outcome.first_error {
            warn!("Capture on device {} failed: {}", idx, err);
            for (_, other) in &outcome.other_errors {
                warn!("Capture also failed: {}", other);
            }
            discard_staged(&staging, &nums);
            return Err(err);
        }
        let staged: Vec<PathBuf> = outcome.completed.into_iter().map(|(_, p)| p).collect();

        if !replaced.is_empty() {
            let old: Vec<String> = pages
                .iter()
                .filter(|p| replaced.contains(&p.capture_num))
                .flat_map(|p| p.files().into_iter().map(str::to_string))
                .collect();
            self.bag.lock().remove_payload(&old)?;
            pages.retain(|p| !replaced.contains(&p.capture_num));
            for num in &replaced {
                self.thumbnails.invalidate(num);
            }
        }

        let raw_dir = self.data_path("raw");
        std::fs::create_dir_all(&raw_dir).map_err(|e| SpreadsError::io(&raw_dir, e))?;
        let mut shot: Vec<(u32, PathBuf)> = Vec::with_capacity(staged.len());
        for (num, file) in nums.iter().zip(staged) {
            let ext = file
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "jpg".to_string());
            let target = raw_dir.join(format!("{:03}.{}", num, ext));
            std::fs::rename(&file, &target).map_err(|e| SpreadsError::io(&target, e))?;
            shot.push((*num, target));
        }
        let files: Vec<&PathBuf> = shot.iter().map(|(_, p)| p).collect();
        self.bag.lock().add_payload(&files)?;

        // Within a shot the even page precedes the odd one
        shot.sort_by_key(|(num, _)| *num);
        let mut new_pages = Vec::with_capacity(shot.len());
        for (num, file) in &shot {
            let rel = self.bag.lock().relative(file)?;
            let page = Page::new(*num, 0, rel);
            let idx = numbering::insertion_index(&pages, *num);
            pages.insert(idx, page);
        }
        self.commit_pages(pages)?;
        for (num, _) in &shot {
            if let Some(page) = self.page(*num) {
                new_pages.push(page);
            }
        }

        {
            let mut state = self.state.write();
            if state.capture_start.is_none() {
                state.capture_start = Some(chrono::Utc::now().timestamp());
            }
        }
        *self.last_shot.lock() = nums;

        for plugin in &plugins {
            if let Some(hook) = plugin.capture() {
                if let Err(e) = hook.capture(&new_pages) {
                    warn!("Capture hook '{}' failed: {}", plugin.name(), e);
                    self.emit_modified(json!({ "pages": self.pages() }));
                    return Err(e);
                }
            }
        }

        info!(
            "Captured {} page(s) for workflow {}{}",
            new_pages.len(),
            self.id,
            if retake { " (retake)" } else { "" }
        );
        self.emit(
            Signal::CaptureExecuted,
            crate::payload!("pages" => new_pages, "retake" => retake),
        );
        Ok(new_pages)
    }

    /// Stops triggers and runs every `finish_capture`, then leaves the
    /// capture phase. Failures are collected and returned together after all
    /// of them ran.
    pub fn finish_capture(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.state.read().check(Action::FinishCapture)?;

        let mut errors = Vec::new();
        if let Some(mut session) = self.session.lock().take() {
            errors.extend(session.stop_triggers());
            for plugin in &session.plugins {
                if let Some(hook) = plugin.capture() {
                    if let Err(e) = hook.finish_capture(&session.devices) {
                        warn!("Capture hook '{}' failed to finish: {}", plugin.name(), e);
                        errors.push(e);
                    }
                }
            }
            for device in &session.devices {
                if let Err(e) = device.finish_capture() {
                    warn!("Device {} failed to finish: {}", device.id(), e);
                    errors.push(e.into());
                }
            }
        }

        self.state.write().end_capture();
        {
            let mut prepared = self.services.prepared.lock();
            let mine = prepared
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|w| w.id == self.id);
            if mine {
                *prepared = None;
            }
        }
        let staging = self.path().join(STAGING_DIR);
        if staging.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                debug!("Could not remove {}: {}", staging.display(), e);
            }
        }
        self.cancel.reset();

        info!("Finished capture of workflow {}", self.id);
        self.emit_modified(json!({ "status": self.status() }));
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SpreadsError::Aggregate { errors })
        }
    }
}

/// Retries once when the driver reports a transient failure.
fn prepare_device(device: &Arc<dyn Device>) -> std::result::Result<(), DeviceError> {
    match device.prepare_capture() {
        Err(e) if e.is_transient() => {
            warn!("Preparing {} failed ({}), retrying once", device.id(), e);
            device.prepare_capture()
        }
        other => other,
    }
}

/// Deletes whatever a driver may have written for `nums`, whatever the
/// extension.
fn discard_staged(staging: &Path, nums: &[u32]) {
    let dir = glob::Pattern::escape(&staging.to_string_lossy());
    for num in nums {
        let patterns = [format!("{}/{:03}", dir, num), format!("{}/{:03}.*", dir, num)];
        let paths = patterns
            .iter()
            .filter_map(|pattern| glob::glob(pattern).ok())
            .flat_map(|paths| paths.flatten());
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed partial capture {}", path.display()),
                Err(e) => warn!("Failed to remove partial capture {}: {}", path.display(), e),
            }
        }
    }
}

fn drain_triggers(workflow: Weak<Workflow>, triggers: Receiver<TriggerEvent>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(triggers) -> event => {
                let Ok(event) = event else { break };
                let Some(workflow) = workflow.upgrade() else { break };
                debug!("Trigger fired {:?} ago", event.at.elapsed());
                if let Err(e) = workflow.capture(false) {
                    warn!("Triggered capture failed: {}", e);
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Trigger drainer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discard_staged_removes_any_extension() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["004.jpg", "004.cr2", "005", "0040.jpg", "006.jpg"] {
            std::fs::write(temp_dir.path().join(name), b"x").unwrap();
        }
        discard_staged(temp_dir.path(), &[4, 5]);
        let mut left: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["0040.jpg", "006.jpg"]);
    }
}
