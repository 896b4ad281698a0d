//! Mock devices and recording plugins.
//!
//! The mock driver wraps the built-in dummy device so captures produce real
//! JPEGs, and adds counters plus failure injection. Hook plugins record
//! every call into a shared `Recorder`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use spreads::config::ConfigView;
use spreads::device::dummy::DummyDevice;
use spreads::error::{DeviceError, Result, SpreadsError};
use spreads::metadata::Metadata;
use spreads::page::Page;
use spreads::plugin::{
    CaptureHook, Hook, OutputHook, PluginFactory, PluginInstance, ProcessHook, StepContext,
};
use spreads::{Device, DeviceFeature, DriverFactory, TargetPage};

pub const MOCK_DRIVER: &str = "mock";

const PAIR_FEATURES: &[DeviceFeature] = &[DeviceFeature::IsCamera, DeviceFeature::TargetPages];
const SINGLE_FEATURES: &[DeviceFeature] = &[DeviceFeature::IsCamera];

/// Shared state of all mock devices, inspected and steered by tests.
pub struct MockRig {
    pub prepares: AtomicUsize,
    pub captures: AtomicUsize,
    pub finishes: AtomicUsize,
    pub connected: AtomicBool,
    /// Index of the device whose next captures fail after writing a
    /// partial file.
    pub fail_device: Mutex<Option<usize>>,
    /// Number of upcoming `prepare_capture` calls that time out.
    pub transient_failures: AtomicUsize,
    pub fail_finish: AtomicBool,
    pub config_updates: Mutex<Vec<Value>>,
}

impl Default for MockRig {
    fn default() -> Self {
        Self {
            prepares: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            fail_device: Mutex::new(None),
            transient_failures: AtomicUsize::new(0),
            fail_finish: AtomicBool::new(false),
            config_updates: Mutex::new(Vec::new()),
        }
    }
}

pub struct MockDriver {
    pub rig: Arc<MockRig>,
    pub targets: Vec<Option<TargetPage>>,
    pub delay: Duration,
    pub target_pages: bool,
}

impl MockDriver {
    /// Two devices, even first.
    pub fn pair(rig: Arc<MockRig>) -> Self {
        Self {
            rig,
            targets: vec![Some(TargetPage::Even), Some(TargetPage::Odd)],
            delay: Duration::ZERO,
            target_pages: true,
        }
    }
}

impl DriverFactory for MockDriver {
    fn name(&self) -> &'static str {
        MOCK_DRIVER
    }

    fn features(&self) -> &'static [DeviceFeature] {
        if self.target_pages {
            PAIR_FEATURES
        } else {
            SINGLE_FEATURES
        }
    }

    fn yield_devices(&self, config: &ConfigView) -> std::result::Result<Vec<Arc<dyn Device>>, DeviceError> {
        let upside_down = config.get_bool("upside_down", false);
        Ok(self
            .targets
            .iter()
            .enumerate()
            .map(|(index, target)| {
                Arc::new(MockDevice {
                    inner: DummyDevice::new(format!("mock-{}", index), *target, self.delay, upside_down),
                    index,
                    rig: Arc::clone(&self.rig),
                }) as Arc<dyn Device>
            })
            .collect())
    }
}

pub struct MockDevice {
    inner: DummyDevice,
    index: usize,
    rig: Arc<MockRig>,
}

impl Device for MockDevice {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn features(&self) -> &[DeviceFeature] {
        SINGLE_FEATURES
    }

    fn connected(&self) -> bool {
        self.rig.connected.load(Ordering::SeqCst)
    }

    fn target_page(&self) -> Option<TargetPage> {
        self.inner.target_page()
    }

    fn set_target_page(&self, target: TargetPage) -> std::result::Result<(), DeviceError> {
        self.inner.set_target_page(target)
    }

    fn prepare_capture(&self) -> std::result::Result<(), DeviceError> {
        self.rig.prepares.fetch_add(1, Ordering::SeqCst);
        let pending = self.rig.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.rig.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(DeviceError::Timeout(format!("{} did not answer", self.id())));
        }
        self.inner.prepare_capture()
    }

    fn capture(&self, path: &Path) -> std::result::Result<PathBuf, DeviceError> {
        self.rig.captures.fetch_add(1, Ordering::SeqCst);
        if *self.rig.fail_device.lock() == Some(self.index) {
            let partial = path.with_extension("jpg");
            std::fs::write(&partial, b"\xff\xd8 truncated").map_err(|source| DeviceError::Io {
                path: partial.clone(),
                source,
            })?;
            return Err(DeviceError::Failed(format!("{}: shutter jammed", self.id())));
        }
        self.inner.capture(path)
    }

    fn finish_capture(&self) -> std::result::Result<(), DeviceError> {
        self.rig.finishes.fetch_add(1, Ordering::SeqCst);
        if self.rig.fail_finish.load(Ordering::SeqCst) {
            return Err(DeviceError::Failed(format!("{}: lens stuck", self.id())));
        }
        Ok(())
    }

    fn update_configuration(&self, changes: &Value) -> std::result::Result<(), DeviceError> {
        self.rig.config_updates.lock().push(changes.clone());
        self.inner.update_configuration(changes)
    }
}

/// Ordered log of hook calls, e.g. `beep.capture:2` or `rotate.process`.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }
}

type Build = dyn Fn(&ConfigView) -> Result<PluginInstance> + Send + Sync;

/// Plugin factory backed by a closure.
pub struct FnPlugin {
    name: &'static str,
    hooks: &'static [Hook],
    build: Box<Build>,
}

impl FnPlugin {
    pub fn new<F>(name: &'static str, hooks: &'static [Hook], build: F) -> Self
    where
        F: Fn(&ConfigView) -> Result<PluginInstance> + Send + Sync + 'static,
    {
        Self {
            name,
            hooks,
            build: Box::new(build),
        }
    }
}

impl PluginFactory for FnPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hooks(&self) -> &'static [Hook] {
        self.hooks
    }

    fn build(&self, config: ConfigView) -> Result<PluginInstance> {
        (self.build)(&config)
    }
}

/// Capture hook that records its calls.
pub struct BeepHook {
    pub recorder: Arc<Recorder>,
    pub fail_finish: bool,
}

impl CaptureHook for BeepHook {
    fn prepare_capture(&self, devices: &[Arc<dyn Device>]) -> Result<()> {
        self.recorder.record(format!("beep.prepare:{}", devices.len()));
        Ok(())
    }

    fn capture(&self, pages: &[Page]) -> Result<()> {
        self.recorder.record(format!("beep.capture:{}", pages.len()));
        Ok(())
    }

    fn finish_capture(&self, _devices: &[Arc<dyn Device>]) -> Result<()> {
        self.recorder.record("beep.finish");
        if self.fail_finish {
            return Err(SpreadsError::plugin("beep", "speaker unplugged"));
        }
        Ok(())
    }
}

/// Writes one derivative per page, read from the best available source.
pub struct DerivativeHook {
    pub name: &'static str,
    pub extension: &'static str,
    pub recorder: Arc<Recorder>,
    pub delay: Duration,
    pub fail: bool,
}

impl ProcessHook for DerivativeHook {
    fn process(&self, pages: &mut [Page], target_path: &Path, ctx: &StepContext) -> Result<()> {
        self.recorder.record(format!("{}.process", self.name));
        for (idx, page) in pages.iter_mut().enumerate() {
            if self.fail && idx == 1 {
                return Err(SpreadsError::plugin(self.name, "cannot read page"));
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let source = ctx.resolve(page.get_latest_processed(true).unwrap_or(page.raw_image.as_str()));
            let bytes = std::fs::read(&source).map_err(|e| SpreadsError::io(&source, e))?;
            let out = target_path.join(format!("{:03}.{}", page.capture_num, self.extension));
            let content = if self.extension == "jpg" {
                bytes
            } else {
                format!("<html><!-- {} bytes --></html>", bytes.len()).into_bytes()
            };
            std::fs::write(&out, content).map_err(|e| SpreadsError::io(&out, e))?;
            page.set_processed(self.name, &ctx.relative(&out));
            ctx.page_done()?;
        }
        Ok(())
    }
}

/// Writes a scratch file, then fails before touching any page.
pub struct StrayFileHook {
    pub recorder: Arc<Recorder>,
}

impl ProcessHook for StrayFileHook {
    fn process(&self, _pages: &mut [Page], target_path: &Path, _ctx: &StepContext) -> Result<()> {
        self.recorder.record("stray.process".to_string());
        let scratch = target_path.join("scratch.tmp");
        std::fs::write(&scratch, b"half done").map_err(|e| SpreadsError::io(&scratch, e))?;
        Err(SpreadsError::plugin("stray", "gave up midway"))
    }
}

/// Writes a single text "book" listing the pages.
pub struct BookHook {
    pub recorder: Arc<Recorder>,
}

impl OutputHook for BookHook {
    fn output(
        &self,
        pages: &[Page],
        out_path: &Path,
        metadata: &Metadata,
        target: Option<&str>,
        ctx: &StepContext,
    ) -> Result<Vec<PathBuf>> {
        self.recorder
            .record(format!("book.output:{}", target.unwrap_or("default")));
        let title = metadata.title.clone().unwrap_or_else(|| "book".to_string());
        let file = out_path.join(format!("{}.txt", title));
        let listing: String = pages
            .iter()
            .map(|p| format!("{} {}\n", p.page_label, p.raw_image))
            .collect();
        std::fs::write(&file, listing).map_err(|e| SpreadsError::io(&file, e))?;
        ctx.report(1.0)?;
        Ok(vec![file])
    }
}

pub fn beep_plugin(recorder: Arc<Recorder>, fail_finish: bool) -> FnPlugin {
    FnPlugin::new("beep", &[Hook::Capture], move |_| {
        Ok(PluginInstance::new("beep").with_capture(Arc::new(BeepHook {
            recorder: Arc::clone(&recorder),
            fail_finish,
        })))
    })
}

pub fn derivative_plugin(
    name: &'static str,
    extension: &'static str,
    recorder: Arc<Recorder>,
    delay: Duration,
    fail: bool,
) -> FnPlugin {
    FnPlugin::new(name, &[Hook::Process], move |_| {
        Ok(PluginInstance::new(name).with_process(Arc::new(DerivativeHook {
            name,
            extension,
            recorder: Arc::clone(&recorder),
            delay,
            fail,
        })))
    })
}

pub fn stray_plugin(recorder: Arc<Recorder>) -> FnPlugin {
    FnPlugin::new("stray", &[Hook::Process], move |_| {
        Ok(PluginInstance::new("stray").with_process(Arc::new(StrayFileHook {
            recorder: Arc::clone(&recorder),
        })))
    })
}

pub fn book_plugin(recorder: Arc<Recorder>) -> FnPlugin {
    FnPlugin::new("book", &[Hook::Output], move |_| {
        Ok(PluginInstance::new("book").with_output(Arc::new(BookHook {
            recorder: Arc::clone(&recorder),
        })))
    })
}
