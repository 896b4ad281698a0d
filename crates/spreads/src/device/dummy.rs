//! Software-only driver that produces small synthetic JPEGs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use parking_lot::RwLock;
use serde_json::Value;

use super::{exif, Device, DeviceFeature, DriverFactory, TargetPage};
use crate::config::{ConfigTemplate, ConfigView, OptionTemplate};
use crate::error::DeviceError;

pub const DRIVER_NAME: &str = "dummy";

const FEATURES: &[DeviceFeature] = &[
    DeviceFeature::IsCamera,
    DeviceFeature::Preview,
    DeviceFeature::CanDisplayText,
    DeviceFeature::TargetPages,
];

pub struct DummyDriver;

impl DriverFactory for DummyDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn features(&self) -> &'static [DeviceFeature] {
        FEATURES
    }

    fn configuration_template(&self) -> ConfigTemplate {
        ConfigTemplate::new()
            .with(
                "dummy_devices",
                OptionTemplate::new(2, "Number of simulated devices").advanced(),
            )
            .with(
                "capture_delay_ms",
                OptionTemplate::new(0, "Simulated exposure time per shot").advanced(),
            )
    }

    fn yield_devices(&self, config: &ConfigView) -> Result<Vec<Arc<dyn Device>>, DeviceError> {
        let count = config.get_u64("dummy_devices", 2);
        let delay = Duration::from_millis(config.get_u64("capture_delay_ms", 0));
        let upside_down = config.get_bool("upside_down", false);

        let devices = (0..count)
            .map(|idx| {
                // First device shoots even pages, the second odd ones
                let target = match idx {
                    0 => Some(TargetPage::Even),
                    1 => Some(TargetPage::Odd),
                    _ => None,
                };
                Arc::new(DummyDevice::new(format!("dummy-{}", idx), target, delay, upside_down))
                    as Arc<dyn Device>
            })
            .collect();
        Ok(devices)
    }
}

pub struct DummyDevice {
    id: String,
    target: RwLock<Option<TargetPage>>,
    delay: RwLock<Duration>,
    upside_down: AtomicBool,
    shots: AtomicU32,
}

impl DummyDevice {
    pub fn new(id: String, target: Option<TargetPage>, delay: Duration, upside_down: bool) -> Self {
        Self {
            id,
            target: RwLock::new(target),
            delay: RwLock::new(delay),
            upside_down: AtomicBool::new(upside_down),
            shots: AtomicU32::new(0),
        }
    }

    fn render(&self) -> Result<Vec<u8>, DeviceError> {
        // Vary the pixels per shot so retakes produce different bytes
        let shot = self.shots.fetch_add(1, Ordering::SeqCst);
        let shade = (shot.wrapping_mul(37) % 200) as u8 + 40;
        let img = RgbImage::from_fn(32, 24, |x, _| {
            if x < 16 {
                Rgb([shade, shade, shade])
            } else {
                Rgb([255 - shade, 128, shade / 2])
            }
        });

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 85)
            .encode_image(&img)
            .map_err(|e| DeviceError::Failed(format!("{}: JPEG encoding failed: {}", self.id, e)))?;
        Ok(buf)
    }
}

impl Device for DummyDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn features(&self) -> &[DeviceFeature] {
        FEATURES
    }

    fn connected(&self) -> bool {
        true
    }

    fn target_page(&self) -> Option<TargetPage> {
        *self.target.read()
    }

    fn set_target_page(&self, target: TargetPage) -> Result<(), DeviceError> {
        *self.target.write() = Some(target);
        Ok(())
    }

    fn prepare_capture(&self) -> Result<(), DeviceError> {
        log::debug!("{}: ready", self.id);
        Ok(())
    }

    fn capture(&self, path: &Path) -> Result<PathBuf, DeviceError> {
        let delay = *self.delay.read();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut jpeg = self.render()?;
        if let Some(target) = self.target_page() {
            let orientation =
                exif::orientation_for(target, self.upside_down.load(Ordering::SeqCst));
            jpeg = exif::set_orientation(&jpeg, orientation)?;
        }

        let path = path.with_extension("jpg");
        std::fs::write(&path, jpeg).map_err(|source| DeviceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn get_preview_image(&self) -> Result<Vec<u8>, DeviceError> {
        self.render()
    }

    fn update_configuration(&self, changes: &Value) -> Result<(), DeviceError> {
        if let Some(device) = changes.get("device") {
            if let Some(ms) = device.get("capture_delay_ms").and_then(Value::as_u64) {
                *self.delay.write() = Duration::from_millis(ms);
            }
            if let Some(flag) = device.get("upside_down").and_then(Value::as_bool) {
                self.upside_down.store(flag, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn show_textbox(&self, message: &str) -> Result<(), DeviceError> {
        log::info!("{}: {}", self.id, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use tempfile::TempDir;

    fn device_view() -> ConfigView {
        let mut config = Configuration::new();
        config.set_template("device", &DummyDriver.configuration_template());
        config.view("device")
    }

    #[test]
    fn test_yields_two_devices_with_targets() {
        let devices = DummyDriver.yield_devices(&device_view()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].target_page(), Some(TargetPage::Even));
        assert_eq!(devices[1].target_page(), Some(TargetPage::Odd));
        assert!(DummyDriver.requires_target_pages());
    }

    #[test]
    fn test_capture_writes_oriented_jpeg() {
        let temp_dir = TempDir::new().unwrap();
        let devices = DummyDriver.yield_devices(&device_view()).unwrap();

        let written = devices[1].capture(&temp_dir.path().join("001")).unwrap();
        assert_eq!(written, temp_dir.path().join("001.jpg"));

        let bytes = std::fs::read(&written).unwrap();
        assert_eq!(exif::read_orientation(&bytes), Some(6));
    }

    #[test]
    fn test_live_reconfiguration() {
        let temp_dir = TempDir::new().unwrap();
        let device = DummyDevice::new("d".into(), Some(TargetPage::Even), Duration::ZERO, false);
        device
            .update_configuration(&serde_json::json!({"device": {"upside_down": true}}))
            .unwrap();

        let written = device.capture(&temp_dir.path().join("000.jpg")).unwrap();
        assert_eq!(exif::read_orientation(&std::fs::read(written).unwrap()), Some(6));
    }

    #[test]
    fn test_unsupported_focus() {
        let device = DummyDevice::new("d".into(), None, Duration::ZERO, false);
        assert!(matches!(device.acquire_focus(), Err(DeviceError::NotSupported(_))));
    }
}
