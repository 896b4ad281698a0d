//! Capture device contract consumed by the workflow engine.

pub mod dummy;
pub mod exif;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConfigTemplate, ConfigView};
use crate::error::DeviceError;

pub use exif::orientation_for;

/// Capability flags declared by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceFeature {
    IsCamera,
    Preview,
    CanDisplayText,
    CanAdjustFocus,
    /// Devices must be assigned distinct odd/even roles before capturing.
    TargetPages,
}

/// Which half of a spread a device photographs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPage {
    Odd,
    Even,
}

impl TargetPage {
    pub fn flipped(self) -> Self {
        match self {
            TargetPage::Odd => TargetPage::Even,
            TargetPage::Even => TargetPage::Odd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetPage::Odd => "odd",
            TargetPage::Even => "even",
        }
    }
}

impl std::str::FromStr for TargetPage {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odd" => Ok(TargetPage::Odd),
            "even" => Ok(TargetPage::Even),
            other => Err(DeviceError::Failed(format!("invalid target page '{}'", other))),
        }
    }
}

/// One physical capture device.
///
/// All methods may block. The engine shares devices across threads, so
/// mutable state lives behind interior locks.
pub trait Device: Send + Sync {
    /// Stable identifier, used in logs and error messages.
    fn id(&self) -> String;

    fn features(&self) -> &[DeviceFeature];

    fn has_feature(&self, feature: DeviceFeature) -> bool {
        self.features().contains(&feature)
    }

    /// Cheap liveness check, called before every capture session.
    fn connected(&self) -> bool;

    fn target_page(&self) -> Option<TargetPage>;

    fn set_target_page(&self, target: TargetPage) -> Result<(), DeviceError>;

    fn prepare_capture(&self) -> Result<(), DeviceError>;

    /// Writes one image. `path` carries the capture-number stem; the driver
    /// may change the extension and returns the path actually written.
    fn capture(&self, path: &Path) -> Result<PathBuf, DeviceError>;

    fn finish_capture(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// One JPEG frame.
    fn get_preview_image(&self) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotSupported("preview".to_string()))
    }

    /// Called with the changed leaves after a configuration update.
    fn update_configuration(&self, _changes: &Value) -> Result<(), DeviceError> {
        Ok(())
    }

    fn show_textbox(&self, _message: &str) -> Result<(), DeviceError> {
        Err(DeviceError::NotSupported("text display".to_string()))
    }

    /// One-shot autofocus returning an opaque focus value.
    fn acquire_focus(&self) -> Result<i64, DeviceError> {
        Err(DeviceError::NotSupported("focus".to_string()))
    }
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("target_page", &self.target_page())
            .finish()
    }
}

/// A driver: enumerates devices of one kind.
pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Class-level features, including [`DeviceFeature::TargetPages`].
    fn features(&self) -> &'static [DeviceFeature];

    /// Options merged into the `device` section.
    fn configuration_template(&self) -> ConfigTemplate {
        ConfigTemplate::new()
    }

    /// All currently attached devices, configured from the `device` section.
    fn yield_devices(&self, config: &ConfigView) -> Result<Vec<Arc<dyn Device>>, DeviceError>;

    fn requires_target_pages(&self) -> bool {
        self.features().contains(&DeviceFeature::TargetPages)
    }
}
