pub mod bag;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metadata;
pub mod page;
pub mod plugin;
pub mod sanitize;
pub mod worker;
pub mod workflow;

pub use bag::{Algorithm, Bag, BagValidationError, Oxum, TarCompression, ValidationDetail};
pub use config::{ConfigTemplate, ConfigView, Configuration, OptionTemplate};
pub use device::{Device, DeviceFeature, DriverFactory, TargetPage};
pub use engine::{Engine, FindKey};
pub use error::{
    BagError, ConfigError, DeviceError, ErrorPayload, Result, SpreadsError, ValidationError,
    WorkflowError,
};
pub use events::{Event, EventBus, EventMessage, Signal};
pub use metadata::Metadata;
pub use page::Page;
pub use plugin::{
    CaptureHook, Hook, OutputHook, PluginFactory, PluginInstance, PluginRegistry, ProcessHook,
    StepContext, TriggerHandle, TriggerHook,
};
pub use workflow::{CancellationToken, Status, Step, Workflow, WorkflowSnapshot};
