use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::bag::BagValidationError;

#[derive(Error, Debug)]
pub enum SpreadsError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Missing dependency: '{tool}' was not found on PATH")]
    MissingDependency { tool: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Bag error: {0}")]
    Bag(#[from] BagError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{} error(s) occurred: {}", .errors.len(), join_messages(.errors))]
    Aggregate { errors: Vec<SpreadsError> },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn join_messages(errors: &[SpreadsError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SpreadsError {
    pub fn plugin(plugin: &str, message: impl fmt::Display) -> Self {
        SpreadsError::Plugin {
            plugin: plugin.to_string(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpreadsError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code used by command-line front ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpreadsError::Device(_) => 1,
            SpreadsError::Config(_) => 2,
            SpreadsError::MissingDependency { .. } => 3,
            _ => 4,
        }
    }

    /// Short type name used in serialized error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SpreadsError::Device(DeviceError::NotFound(_)) => "DeviceNotFound",
            SpreadsError::Device(_) => "DeviceError",
            SpreadsError::MissingDependency { .. } => "MissingDependency",
            SpreadsError::Validation(_) => "ValidationError",
            SpreadsError::Workflow(_) => "WorkflowError",
            SpreadsError::Bag(BagError::Validation(_)) => "ValidationError",
            SpreadsError::Bag(_) => "BagError",
            SpreadsError::Config(_) => "ConfigError",
            SpreadsError::Plugin { .. } => "PluginError",
            SpreadsError::Cancelled => "Cancelled",
            SpreadsError::Aggregate { .. } => "AggregateError",
            SpreadsError::Io { .. } => "IOError",
        }
    }

    /// Converts the error into the `{type, message, payload}` form consumed by the web layer.
    pub fn to_payload(&self) -> ErrorPayload {
        let payload = match self {
            SpreadsError::Validation(v) => serde_json::to_value(&v.fields).ok(),
            SpreadsError::Workflow(WorkflowError::IllegalTransition { current, attempted }) => {
                Some(serde_json::json!({ "current": current, "attempted": attempted }))
            }
            SpreadsError::Bag(BagError::Validation(v)) => serde_json::to_value(&v.details).ok(),
            SpreadsError::Aggregate { errors } => Some(serde_json::Value::Array(
                errors
                    .iter()
                    .map(|e| serde_json::to_value(e.to_payload()).unwrap_or_default())
                    .collect(),
            )),
            SpreadsError::Plugin { plugin, .. } => Some(serde_json::json!({ "plugin": plugin })),
            _ => None,
        };
        ErrorPayload {
            error_type: self.kind().to_string(),
            message: self.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{0}")]
    Failed(String),

    #[error("No device found: {0}")]
    NotFound(String),

    #[error("missing target page")]
    MissingTargetPage,

    #[error("Operation not supported by device: {0}")]
    NotSupported(String),

    #[error("Device timed out: {0}")]
    Timeout(String),

    #[error("Device I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeviceError {
    /// Transient errors may be retried once by the engine when preparing devices.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout(_))
    }
}

/// Request or configuration validation failure with a per-field message map.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed: {message}")]
pub struct ValidationError {
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, reason: impl Into<String>) -> Self {
        self.fields.insert(field.into(), reason.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Cannot {attempted} while workflow is {current}")]
    IllegalTransition { current: String, attempted: String },

    #[error("Workflow is not prepared for capture")]
    NotPrepared,

    #[error("Workflow at '{path}' is locked by another process")]
    Locked { path: PathBuf },

    #[error("Page with capture number {0} does not belong to this workflow")]
    UnknownPage(u32),
}

#[derive(Error, Debug)]
pub enum BagError {
    #[error("Refusing to create bag in non-empty directory '{0}'")]
    NotEmpty(PathBuf),

    #[error("'{0}' is not a bag: bagit.txt is missing")]
    NotABag(PathBuf),

    #[error("Unsupported BagIt version '{found}' (expected '{expected}')")]
    UnsupportedVersion { found: String, expected: String },

    #[error("Bag structure is invalid: {0}")]
    Structure(String),

    #[error("Malformed tag file '{path}' at line {line}")]
    MalformedTagFile { path: PathBuf, line: usize },

    #[error("Path '{0}' is not inside the bag")]
    OutsideBag(PathBuf),

    #[error("Tag file '{0}' must not live inside the payload directory")]
    TagFileInPayload(PathBuf),

    #[error("{0}")]
    Validation(#[from] BagValidationError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Bag I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BagError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BagError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("No device driver configured (set 'core.driver')")]
    MissingDriver,

    #[error("Unknown device driver '{0}'")]
    UnknownDriver(String),

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Layer '{0}' is read-only")]
    ReadOnly(&'static str),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, SpreadsError>;

/// Fails with `MissingDependency` unless `tool` resolves to an executable on `PATH`.
pub fn require_executable(tool: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| SpreadsError::MissingDependency {
            tool: tool.to_string(),
        })
}
