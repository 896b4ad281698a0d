use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "SPREADS_CONFIG";
pub const APP_DIR: &str = "spreads";
pub const CONFIG_FILE: &str = "config.yaml";

/// Resolves the user configuration file.
///
/// Order: `$SPREADS_CONFIG`, `$XDG_CONFIG_HOME/spreads/config.yaml`, the
/// platform config directory, then `~/.config/spreads/config.yaml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    config_dir().map(|dir| dir.join(CONFIG_FILE))
}

pub fn config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(xdg).join(APP_DIR));
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_DIR))
}

/// Reads a YAML file into a JSON tree. A missing file is an empty tree.
pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        log::debug!("No config file at {}, using defaults", path.display());
        return Ok(super::layered::empty());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_yaml_from_str(&content)
}

pub fn load_yaml_from_str(content: &str) -> Result<Value, ConfigError> {
    if content.trim().is_empty() {
        return Ok(super::layered::empty());
    }
    let value: Value = serde_yaml::from_str(content)?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(super::layered::empty()),
        _ => Err(ConfigError::InvalidValue {
            key: "<root>".to_string(),
            reason: "configuration must be a mapping of sections".to_string(),
        }),
    }
}

pub fn write_yaml<P: AsRef<Path>>(path: P, tree: &Value) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let content = serde_yaml::to_string(tree)?;
    write_atomic(path, content.as_bytes())
}

/// Reads a JSON overlay file (the per-workflow `config.json`).
pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(super::layered::empty());
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&content)?)
}

pub fn write_json<P: AsRef<Path>>(path: P, tree: &Value) -> Result<(), ConfigError> {
    let content = serde_json::to_vec_pretty(tree)?;
    write_atomic(path.as_ref(), &content)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::WriteFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}
