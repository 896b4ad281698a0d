//! Helpers for sanitizing names and data before they reach the filesystem or
//! tracing span attributes.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static RE_PATH_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[/:]").unwrap());

/// Returns only the filename component of a path, for log and span fields.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Turns a free-form title into a directory name by replacing `/` and `:`
/// with `_`. Returns `None` when nothing usable remains.
pub fn workflow_dirname(title: &str) -> Option<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return None;
    }
    let name = RE_PATH_SEPARATORS.replace_all(trimmed, "_").to_string();
    if name.trim_matches('.').is_empty() {
        return None;
    }
    Some(name)
}

/// Percent-encodes the characters that would break a line-oriented manifest.
pub fn encode_manifest_path(path: &str) -> String {
    path.replace('\r', "%0D").replace('\n', "%0A")
}

pub fn decode_manifest_path(path: &str) -> String {
    path.replace("%0D", "\r")
        .replace("%0d", "\r")
        .replace("%0A", "\n")
        .replace("%0a", "\n")
}
