use std::collections::BTreeMap;
use std::path::Path;

use super::tagfile::write_atomic;
use crate::error::BagError;
use crate::sanitize::{decode_manifest_path, encode_manifest_path};

/// Digest per bag-relative path (`data/raw/000.jpg` or `bagit.txt`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, BagError> {
        let mut entries = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (digest, file) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| BagError::MalformedTagFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                })?;
            let file = file.trim_start();
            if file.is_empty() {
                return Err(BagError::MalformedTagFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
            entries.insert(decode_manifest_path(file), digest.to_ascii_lowercase());
        }
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> Result<Self, BagError> {
        let content = std::fs::read_to_string(path).map_err(|e| BagError::io(path, e))?;
        Self::parse(&content, path)
    }

    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(file, digest)| format!("{}  {}\n", digest, encode_manifest_path(file)))
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<(), BagError> {
        write_atomic(path, self.serialize().as_bytes())
    }

    pub fn insert(&mut self, file: String, digest: String) -> Option<String> {
        self.entries.insert(file, digest)
    }

    pub fn remove(&mut self, file: &str) -> Option<String> {
        self.entries.remove(file)
    }

    /// Removes every entry equal to `prefix` or below `prefix/`.
    pub fn remove_tree(&mut self, prefix: &str) -> Vec<String> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let removed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.as_str() == prefix || k.starts_with(&dir))
            .cloned()
            .collect();
        for key in &removed {
            self.entries.remove(key);
        }
        removed
    }

    pub fn get(&self, file: &str) -> Option<&str> {
        self.entries.get(file).map(String::as_str)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.entries.contains_key(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(f, d)| (f.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
