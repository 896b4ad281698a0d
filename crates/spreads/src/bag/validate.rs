//! Structural, content and oxum validation.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;
use walkdir::WalkDir;

use super::checksum::{self, Algorithm};
use super::manifest::Manifest;
use super::{to_bag_path, Bag, Oxum, DATA_DIR};
use crate::error::BagError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ValidationDetail {
    ChecksumMismatch {
        path: String,
        algorithm: Algorithm,
        expected: String,
        found: String,
    },
    FileMissing {
        path: String,
    },
    UnexpectedFile {
        path: String,
    },
    OxumMismatch {
        expected: String,
        found: String,
    },
}

impl fmt::Display for ValidationDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationDetail::ChecksumMismatch {
                path,
                algorithm,
                expected,
                found,
            } => write!(
                f,
                "{} {} checksum mismatch (expected {}, found {})",
                path, algorithm, expected, found
            ),
            ValidationDetail::FileMissing { path } => write!(f, "{} is missing", path),
            ValidationDetail::UnexpectedFile { path } => {
                write!(f, "{} is not listed in any manifest", path)
            }
            ValidationDetail::OxumMismatch { expected, found } => {
                write!(f, "Payload-Oxum is {} but payload is {}", expected, found)
            }
        }
    }
}

/// All problems found by one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BagValidationError {
    pub details: Vec<ValidationDetail>,
}

impl fmt::Display for BagValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bag validation failed with {} problem(s)", self.details.len())?;
        for detail in self.details.iter().take(5) {
            write!(f, "; {}", detail)?;
        }
        if self.details.len() > 5 {
            write!(f, "; ...")?;
        }
        Ok(())
    }
}

impl std::error::Error for BagValidationError {}

impl Bag {
    /// `data/` and at least one payload manifest must exist.
    pub fn validate_structure(&self) -> Result<(), BagError> {
        if !self.data_dir().is_dir() {
            return Err(BagError::Structure(format!(
                "'{}' has no data directory",
                self.path.display()
            )));
        }
        let has_manifest = Algorithm::ALL
            .iter()
            .any(|alg| self.path.join(alg.manifest_name()).is_file());
        if !has_manifest {
            return Err(BagError::Structure(format!(
                "'{}' has no payload manifest",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Payload files actually present under `data/`, bag-relative.
    pub(crate) fn files_on_disk(&self) -> BTreeSet<String> {
        WalkDir::new(self.data_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.path)
                    .ok()
                    .map(to_bag_path)
            })
            .collect()
    }

    /// Oxum of whatever is under `data/`, tracked or not.
    pub fn payload_oxum(&self) -> Oxum {
        let mut oxum = Oxum::default();
        for entry in WalkDir::new(self.data_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            oxum.files += 1;
            oxum.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        oxum
    }

    /// Collects every problem. Digests are only recomputed when `fast` is
    /// false; the oxum check always runs.
    pub(crate) fn problems(&self, fast: bool) -> Result<Vec<ValidationDetail>, BagError> {
        let mut details = Vec::new();

        if let Some(expected) = self.info("Payload-Oxum") {
            let found = self.payload_oxum().to_string();
            if expected != found {
                details.push(ValidationDetail::OxumMismatch {
                    expected: expected.to_string(),
                    found,
                });
            }
        }

        let on_disk = self.files_on_disk();
        let tracked: BTreeSet<String> = self.payload_files().into_iter().collect();

        for file in &tracked {
            if !on_disk.contains(file) {
                details.push(ValidationDetail::FileMissing { path: file.clone() });
            }
        }
        for file in on_disk.difference(&tracked) {
            details.push(ValidationDetail::UnexpectedFile { path: file.clone() });
        }

        if !fast {
            let present: Vec<PathBuf> = tracked
                .iter()
                .filter(|f| on_disk.contains(*f))
                .map(|f| self.path.join(f))
                .collect();
            for (abs, digests) in checksum::hash_files(present, &self.algorithms)? {
                let rel = abs
                    .strip_prefix(&self.path)
                    .map(to_bag_path)
                    .unwrap_or_default();
                for (alg, found) in digests {
                    let expected = self.manifests.get(&alg).and_then(|m| m.get(&rel));
                    if let Some(expected) = expected {
                        if expected != found {
                            details.push(ValidationDetail::ChecksumMismatch {
                                path: rel.clone(),
                                algorithm: alg,
                                expected: expected.to_string(),
                                found,
                            });
                        }
                    }
                }
            }
            details.extend(self.tag_problems()?);
        }

        Ok(details)
    }

    fn tag_problems(&self) -> Result<Vec<ValidationDetail>, BagError> {
        let mut details = Vec::new();
        for alg in Algorithm::ALL {
            let path = self.path.join(alg.tagmanifest_name());
            if !path.is_file() {
                continue;
            }
            for (rel, expected) in Manifest::read(&path)?.iter() {
                let abs = self.path.join(rel);
                if !abs.is_file() {
                    details.push(ValidationDetail::FileMissing {
                        path: rel.to_string(),
                    });
                    continue;
                }
                let found = checksum::hash_file(&abs, &[alg])?
                    .remove(&alg)
                    .unwrap_or_default();
                if found != expected {
                    details.push(ValidationDetail::ChecksumMismatch {
                        path: rel.to_string(),
                        algorithm: alg,
                        expected: expected.to_string(),
                        found,
                    });
                }
            }
        }
        Ok(details)
    }

    /// Full validation. Structural and I/O problems are raised as their own
    /// errors; everything else is collected into [`BagValidationError`].
    pub fn validate(&self, fast: bool) -> Result<(), BagError> {
        self.validate_structure()?;
        let details = self.problems(fast)?;
        if details.is_empty() {
            debug!("Bag at {} is valid", self.path.display());
            Ok(())
        } else {
            Err(BagValidationError { details }.into())
        }
    }

    /// Like [`Bag::validate`], but validation failures come back as `false`.
    pub fn is_valid(&self, fast: bool) -> Result<bool, BagError> {
        match self.validate(fast) {
            Ok(()) => Ok(true),
            Err(BagError::Validation(err)) => {
                info!("Bag at {} is invalid: {}", self.path.display(), err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Structure is sound, the oxum matches and every manifest entry resolves.
    pub fn is_complete(&self) -> Result<bool, BagError> {
        self.validate_structure()?;
        let on_disk = self.files_on_disk();
        let all_resolve = self.payload_files().iter().all(|f| on_disk.contains(f));
        let oxum_ok = match self.info("Payload-Oxum") {
            Some(expected) => expected == self.payload_oxum().to_string(),
            None => true,
        };
        Ok(all_resolve && oxum_ok)
    }

    /// Structure is sound, `fetch.txt` exists and the manifest entries missing
    /// from disk are exactly those listed in it.
    pub fn is_incomplete(&self) -> Result<bool, BagError> {
        self.validate_structure()?;
        let Some(fetch) = self.fetch_entries()? else {
            return Ok(false);
        };
        let on_disk = self.files_on_disk();
        let missing: BTreeSet<String> = self
            .payload_files()
            .into_iter()
            .filter(|f| !on_disk.contains(f))
            .collect();
        let fetched: BTreeSet<String> = fetch.into_keys().collect();
        Ok(!missing.is_empty() && missing == fetched)
    }

    /// Reconciles the manifests with the payload on disk: adds unexpected
    /// files, drops missing ones and, unless `fast`, re-hashes mismatches.
    pub fn update_payload(&mut self, fast: bool) -> Result<(), BagError> {
        self.validate_structure()?;
        let mut refresh: Vec<String> = Vec::new();
        let mut removed = 0usize;

        for detail in self.problems(fast)? {
            match detail {
                ValidationDetail::UnexpectedFile { path } => refresh.push(path),
                ValidationDetail::ChecksumMismatch { path, .. }
                    if path.starts_with(&format!("{}/", DATA_DIR)) =>
                {
                    refresh.push(path)
                }
                ValidationDetail::FileMissing { path }
                    if path.starts_with(&format!("{}/", DATA_DIR)) =>
                {
                    for manifest in self.manifests.values_mut() {
                        manifest.remove(&path);
                    }
                    removed += 1;
                }
                _ => {}
            }
        }
        refresh.sort();
        refresh.dedup();

        info!(
            "Updating payload of {}: {} refreshed, {} removed",
            self.path.display(),
            refresh.len(),
            removed
        );
        // add_payload also recomputes the oxum and saves
        self.add_payload(&refresh)?;
        Ok(())
    }
}
