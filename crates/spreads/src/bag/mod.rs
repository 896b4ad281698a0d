//! On-disk BagIt store.
//!
//! A bag is a directory with `bagit.txt`, payload manifests, tag manifests,
//! `bag-info.txt` and a `data/` payload tree. Every mutation rewrites the
//! affected tag files with a write-then-rename, so readers never observe a
//! half-written manifest.

pub mod checksum;
pub mod manifest;
pub mod package;
pub mod tagfile;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::BagError;

pub use checksum::Algorithm;
pub use manifest::Manifest;
pub use package::{FetchMapping, TarCompression};
pub use validate::{BagValidationError, ValidationDetail};

pub const BAGIT_VERSION: &str = "0.97";
pub const ENCODING: &str = "UTF-8";
pub const BAGIT_TXT: &str = "bagit.txt";
pub const BAG_INFO_TXT: &str = "bag-info.txt";
pub const FETCH_TXT: &str = "fetch.txt";
pub const DATA_DIR: &str = "data";
pub const SOFTWARE_AGENT: &str = concat!("spreads ", env!("CARGO_PKG_VERSION"));

/// Payload summary `<bytes>.<files>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Oxum {
    pub bytes: u64,
    pub files: u64,
}

impl fmt::Display for Oxum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bytes, self.files)
    }
}

impl FromStr for Oxum {
    type Err = BagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BagError::Structure(format!("invalid Payload-Oxum '{}'", s));
        let (bytes, files) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Oxum {
            bytes: bytes.parse().map_err(|_| invalid())?,
            files: files.parse().map_err(|_| invalid())?,
        })
    }
}

/// Tag files the bag maintains itself; they are never "registered".
pub fn is_standard_tagfile(name: &str) -> bool {
    name == BAGIT_TXT
        || name == BAG_INFO_TXT
        || name == FETCH_TXT
        || (name.starts_with("manifest-") && name.ends_with(".txt"))
        || (name.starts_with("tagmanifest-") && name.ends_with(".txt"))
}

/// Joins path components with `/`, the separator used inside manifests.
fn to_bag_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct Bag {
    path: PathBuf,
    algorithms: Vec<Algorithm>,
    manifests: BTreeMap<Algorithm, Manifest>,
    tagfiles: BTreeSet<String>,
    info: Vec<(String, String)>,
}

impl Bag {
    /// Creates an empty bag at `path`. `md5` is always included.
    pub fn create(path: &Path, algorithms: &[Algorithm]) -> Result<Self, BagError> {
        if path.exists() {
            if !path.is_dir() {
                return Err(BagError::Structure(format!(
                    "'{}' exists and is not a directory",
                    path.display()
                )));
            }
            let mut entries = std::fs::read_dir(path).map_err(|e| BagError::io(path, e))?;
            if entries.next().is_some() {
                return Err(BagError::NotEmpty(path.to_path_buf()));
            }
        }

        let data = path.join(DATA_DIR);
        std::fs::create_dir_all(&data).map_err(|e| BagError::io(&data, e))?;

        let mut algs: BTreeSet<Algorithm> = algorithms.iter().copied().collect();
        algs.insert(Algorithm::Md5);

        let bag = Bag {
            path: path.to_path_buf(),
            manifests: algs.iter().map(|a| (*a, Manifest::new())).collect(),
            algorithms: algs.into_iter().collect(),
            tagfiles: BTreeSet::new(),
            info: vec![
                (
                    "Bagging-Date".to_string(),
                    chrono::Local::now().format("%Y-%m-%d").to_string(),
                ),
                ("Bag-Software-Agent".to_string(), SOFTWARE_AGENT.to_string()),
                ("Payload-Oxum".to_string(), Oxum::default().to_string()),
            ],
        };

        let bagit = tagfile::serialize_tags([
            ("BagIt-Version", BAGIT_VERSION),
            ("Tag-File-Character-Encoding", ENCODING),
        ]);
        tagfile::write_atomic(&path.join(BAGIT_TXT), bagit.as_bytes())?;
        bag.save()?;

        info!("Created bag at {}", path.display());
        Ok(bag)
    }

    pub fn open(path: &Path) -> Result<Self, BagError> {
        let bagit = path.join(BAGIT_TXT);
        if !bagit.is_file() {
            return Err(BagError::NotABag(path.to_path_buf()));
        }
        let raw = std::fs::read(&bagit).map_err(|e| BagError::io(&bagit, e))?;
        if raw.starts_with(&[0xEF, 0xBB, 0xBF]) {
            return Err(BagError::Structure("bagit.txt must not start with a BOM".to_string()));
        }
        let content = String::from_utf8(raw)
            .map_err(|_| BagError::Structure("bagit.txt is not valid UTF-8".to_string()))?;
        let declaration = tagfile::parse_tags(&content, &bagit)?;
        let version = declaration
            .iter()
            .find(|(k, _)| k == "BagIt-Version")
            .map(|(_, v)| v.trim())
            .ok_or_else(|| BagError::Structure("bagit.txt lacks BagIt-Version".to_string()))?;
        if version != BAGIT_VERSION {
            return Err(BagError::UnsupportedVersion {
                found: version.to_string(),
                expected: BAGIT_VERSION.to_string(),
            });
        }

        let mut manifests = BTreeMap::new();
        for alg in Algorithm::ALL {
            let manifest_path = path.join(alg.manifest_name());
            if manifest_path.is_file() {
                manifests.insert(alg, Manifest::read(&manifest_path)?);
            }
        }
        if manifests.is_empty() {
            return Err(BagError::Structure(format!(
                "'{}' has no payload manifest",
                path.display()
            )));
        }

        let info_path = path.join(BAG_INFO_TXT);
        let info = if info_path.is_file() {
            tagfile::read_tags(&info_path)?
        } else {
            Vec::new()
        };

        let mut tagfiles = BTreeSet::new();
        for alg in Algorithm::ALL {
            let tagmanifest = path.join(alg.tagmanifest_name());
            if tagmanifest.is_file() {
                let manifest = Manifest::read(&tagmanifest)?;
                tagfiles.extend(
                    manifest
                        .files()
                        .filter(|f| !is_standard_tagfile(f))
                        .map(str::to_string),
                );
            }
        }

        debug!(
            "Opened bag at {} ({} payload files)",
            path.display(),
            manifests.values().next().map(Manifest::len).unwrap_or(0)
        );
        Ok(Bag {
            path: path.to_path_buf(),
            algorithms: manifests.keys().copied().collect(),
            manifests,
            tagfiles,
            info,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    pub fn manifest(&self, algorithm: Algorithm) -> Option<&Manifest> {
        self.manifests.get(&algorithm)
    }

    /// Payload files in manifest order.
    pub fn payload_files(&self) -> Vec<String> {
        let mut files: BTreeSet<String> = BTreeSet::new();
        for manifest in self.manifests.values() {
            files.extend(manifest.files().map(str::to_string));
        }
        files.into_iter().collect()
    }

    pub fn tagfiles(&self) -> impl Iterator<Item = &str> {
        self.tagfiles.iter().map(String::as_str)
    }

    pub fn info(&self, key: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn info_tags(&self) -> &[(String, String)] {
        &self.info
    }

    /// Sets a `bag-info.txt` tag in memory; call [`Bag::save`] to persist.
    pub fn set_info(&mut self, key: &str, value: &str) {
        match self.info.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.info.push((key.to_string(), value.to_string())),
        }
    }

    pub fn oxum(&self) -> Option<Oxum> {
        self.info("Payload-Oxum").and_then(|v| v.parse().ok())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.path.join(path)
        }
    }

    /// Bag-relative form (`data/raw/000.jpg`) of a path inside the bag.
    pub fn relative(&self, path: &Path) -> Result<String, BagError> {
        let abs = self.absolute(path);
        let rel = abs
            .strip_prefix(&self.path)
            .map_err(|_| BagError::OutsideBag(abs.clone()))?;
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(BagError::OutsideBag(abs.clone()));
        }
        Ok(to_bag_path(rel))
    }

    /// Adds files (or every file below directories) to the payload. Paths
    /// outside `data/` are copied in first. Returns the bag-relative paths.
    pub fn add_payload<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<Vec<String>, BagError> {
        let data = self.data_dir();
        let mut files: Vec<PathBuf> = Vec::new();

        for path in paths {
            let src = self.absolute(path.as_ref());
            if !src.exists() {
                return Err(BagError::io(
                    &src,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                ));
            }
            let inside = src.starts_with(&data);

            if src.is_dir() {
                let found: Vec<PathBuf> = WalkDir::new(&src)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .collect();
                if found.is_empty() {
                    warn!("Skipping empty directory {}", src.display());
                    continue;
                }
                if inside {
                    files.extend(found);
                    continue;
                }
                let name = src.file_name().unwrap_or_default();
                for file in found {
                    let rel = file.strip_prefix(&src).unwrap_or(&file);
                    let target = data.join(name).join(rel);
                    copy_into(&file, &target)?;
                    files.push(target);
                }
            } else if inside {
                files.push(src);
            } else {
                let target = data.join(src.file_name().unwrap_or_default());
                copy_into(&src, &target)?;
                files.push(target);
            }
        }

        let mut added = Vec::with_capacity(files.len());
        for (file, digests) in checksum::hash_files(files, &self.algorithms)? {
            let rel = self.relative(&file)?;
            for (alg, digest) in digests {
                if let Some(manifest) = self.manifests.get_mut(&alg) {
                    manifest.insert(rel.clone(), digest);
                }
            }
            added.push(rel);
        }

        self.update_oxum();
        self.save()?;
        debug!("Added {} payload file(s)", added.len());
        Ok(added)
    }

    /// Deletes payload files (or directories) and their manifest entries.
    pub fn remove_payload<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), BagError> {
        for path in paths {
            let abs = self.absolute(path.as_ref());
            let rel = self.relative(&abs)?;
            if !rel.starts_with("data/") {
                return Err(BagError::Structure(format!("'{}' is not a payload path", rel)));
            }
            if abs.is_dir() {
                std::fs::remove_dir_all(&abs).map_err(|e| BagError::io(&abs, e))?;
            } else if abs.exists() {
                std::fs::remove_file(&abs).map_err(|e| BagError::io(&abs, e))?;
            }
            for manifest in self.manifests.values_mut() {
                manifest.remove_tree(&rel);
            }
        }
        self.update_oxum();
        self.save()
    }

    /// Registers tag files. Paths outside the bag are copied to its root.
    pub fn add_tagfiles<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), BagError> {
        let data = self.data_dir();
        for path in paths {
            let mut abs = self.absolute(path.as_ref());
            if abs.starts_with(&data) {
                return Err(BagError::TagFileInPayload(abs));
            }
            if !abs.starts_with(&self.path) {
                let target = self.path.join(abs.file_name().unwrap_or_default());
                copy_into(&abs, &target)?;
                abs = target;
            }
            if !abs.is_file() {
                return Err(BagError::io(
                    &abs,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such tag file"),
                ));
            }
            let rel = self.relative(&abs)?;
            self.tagfiles.insert(rel);
        }
        self.save()
    }

    pub fn remove_tagfiles<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), BagError> {
        for path in paths {
            let abs = self.absolute(path.as_ref());
            let rel = self.relative(&abs)?;
            if rel.starts_with("data/") {
                return Err(BagError::TagFileInPayload(abs));
            }
            self.tagfiles.remove(&rel);
            if abs.is_file() {
                std::fs::remove_file(&abs).map_err(|e| BagError::io(&abs, e))?;
            }
        }
        self.save()
    }

    /// Atomically writes a tag file at the bag root and registers it.
    pub fn write_tagfile(&mut self, name: &str, content: &[u8]) -> Result<(), BagError> {
        let abs = self.path.join(name);
        if abs.starts_with(self.data_dir()) {
            return Err(BagError::TagFileInPayload(abs));
        }
        tagfile::write_atomic(&abs, content)?;
        self.tagfiles.insert(self.relative(&abs)?);
        self.save()
    }

    pub fn read_tagfile(&self, name: &str) -> Result<Option<Vec<u8>>, BagError> {
        let abs = self.path.join(name);
        if !abs.is_file() {
            return Ok(None);
        }
        std::fs::read(&abs)
            .map(Some)
            .map_err(|e| BagError::io(&abs, e))
    }

    fn primary_manifest(&self) -> Option<&Manifest> {
        self.manifests
            .get(&Algorithm::Md5)
            .or_else(|| self.manifests.values().next())
    }

    /// Oxum of the manifest-tracked payload as it is on disk now.
    pub fn tracked_oxum(&self) -> Oxum {
        let Some(manifest) = self.primary_manifest() else {
            return Oxum::default();
        };
        let bytes = manifest
            .files()
            .filter_map(|f| std::fs::metadata(self.path.join(f)).ok())
            .map(|m| m.len())
            .sum();
        Oxum {
            bytes,
            files: manifest.len() as u64,
        }
    }

    fn update_oxum(&mut self) {
        let oxum = self.tracked_oxum();
        self.set_info("Payload-Oxum", &oxum.to_string());
    }

    /// Writes `bag-info.txt`, all payload manifests and the tag manifests.
    pub fn save(&self) -> Result<(), BagError> {
        let info = tagfile::serialize_tags(self.info.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        tagfile::write_atomic(&self.path.join(BAG_INFO_TXT), info.as_bytes())?;

        for (alg, manifest) in &self.manifests {
            manifest.write(&self.path.join(alg.manifest_name()))?;
        }

        let mut covered: Vec<String> = vec![BAGIT_TXT.to_string(), BAG_INFO_TXT.to_string()];
        covered.extend(self.manifests.keys().map(Algorithm::manifest_name));
        covered.extend(self.tagfiles.iter().cloned());

        let mut tagmanifests: BTreeMap<Algorithm, Manifest> = self
            .algorithms
            .iter()
            .map(|a| (*a, Manifest::new()))
            .collect();
        for rel in covered {
            let abs = self.path.join(&rel);
            if !abs.is_file() {
                warn!("Registered tag file {} is missing", rel);
                continue;
            }
            for (alg, digest) in checksum::hash_file(&abs, &self.algorithms)? {
                if let Some(manifest) = tagmanifests.get_mut(&alg) {
                    manifest.insert(rel.clone(), digest);
                }
            }
        }
        for (alg, manifest) in &tagmanifests {
            manifest.write(&self.path.join(alg.tagmanifest_name()))?;
        }
        Ok(())
    }

    /// Entries of `fetch.txt` keyed by bag-relative path, if the file exists.
    pub fn fetch_entries(&self) -> Result<Option<BTreeMap<String, (String, String)>>, BagError> {
        let fetch = self.path.join(FETCH_TXT);
        if !fetch.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&fetch).map_err(|e| BagError::io(&fetch, e))?;
        let mut entries = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(url), Some(length), Some(path)) => {
                    entries.insert(
                        crate::sanitize::decode_manifest_path(path.trim()),
                        (url.to_string(), length.to_string()),
                    );
                }
                _ => {
                    return Err(BagError::MalformedTagFile {
                        path: fetch.clone(),
                        line: idx + 1,
                    })
                }
            }
        }
        Ok(Some(entries))
    }
}

fn copy_into(src: &Path, target: &Path) -> Result<(), BagError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BagError::io(parent, e))?;
    }
    std::fs::copy(src, target).map_err(|e| BagError::io(src, e))?;
    Ok(())
}
