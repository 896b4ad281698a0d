//! Deterministic ZIP and tar archives of a bag.
//!
//! Entries are sorted and rooted at the bag's directory name, timestamps and
//! ownership are fixed, and ZIP entries are stored uncompressed so the archive
//! size is known before it is written (see [`Bag::zip_size`]).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::info;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::{to_bag_path, Bag, FETCH_TXT};
use crate::error::BagError;
use crate::sanitize::encode_manifest_path;

/// Bag-relative payload path to the URL it can be fetched from instead.
pub type FetchMapping = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TarCompression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

impl TarCompression {
    pub fn extension(&self) -> &'static str {
        match self {
            TarCompression::None => "tar",
            TarCompression::Gzip => "tar.gz",
            TarCompression::Bzip2 => "tar.bz2",
        }
    }
}

struct Entry {
    name: String,
    source: EntrySource,
}

enum EntrySource {
    File { path: PathBuf, size: u64 },
    Generated(Vec<u8>),
}

impl Entry {
    fn size(&self) -> u64 {
        match &self.source {
            EntrySource::File { size, .. } => *size,
            EntrySource::Generated(bytes) => bytes.len() as u64,
        }
    }

    fn write_to(&self, out: &mut dyn Write) -> Result<(), BagError> {
        match &self.source {
            EntrySource::File { path, .. } => {
                let mut file = File::open(path).map_err(|e| BagError::io(path, e))?;
                io::copy(&mut file, out).map_err(|e| BagError::io(path, e))?;
            }
            EntrySource::Generated(bytes) => {
                out.write_all(bytes)
                    .map_err(|e| BagError::Archive(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn zip_error(err: zip::result::ZipError) -> BagError {
    BagError::Archive(err.to_string())
}

impl Bag {
    fn archive_root(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bag".to_string())
    }

    /// Sorted archive entries. Top-level dot files (lock file, staging area,
    /// pending temp files) never leave the workflow directory.
    fn archive_entries(&self, fetch: &FetchMapping) -> Result<Vec<Entry>, BagError> {
        let root = self.archive_root();
        let mut entries = Vec::new();
        let mut fetch_lines = String::new();

        let walker = WalkDir::new(&self.path)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() > 1 || !e.file_name().to_string_lossy().starts_with('.'));

        for entry in walker {
            let entry = entry.map_err(|e| BagError::Archive(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.path)
                .map(to_bag_path)
                .map_err(|_| BagError::OutsideBag(entry.path().to_path_buf()))?;
            let size = entry
                .metadata()
                .map_err(|e| BagError::Archive(e.to_string()))?
                .len();

            if !fetch.is_empty() && rel == FETCH_TXT {
                continue;
            }
            if let Some(url) = fetch.get(&rel) {
                fetch_lines.push_str(&format!("{} {} {}\n", url, size, encode_manifest_path(&rel)));
                continue;
            }
            entries.push(Entry {
                name: format!("{}/{}", root, rel),
                source: EntrySource::File {
                    path: entry.into_path(),
                    size,
                },
            });
        }

        if !fetch_lines.is_empty() {
            let name = format!("{}/{}", root, FETCH_TXT);
            let pos = entries
                .iter()
                .position(|e| e.name > name)
                .unwrap_or(entries.len());
            entries.insert(
                pos,
                Entry {
                    name,
                    source: EntrySource::Generated(fetch_lines.into_bytes()),
                },
            );
        }
        Ok(entries)
    }

    fn zip_options() -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644)
    }

    pub fn package_as_zip(&self, dest: &Path, fetch: &FetchMapping) -> Result<(), BagError> {
        let file = File::create(dest).map_err(|e| BagError::io(dest, e))?;
        let mut writer = ZipWriter::new(file);
        let entries = self.archive_entries(fetch)?;
        for entry in &entries {
            writer
                .start_file(entry.name.as_str(), Self::zip_options())
                .map_err(zip_error)?;
            entry.write_to(&mut writer)?;
        }
        writer.finish().map_err(zip_error)?;
        info!("Packaged {} entries into {}", entries.len(), dest.display());
        Ok(())
    }

    /// Writes the ZIP to a non-seekable sink such as a network response.
    pub fn package_as_zipstream<W: Write>(
        &self,
        writer: W,
        fetch: &FetchMapping,
    ) -> Result<(), BagError> {
        let mut zip = ZipWriter::new_stream(writer);
        for entry in self.archive_entries(fetch)? {
            zip.start_file(entry.name.as_str(), Self::zip_options())
                .map_err(zip_error)?;
            entry.write_to(&mut zip)?;
        }
        zip.finish().map_err(zip_error)?;
        Ok(())
    }

    pub fn package_as_tar(
        &self,
        dest: &Path,
        compression: TarCompression,
        fetch: &FetchMapping,
    ) -> Result<(), BagError> {
        let file = File::create(dest).map_err(|e| BagError::io(dest, e))?;
        let entries = self.archive_entries(fetch)?;
        match compression {
            TarCompression::None => {
                write_tar(file, &entries)?;
            }
            TarCompression::Gzip => {
                let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
                write_tar(encoder, &entries)?
                    .finish()
                    .map_err(|e| BagError::io(dest, e))?;
            }
            TarCompression::Bzip2 => {
                let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::best());
                write_tar(encoder, &entries)?
                    .finish()
                    .map_err(|e| BagError::io(dest, e))?;
            }
        }
        info!("Packaged {} entries into {}", entries.len(), dest.display());
        Ok(())
    }

    /// Exact size of the archive [`Bag::package_as_zip`] would write:
    /// local headers plus data, central directory, end record.
    pub fn zip_size(&self, fetch: &FetchMapping) -> Result<u64, BagError> {
        let entries = self.archive_entries(fetch)?;
        let local: u64 = entries
            .iter()
            .map(|e| 30 + e.name.len() as u64 + e.size())
            .sum();
        let central: u64 = entries.iter().map(|e| 46 + e.name.len() as u64).sum();
        Ok(local + central + 22)
    }
}

fn write_tar<W: Write>(out: W, entries: &[Entry]) -> Result<W, BagError> {
    let mut builder = tar::Builder::new(out);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.size());
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.write_to(&mut data)?;
        builder
            .append_data(&mut header, &entry.name, data.as_slice())
            .map_err(|e| BagError::Archive(e.to_string()))?;
    }
    builder
        .into_inner()
        .map_err(|e| BagError::Archive(e.to_string()))
}
