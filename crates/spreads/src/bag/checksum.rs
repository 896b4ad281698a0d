use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::BagError;
use crate::worker::pool::{cpu_degree, fan_out};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Md5, Algorithm::Sha1, Algorithm::Sha256];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
        }
    }

    pub fn manifest_name(&self) -> String {
        format!("manifest-{}.txt", self.name())
    }

    pub fn tagmanifest_name(&self) -> String {
        format!("tagmanifest-{}.txt", self.name())
    }

    fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Md5 => Hasher::Md5(Md5::new()),
            Algorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = BagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Algorithm::Md5),
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            other => Err(BagError::Structure(format!(
                "unsupported checksum algorithm '{}'",
                other
            ))),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hex digests of one file, one per algorithm.
pub type Digests = BTreeMap<Algorithm, String>;

/// Hashes `path` once per algorithm in a single read pass.
pub fn hash_file(path: &Path, algorithms: &[Algorithm]) -> Result<Digests, BagError> {
    let mut file = File::open(path).map_err(|e| BagError::io(path, e))?;
    let mut hashers: Vec<(Algorithm, Hasher)> =
        algorithms.iter().map(|a| (*a, a.hasher())).collect();

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(|e| BagError::io(path, e))?;
        if read == 0 {
            break;
        }
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buf[..read]);
        }
    }

    Ok(hashers
        .into_iter()
        .map(|(alg, hasher)| (alg, hasher.finalize_hex()))
        .collect())
}

pub fn hash_bytes(data: &[u8], algorithm: Algorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hashes many files on a pool of `min(files, cpus)` threads. Results keep
/// the input order.
pub fn hash_files(
    paths: Vec<PathBuf>,
    algorithms: &[Algorithm],
) -> Result<Vec<(PathBuf, Digests)>, BagError> {
    let degree = cpu_degree(paths.len());
    fan_out(paths, degree, |_, path: PathBuf| -> Result<_, BagError> {
        let digests = hash_file(&path, algorithms)?;
        Ok((path, digests))
    })
    .into_result()
}
