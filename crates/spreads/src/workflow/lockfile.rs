//! Advisory lock keeping two owners from opening the same workflow.
//!
//! Across processes the lock file's pid decides; within this process a
//! registry of held locks does, so two engines cannot share a bag either.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{SpreadsError, WorkflowError};

pub const LOCK_FILE: &str = ".spreads.lock";

/// Canonical bag roots whose lock a live `LockFile` of this process holds.
static HELD: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Holds `<bag>/.spreads.lock` (containing the owner's pid) until dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    key: PathBuf,
}

impl LockFile {
    pub fn acquire(root: &Path) -> Result<Self, SpreadsError> {
        let path = root.join(LOCK_FILE);
        let key = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let locked = || -> SpreadsError {
            WorkflowError::Locked {
                path: root.to_path_buf(),
            }
            .into()
        };

        let mut held = HELD.lock();
        if held.contains(&key) {
            return Err(locked());
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .map_err(|e| SpreadsError::io(&path, e))?;
                    held.insert(key.clone());
                    debug!("Acquired workflow lock {}", path.display());
                    return Ok(Self { path, key });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(&path) {
                        return Err(locked());
                    }
                    warn!("Removing stale workflow lock {}", path.display());
                    std::fs::remove_file(&path).map_err(|e| SpreadsError::io(&path, e))?;
                }
                Err(e) => return Err(SpreadsError::io(&path, e)),
            }
        }
        Err(locked())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let mut held = HELD.lock();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to release workflow lock {}: {}", self.path.display(), e);
            }
        }
        held.remove(&self.key);
    }
}

/// A lock is stale when it names a pid that no longer runs, or this process
/// while no `LockFile` here holds it (left over from a crashed instance).
/// Callers check the registry first.
fn is_stale(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<u32>() else {
        return true;
    };
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    proc_root.is_dir() && !proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let lock = LockFile::acquire(temp_dir.path()).unwrap();
        assert!(lock.path().is_file());
        drop(lock);
        assert!(!temp_dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_foreign_live_lock_is_respected() {
        let temp_dir = TempDir::new().unwrap();
        // pid 1 always runs
        std::fs::write(temp_dir.path().join(LOCK_FILE), "1").unwrap();
        let err = LockFile::acquire(temp_dir.path()).unwrap_err();
        assert!(matches!(
            err,
            SpreadsError::Workflow(WorkflowError::Locked { .. })
        ));
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOCK_FILE), "not a pid").unwrap();
        let lock = LockFile::acquire(temp_dir.path()).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_second_holder_in_same_process_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let first = LockFile::acquire(temp_dir.path()).unwrap();

        let err = LockFile::acquire(temp_dir.path()).unwrap_err();
        assert!(matches!(
            err,
            SpreadsError::Workflow(WorkflowError::Locked { .. })
        ));
        // The refused attempt leaves the holder's lock in place
        assert!(first.path().is_file());

        drop(first);
        let again = LockFile::acquire(temp_dir.path()).unwrap();
        assert!(again.path().is_file());
    }

    #[test]
    fn test_orphaned_lock_of_this_process_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(LOCK_FILE),
            std::process::id().to_string(),
        )
        .unwrap();
        let lock = LockFile::acquire(temp_dir.path()).unwrap();
        assert!(lock.path().is_file());
    }
}
