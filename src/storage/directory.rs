//! Data-directory management
//!
//! The data directory is exclusive to one process. A lock file at the
//! directory root asserts this with atomic O_EXCL creation; a conflicting
//! process fails fast at startup. Locks left behind by a dead process are
//! detected by pid liveness and cleared.

use crate::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the lock file at the data directory root
const LOCK_FILE: &str = ".promcache.lock";

/// Exclusive hold on a data directory
///
/// Acquired once at catalog startup and held for the life of the process.
/// Dropping the guard removes the lock file.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Create the data directory if needed and acquire its lock
    ///
    /// Uses `O_CREAT | O_EXCL` so acquisition is atomic. If the lock file
    /// already exists, its recorded pid is checked for liveness: a stale
    /// lock from a dead process is removed and acquisition retried once; a
    /// live owner is a fatal startup conflict.
    pub fn acquire(data_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                    if Self::holder_alive(&path) {
                        return Err(Error::AlreadyLocked(path.display().to_string()));
                    }
                    tracing::warn!(path = %path.display(), "removing stale lock file");
                    std::fs::remove_file(&path)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(Error::AlreadyLocked(path.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::AlreadyLocked(path.display().to_string()))
    }

    /// Whether the pid recorded in an existing lock file is still running
    fn holder_alive(path: &Path) -> bool {
        let pid = match std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
        {
            Some(pid) => pid,
            // Unreadable content: assume alive rather than steal the lock
            None => return true,
        };
        if pid == std::process::id() {
            return true;
        }
        #[cfg(unix)]
        {
            Path::new("/proc").join(pid.to_string()).exists()
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join(LOCK_FILE);

        {
            let _lock = DirLock::acquire(tmp.path()).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_conflict_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let _lock = DirLock::acquire(tmp.path()).unwrap();

        // Same pid counts as a live holder
        let err = DirLock::acquire(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::AlreadyLocked(_)));
    }

    #[test]
    fn test_stale_lock_recovered() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join(LOCK_FILE);
        // A pid that cannot be running
        std::fs::write(&lock_path, "999999999").unwrap();

        let _lock = DirLock::acquire(tmp.path()).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_creates_missing_data_dir() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/data");
        let _lock = DirLock::acquire(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
