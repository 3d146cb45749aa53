//! Exclusive advisory lock on a WAL's companion lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::WalWriteError;

/// Holds an exclusive lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Block until the exclusive lock on `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self, WalWriteError> {
        let file = open_lock_file(path)?;
        debug!(path = %path.display(), "acquiring wal lock");
        file.lock_exclusive().map_err(|source| WalWriteError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Acquire without blocking; `Ok(None)` when another writer holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, WalWriteError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(WalWriteError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release wal lock");
        } else {
            debug!(path = %self.path.display(), "released wal lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, WalWriteError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WalWriteError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| WalWriteError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_cannot_take_held_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal.lock");

        let held = LockGuard::acquire(&path).expect("acquire");
        assert!(LockGuard::try_acquire(&path).expect("try").is_none());

        drop(held);
        assert!(LockGuard::try_acquire(&path).expect("try").is_some());
    }
}
