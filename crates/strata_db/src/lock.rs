//! Cross-process exclusive locks on files next to the ledger.
//!
//! SQLite serializes single statements and transactions itself. Sequences
//! that also touch plain files (a model import followed by a registry
//! rewrite) take one of these locks for their whole duration.
//!
//! `fs2` keeps the MSRV at 1.75; `std::fs::File::lock` needs 1.89.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Unable to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held exclusive lock. Dropping it closes the handle, which releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    lock_path: PathBuf,
}

impl LockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(lock = %self.lock_path.display(), "Released lock");
    }
}

/// `registry.json` locks through `registry.json.lock`, `registry` through `registry.lock`.
fn lock_path_for(target: &Path) -> PathBuf {
    let mut lock_path = target.to_path_buf();
    let extension = match target.extension() {
        Some(ext) => format!("{}.lock", ext.to_string_lossy()),
        None => "lock".to_string(),
    };
    lock_path.set_extension(extension);
    lock_path
}

/// Block until the exclusive lock for `target` is held.
pub fn lock_exclusive(target: &Path) -> Result<LockGuard, LockError> {
    let lock_path = lock_path_for(target);
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| LockError::Open {
            path: lock_path.clone(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| LockError::Open {
            path: lock_path.clone(),
            source,
        })?;

    // Fully qualified so std's File::lock_exclusive (1.89+) is not picked.
    FileExt::lock_exclusive(&file).map_err(|source| LockError::Acquire {
        path: lock_path.clone(),
        source,
    })?;
    debug!(lock = %lock_path.display(), "Acquired lock");
    Ok(LockGuard {
        _file: file,
        lock_path,
    })
}
