//! Single publishing process per database.
//!
//! Per-account session locks only exist inside one process. A daemon holds
//! an exclusive lock on `<database>.lock` for as long as it runs, so a
//! second daemon pointed at the same database refuses to start instead of
//! publishing for the same accounts in parallel.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PostlineError, Result};

#[derive(Debug)]
pub struct InstanceLock {
    // The lock lives as long as this handle
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock path for a database file
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock for `db_path` without waiting.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when another process holds it; `Dispatch` when the
    /// lock file cannot be created.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = Self::lock_path(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| lock_file_error(&path, e))?;
            }
        }

        // Never truncated before locking, the holder's pid stays readable
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_file_error(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            return Err(PostlineError::AlreadyRunning(if holder.is_empty() {
                format!("{} is locked", path.display())
            } else {
                format!("{} is locked by pid {}", path.display(), holder)
            }));
        }

        file.set_len(0).map_err(|e| lock_file_error(&path, e))?;
        write!(file, "{}", std::process::id()).map_err(|e| lock_file_error(&path, e))?;

        tracing::debug!(path = %path.display(), "Instance lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_file_error(path: &Path, e: std::io::Error) -> PostlineError {
    PostlineError::Dispatch(format!("cannot use lock file {}: {}", path.display(), e))
}
