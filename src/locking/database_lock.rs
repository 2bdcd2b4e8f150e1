//! Lock file beside the database.
//!
//! Identity creation is serialized per partition inside one process; the lock
//! file extends that to "one resolving process per database".

use crate::constants::LOCK_FILE_EXTENSION;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lock file content, for operators finding a stale lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID that holds the lock.
    pub pid: u32,
    /// Hostname of the machine.
    pub hostname: String,
    /// When the lock was acquired.
    pub started: DateTime<Utc>,
    /// Database being written.
    pub database: PathBuf,
}

/// RAII guard for a database lock.
#[derive(Debug)]
pub struct DatabaseLock {
    lock_path: PathBuf,
}

impl DatabaseLock {
    /// Take the lock for `database`, failing if another process holds it.
    pub fn acquire(database: &Path) -> Result<Self> {
        let lock_path = Self::lock_path_for(database);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);

        match file {
            Ok(mut f) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    hostname: hostname::get().map_or_else(
                        |_| "unknown".to_string(),
                        |h| h.to_string_lossy().into_owned(),
                    ),
                    started: Utc::now(),
                    database: database.to_path_buf(),
                };

                let json = serde_json::to_string_pretty(&info).unwrap_or_else(|_| "{}".to_string());
                let _ = f.write_all(json.as_bytes());

                register_lock(&lock_path);
                Ok(Self { lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::DatabaseLocked { path: lock_path })
            }
            Err(e) => Err(Error::LockCreate {
                path: lock_path,
                source: e,
            }),
        }
    }

    /// Lock file path for a database file.
    pub fn lock_path_for(database: &Path) -> PathBuf {
        let mut name = database
            .file_name()
            .map_or_else(|| "database".into(), std::ffi::OsStr::to_os_string);
        name.push(LOCK_FILE_EXTENSION);
        database.with_file_name(name)
    }

    /// Check if a lock file exists for `database`.
    pub fn is_locked(database: &Path) -> bool {
        Self::lock_path_for(database).exists()
    }

    /// Read who holds the lock, if the lock file is present and readable.
    pub fn holder(database: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(Self::lock_path_for(database)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Path of the lock file held by this guard.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        unregister_lock(&self.lock_path);
    }
}

/// Active lock paths, removed by the Ctrl-C handler.
static ACTIVE_LOCKS: std::sync::LazyLock<std::sync::Mutex<Vec<PathBuf>>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(Vec::new()));

fn register_lock(path: &Path) {
    if let Ok(mut locks) = ACTIVE_LOCKS.lock() {
        locks.push(path.to_path_buf());
    }
}

fn unregister_lock(path: &Path) {
    if let Ok(mut locks) = ACTIVE_LOCKS.lock() {
        locks.retain(|p| p != path);
    }
}

/// Remove every lock this process holds. Called on signal.
pub fn cleanup_all_locks() {
    if let Ok(locks) = ACTIVE_LOCKS.lock() {
        for lock_path in locks.iter() {
            let _ = fs::remove_file(lock_path);
        }
    }
}
