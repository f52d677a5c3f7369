//! Run locks
//!
//! Serializes runs that share a lock identity. A run holds both an entry in
//! the in-process registry and a lock file under the state directory, so
//! runs started from separate processes exclude each other as well.
//!
//! Lock files record the owner's pid. A lock file whose owner is no longer
//! running (a crashed or killed run) is removed and the lock taken over. A
//! file without a readable pid is treated as held.

use ahash::AHashSet;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How often a queued run re-checks a lock held by another process
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lock acquisition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another run holds the lock
    #[error("resource '{resource}' is locked by another run")]
    Held {
        /// Lock identity
        resource: String,
    },

    /// The lock file could not be written
    #[error("cannot create lock file: {0}")]
    Io(String),
}

/// Registry of held run locks
#[derive(Debug)]
pub struct LockRegistry {
    lock_dir: PathBuf,
    held: Mutex<AHashSet<String>>,
    released: Notify,
}

impl LockRegistry {
    /// Creates a registry keeping lock files in `<state_dir>/locks`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            lock_dir: state_dir.join("locks"),
            held: Mutex::new(AHashSet::new()),
            released: Notify::new(),
        }
    }

    fn lock_file(&self, resource: &str) -> PathBuf {
        let file_name: String = resource
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.lock_dir.join(format!("{file_name}.lock"))
    }

    /// Takes the lock for `resource` without waiting.
    ///
    /// # Errors
    ///
    /// [`LockError::Held`] if any run holds it, [`LockError::Io`] if the lock
    /// file cannot be written.
    pub fn try_acquire(self: &Arc<Self>, resource: &str) -> Result<RunLockGuard, LockError> {
        let mut held = self.held.lock();
        if held.contains(resource) {
            return Err(LockError::Held {
                resource: resource.to_string(),
            });
        }

        fs::create_dir_all(&self.lock_dir).map_err(|e| LockError::Io(e.to_string()))?;
        let path = self.lock_file(resource);
        let held_or_io = |e: io::Error| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                LockError::Held {
                    resource: resource.to_string(),
                }
            } else {
                LockError::Io(e.to_string())
            }
        };
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && reclaim_stale(&path) => {
                create_lock_file(&path).map_err(held_or_io)?
            }
            Err(e) => return Err(held_or_io(e)),
        };
        // Owner pid is informational; a failed write does not void the lock
        let _ = writeln!(file, "{}", std::process::id());

        held.insert(resource.to_string());
        tracing::debug!(resource, lock_file = %path.display(), "Acquired run lock");

        Ok(RunLockGuard {
            registry: Arc::clone(self),
            resource: resource.to_string(),
            path,
        })
    }

    /// Waits for the lock until `deadline`.
    ///
    /// # Errors
    ///
    /// [`LockError::Held`] if the lock is still held at the deadline,
    /// [`LockError::Io`] on lock file errors.
    pub async fn acquire(
        self: &Arc<Self>,
        resource: &str,
        deadline: Instant,
    ) -> Result<RunLockGuard, LockError> {
        loop {
            let released = self.released.notified();
            match self.try_acquire(resource) {
                Err(LockError::Held { .. }) => {
                    tracing::info!(resource, "Waiting for run lock");
                }
                other => return other,
            }

            // Wake on an in-process release, or re-check the file periodically
            let wait = tokio::time::timeout(FILE_POLL_INTERVAL, released);
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(LockError::Held {
                    resource: resource.to_string(),
                });
            }
        }
    }

    /// Returns true if this process holds the lock for `resource`
    pub fn is_held(&self, resource: &str) -> bool {
        self.held.lock().contains(resource)
    }
}

fn create_lock_file(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Removes `path` when the pid it records is no longer running
fn reclaim_stale(path: &Path) -> bool {
    let Some(pid) = fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
    else {
        return false;
    };
    if process_alive(pid) {
        return false;
    }

    tracing::warn!(pid, lock_file = %path.display(), "Removing lock file of a dead run");
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => e.kind() == io::ErrorKind::NotFound,
    }
}

/// Null signal probe; a process owned by another user still counts as alive
fn process_alive(pid: i32) -> bool {
    let delivered = unsafe { libc::kill(pid, 0) == 0 };
    delivered || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Held run lock; released on drop
#[derive(Debug)]
pub struct RunLockGuard {
    registry: Arc<LockRegistry>,
    resource: String,
    path: PathBuf,
}

impl RunLockGuard {
    /// Lock identity
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(lock_file = %self.path.display(), error = %e, "Failed to remove lock file");
        }
        self.registry.held.lock().remove(&self.resource);
        self.registry.released.notify_waiters();
        tracing::debug!(resource = %self.resource, "Released run lock");
    }
}
