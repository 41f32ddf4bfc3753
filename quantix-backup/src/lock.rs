//! Single-instance lock.
//!
//! The lock token is a file holding the owner's PID. A token whose owner is
//! no longer alive, or whose content is unreadable, is stale and reclaimed.
//! The token is published with a hard link from a private temporary file so
//! other processes never observe a partially written PID.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts to replace a stale token before giving up.
const RECLAIM_ATTEMPTS: usize = 3;

/// Lock acquisition failures.
#[derive(Error, Debug)]
pub enum LockError {
    /// A live process owns the lock.
    #[error("another backup run (pid {pid}) holds {}", .path.display())]
    Held { pid: u32, path: PathBuf },

    /// The token could not be created or inspected.
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Process-wide mutual exclusion across invocations.
#[derive(Debug, Clone)]
pub struct SingleInstanceLock {
    path: PathBuf,
}

impl SingleInstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, reclaiming a stale token if necessary.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let pid = std::process::id();

        for _ in 0..RECLAIM_ATTEMPTS {
            match self.publish(pid) {
                Ok(()) => {
                    info!(path = %self.path.display(), pid, "Acquired backup lock");
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            match self.owner()? {
                Some(owner) if is_alive(owner) => {
                    return Err(LockError::Held {
                        pid: owner,
                        path: self.path.clone(),
                    });
                }
                owner => {
                    warn!(
                        path = %self.path.display(),
                        stale_pid = ?owner,
                        "Reclaiming stale backup lock"
                    );
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => {
                            return Err(LockError::Io {
                                path: self.path.clone(),
                                source,
                            })
                        }
                    }
                }
            }
        }

        Err(LockError::Io {
            path: self.path.clone(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "lock file keeps reappearing",
            ),
        })
    }

    /// Write our PID to a private file and link it into place.
    fn publish(&self, pid: u32) -> io::Result<()> {
        let staging = self.staging_path(pid);

        let result = (|| {
            let mut file = fs::File::create(&staging)?;
            writeln!(file, "{}", pid)?;
            file.sync_all()?;
            fs::hard_link(&staging, &self.path)
        })();

        if let Err(e) = fs::remove_file(&staging) {
            debug!(path = %staging.display(), error = %e, "Could not remove staging file");
        }
        result
    }

    fn staging_path(&self, pid: u32) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", pid));
        self.path.with_file_name(name)
    }

    /// PID recorded in the current token, `None` if unparsable or gone.
    fn owner(&self) -> Result<Option<u32>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Held lock; the token is removed when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Released backup lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

/// Whether a process with this PID exists.
#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // EPERM: the process exists but belongs to another user
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SingleInstanceLock::new(dir.path().join("backup.lock"));

        let guard = lock.acquire().unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!lock.path().exists());
        // No staging files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SingleInstanceLock::new(dir.path().join("backup.lock"));

        let _guard = lock.acquire().unwrap();
        match lock.acquire() {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_token_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.lock");

        // Reap a short-lived child so its PID is known dead
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{}\n", dead_pid)).unwrap();

        let guard = SingleInstanceLock::new(&path).acquire().unwrap();
        assert_eq!(
            fs::read_to_string(guard.path()).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_garbage_token_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "not a pid").unwrap();

        assert!(SingleInstanceLock::new(&path).acquire().is_ok());
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let lock = SingleInstanceLock::new("/nonexistent/dir/backup.lock");
        assert!(matches!(lock.acquire(), Err(LockError::Io { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_liveness() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }
}
