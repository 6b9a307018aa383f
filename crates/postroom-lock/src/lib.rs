//! Cross-process advisory file locks.
//!
//! Every mutable per-list resource and the site-wide alias map are guarded
//! by a lock file under the site lock directory. The file contains JSON
//! metadata about the holder (PID, hostname, timestamp, purpose) so a
//! stuck lock can be diagnosed and, past its lifetime, broken.
//!
//! Acquisition is bounded: callers wait up to a timeout, polling, and get
//! [`LockError::Timeout`] back rather than blocking forever. Runners map
//! that to "retry this entry later".
//!
//! Lock ordering discipline: the MTA lock is always taken before any list
//! lock, never the reverse.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How long a lock may be held before another process may break it.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(900);

/// Poll interval while waiting on a held lock.
const ACQUIRE_POLL: Duration = Duration::from_millis(250);

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// What the lock guards (list name, "mta", ...)
    pub purpose: String,
}

/// Errors surfaced by lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock stayed held for the whole bounded wait.
    #[error("timed out waiting for lock {name:?} held by pid {holder_pid} on {holder_host}")]
    Timeout {
        name: String,
        holder_pid: u32,
        holder_host: String,
    },
    /// Filesystem failure while creating, reading, or removing the file.
    #[error("lock I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The lock file exists but does not parse.
    #[error("corrupt lock file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Lock file handle that releases on Drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    released: bool,
}

impl FileLock {
    /// Acquire the named lock, waiting up to `timeout`.
    ///
    /// A lock whose holder recorded it longer than `lifetime` ago is
    /// considered abandoned and is broken. A corrupt lock file is likewise
    /// removed and re-acquired.
    pub fn acquire(
        lock_dir: &Path,
        name: &str,
        timeout: Duration,
        lifetime: Duration,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir).map_err(|source| LockError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let path = lock_path(lock_dir, name);
        let deadline = Instant::now() + timeout;

        loop {
            match Self::try_claim(&path, name) {
                Ok(lock) => return Ok(lock),
                Err(ClaimFailure::Held) => {}
                Err(ClaimFailure::Error(err)) => return Err(err),
            }

            // Claim failed: inspect the holder to decide between breaking
            // a stale lock and waiting out a live one.
            match read_lock_info_from_path(&path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > lifetime.as_secs() {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            holder_pid: info.pid,
                            holder_host: info.hostname,
                        });
                    }
                }
                Err(LockError::Io { ref source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    // Holder released between our claim and read; retry now.
                    continue;
                }
                Err(LockError::Corrupt { .. }) => {
                    let _ = fs::remove_file(&path);
                    continue;
                }
                Err(err) => return Err(err),
            }

            std::thread::sleep(ACQUIRE_POLL.min(timeout));
        }
    }

    /// Single claim attempt: exclusive create of the lock file.
    fn try_claim(path: &Path, purpose: &str) -> Result<Self, ClaimFailure> {
        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            purpose: purpose.to_string(),
        };
        let json = serde_json::to_string_pretty(&info).map_err(|err| {
            ClaimFailure::Error(LockError::Corrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
        })?;

        // create_new is the atomic cross-process claim; losing the race
        // surfaces as AlreadyExists.
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(json.as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|source| {
                        let _ = fs::remove_file(path);
                        ClaimFailure::Error(LockError::Io {
                            path: path.to_path_buf(),
                            source,
                        })
                    })?;
                Ok(Self {
                    path: path.to_path_buf(),
                    released: false,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ClaimFailure::Held)
            }
            Err(source) => Err(ClaimFailure::Error(LockError::Io {
                path: path.to_path_buf(),
                source,
            })),
        }
    }

    /// Release the lock file.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                self.released = true;
                Ok(())
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                self.released = true;
                Ok(())
            }
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Check whether the named lock is currently held.
    pub fn is_locked(lock_dir: &Path, name: &str) -> bool {
        lock_path(lock_dir, name).exists()
    }

    /// Read the holder information of the named lock.
    pub fn read_lock_info(lock_dir: &Path, name: &str) -> Result<LockInfo, LockError> {
        read_lock_info_from_path(&lock_path(lock_dir, name))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Best effort to release the lock
        let _ = self.release();
    }
}

enum ClaimFailure {
    Held,
    Error(LockError),
}

/// Read lock info from a specific path
fn read_lock_info_from_path(path: &Path) -> Result<LockInfo, LockError> {
    let content = fs::read_to_string(path).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|err| LockError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Path of the named lock file inside a lock directory.
///
/// Slashes and `@` in list names are flattened so every lock is a single
/// file directly under the lock directory.
pub fn lock_path(lock_dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == '@' { '.' } else { c })
        .collect();
    lock_dir.join(format!("{safe}.lock"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn lock_path_flattens_list_names() {
        let base = PathBuf::from("locks");
        assert_eq!(
            lock_path(&base, "test@example.com"),
            PathBuf::from("locks").join("test.example.com.lock")
        );
    }

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock =
            FileLock::acquire(td.path(), "mta", SHORT, DEFAULT_LIFETIME).expect("acquire");
        assert!(FileLock::is_locked(td.path(), "mta"));
        lock.release().expect("release");
        assert!(!FileLock::is_locked(td.path(), "mta"));
    }

    #[test]
    fn acquire_times_out_on_held_lock() {
        let td = tempdir().expect("tempdir");
        let _held =
            FileLock::acquire(td.path(), "a@b.c", SHORT, DEFAULT_LIFETIME).expect("first");

        let result = FileLock::acquire(td.path(), "a@b.c", SHORT, DEFAULT_LIFETIME);
        match result {
            Err(LockError::Timeout { holder_pid, .. }) => {
                assert_eq!(holder_pid, std::process::id());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn distinct_names_do_not_contend() {
        let td = tempdir().expect("tempdir");
        let _a = FileLock::acquire(td.path(), "one@x.y", SHORT, DEFAULT_LIFETIME).expect("a");
        let _b = FileLock::acquire(td.path(), "two@x.y", SHORT, DEFAULT_LIFETIME).expect("b");
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock =
                FileLock::acquire(td.path(), "mta", SHORT, DEFAULT_LIFETIME).expect("acquire");
            assert!(FileLock::is_locked(td.path(), "mta"));
        }
        assert!(!FileLock::is_locked(td.path(), "mta"));
    }

    #[test]
    fn stale_lock_is_broken() {
        let td = tempdir().expect("tempdir");
        let path = lock_path(td.path(), "mta");
        let old_info = LockInfo {
            pid: 12345,
            hostname: "test-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            purpose: "mta".to_string(),
        };
        fs::write(&path, serde_json::to_string(&old_info).expect("serialize")).expect("write");

        let _lock = FileLock::acquire(td.path(), "mta", SHORT, Duration::from_secs(3600))
            .expect("break stale and acquire");
        let info = FileLock::read_lock_info(td.path(), "mta").expect("read info");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn corrupt_lock_is_removed_and_reacquired() {
        let td = tempdir().expect("tempdir");
        fs::write(lock_path(td.path(), "mta"), "not json at all").expect("write");

        let _lock =
            FileLock::acquire(td.path(), "mta", SHORT, DEFAULT_LIFETIME).expect("acquire");
        let info = FileLock::read_lock_info(td.path(), "mta").expect("read info");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn read_lock_info_reports_holder() {
        let td = tempdir().expect("tempdir");
        let _lock = FileLock::acquire(td.path(), "list@example.com", SHORT, DEFAULT_LIFETIME)
            .expect("acquire");

        let info = FileLock::read_lock_info(td.path(), "list@example.com").expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.purpose, "list@example.com");
        assert!(!info.hostname.is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let mut lock =
            FileLock::acquire(td.path(), "mta", SHORT, DEFAULT_LIFETIME).expect("acquire");
        lock.release().expect("first release");
        lock.release().expect("second release");
    }
}
