//! Exclusive lock file guarding blackboard writes.
//!
//! Create-or-fail semantics: the holder writes its identity and a heartbeat
//! into the file. A lock whose heartbeat is older than the break-glass TTL
//! belongs to a crashed holder and is broken by the next acquirer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiaryError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
}

pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock, polling until `timeout`. Stale locks past
    /// `break_glass` are removed first.
    pub fn acquire(path: &Path, timeout: Duration, break_glass: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                        heartbeat_at: Utc::now(),
                    };
                    let _ = file.write_all(&serde_json::to_vec(&info)?);
                    let _ = file.sync_all();
                    debug!(path = %path.display(), "Blackboard lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(path, break_glass) {
                        warn!(path = %path.display(), "Breaking stale blackboard lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(ApiaryError::TransientBackend(format!(
                            "blackboard lock at {} not released within {}s",
                            path.display(),
                            timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Refresh the holder heartbeat so long write sections are not broken.
    pub fn heartbeat(&self) -> Result<()> {
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        std::fs::write(&self.path, serde_json::to_vec(&info)?)?;
        Ok(())
    }

    fn is_stale(path: &Path, break_glass: Duration) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            // Unreadable lock: fall back to file age.
            return std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age >= break_glass);
        };
        match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => {
                let age = Utc::now() - info.heartbeat_at;
                age.to_std().is_ok_and(|age| age >= break_glass)
            }
            Err(_) => true,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_acquisition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        let guard = LockGuard::acquire(&path, Duration::from_millis(100), Duration::from_secs(60))
            .unwrap();
        // Second acquirer times out while the first holds it.
        let second =
            LockGuard::acquire(&path, Duration::from_millis(100), Duration::from_secs(60));
        assert!(second.is_err());
        drop(guard);
        // Released on drop.
        assert!(
            LockGuard::acquire(&path, Duration::from_millis(100), Duration::from_secs(60)).is_ok()
        );
    }

    #[test]
    fn test_break_glass_on_stale_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        // A crashed holder left a lock with an ancient heartbeat.
        let stale = serde_json::json!({
            "pid": 0,
            "acquired_at": "2020-01-01T00:00:00Z",
            "heartbeat_at": "2020-01-01T00:00:00Z",
        });
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let guard =
            LockGuard::acquire(&path, Duration::from_millis(200), Duration::from_secs(60));
        assert!(guard.is_ok());
    }

    #[test]
    fn test_garbage_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        std::fs::write(&path, b"not json").unwrap();
        assert!(
            LockGuard::acquire(&path, Duration::from_millis(200), Duration::from_secs(60)).is_ok()
        );
    }
}
