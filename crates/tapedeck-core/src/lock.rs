//! Cross-process file locking for tape writes.
//!
//! Uses OS-level advisory locking (via fs2) so that concurrent recorders
//! writing to the same tape path serialize, while recorders for distinct
//! paths proceed in parallel. Locks live on a `.lock` sidecar next to the
//! tape so the tape file itself can be atomically renamed over.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Default time to wait for a contended lock before failing.
pub const LOCK_WAIT_DEFAULT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a contended lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// An acquired exclusive lock on a tape path.
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct PathLock {
    _lock_file: File,
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquire the exclusive lock guarding `target`, waiting up to `wait`.
    ///
    /// Returns [`Error::StoreBusy`] when another process holds the lock for
    /// the whole wait window.
    pub fn acquire(target: &Path, wait: Duration) -> Result<Self> {
        let lock_path = sidecar_path(target);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let started = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(
                        lock_path = %lock_path.display(),
                        "acquired tape lock"
                    );
                    return Ok(Self {
                        _lock_file: lock_file,
                        lock_path,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited >= wait {
                        return Err(Error::StoreBusy {
                            path: target.to_path_buf(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL.min(wait - waited));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Path of the lock sidecar file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        tracing::debug!(
            lock_path = %self.lock_path.display(),
            "released tape lock"
        );
        // The OS lock is released when _lock_file is dropped; the sidecar
        // stays behind so waiters do not race on file creation.
    }
}

/// Compute the lock sidecar path for a tape path.
fn sidecar_path(target: &Path) -> PathBuf {
    let mut path = target.to_path_buf();
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tape");
    path.set_file_name(format!("{file_name}.lock"));
    path
}
