//! Cross-process allocation lock.
//!
//! Uses `flock(2)` on a file in the cache directory so that two manager
//! processes cannot pick the same free TAP name between scanning the host
//! and creating the devices.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::ExecutorError;

/// Exclusive advisory lock held from TAP allocation until the devices exist.
///
/// The lock is released when this guard is dropped, or when the process
/// exits/crashes.
#[derive(Debug)]
pub struct AllocationLock {
    file: File,
    path: PathBuf,
}

impl AllocationLock {
    /// Blocks (on a blocking-pool thread) until the lock at `path` is held.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the lock file cannot be opened or locked.
    pub async fn acquire(path: &Path) -> Result<Self, ExecutorError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::lock(path, libc::LOCK_EX))
            .await
            .map_err(|e| ExecutorError::Io(std::io::Error::other(e)))?
    }

    /// Takes the lock only if nobody else holds it.
    #[cfg(test)]
    fn try_acquire(path: &Path) -> Result<Self, ExecutorError> {
        Self::lock(path.to_path_buf(), libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(path: PathBuf, operation: libc::c_int) -> Result<Self, ExecutorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // SAFETY: `file` owns a valid open descriptor for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(ExecutorError::conflict(
                    format!("allocation lock {}", path.display()),
                    "held by another manager process",
                ));
            }
            return Err(err.into());
        }

        tracing::debug!(lock = %path.display(), "allocation lock acquired");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AllocationLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor stays open until `self.file` is dropped after this.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock = %self.path.display(), "allocation lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path() -> (tempfile::TempDir, PathBuf) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let path = dir.path().join("cache/.tap.lock");
        (dir, path)
    }

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let (_dir, path) = lock_path();
        let first = match AllocationLock::acquire(&path).await {
            Ok(l) => l,
            Err(e) => panic!("first acquire: {e}"),
        };
        assert!(first.path().exists());

        let contended = AllocationLock::try_acquire(&path);
        assert!(matches!(contended, Err(ExecutorError::ResourceConflict { .. })));

        drop(first);
        assert!(AllocationLock::try_acquire(&path).is_ok(), "lock must be free after drop");
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_holder() {
        let (_dir, path) = lock_path();
        let first = match AllocationLock::acquire(&path).await {
            Ok(l) => l,
            Err(e) => panic!("first acquire: {e}"),
        };

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move { AllocationLock::acquire(&waiter_path).await.is_ok() });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "waiter must block while the lock is held");

        drop(first);
        assert!(matches!(waiter.await, Ok(true)));
    }
}
