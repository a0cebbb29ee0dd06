//! Advisory file locking for cache entries.
//!
//! Every cache entry owns a sibling `.lock` file. All read, write and
//! remove operations on the entry's data and dependency files happen
//! while holding an exclusive lock on it, which serializes access to one
//! fingerprint across threads and across processes sharing the same
//! cache directory. Operations on different fingerprints never contend.
//!
//! Acquisition blocks without a timeout; callers needing a bounded wait
//! must layer one on top.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a cache entry.
///
/// The lock is released when the guard is dropped, on every exit path.
pub struct EntryLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl EntryLock {
    /// Acquire an exclusive lock, blocking until it becomes available.
    ///
    /// Creates the lock file if it does not exist.
    pub fn acquire(lock_path: &Path) -> io::Result<Self> {
        let lock_file = Self::open_locked(lock_path)?;
        Ok(Self {
            lock_path: lock_path.to_path_buf(),
            lock_file,
        })
    }

    #[cfg(unix)]
    fn open_locked(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(file);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
            // Interrupted by a signal, retry
        }
    }

    #[cfg(not(unix))]
    fn open_locked(lock_path: &Path) -> io::Result<File> {
        use std::time::Duration;

        // No flock equivalent is portable here, so fall back to
        // create_new as the mutual-exclusion primitive and poll.
        let poll_interval = Duration::from_millis(50);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(lock_path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("entry.lock");

        let lock = EntryLock::acquire(&lock_path).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_reacquire_after_drop() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("entry.lock");

        {
            let _lock = EntryLock::acquire(&lock_path).unwrap();
        }
        // Released on drop, so this must not block
        let _lock2 = EntryLock::acquire(&lock_path).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_acquire_blocks_until_released() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("entry.lock");
        let lock_path2 = lock_path.clone();

        let lock = EntryLock::acquire(&lock_path).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _lock = EntryLock::acquire(&lock_path2).unwrap();
            tx.send(()).unwrap();
        });

        // The second holder must still be waiting
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(lock);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }
}
