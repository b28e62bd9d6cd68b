//! flock-based exclusive locks for shared sandbox files and folders.
//!
//! A lock serializes both threads of this process and other processes, since
//! every acquisition opens its own file description.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

/// Default wait before giving up on a lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Guard holding an exclusive lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

impl FileLock {
    /// Acquire the lock, polling with exponential backoff until `timeout`.
    ///
    /// Returns `ErrorKind::TimedOut` when the lock stays held past the deadline.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(lock_path)?;
        let deadline = Instant::now() + timeout;
        let mut backoff = MIN_BACKOFF;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "lock {} still held after {:?}",
                                lock_path.display(),
                                timeout
                            ),
                        ));
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_parent_dirs_and_file() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("locks").join("workspace.lock");

        let _lock = FileLock::acquire(&lock_path, DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn dropping_the_guard_releases_the_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("projects.lock");

        let held = FileLock::acquire(&lock_path, DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(FileLock::acquire(&lock_path, Duration::from_millis(20)).is_err());

        drop(held);
        assert!(FileLock::acquire(&lock_path, Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn acquire_times_out_while_other_thread_holds() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join("folder-demo.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let holder_path = Arc::clone(&lock_path);
        let holder_barrier = Arc::clone(&barrier);
        let holder = thread::spawn(move || {
            let lock = FileLock::acquire(&holder_path, DEFAULT_LOCK_TIMEOUT).unwrap();
            holder_barrier.wait();
            thread::sleep(Duration::from_millis(400));
            drop(lock);
        });

        barrier.wait();
        let err = FileLock::acquire(&lock_path, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        holder.join().unwrap();
    }

    #[test]
    fn acquire_waits_for_release() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join("workspace.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let holder_path = Arc::clone(&lock_path);
        let holder_barrier = Arc::clone(&barrier);
        let holder = thread::spawn(move || {
            let lock = FileLock::acquire(&holder_path, DEFAULT_LOCK_TIMEOUT).unwrap();
            holder_barrier.wait();
            thread::sleep(Duration::from_millis(50));
            drop(lock);
        });

        barrier.wait();
        assert!(FileLock::acquire(&lock_path, Duration::from_secs(5)).is_ok());

        holder.join().unwrap();
    }
}
