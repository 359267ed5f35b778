//! File-level exclusive lock serialising writers of the baseline store and
//! the alert history.
//!
//! The daemon and short-lived administrative commands all take this lock
//! around their load–mutate–save or read–rewrite sequences. On unix this is
//! `flock(2)`, so the lock is released by the kernel if the holder dies.

use crate::error::{Result, VigiloError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

pub struct StoreLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Block (polling every `retry`) until the lock is held or `timeout`
    /// elapses, in which case `LockTimeout` is returned.
    pub fn acquire(path: &Path, timeout: Duration, retry: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(file) = try_lock(path)? {
                trace!(path = %path.display(), "file lock acquired");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }
            if started.elapsed() >= timeout {
                return Err(VigiloError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(retry);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(path: &Path) -> Result<Option<File>> {
    use std::os::unix::io::AsRawFd;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(Some(file));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(None)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn try_lock(path: &Path) -> Result<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_times_out_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let first = StoreLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(5)).unwrap();
        let err = StoreLock::acquire(&path, Duration::from_millis(60), Duration::from_millis(5))
            .err()
            .unwrap();
        assert!(matches!(err, VigiloError::LockTimeout { .. }));
        drop(first);
        let again = StoreLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(5));
        assert!(again.is_ok());
    }
}
