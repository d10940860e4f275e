//! Advisory cross-process locking for the user registry.
//!
//! The lock lives on a sibling file rather than the registry itself: the
//! registry is replaced by rename on every write, which would leave a lock
//! held on the old inode.

use crate::error_handling::types::RegistryError;
use log::{trace, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const RETRY_PAUSE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Held `flock` on the registry lock file, released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl RegistryLock {
    /// Acquires the lock, retrying without blocking until `timeout` elapses.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, RegistryError> {
        let file = open_lock_file(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            if try_flock(&file, mode)? {
                return Ok(Self::held(file, path, mode));
            }
            if Instant::now() >= deadline {
                return Err(RegistryError::LockTimeout(path.to_path_buf()));
            }
            thread::sleep(RETRY_PAUSE);
        }
    }

    /// Single attempt. `None` when another process holds a conflicting lock.
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>, RegistryError> {
        let file = open_lock_file(path)?;
        Ok(try_flock(&file, mode)?.then(|| Self::held(file, path, mode)))
    }

    fn held(file: File, path: &Path, mode: LockMode) -> Self {
        trace!("Acquired {:?} lock on {}", mode, path.display());
        Self {
            file,
            path: path.to_path_buf(),
            mode,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

fn open_lock_file(path: &Path) -> Result<File, RegistryError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

/// Returns `false` when the lock is held elsewhere.
fn try_flock(file: &File, mode: LockMode) -> Result<bool, RegistryError> {
    let op = (match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    }) | libc::LOCK_NB;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
        _ => Err(RegistryError::IoError(err)),
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        // SAFETY: same descriptor as in `acquire`, still open here.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                "Failed to release lock on {}: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        } else {
            trace!("Released {:?} lock on {}", self.mode, self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exclusive_lock_excludes_other_holders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json.lock");

        let held = RegistryLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(50)).unwrap();
        assert_eq!(held.mode(), LockMode::Exclusive);

        let err = RegistryLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout(_)));
        let err = RegistryLock::acquire(&path, LockMode::Shared, Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout(_)));

        drop(held);
        RegistryLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn try_acquire_gives_up_at_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json.lock");

        let held = RegistryLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        assert!(RegistryLock::try_acquire(&path, LockMode::Shared).unwrap().is_none());
        assert!(started.elapsed() < RETRY_PAUSE);

        drop(held);
        let shared = RegistryLock::try_acquire(&path, LockMode::Shared).unwrap().unwrap();
        assert_eq!(shared.mode(), LockMode::Shared);
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("users.json.lock");

        let _a = RegistryLock::acquire(&path, LockMode::Shared, Duration::from_millis(50)).unwrap();
        let _b = RegistryLock::acquire(&path, LockMode::Shared, Duration::from_millis(50)).unwrap();
        assert!(path.exists());
    }
}
