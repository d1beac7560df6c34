//! Host-wide advisory locks.
//!
//! Every `vpsf` invocation is its own process, so an in-process mutex
//! cannot serialize two commands. A [`HostLock`] holds an exclusive
//! `flock(2)` on a lock file until it is dropped. Two handles conflict even
//! when they live in the same process.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::time::Instant;

use crate::error::{ForgeError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lock file guarding `path`: the same name with `.lock` appended.
#[must_use]
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive lock on a file, released on drop.
pub struct HostLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl HostLock {
    /// Takes the lock without waiting. Returns `None` while another
    /// handle holds it.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Io`] if the lock file cannot be opened or
    /// locked.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let io = |source| ForgeError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self {
                path: path.to_path_buf(),
                _flock: flock,
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(io(std::io::Error::from(errno))),
        }
    }

    /// Waits up to `timeout` for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Timeout`] if the lock is still held when the
    /// budget runs out, or the error of [`HostLock::try_acquire`].
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                tracing::trace!(path = %path.display(), "host lock taken");
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::Timeout {
                    operation: format!("lock {}", path.display()),
                    after: timeout,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
