//! Named mutual exclusion that holds across process boundaries.
//!
//! A [`NamedLock`] is a lock file under the node's lock directory, locked
//! with `flock(2)`. Ranks on one node open the same path, so the kernel
//! arbitrates between them and drops the lock if a holder dies. `flock` does
//! not separate threads sharing one open file, so each handle also carries an
//! in-process mutex taken first.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use sgpu_core::SyncError;

/// A cross-process mutex identified by name.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    path: PathBuf,
    file: File,
    local: Mutex<()>,
}

impl NamedLock {
    /// Open (creating if needed) the lock `name` inside `dir`.
    ///
    /// The file is never truncated or removed: other ranks may hold it.
    pub fn create(dir: &Path, name: &str) -> Result<Self, SyncError> {
        let path = dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| SyncError::Create {
                name: name.to_string(),
                source,
            })?;
        tracing::trace!(name, path = %path.display(), "named lock opened");
        Ok(Self {
            name: name.to_string(),
            path,
            file,
            local: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held by this handle.
    pub fn acquire(&self) -> Result<NamedLockGuard<'_>, SyncError> {
        // The guarded value is (), so a poisoned mutex carries no broken state.
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        flock(&self.file, libc::LOCK_EX).map_err(|source| SyncError::Acquire {
            name: self.name.clone(),
            source,
        })?;
        Ok(NamedLockGuard {
            lock: self,
            _local: local,
        })
    }

    /// Take the lock only if nobody holds it. `Ok(None)` when contended.
    pub fn try_acquire(&self) -> Result<Option<NamedLockGuard<'_>>, SyncError> {
        let local = match self.local.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        match flock(&self.file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(NamedLockGuard {
                lock: self,
                _local: local,
            })),
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(source) => Err(SyncError::Acquire {
                name: self.name.clone(),
                source,
            }),
        }
    }
}

/// Held lock. Dropping it releases the lock for other ranks.
#[derive(Debug)]
pub struct NamedLockGuard<'a> {
    lock: &'a NamedLock,
    _local: MutexGuard<'a, ()>,
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.lock.file, libc::LOCK_UN) {
            tracing::error!(name = %self.lock.name, error = %e, "failed to release named lock");
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
