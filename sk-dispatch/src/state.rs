//! State directory and its advisory lock.
//!
//! The directory's existence means "dispatcher loaded"; creating it is the
//! atomic claim step. Every dispatcher handle keeps a non-blocking
//! exclusive flock on the directory handle for its whole lifetime, so at
//! most one control process mutates a namespace at a time.

use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::errors::{DispatchError, Result};

pub struct StateDir {
    path: PathBuf,
    // Held until drop; releasing the lock is what frees the namespace for
    // the next control process.
    _lock: Flock<File>,
}

impl StateDir {
    /// Claim a namespace by creating its state directory.
    pub fn create(path: &Path) -> Result<StateDir> {
        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.create(path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                DispatchError::AlreadyLoaded
            } else {
                DispatchError::Io(e)
            }
        })?;

        // The directory was created by this call, so a failure to lock it
        // must not leave it behind.
        match Self::lock(path) {
            Ok(lock) => Ok(StateDir {
                path: path.to_path_buf(),
                _lock: lock,
            }),
            Err(e) => {
                let _ = fs::remove_dir_all(path);
                Err(e)
            }
        }
    }

    /// Open the state directory of an already loaded dispatcher.
    pub fn open(path: &Path) -> Result<StateDir> {
        if !path.is_dir() {
            return Err(DispatchError::NotLoaded);
        }
        Ok(StateDir {
            path: path.to_path_buf(),
            _lock: Self::lock(path)?,
        })
    }

    fn lock(path: &Path) -> Result<Flock<File>> {
        let dir = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DispatchError::NotLoaded
            } else {
                DispatchError::Io(e)
            }
        })?;

        Flock::lock(dir, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| match errno {
            Errno::EWOULDBLOCK => DispatchError::Busy,
            errno => DispatchError::Io(io::Error::from_raw_os_error(errno as i32)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove all pinned state. The lock stays valid on the unlinked
    /// handle until drop.
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// Removes a freshly created state directory unless disarmed. Bundles the
/// compensating cleanup of a failed multi-step create into one unwind
/// action.
pub struct RemoveOnError {
    path: Option<PathBuf>,
}

impl RemoveOnError {
    pub fn new(path: &Path) -> RemoveOnError {
        RemoveOnError {
            path: Some(path.to_path_buf()),
        }
    }

    /// Keep the directory: creation succeeded.
    pub fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for RemoveOnError {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_dir_all(&path);
        }
    }
}
