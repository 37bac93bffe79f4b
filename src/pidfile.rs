//! Exclusive PID-lock file, acquired by [`crate::Controller::new`] and
//! released during shutdown.
//!
//! Grounded on the lock-file dance in the teacher's daemon startup: open
//! without truncating, acquire the advisory lock, only then truncate and
//! write the PID — so a failed lock attempt never clobbers the PID of the
//! daemon that already holds it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::DaemonError;

/// A held exclusive lock on a PID file. Dropping it releases the lock; the
/// file itself is left on disk for the next start to reuse.
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Acquire an exclusive lock on `path`, creating it if necessary, and
    /// write the current process id into it.
    ///
    /// Returns [`DaemonError::AlreadyRunning`] if another process already
    /// holds the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DaemonError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new().write(true).create(true).truncate(false).open(&path).map_err(
            |source| DaemonError::Io { path: path.clone(), source },
        )?;

        file.try_lock_exclusive().map_err(|_| DaemonError::AlreadyRunning(path.clone()))?;

        let mut file = file;
        file.set_len(0).map_err(|source| DaemonError::Io { path: path.clone(), source })?;
        writeln!(file, "{}", std::process::id())
            .map_err(|source| DaemonError::Io { path: path.clone(), source })?;

        Ok(Self { path, file })
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and drop the handle. Equivalent to dropping the
    /// value; kept as an explicit method so shutdown sequences read clearly.
    pub fn release(self) {
        let _ = self.file.unlock();
    }
}
