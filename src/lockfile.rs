//! Process-level exclusivity for a storage directory, and the liveness
//! signal the core consumes from it.
//!
//! `spec.md` §1 places "process-level lockfile supervision" out of scope
//! for the core ("the core consumes a 'lockfile holder is alive' signal")
//! — this module is the thin concrete collaborator that satisfies that
//! interface, not part of the storage stack proper. [`StorageManager`]
//! takes anything implementing [`LivenessSignal`]; [`LockFile`] is the
//! default, disk-backed implementation.
//!
//! Grounded on the `fs2` advisory-locking crate, used the same way by the
//! retrieval pack's `nfvdat-kv-store` and `bridgekat-qinhuai` repos for
//! single-writer enforcement over a data directory — the teacher itself
//! has no multi-process story (it is an embedded, single-process library),
//! so this is an "enrich from the rest of the pack" module per the
//! transformation rules rather than something adapted from the teacher.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, StorageError};

/// Something a [`crate::storage::StorageManager`] can poll to learn
/// whether the process-level lock it was opened under is still held.
///
/// `spec.md` §5: "a liveness check (the lockfile watcher) fatally halts
/// further operations once it stops." The core only consumes this signal
/// — it does not run the watcher itself.
pub trait LivenessSignal: Send {
    fn is_alive(&self) -> bool;
}

/// Never reports a failure. The default for single-process use and for
/// tests that do not exercise lock loss.
pub struct AlwaysAlive;

impl LivenessSignal for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// An advisory exclusive lock on `P.lck`, held for the lifetime of this
/// value. Acts as its own [`LivenessSignal`]: as long as the process that
/// acquired it is alive and this value has not been dropped, the lock is
/// held.
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Acquire the exclusive lock at `path`, creating the file if
    /// necessary. Fails immediately (rather than blocking) if another
    /// process already holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<LockFile> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            StorageError::ReadOnly(format!(
                "{} is held by another process",
                path.display()
            ))
        })?;
        Ok(LockFile { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LivenessSignal for LockFile {
    fn is_alive(&self) -> bool {
        // `try_lock_exclusive` on a lock we already hold always succeeds
        // (advisory locks are per-process, not per-handle), so liveness
        // here really asks "is the handle still open", which it trivially
        // is for as long as this value exists. The only way the lock
        // becomes unheld out from under a live `LockFile` is the file
        // disappearing entirely.
        self.path.exists()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_drop_releases_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lck");
        {
            let lock = LockFile::acquire(&path).unwrap();
            assert!(lock.is_alive());
        }
        // A second acquire after drop should succeed.
        let lock2 = LockFile::acquire(&path).unwrap();
        assert!(lock2.is_alive());
    }

    #[test]
    fn second_acquire_while_held_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lck");
        let _lock = LockFile::acquire(&path).unwrap();
        assert!(LockFile::acquire(&path).is_err());
    }

    #[test]
    fn always_alive_never_reports_failure() {
        assert!(AlwaysAlive.is_alive());
    }
}
