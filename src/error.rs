//! Unified error handling for the storage engine.
//!
//! This module defines [`StorageError`], the single error type propagated
//! throughout every layer of the engine — from segment I/O and the redo log,
//! through the slot managers, up to the public [`crate::storage`] facade.
//!
//! A convenience [`Result<T>`] type alias is re-exported from the crate root
//! so that callers can write `Result<T>` instead of
//! `std::result::Result<T, StorageError>`.

use std::fmt;
use std::io;

/// The canonical error type for all storage-engine operations.
///
/// Every fallible function in the codebase returns this type (via the
/// [`Result`] alias). Variants are grouped by the taxonomy the engine's
/// design uses: not-found, conflict, corruption, read-only, encoding, and
/// I/O (see the crate's design notes).
#[derive(Debug)]
pub enum StorageError {
    /// An I/O error originating from the filesystem or disk layer.
    Io(io::Error),

    /// A logical slot resolved to the empty location, or the caller
    /// addressed a physical/logical location that was never allocated.
    SlotNotFound,

    /// A cache lookup found no binding for the requested location.
    NotInCache,

    /// The record is already held by another caller (`get` without a
    /// matching `release`/`discard`).
    AlreadyInUse(u64),

    /// `release`/`discard` was called on a record that was not in use, or
    /// was called twice.
    NotInUse(u64),

    /// A free-page operation was attempted on a page that forbids it (the
    /// header page, or a page that is already free).
    FreePage(u64),

    /// An operation addressed record 0 (the pager header) where a data
    /// page was required.
    Header,

    /// The on-disk file is corrupt or contains an unrecognised format
    /// (bad magic bytes, unexpected header, truncated segment).
    CorruptDatabase(String),

    /// The transaction log's magic bytes did not match; the log is
    /// discarded and this error is informational only (callers typically
    /// do not propagate it — see [`crate::transaction`]).
    BadLogMagic,

    /// A write operation was attempted against a manager opened read-only.
    ReadOnly(String),

    /// A slot size could not be packed into the 16-bit codec (count
    /// overflowed the selected band), or a caller passed a size that was
    /// not the output of [`crate::slotsize::normalize`] where normalised
    /// input was required.
    Encoding(String),

    /// The on-disk format version is newer than this build supports.
    UnsupportedVersion(u64),

    /// An internal invariant was violated. This usually indicates a bug
    /// in the engine itself and should be reported.
    Internal(String),

    /// Several independent operations (e.g. flushing four underlying
    /// record files) each failed; all failures are retained.
    Many(Vec<StorageError>),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "I/O error: {err}"),
            StorageError::SlotNotFound => write!(f, "slot not found"),
            StorageError::NotInCache => write!(f, "not in cache"),
            StorageError::AlreadyInUse(id) => write!(f, "record {id} already in use"),
            StorageError::NotInUse(id) => write!(f, "record {id} not in use"),
            StorageError::FreePage(id) => write!(f, "cannot free page {id}"),
            StorageError::Header => write!(f, "operation not valid on the header page"),
            StorageError::CorruptDatabase(msg) => write!(f, "corrupt database: {msg}"),
            StorageError::BadLogMagic => write!(f, "transaction log has invalid magic bytes"),
            StorageError::ReadOnly(msg) => write!(f, "read-only: {msg}"),
            StorageError::Encoding(msg) => write!(f, "encoding error: {msg}"),
            StorageError::UnsupportedVersion(v) => {
                write!(f, "unsupported on-disk format version: {v}")
            }
            StorageError::Internal(msg) => write!(f, "internal error: {msg}"),
            StorageError::Many(errs) => {
                write!(f, "{} errors occurred:", errs.len())?;
                for e in errs {
                    write!(f, "\n  - {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl StorageError {
    /// Combine a list of independently-produced results into one, folding
    /// all errors into a single [`StorageError::Many`] if any failed.
    ///
    /// Used by operations that must attempt every step even after an
    /// earlier one fails (e.g. [`crate::storage::StorageManager::flush`]
    /// flushing all four underlying record files).
    pub fn collect(results: Vec<Result<()>>) -> Result<()> {
        let errs: Vec<StorageError> = results.into_iter().filter_map(|r| r.err()).collect();
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.into_iter().next().unwrap()),
            _ => Err(StorageError::Many(errs)),
        }
    }
}

/// A specialised [`Result`] type for storage-engine operations.
pub type Result<T> = std::result::Result<T, StorageError>;
