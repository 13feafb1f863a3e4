//! [`StorageManager`]: the public four-file facade over the physical and
//! logical slot layers, plus [`ObjectStorageManager`], the thin
//! object-serialising adapter spec.md §4.10 describes alongside it.
//!
//! A storage directory is named by a base path with no extension; the
//! four backing files and the lockfile hang off it by suffix (`P.db`,
//! `P.dbf`, `P.ix`, `P.ixf`, `P.lck`), matching the naming scheme the
//! teacher's own `RecordFile` segment files use for `.N` segment suffixes.

use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::loc::Location;
use crate::lockfile::{AlwaysAlive, LivenessSignal, LockFile};
use crate::logical::{FreeLogicalSlotManager, LogicalSlotManager};
use crate::pager::Pager;
use crate::physical::{FreePhysicalSlotManager, PhysicalSlotManager};
use crate::recordfile::{RecordFile, DEFAULT_SEGMENT_SIZE};

pub const DEFAULT_PHYSICAL_RECORD_SIZE: usize = 8192;
pub const DEFAULT_FREE_PHYSICAL_RECORD_SIZE: usize = 1024;
pub const DEFAULT_LOGICAL_RECORD_SIZE: usize = 2048;
pub const DEFAULT_FREE_LOGICAL_RECORD_SIZE: usize = 1024;

/// The on-disk format version this build writes and accepts. Stored in
/// root 1 of the physical file, per spec.md §6 ("root 1 is reserved for a
/// format-version marker").
pub const CURRENT_FORMAT_VERSION: u64 = 1;
const ROOT_VERSION_INDEX: usize = 1;

/// Configuration for [`StorageManager::open`].
///
/// Record sizes default to the fixed sizes spec.md §6 assigns each file;
/// they are exposed here mainly so tests can shrink them and exercise
/// multi-segment, multi-continuation-page behavior without writing
/// gigabytes of filler.
pub struct StorageOptions {
    pub base_path: PathBuf,
    pub physical_record_size: usize,
    pub free_physical_record_size: usize,
    pub logical_record_size: usize,
    pub free_logical_record_size: usize,
    pub segment_size: u64,
    pub trans_disabled: bool,
    pub read_only: bool,
    /// Forwarded to [`FreePhysicalSlotManager::set_only_append`]: never
    /// reuse freed physical slots, only hand out fresh space.
    pub only_append: bool,
}

impl StorageOptions {
    pub fn new(base_path: impl Into<PathBuf>) -> StorageOptions {
        StorageOptions {
            base_path: base_path.into(),
            physical_record_size: DEFAULT_PHYSICAL_RECORD_SIZE,
            free_physical_record_size: DEFAULT_FREE_PHYSICAL_RECORD_SIZE,
            logical_record_size: DEFAULT_LOGICAL_RECORD_SIZE,
            free_logical_record_size: DEFAULT_FREE_LOGICAL_RECORD_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            trans_disabled: false,
            read_only: false,
            only_append: false,
        }
    }
}

fn suffixed(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Byte-oriented public facade over the four backing files: physical
/// slots (`db`/`dbf`) and logical slots (`ix`/`ixf`). Every live
/// [`Location`] handed out is a *logical* address; physical addresses are
/// an internal indirection the caller never sees.
pub struct StorageManager {
    physical: PhysicalSlotManager,
    logical: LogicalSlotManager,
    read_only: bool,
    trans_disabled: bool,
    liveness: Box<dyn LivenessSignal>,
    name: String,
}

impl StorageManager {
    pub fn open(options: StorageOptions) -> Result<StorageManager> {
        let liveness: Box<dyn LivenessSignal> = if options.read_only {
            Box::new(AlwaysAlive)
        } else {
            Box::new(LockFile::acquire(suffixed(&options.base_path, "lck"))?)
        };

        let db_rf = RecordFile::open(
            suffixed(&options.base_path, "db"),
            options.physical_record_size,
            options.segment_size,
            options.trans_disabled,
            options.read_only,
        )?;
        let dbf_rf = RecordFile::open(
            suffixed(&options.base_path, "dbf"),
            options.free_physical_record_size,
            options.segment_size,
            options.trans_disabled,
            options.read_only,
        )?;
        let ix_rf = RecordFile::open(
            suffixed(&options.base_path, "ix"),
            options.logical_record_size,
            options.segment_size,
            options.trans_disabled,
            options.read_only,
        )?;
        let ixf_rf = RecordFile::open(
            suffixed(&options.base_path, "ixf"),
            options.free_logical_record_size,
            options.segment_size,
            options.trans_disabled,
            options.read_only,
        )?;

        let mut db_pager = Pager::open(db_rf, options.read_only)?;
        let dbf_pager = Pager::open(dbf_rf, options.read_only)?;
        let ix_pager = Pager::open(ix_rf, options.read_only)?;
        let ixf_pager = Pager::open(ixf_rf, options.read_only)?;

        let version = db_pager.root(ROOT_VERSION_INDEX)?;
        if version == 0 {
            if !options.read_only {
                db_pager.set_root(ROOT_VERSION_INDEX, CURRENT_FORMAT_VERSION)?;
            }
        } else if version > CURRENT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let mut free_physical = FreePhysicalSlotManager::open(dbf_pager);
        free_physical.set_only_append(options.only_append);
        let physical = PhysicalSlotManager::open(db_pager, free_physical);

        let free_logical = FreeLogicalSlotManager::open(ixf_pager);
        let logical = LogicalSlotManager::open(ix_pager, free_logical);

        Ok(StorageManager {
            physical,
            logical,
            read_only: options.read_only,
            trans_disabled: options.trans_disabled,
            liveness,
            name: options.base_path.display().to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_alive(&self) -> Result<()> {
        if !self.liveness.is_alive() {
            return Err(StorageError::Internal(format!(
                "{}: lockfile liveness signal reports the lock is gone, refusing further operations",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.read_only {
            return Err(StorageError::ReadOnly(format!(
                "{} is open read-only",
                self.name
            )));
        }
        Ok(())
    }

    /// Reads one of the sixteen caller-defined roots. Index 1 is reserved
    /// for the format version and is not meant to be read or written by
    /// callers, but nothing here stops them.
    pub fn root(&self, index: usize) -> Result<u64> {
        self.ensure_alive()?;
        self.physical.pager().root(index)
    }

    pub fn set_root(&mut self, index: usize, value: u64) -> Result<()> {
        self.ensure_alive()?;
        if self.read_only {
            return Ok(());
        }
        self.physical.pager_mut().set_root(index, value)
    }

    pub fn insert(&mut self, payload: &[u8]) -> Result<Location> {
        self.ensure_writable()?;
        let phys_loc = self.physical.insert(payload)?;
        self.logical.insert(phys_loc)
    }

    pub fn update(&mut self, log_loc: Location, payload: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let phys_loc = self.logical.fetch(log_loc)?;
        if phys_loc == 0 {
            return Err(StorageError::SlotNotFound);
        }
        let new_phys_loc = self.physical.update(phys_loc, payload)?;
        if new_phys_loc != phys_loc {
            self.logical.update(log_loc, new_phys_loc)?;
        }
        Ok(())
    }

    pub fn fetch(&mut self, log_loc: Location, out: &mut Vec<u8>) -> Result<()> {
        self.ensure_alive()?;
        let phys_loc = self.logical.fetch(log_loc)?;
        if phys_loc == 0 {
            return Err(StorageError::SlotNotFound);
        }
        self.physical.fetch(phys_loc, out)
    }

    /// Frees the physical slot first, then the logical slot. If the
    /// logical free fails after the physical one succeeded, the error is
    /// still propagated: the caller's `log_loc` now points at a freed
    /// physical slot and must not be reused as though `free` had failed
    /// cleanly.
    pub fn free(&mut self, log_loc: Location) -> Result<()> {
        self.ensure_writable()?;
        let phys_loc = self.logical.fetch(log_loc)?;
        if phys_loc == 0 {
            return Err(StorageError::SlotNotFound);
        }
        self.physical.free(phys_loc)?;
        self.logical.free(log_loc)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_alive()?;
        StorageError::collect(vec![self.physical.flush(), self.logical.flush()])
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.trans_disabled || self.read_only {
            return Ok(());
        }
        self.ensure_alive()?;
        StorageError::collect(vec![self.physical.rollback(), self.logical.rollback()])
    }

    pub fn close(self) -> Result<()> {
        StorageError::collect(vec![self.physical.close(), self.logical.close()])
    }
}

/// Encodes and decodes a caller-defined type to and from the bytes
/// [`StorageManager`] stores. spec.md §4.10 calls this out as "an
/// object-serialising variant" layered on the byte-oriented core, and
/// §1 puts the serialization format itself out of scope — the core
/// never interprets the bytes it stores, so this is deliberately a thin
/// pass-through rather than a fixed wire format.
pub trait Codec<T> {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// An object-serialising adapter over [`StorageManager`]: every
/// operation encodes or decodes through a caller-supplied [`Codec`]
/// rather than taking or returning raw bytes.
pub struct ObjectStorageManager<T, C: Codec<T>> {
    inner: StorageManager,
    codec: C,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, C: Codec<T>> ObjectStorageManager<T, C> {
    pub fn new(inner: StorageManager, codec: C) -> ObjectStorageManager<T, C> {
        ObjectStorageManager {
            inner,
            codec,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn into_inner(self) -> StorageManager {
        self.inner
    }

    pub fn insert(&mut self, value: &T) -> Result<Location> {
        let bytes = self.codec.encode(value);
        self.inner.insert(&bytes)
    }

    pub fn update(&mut self, log_loc: Location, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value);
        self.inner.update(log_loc, &bytes)
    }

    pub fn fetch(&mut self, log_loc: Location) -> Result<T> {
        let mut bytes = Vec::new();
        self.inner.fetch(log_loc, &mut bytes)?;
        self.codec.decode(&bytes)
    }

    pub fn free(&mut self, log_loc: Location) -> Result<()> {
        self.inner.free(log_loc)
    }

    pub fn root(&self, index: usize) -> Result<u64> {
        self.inner.root(index)
    }

    pub fn set_root(&mut self, index: usize, value: u64) -> Result<()> {
        self.inner.set_root(index, value)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    pub fn close(self) -> Result<()> {
        self.inner.close()
    }
}
