//! The redo-style transaction log.
//!
//! Grounded on the teacher's `WalManager` (`src/wal/mod.rs`): a
//! magic-header log file, frames written and fsynced on commit, and a
//! scan-on-open recovery pass. The shape is carried over wholesale; what
//! changes is the unit of replication — the teacher's WAL holds fixed-size
//! page images, this log holds variable-length marshaled [`Record`]
//! entries, and instead of always being "live" it accumulates up to
//! `MAX_TRANS` in-memory transaction slots before syncing to the data file,
//! rather than fsyncing per page write.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::record::{Record, RecordId};

/// Log file magic: `0x66 0x42`.
const LOG_MAGIC: [u8; 2] = [0x66, 0x42];

/// Maximum number of committed-but-not-yet-synced transaction slots held
/// in memory before a sync to the data file is forced.
pub const MAX_TRANS: usize = 10;

/// A single committed transaction: the ids it touched, in release order.
/// Duplicate ids across transactions in the ring are deduplicated (last
/// write wins) at sync time.
struct Transaction {
    ids: Vec<RecordId>,
}

/// Manages the on-disk redo log and the in-memory ring of pending,
/// committed-to-log transactions awaiting a sync to the data file.
pub struct TransactionManager {
    log_path: PathBuf,
    log: Option<File>,
    pending: Vec<RecordId>,
    ring: VecDeque<Transaction>,
}

impl TransactionManager {
    /// Open (creating if absent) the log file at `log_path`. An existing
    /// file with the wrong magic is reported via [`StorageError::BadLogMagic`]
    /// rather than opened; callers typically discard such a log (see
    /// `spec.md` §4.3) rather than propagating the error.
    pub fn open(log_path: impl AsRef<Path>) -> Result<TransactionManager> {
        let log_path = log_path.as_ref().to_path_buf();
        let existed = log_path.exists();
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        if existed && log.metadata()?.len() > 0 {
            let mut magic = [0u8; 2];
            log.seek(SeekFrom::Start(0))?;
            log.read_exact(&mut magic)?;
            if magic != LOG_MAGIC {
                return Err(StorageError::BadLogMagic);
            }
        } else {
            log.set_len(0)?;
            log.seek(SeekFrom::Start(0))?;
            log.write_all(&LOG_MAGIC)?;
            log.sync_all()?;
        }

        Ok(TransactionManager {
            log_path,
            log: Some(log),
            pending: Vec::new(),
            ring: VecDeque::new(),
        })
    }

    /// Record that `id` was released dirty and is now referenced by the
    /// transaction currently being accumulated.
    pub fn append(&mut self, id: RecordId) {
        self.pending.push(id);
    }

    /// True once a flush would be forced even without an explicit caller
    /// request (the in-memory ring of committed transactions is full).
    pub fn ring_full(&self) -> bool {
        self.ring.len() >= MAX_TRANS
    }

    /// Serialise the pending (uncommitted) transaction to the log file and
    /// fsync it. A no-op if nothing has been appended since the last
    /// commit. `dirty` supplies the current record contents to marshal.
    pub fn commit(&mut self, dirty: &std::collections::HashMap<RecordId, Record>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let log = self.log.as_mut().expect("log file not open");

        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.pending.len() as i64).to_le_bytes());
        for id in &self.pending {
            let record = dirty.get(id).ok_or_else(|| {
                StorageError::Internal(format!("transaction references unknown dirty record {id}"))
            })?;
            record.marshal(&mut buf);
        }
        log.seek(SeekFrom::End(0))?;
        log.write_all(&buf)?;
        log.sync_all()?;

        let ids = std::mem::take(&mut self.pending);
        self.ring.push_back(Transaction { ids });
        Ok(())
    }

    /// Deduplicate every id referenced by a committed-but-unsynced
    /// transaction (last occurrence wins), write each surviving record via
    /// `write_segment`, decrement its transaction-reference count once per
    /// occurrence removed, and return the ids that dropped to zero (these
    /// are now safe to move back to the free pool — see
    /// [`crate::recordfile::RecordFile::release_in_trans`]).
    ///
    /// After this call the log is truncated back to just its header and
    /// the in-memory ring is empty.
    pub fn sync_to_data(
        &mut self,
        dirty: &mut std::collections::HashMap<RecordId, Record>,
        mut write_segment: impl FnMut(RecordId, &[u8]) -> Result<()>,
    ) -> Result<Vec<RecordId>> {
        self.commit(dirty)?;

        let mut occurrences: std::collections::HashMap<RecordId, usize> =
            std::collections::HashMap::new();
        let mut order: Vec<RecordId> = Vec::new();
        for txn in &self.ring {
            for &id in &txn.ids {
                let count = occurrences.entry(id).or_insert(0);
                if *count == 0 {
                    order.push(id);
                }
                *count += 1;
            }
        }

        let mut resolved = Vec::new();
        for id in order {
            let occ = occurrences[&id];
            let record = dirty
                .get_mut(&id)
                .ok_or_else(|| StorageError::Internal(format!("record {id} missing from dirty set during sync")))?;
            write_segment(id, record.raw())?;
            for _ in 0..occ {
                record.dec_trans_count();
            }
            record.clear_dirty();
            if record.trans_count() == 0 {
                resolved.push(id);
            }
        }

        let log = self.log.as_mut().expect("log file not open");
        log.set_len(LOG_MAGIC.len() as u64)?;
        log.sync_all()?;
        self.ring.clear();

        Ok(resolved)
    }

    /// Read the log file (if any) and return every record entry it holds,
    /// in commit order, for replay into the data file on open. A missing
    /// log file yields an empty vector; a log with the wrong magic yields
    /// [`StorageError::BadLogMagic`] so the caller can decide to discard it.
    pub fn recover(log_path: impl AsRef<Path>) -> Result<Vec<Record>> {
        let log_path = log_path.as_ref();
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(log_path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < LOG_MAGIC.len() || buf[0..2] != LOG_MAGIC {
            return Err(StorageError::BadLogMagic);
        }
        let mut pos = LOG_MAGIC.len();
        let mut records = Vec::new();
        while pos + 8 <= buf.len() {
            let count = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            if count < 0 {
                return Err(StorageError::CorruptDatabase(
                    "negative transaction record count in log".into(),
                ));
            }
            pos += 8;
            for _ in 0..count {
                let (record, consumed) = Record::unmarshal(&buf[pos..])?;
                pos += consumed;
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Truncate the log back to just its header. Used after the caller has
    /// independently replayed the log's contents into the data file (e.g.
    /// recovery on open) and wants to start this manager from a clean log.
    pub fn truncate_to_header(&mut self) -> Result<()> {
        let log = self.log.as_mut().expect("log file not open");
        log.set_len(LOG_MAGIC.len() as u64)?;
        log.sync_all()?;
        Ok(())
    }

    /// Abandon every pending and committed-but-unsynced transaction without
    /// writing any of them to the data file: decrement each referenced
    /// record's transaction-reference count once per occurrence (same
    /// dedup-by-id counting as [`TransactionManager::sync_to_data`]), and
    /// return the ids whose count dropped to zero, removing them from
    /// `dirty` so the caller can return their buffers to its free pool.
    /// Used by rollback, which restores state from the on-disk log instead.
    pub fn discard(&mut self, dirty: &mut std::collections::HashMap<RecordId, Record>) -> Vec<RecordId> {
        self.pending.clear();

        let mut occurrences: std::collections::HashMap<RecordId, usize> =
            std::collections::HashMap::new();
        for txn in self.ring.drain(..) {
            for id in txn.ids {
                *occurrences.entry(id).or_insert(0) += 1;
            }
        }

        let mut resolved = Vec::new();
        for (id, occ) in occurrences {
            if let Some(record) = dirty.get_mut(&id) {
                for _ in 0..occ {
                    record.dec_trans_count();
                }
                if record.trans_count() == 0 {
                    resolved.push(id);
                }
            }
        }
        for id in &resolved {
            dirty.remove(id);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn dirty_record(id: RecordId, byte: u8) -> Record {
        let mut r = Record::new(id, 8);
        r.write_u8(0, byte).unwrap();
        r.mark_dirty();
        r.inc_trans_count();
        r
    }

    #[test]
    fn open_writes_magic_on_fresh_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let _mgr = TransactionManager::open(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..2], &LOG_MAGIC);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, [0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        let err = TransactionManager::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::BadLogMagic));
    }

    #[test]
    fn commit_then_recover_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut mgr = TransactionManager::open(&path).unwrap();

        let mut dirty = HashMap::new();
        dirty.insert(1, dirty_record(1, 7));
        dirty.insert(2, dirty_record(2, 9));
        mgr.append(1);
        mgr.append(2);
        mgr.commit(&dirty).unwrap();
        drop(mgr);

        let recovered = TransactionManager::recover(&path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].id(), 1);
        assert_eq!(recovered[0].raw()[0], 7);
        assert_eq!(recovered[1].id(), 2);
        assert_eq!(recovered[1].raw()[0], 9);
    }

    #[test]
    fn sync_to_data_dedups_and_resolves_trans_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut mgr = TransactionManager::open(&path).unwrap();

        let mut dirty = HashMap::new();
        dirty.insert(1, dirty_record(1, 1));
        mgr.append(1);
        mgr.commit(&dirty).unwrap();

        // Same record released dirty a second time before sync.
        dirty.get_mut(&1).unwrap().write_u8(0, 2).unwrap();
        dirty.get_mut(&1).unwrap().inc_trans_count();
        mgr.append(1);
        mgr.commit(&dirty).unwrap();

        let mut written = Vec::new();
        let resolved = mgr
            .sync_to_data(&mut dirty, |id, data| {
                written.push((id, data.to_vec()));
                Ok(())
            })
            .unwrap();

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, 1);
        assert_eq!(written[0].1[0], 2);
        assert_eq!(resolved, vec![1]);
        assert_eq!(dirty[&1].trans_count(), 0);
        assert!(!dirty[&1].is_dirty());
    }

    #[test]
    fn ring_full_after_max_trans_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut mgr = TransactionManager::open(&path).unwrap();
        for i in 0..MAX_TRANS {
            let mut dirty = HashMap::new();
            dirty.insert(i as u64, dirty_record(i as u64, 0));
            mgr.append(i as u64);
            mgr.commit(&dirty).unwrap();
        }
        assert!(mgr.ring_full());
    }

    #[test]
    fn recover_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent-log");
        let recovered = TransactionManager::recover(&path).unwrap();
        assert!(recovered.is_empty());
    }
}
