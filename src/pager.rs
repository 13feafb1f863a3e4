//! The paged view over a [`RecordFile`]: typed linked lists of pages, and
//! the record-0 header that anchors them plus a small bank of caller roots.
//!
//! Grounded on the teacher's `Pager` (`src/pager/mod.rs`): a header page
//! parsed on open, a LIFO free-page list, `allocate_page`/`free_page`, and
//! a `schema_root`-style metadata slot in the header — generalised here
//! from one root to an array of them, and from one implicit page "kind"
//! to five typed linked lists threaded through `nextPage`/`prevPage`.

use crate::error::{Result, StorageError};
use crate::record::{PageView, RecordId};
use crate::recordfile::RecordFile;

/// Header magic at offset 0 of record 0.
pub const HEADER_MAGIC: u16 = 0x1980;

/// Number of typed linked lists threaded through the pager, including the
/// free-page list (index 0).
const NUM_LISTS: usize = 5;

/// Byte offset where the per-list `(first, last)` pointer pairs begin.
const LISTS_OFFSET: usize = 2;
/// Byte offset where the root-value array begins (`2 + 5*16`).
pub const ROOTS_OFFSET: usize = LISTS_OFFSET + NUM_LISTS * 16;

/// Index of the free-page list within the five typed lists. Only `next`
/// pointers are maintained for this list — see `spec.md` §9 ("Free-list
/// prev pointers are not maintained").
const FREE_LIST_INDEX: usize = 0;

/// The four page kinds a caller may explicitly allocate. (The fifth kind,
/// `Free`, exists only as the destination of [`Pager::free_page`] and the
/// source of [`Pager::allocate_page`]'s recycling — `spec.md` §4.4
/// forbids allocating type 0 directly.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Data,
    Translation,
    FreeLogicalSlot,
    FreePhysicalSlot,
}

impl PageType {
    fn list_index(self) -> usize {
        match self {
            PageType::Data => 1,
            PageType::Translation => 2,
            PageType::FreeLogicalSlot => 3,
            PageType::FreePhysicalSlot => 4,
        }
    }

    fn to_page_view(self) -> PageView {
        match self {
            PageType::Data => PageView::Data { offset_first: 0 },
            PageType::Translation => PageView::Translation,
            PageType::FreeLogicalSlot => PageView::FreeLogicalSlot,
            PageType::FreePhysicalSlot => PageView::FreePhysicalSlot,
        }
    }
}

fn list_index_of(view: PageView) -> Result<usize> {
    match view {
        PageView::Free => Err(StorageError::Internal(
            "free pages do not belong to a typed list".into(),
        )),
        PageView::Data { .. } => Ok(1),
        PageView::Translation => Ok(2),
        PageView::FreeLogicalSlot => Ok(3),
        PageView::FreePhysicalSlot => Ok(4),
    }
}

/// In-memory mirror of record 0's contents.
struct HeaderState {
    list_first: [RecordId; NUM_LISTS],
    list_last: [RecordId; NUM_LISTS],
    roots: Vec<u64>,
}

impl HeaderState {
    fn empty(num_roots: usize) -> HeaderState {
        HeaderState {
            list_first: [0; NUM_LISTS],
            list_last: [0; NUM_LISTS],
            roots: vec![0; num_roots],
        }
    }
}

/// A [`RecordFile`] viewed as a set of typed linked lists anchored in a
/// header stored at record 0.
pub struct Pager {
    records: RecordFile,
    read_only: bool,
    header: HeaderState,
}

impl Pager {
    /// Open a pager over `records`, initialising record 0 as a fresh
    /// header if it has never been written, or parsing the existing one.
    pub fn open(records: RecordFile, read_only: bool) -> Result<Pager> {
        let num_roots = Self::num_roots_for(records.record_size())?;
        let mut pager = Pager {
            records,
            read_only,
            header: HeaderState::empty(num_roots),
        };
        let is_new = pager.reload_header()?;
        if is_new {
            if pager.read_only {
                return Err(StorageError::ReadOnly(
                    "cannot initialise a new pager header in read-only mode".into(),
                ));
            }
            pager.persist_header()?;
        }
        Ok(pager)
    }

    fn num_roots_for(record_size: usize) -> Result<usize> {
        if record_size <= ROOTS_OFFSET {
            return Err(StorageError::Internal(format!(
                "record size {record_size} too small to hold a pager header"
            )));
        }
        Ok((record_size - ROOTS_OFFSET) / 8)
    }

    /// Reads record 0 and either parses it into `self.header` (returning
    /// `false`) or, if it is all zero (a brand-new record file), leaves
    /// the header at its empty defaults and returns `true`.
    fn reload_header(&mut self) -> Result<bool> {
        let guard = self.records.get(0)?;
        let magic = guard.read_u16(0)?;
        if magic == 0 {
            self.records.discard(guard)?;
            return Ok(true);
        }
        if magic != HEADER_MAGIC {
            self.records.discard(guard)?;
            return Err(StorageError::CorruptDatabase(format!(
                "pager header has bad magic {magic:#06x}"
            )));
        }
        for i in 0..NUM_LISTS {
            let off = LISTS_OFFSET + i * 16;
            self.header.list_first[i] = guard.read_u64(off)?;
            self.header.list_last[i] = guard.read_u64(off + 8)?;
        }
        for (i, root) in self.header.roots.iter_mut().enumerate() {
            *root = guard.read_u64(ROOTS_OFFSET + i * 8)?;
        }
        self.records.discard(guard)?;
        Ok(false)
    }

    fn persist_header(&mut self) -> Result<()> {
        let mut guard = self.records.get(0)?;
        guard.write_u16(0, HEADER_MAGIC)?;
        for i in 0..NUM_LISTS {
            let off = LISTS_OFFSET + i * 16;
            guard.write_u64(off, self.header.list_first[i])?;
            guard.write_u64(off + 8, self.header.list_last[i])?;
        }
        for (i, root) in self.header.roots.iter().enumerate() {
            guard.write_u64(ROOTS_OFFSET + i * 8, *root)?;
        }
        self.records.release(guard, true)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            Err(StorageError::ReadOnly(
                "pager is read-only".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Allocate a page of `page_type`, recycling from the free-page list
    /// if non-empty or extending the record file by one record otherwise,
    /// and append it to the tail of `page_type`'s list.
    pub fn allocate_page(&mut self, page_type: PageType) -> Result<RecordId> {
        self.ensure_writable()?;
        let id = if self.header.list_first[FREE_LIST_INDEX] != 0 {
            let free_id = self.header.list_first[FREE_LIST_INDEX];
            let guard = self.records.get(free_id)?;
            let next = guard.next_page()?;
            self.records.discard(guard)?;
            self.header.list_first[FREE_LIST_INDEX] = next;
            free_id
        } else {
            self.records.allocate_new_id()
        };

        let mut guard = self.records.get(id)?;
        guard.clear_data();
        guard.write_page_view(page_type.to_page_view())?;
        guard.set_prev_page(0)?;
        guard.set_next_page(0)?;
        self.records.release(guard, true)?;

        self.append_to_tail(page_type.list_index(), id)?;
        self.persist_header()?;
        Ok(id)
    }

    fn append_to_tail(&mut self, idx: usize, id: RecordId) -> Result<()> {
        let old_last = self.header.list_last[idx];
        if old_last == 0 {
            self.header.list_first[idx] = id;
            self.header.list_last[idx] = id;
            return Ok(());
        }
        let mut prev_guard = self.records.get(old_last)?;
        prev_guard.set_next_page(id)?;
        self.records.release(prev_guard, true)?;

        let mut this_guard = self.records.get(id)?;
        this_guard.set_prev_page(old_last)?;
        self.records.release(this_guard, true)?;

        self.header.list_last[idx] = id;
        Ok(())
    }

    /// Retype `id` to free and prepend it onto the free-page list,
    /// unlinking it from whatever typed list it currently belongs to.
    /// Forbids the header page and pages that are already free
    /// (`spec.md` §7: `FreePage`/`Header`).
    pub fn free_page(&mut self, id: RecordId) -> Result<()> {
        self.ensure_writable()?;
        if id == 0 {
            return Err(StorageError::Header);
        }
        let mut guard = self.records.get(id)?;
        let view = guard.parse_page_view()?;
        if view == PageView::Free {
            self.records.discard(guard)?;
            return Err(StorageError::FreePage(id));
        }
        let idx = list_index_of(view)?;
        let prev = guard.prev_page()?;
        let next = guard.next_page()?;

        let old_free_head = self.header.list_first[FREE_LIST_INDEX];
        guard.write_page_view(PageView::Free)?;
        guard.set_next_page(old_free_head)?;
        guard.set_prev_page(0)?;
        self.records.release(guard, true)?;
        self.header.list_first[FREE_LIST_INDEX] = id;

        if prev != 0 {
            let mut p = self.records.get(prev)?;
            p.set_next_page(next)?;
            self.records.release(p, true)?;
        } else {
            self.header.list_first[idx] = next;
        }
        if next != 0 {
            let mut n = self.records.get(next)?;
            n.set_prev_page(prev)?;
            self.records.release(n, true)?;
        } else {
            self.header.list_last[idx] = prev;
        }

        self.persist_header()
    }

    pub fn first(&self, page_type: PageType) -> RecordId {
        self.header.list_first[page_type.list_index()]
    }

    pub fn last(&self, page_type: PageType) -> RecordId {
        self.header.list_last[page_type.list_index()]
    }

    /// Follow `id`'s `nextPage` pointer. Returns 0 at the end of the list.
    pub fn next(&mut self, id: RecordId) -> Result<RecordId> {
        let guard = self.records.get(id)?;
        let n = guard.next_page()?;
        self.records.discard(guard)?;
        Ok(n)
    }

    /// Follow `id`'s `prevPage` pointer. Returns 0 at the start of the list.
    pub fn prev(&mut self, id: RecordId) -> Result<RecordId> {
        let guard = self.records.get(id)?;
        let p = guard.prev_page()?;
        self.records.discard(guard)?;
        Ok(p)
    }

    /// Check out page `id` for reading/writing its payload. The caller is
    /// responsible for releasing it through [`Pager::release`].
    pub fn get(&mut self, id: RecordId) -> Result<crate::record::RecordGuard> {
        self.records.get(id)
    }

    pub fn release(&mut self, guard: crate::record::RecordGuard, dirty: bool) -> Result<()> {
        if dirty {
            self.ensure_writable()?;
        }
        self.records.release(guard, dirty)
    }

    /// Release a checked-out page without persisting any change to it.
    pub fn discard(&mut self, guard: crate::record::RecordGuard) -> Result<()> {
        self.records.discard(guard)
    }

    pub fn record_size(&self) -> usize {
        self.records.record_size()
    }

    pub fn root(&self, index: usize) -> Result<u64> {
        self.header.roots.get(index).copied().ok_or_else(|| {
            StorageError::Internal(format!("root index {index} out of range"))
        })
    }

    pub fn num_roots(&self) -> usize {
        self.header.roots.len()
    }

    pub fn set_root(&mut self, index: usize, value: u64) -> Result<()> {
        self.ensure_writable()?;
        if index >= self.header.roots.len() {
            return Err(StorageError::Internal(format!(
                "root index {index} out of range"
            )));
        }
        self.header.roots[index] = value;
        self.persist_header()
    }

    /// Flush the underlying record file (committing and syncing any
    /// pending transaction, then fsyncing the data segments).
    pub fn flush(&mut self) -> Result<()> {
        self.records.flush()
    }

    /// Roll back the underlying record file to its last durable state and
    /// re-read the header, which may have changed as a result.
    pub fn rollback(&mut self) -> Result<()> {
        self.records.rollback()?;
        self.reload_header()?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.records.close()
    }
}

/// A stateful cursor over one of the pager's typed linked lists, starting
/// "before" the first page and advancing on each call to [`PageCursor::advance`].
///
/// Mirrors `spec.md` §4.4: after iteration has begun, `prev` stops at the
/// first page rather than returning 0.
pub struct PageCursor {
    page_type: PageType,
    current: RecordId,
    started: bool,
}

impl PageCursor {
    pub fn new(page_type: PageType) -> PageCursor {
        PageCursor {
            page_type,
            current: 0,
            started: false,
        }
    }

    pub fn current(&self) -> RecordId {
        self.current
    }

    /// Advance to the next page (the first page of the list if iteration
    /// has not yet started). Returns `None` once the list is exhausted.
    pub fn advance(&mut self, pager: &mut Pager) -> Result<Option<RecordId>> {
        self.current = if !self.started {
            self.started = true;
            pager.first(self.page_type)
        } else {
            pager.next(self.current)?
        };
        Ok(if self.current == 0 {
            None
        } else {
            Some(self.current)
        })
    }

    /// Step back. Once iteration has started, stops at the first page of
    /// the list instead of returning to "before the start".
    pub fn prev(&mut self, pager: &mut Pager) -> Result<Option<RecordId>> {
        if !self.started || self.current == 0 {
            return Ok(None);
        }
        let p = pager.prev(self.current)?;
        if p != 0 {
            self.current = p;
        }
        Ok(Some(self.current))
    }
}
