//! Variable-length byte slots spanning one or more data pages, and the
//! free-list manager that recycles them.
//!
//! Grounded on the teacher's `BufferPool`/`Pager` pairing (`src/buffer/mod.rs`,
//! `src/pager/mod.rs`): one manager (here [`PhysicalSlotManager`]) owns the
//! policy, a lower layer ([`crate::pager::Pager`]) owns page I/O, and a
//! sibling manager ([`FreePhysicalSlotManager`]) recycles reclaimed space —
//! mirroring how the teacher's B-tree leans on `Pager::free_page` for its
//! own node recycling rather than reimplementing free-space tracking.

use crate::error::{Result, StorageError};
use crate::loc::{self, Location};
use crate::pager::{PageType, Pager};
use crate::record::{PageView, RecordId, PAGE_HEADER_LEN};
use crate::slotsize;

/// First-fit search stops immediately at a candidate within this many bytes
/// of the requested size rather than continuing to look for a tighter fit.
const OPTIMAL_WASTE_MARGIN: u32 = 128;

/// If rounding a fresh allocation up to consume a page's entire remaining
/// tail would waste no more than this many bytes (plus one slot header),
/// round up rather than leaving an unusably small sliver behind.
///
/// `spec.md` §4.6 names this threshold (`AllocationRoundUpThreshold`) but
/// does not give it a value; 16 bytes is chosen to be comfortably smaller
/// than any slot header plus a minimal payload, so "dust" below it really
/// is unusable. Recorded as an Open Question resolution in `DESIGN.md`.
const ALLOCATION_ROUND_UP_THRESHOLD: u32 = 16;

/// Bytes occupied by a physical slot's header: `currentSizeDelta` (u16) +
/// `encodedCapacity` (u16).
const SLOT_HEADER_LEN: usize = 4;

/// 12-byte on-disk entry: 8-byte location + 4-byte raw capacity.
const FREE_ENTRY_LEN: usize = 12;

/// Pages of reclaimed `(location, capacity)` pairs, consulted before a
/// [`PhysicalSlotManager`] allocates fresh space.
///
/// Grounded on `spec.md` §4.7. Freed entries are buffered in `pending`
/// until [`FreePhysicalSlotManager::flush`] (matching
/// [`crate::storage::StorageManager::flush`]'s "flush free-slot managers,
/// then pagers" ordering), but [`FreePhysicalSlotManager::get`] also
/// checks `pending` first so a slot freed and re-requested within the same
/// uncommitted batch of work is still reusable.
pub struct FreePhysicalSlotManager {
    pager: Pager,
    pending: Vec<(Location, u32)>,
    /// Non-durable hint: the largest capacity seen during the last scan
    /// that failed to find a match. Reset on every [`Self::add`] and on
    /// any error path through [`Self::get`] (`spec.md` §9).
    last_max_slot_size: Option<u32>,
    /// When set, [`Self::get`] always reports no match (used for
    /// write-only migration where reuse is not wanted).
    only_append: bool,
}

impl FreePhysicalSlotManager {
    pub fn open(pager: Pager) -> FreePhysicalSlotManager {
        FreePhysicalSlotManager {
            pager,
            pending: Vec::new(),
            last_max_slot_size: None,
            only_append: false,
        }
    }

    pub fn set_only_append(&mut self, only_append: bool) {
        self.only_append = only_append;
    }

    fn elements_per_page(&self) -> usize {
        (self.pager.record_size() - PAGE_HEADER_LEN) / FREE_ENTRY_LEN
    }

    /// Buffer a freed `(location, capacity)` pair for the next
    /// [`Self::flush`], and invalidate the `lastMaxSlotSize` hint.
    pub fn add(&mut self, location: Location, capacity: u32) {
        self.pending.push((location, capacity));
        self.last_max_slot_size = None;
    }

    /// Best-fit search for a free slot with `capacity >= requested` and
    /// `capacity - requested <= max_acceptable_waste`. Returns immediately
    /// on a candidate within [`OPTIMAL_WASTE_MARGIN`] of `requested`;
    /// otherwise returns the smallest-waste acceptable candidate found.
    pub fn get(&mut self, requested: u32, max_acceptable_waste: u32) -> Result<Option<(Location, u32)>> {
        if self.only_append {
            return Ok(None);
        }
        if let Some(max_seen) = self.last_max_slot_size {
            if requested > max_seen {
                return Ok(None);
            }
        }
        if let Some(idx) = self
            .pending
            .iter()
            .position(|&(_, cap)| cap >= requested && cap - requested <= max_acceptable_waste)
        {
            let (loc, cap) = self.pending.remove(idx);
            return Ok(Some((loc, cap)));
        }

        let epp = self.elements_per_page();
        let mut page_id = self.pager.first(PageType::FreePhysicalSlot);
        let mut best: Option<(RecordId, usize, Location, u32, u32)> = None;
        let mut max_seen = 0u32;

        while page_id != 0 {
            let guard = self.pager.get(page_id)?;
            let next_page = guard.next_page()?;
            let mut immediate: Option<(usize, Location, u32)> = None;
            for i in 0..epp {
                let off = PAGE_HEADER_LEN + i * FREE_ENTRY_LEN;
                let loc = guard.read_u64(off)?;
                if loc == 0 {
                    continue;
                }
                let cap = guard.read_u32(off + 8)?;
                if cap > max_seen {
                    max_seen = cap;
                }
                if cap >= requested {
                    let waste = cap - requested;
                    if waste < OPTIMAL_WASTE_MARGIN {
                        immediate = Some((i, loc, cap));
                        break;
                    } else if waste <= max_acceptable_waste
                        && best.as_ref().map_or(true, |b| waste < b.4)
                    {
                        best = Some((page_id, i, loc, cap, waste));
                    }
                }
            }
            self.pager.discard(guard)?;
            if let Some((slot, loc, cap)) = immediate {
                self.remove_entry(page_id, slot)?;
                return Ok(Some((loc, cap)));
            }
            page_id = next_page;
        }

        if let Some((page_id, slot, loc, cap, _)) = best {
            self.remove_entry(page_id, slot)?;
            return Ok(Some((loc, cap)));
        }

        if max_seen > 0 {
            self.last_max_slot_size = Some(max_seen);
        }
        Ok(None)
    }

    /// Zero a consumed entry; if the page holding it is now entirely
    /// empty, free it back to the pager (`spec.md` §4.7).
    fn remove_entry(&mut self, page_id: RecordId, slot: usize) -> Result<()> {
        let epp = self.elements_per_page();
        let mut guard = self.pager.get(page_id)?;
        let off = PAGE_HEADER_LEN + slot * FREE_ENTRY_LEN;
        guard.write_u64(off, 0)?;
        guard.write_u32(off + 8, 0)?;
        let mut remaining = false;
        for i in 0..epp {
            if guard.read_u64(PAGE_HEADER_LEN + i * FREE_ENTRY_LEN)? != 0 {
                remaining = true;
                break;
            }
        }
        self.pager.release(guard, true)?;
        if !remaining {
            self.pager.free_page(page_id)?;
        }
        Ok(())
    }

    /// Write every pending entry into an existing page with room, or a
    /// freshly allocated one, then flush the underlying pager.
    pub fn flush(&mut self) -> Result<()> {
        while let Some((loc, cap)) = self.pending.pop() {
            self.append_one(loc, cap)?;
        }
        self.pager.flush()
    }

    fn append_one(&mut self, location: Location, capacity: u32) -> Result<()> {
        let epp = self.elements_per_page();
        let mut page_id = self.pager.first(PageType::FreePhysicalSlot);
        while page_id != 0 {
            let mut guard = self.pager.get(page_id)?;
            let mut empty_off = None;
            for i in 0..epp {
                let off = PAGE_HEADER_LEN + i * FREE_ENTRY_LEN;
                if guard.read_u64(off)? == 0 {
                    empty_off = Some(off);
                    break;
                }
            }
            if let Some(off) = empty_off {
                guard.write_u64(off, location)?;
                guard.write_u32(off + 8, capacity)?;
                self.pager.release(guard, true)?;
                return Ok(());
            }
            let next = guard.next_page()?;
            self.pager.discard(guard)?;
            page_id = next;
        }

        let new_page = self.pager.allocate_page(PageType::FreePhysicalSlot)?;
        let result = (|| -> Result<()> {
            let mut guard = self.pager.get(new_page)?;
            guard.write_u64(PAGE_HEADER_LEN, location)?;
            guard.write_u32(PAGE_HEADER_LEN + 8, capacity)?;
            self.pager.release(guard, true)
        })();
        if result.is_err() {
            let _ = self.pager.free_page(new_page);
        }
        result
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.last_max_slot_size = None;
        self.pager.rollback()
    }

    pub fn close(self) -> Result<()> {
        self.pager.close()
    }
}

/// Variable-length byte slots allocated across a pager's data pages, with
/// a packed 4-byte `(currentSize, capacity)` header per slot and reuse via
/// a [`FreePhysicalSlotManager`].
///
/// Grounded on `spec.md` §4.6.
pub struct PhysicalSlotManager {
    pager: Pager,
    free: FreePhysicalSlotManager,
}

impl PhysicalSlotManager {
    pub fn open(pager: Pager, free: FreePhysicalSlotManager) -> PhysicalSlotManager {
        PhysicalSlotManager { pager, free }
    }

    /// The pager over the physical-slot file, whose record 0 also carries
    /// the [`crate::storage::StorageManager`]'s public roots.
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    fn max_acceptable_waste(&self) -> u32 {
        self.pager.record_size() as u32 / 4
    }

    fn payload_capacity_per_cont_page(&self) -> u32 {
        (self.pager.record_size() - PAGE_HEADER_LEN) as u32
    }

    /// Allocate a slot sized to fit `payload` (reusing a free slot when a
    /// close-enough one exists) and write `payload` into it.
    pub fn insert(&mut self, payload: &[u8]) -> Result<Location> {
        let normalized = slotsize::normalize(payload.len() as u32)?;
        let (location, _capacity) = match self.free.get(normalized, self.max_acceptable_waste())? {
            Some(found) => found,
            None => self.allocate_new(normalized)?,
        };
        self.write(location, payload)?;
        Ok(location)
    }

    /// Rewrite `payload` in place if it still fits within the slot's
    /// capacity closely enough; otherwise free the old slot and insert
    /// fresh, returning the (possibly new) location.
    pub fn update(&mut self, location: Location, payload: &[u8]) -> Result<Location> {
        let (capacity, _current) = self.read_header(location)?;
        let requested = payload.len() as u32;
        if requested <= capacity && capacity - requested <= slotsize::MAX_SIZE_DELTA {
            self.write(location, payload)?;
            return Ok(location);
        }
        self.free(location)?;
        self.insert(payload)
    }

    /// Tombstone the slot's current size and return its capacity to the
    /// free-physical manager.
    pub fn free(&mut self, location: Location) -> Result<()> {
        let (capacity, _current) = self.read_header(location)?;
        let (page_id, offset) = loc::unpack(location);
        let mut guard = self.pager.get(page_id)?;
        let delta = slotsize::encode_size_delta(capacity, 0)?;
        guard.write_u16(offset as usize, delta)?;
        self.pager.release(guard, true)?;
        self.free.add(location, capacity);
        Ok(())
    }

    /// Read a slot's current contents into `out`, replacing its prior
    /// contents.
    pub fn fetch(&mut self, location: Location, out: &mut Vec<u8>) -> Result<()> {
        let (_capacity, current_size) = self.read_header(location)?;
        out.clear();
        out.reserve(current_size as usize);

        let (mut page_id, offset) = loc::unpack(location);
        let mut remaining = current_size;
        let mut pos_in_page = offset as usize + SLOT_HEADER_LEN;
        while remaining > 0 {
            let guard = self.pager.get(page_id)?;
            let avail = guard.len() - pos_in_page;
            let take = avail.min(remaining as usize);
            out.extend_from_slice(&guard.raw()[pos_in_page..pos_in_page + take]);
            let next = guard.next_page()?;
            self.pager.discard(guard)?;
            remaining -= take as u32;
            page_id = next;
            pos_in_page = PAGE_HEADER_LEN;
        }
        Ok(())
    }

    fn read_header(&mut self, location: Location) -> Result<(u32, u32)> {
        let (page_id, offset) = loc::unpack(location);
        let guard = self.pager.get(page_id)?;
        let delta = guard.read_u16(offset as usize)?;
        let encoded_capacity = guard.read_u16(offset as usize + 2)?;
        self.pager.discard(guard)?;
        let capacity = slotsize::decode(encoded_capacity);
        let current = slotsize::decode_size_delta(capacity, delta);
        Ok((capacity, current))
    }

    fn write(&mut self, location: Location, payload: &[u8]) -> Result<()> {
        let (capacity, _) = self.read_header(location)?;
        let current_size = payload.len() as u32;
        if current_size > capacity {
            return Err(StorageError::Internal(format!(
                "payload of {current_size} bytes exceeds slot capacity {capacity}"
            )));
        }
        let (page_id, offset) = loc::unpack(location);
        let delta = slotsize::encode_size_delta(capacity, current_size)?;
        let mut guard = self.pager.get(page_id)?;
        guard.write_u16(offset as usize, delta)?;
        self.pager.release(guard, true)?;

        let mut remaining = payload;
        let mut cur_page = page_id;
        let mut pos_in_page = offset as usize + SLOT_HEADER_LEN;
        while !remaining.is_empty() {
            let mut guard = self.pager.get(cur_page)?;
            let avail = guard.len() - pos_in_page;
            let take = avail.min(remaining.len());
            guard.raw_mut()[pos_in_page..pos_in_page + take].copy_from_slice(&remaining[..take]);
            let next = guard.next_page()?;
            self.pager.release(guard, true)?;
            remaining = &remaining[take..];
            cur_page = next;
            pos_in_page = PAGE_HEADER_LEN;
        }
        Ok(())
    }

    /// Allocate a fresh slot of `normalized` bytes, walking from the last
    /// data page's free tail and spanning continuation pages if needed
    /// (`spec.md` §4.6).
    fn allocate_new(&mut self, normalized: u32) -> Result<(Location, u32)> {
        let last_page = match self.pager.last(PageType::Data) {
            0 => self.allocate_fresh_data_page()?,
            id => id,
        };

        let mut guard = self.pager.get(last_page)?;
        let view = guard.parse_page_view()?;
        let record_size = guard.len();
        self.pager.discard(guard)?;
        let offset_first = match view {
            PageView::Data { offset_first } => offset_first,
            _ => {
                return Err(StorageError::CorruptDatabase(
                    "last data-list page is not a data page".into(),
                ))
            }
        };

        let available = record_size as u32 - offset_first as u32;
        if available >= SLOT_HEADER_LEN as u32 + normalized {
            let leftover = available - SLOT_HEADER_LEN as u32 - normalized;
            let capacity = if leftover <= ALLOCATION_ROUND_UP_THRESHOLD + SLOT_HEADER_LEN as u32 {
                normalized + leftover
            } else {
                normalized
            };
            let new_offset_first = offset_first as u32 + SLOT_HEADER_LEN as u32 + capacity;

            let mut guard = self.pager.get(last_page)?;
            let delta = slotsize::encode_size_delta(capacity, 0)?;
            let encoded_capacity = slotsize::encode(capacity)?;
            guard.write_u16(offset_first as usize, delta)?;
            guard.write_u16(offset_first as usize + 2, encoded_capacity)?;
            guard.write_page_view(PageView::Data {
                offset_first: new_offset_first as u16,
            })?;
            self.pager.release(guard, true)?;

            return Ok((loc::pack(last_page, offset_first), capacity));
        }

        // Case (b): the slot starts here but its payload spans one or
        // more continuation pages.
        let rspace = available.saturating_sub(SLOT_HEADER_LEN as u32);
        let mut guard = self.pager.get(last_page)?;
        let delta = slotsize::encode_size_delta(normalized, 0)?;
        let encoded_capacity = slotsize::encode(normalized)?;
        guard.write_u16(offset_first as usize, delta)?;
        guard.write_u16(offset_first as usize + 2, encoded_capacity)?;
        guard.write_page_view(PageView::Data {
            offset_first: record_size as u16,
        })?;
        self.pager.release(guard, true)?;

        let location = loc::pack(last_page, offset_first);
        let mut remaining = normalized - rspace;
        let per_page = self.payload_capacity_per_cont_page();
        while remaining > per_page {
            self.allocate_continuation_page()?;
            remaining -= per_page;
        }
        let tail_page = self.allocate_continuation_page()?;
        let mut tail_guard = self.pager.get(tail_page)?;
        tail_guard.write_page_view(PageView::Data {
            offset_first: (PAGE_HEADER_LEN as u32 + remaining) as u16,
        })?;
        self.pager.release(tail_guard, true)?;

        Ok((location, normalized))
    }

    fn allocate_fresh_data_page(&mut self) -> Result<RecordId> {
        let page_id = self.pager.allocate_page(PageType::Data)?;
        let mut guard = self.pager.get(page_id)?;
        guard.write_page_view(PageView::Data {
            offset_first: PAGE_HEADER_LEN as u16,
        })?;
        self.pager.release(guard, true)?;
        Ok(page_id)
    }

    /// A continuation page advertises `offsetFirst = 0` — "no slot starts
    /// here" — which is exactly [`PageType::Data`]'s default view, so no
    /// extra write is needed beyond the allocation itself.
    fn allocate_continuation_page(&mut self) -> Result<RecordId> {
        self.pager.allocate_page(PageType::Data)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.free.flush()?;
        self.pager.flush()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.free.rollback()?;
        self.pager.rollback()
    }

    pub fn close(self) -> Result<()> {
        self.free.close()?;
        self.pager.close()
    }
}
