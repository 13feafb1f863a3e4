//! Location packing: `(record_id, offset)` <-> a single 64-bit integer.
//!
//! Every slot in the engine — physical, logical, free-list entry — is
//! addressed by a *location*: a record id and a byte offset within that
//! record, packed into 64 bits as `(record_id << 16) | offset`. This gives a
//! 48-bit record-id space and a 16-bit in-record byte offset. Zero is
//! reserved to mean "empty / never allocated" and `0xFFFF_FFFF_FFFF_FFFF`
//! is reserved as well (callers must never produce it from `pack`).

use crate::error::{Result, StorageError};

/// A packed `(record_id, offset)` location. Zero means "empty".
pub type Location = u64;

/// The reserved "empty" location.
pub const NULL_LOCATION: Location = 0;

const OFFSET_BITS: u32 = 16;
const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;
const MAX_RECORD_ID: u64 = (1u64 << (64 - OFFSET_BITS)) - 1;

/// Pack a record id and an in-record byte offset into a single [`Location`].
///
/// `offset` must fit in 16 bits; `record_id` must fit in the remaining 48
/// bits. Out-of-range inputs are a programmer error.
pub fn pack(record_id: u64, offset: u16) -> Location {
    debug_assert!(
        record_id <= MAX_RECORD_ID,
        "record_id {record_id} exceeds the 48-bit location space"
    );
    (record_id << OFFSET_BITS) | (offset as u64)
}

/// Inverse of [`pack`].
pub fn unpack(loc: Location) -> (u64, u16) {
    let record_id = loc >> OFFSET_BITS;
    let offset = (loc & OFFSET_MASK) as u16;
    (record_id, offset)
}

/// Fallible variant of [`pack`] for callers that receive `record_id` from
/// untrusted or computed input rather than a compile-time-bounded counter.
pub fn try_pack(record_id: u64, offset: u16) -> Result<Location> {
    if record_id > MAX_RECORD_ID {
        return Err(StorageError::Encoding(format!(
            "record id {record_id} does not fit in a 48-bit location"
        )));
    }
    Ok(pack(record_id, offset))
}

/// True if `loc` is the reserved "empty" location.
pub fn is_null(loc: Location) -> bool {
    loc == NULL_LOCATION
}
