//! On-disk layout for the persistent store's bucket files, little-endian, no padding.
//!
//! A bucket is a pair of files: `<svc>_<fid>.dat` holds up to [`FILE_DATA_COUNT`] records
//! back to back (`size:u32 | ObjectHeader | payload`), and `<svc>_<fid>.tbl` holds the
//! relinquish bitmap for that bucket, written only when a bucket is crossed with at least
//! one freed slot.

use std::path::{Path, PathBuf};

use endian_trait::Endian;

use crate::block::StorageId;

/// Records per bucket. Fixed at compile time because `file_id`/`slot` are derived from it
/// via `>> 8` / `& 0xFF`; changing it requires recompiling (per `SPEC_FULL.md` §6).
pub const FILE_DATA_COUNT: usize = 256;

/// On-disk record header. `size` is redundant with the outer `size:u32` word for sanity
/// checking; `sid` is written as `vacant` and only ever stamped into the in-memory copy
/// handed back by `dequeue`/`retrieve`, since a `sid` is fully recoverable from the
/// record's position and never needs to be read back off disk.
#[derive(Endian, Clone, Copy, Debug)]
#[repr(C, packed)]
pub(crate) struct ObjectHeader {
    pub handle: i32,
    pub sid: u64,
    pub size: u32,
}

/// Per-bucket freed-slot bitmap, one byte per slot rather than a packed bitset so the
/// `Endian` derive's `arrays` feature can round-trip it directly.
#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct RelinquishTable {
    pub freed: [u8; FILE_DATA_COUNT],
    pub free_cnt: i32,
}

impl Default for RelinquishTable {
    fn default() -> Self {
        RelinquishTable {
            freed: [0; FILE_DATA_COUNT],
            free_cnt: 0,
        }
    }
}

/// Splits a 0-based `data_id` into its owning bucket and the slot within that bucket.
pub(crate) fn split_data_id(data_id: u64) -> (u64, usize) {
    (data_id >> 8, (data_id & 0xFF) as usize)
}

/// Recovers the 0-based `data_id` a caller-visible [`StorageId`] addresses, or `None` for
/// the reserved `vacant` sentinel (`sid == 0`).
pub(crate) fn data_id_of(sid: StorageId) -> Option<u64> {
    if sid == StorageId::VACANT {
        None
    } else {
        Some(sid.0 - 1)
    }
}

pub(crate) fn sid_of(data_id: u64) -> StorageId {
    StorageId(data_id + 1)
}

pub(crate) fn dat_path(root: &Path, service_id: u32, file_id: u64) -> PathBuf {
    root.join(format!("{service_id}_{file_id}.dat"))
}

pub(crate) fn tbl_path(root: &Path, service_id: u32, file_id: u64) -> PathBuf {
    root.join(format!("{service_id}_{file_id}.tbl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_matches_bucket_arithmetic() {
        assert_eq!(split_data_id(0), (0, 0));
        assert_eq!(split_data_id(255), (0, 255));
        assert_eq!(split_data_id(256), (1, 0));
        assert_eq!(split_data_id(257), (1, 1));
    }

    #[test]
    fn sid_round_trips_through_data_id() {
        for data_id in [0u64, 1, 255, 256, 1_000_000] {
            let sid = sid_of(data_id);
            assert_eq!(data_id_of(sid), Some(data_id));
        }
    }

    #[test]
    fn vacant_sid_has_no_data_id() {
        assert_eq!(data_id_of(StorageId::VACANT), None);
    }
}
