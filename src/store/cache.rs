//! Direct-mapped data cache with lockable cells, indexed by `data_id mod cache_size`.
//!
//! Eviction is write-through-on-miss: installing a new occupant simply overwrites an
//! unlocked one. A locked occupant cannot be evicted — callers check [`DataCache::blocked`]
//! before calling [`DataCache::install`] and park on the store's condvar in between, the way
//! `store/mod.rs`'s `dequeue`/`retrieve` do.

use std::sync::Arc;

#[derive(Clone)]
enum Slot {
    Empty,
    Resident {
        data_id: u64,
        locked: bool,
        mem: Arc<[u8]>,
    },
}

pub(crate) struct DataCache {
    slots: Vec<Slot>,
}

impl DataCache {
    pub fn new(cache_size: usize) -> Self {
        DataCache {
            slots: vec![Slot::Empty; cache_size.max(1)],
        }
    }

    fn index(&self, data_id: u64) -> usize {
        (data_id % self.slots.len() as u64) as usize
    }

    /// Returns a clone of the cached bytes for `data_id` if resident, locking the slot
    /// (a no-op if it was already locked — a lock is not exclusive against further hits,
    /// only against eviction).
    pub fn hit(&mut self, data_id: u64) -> Option<Arc<[u8]>> {
        let idx = self.index(data_id);
        match &mut self.slots[idx] {
            Slot::Resident {
                data_id: d,
                locked,
                mem,
            } if *d == data_id => {
                *locked = true;
                Some(mem.clone())
            }
            _ => None,
        }
    }

    /// True if `data_id`'s slot is occupied by a different, still-locked resident — the
    /// caller must wait (on the store's condvar) before [`DataCache::install`] can proceed.
    pub fn blocked(&self, data_id: u64) -> bool {
        let idx = self.index(data_id);
        matches!(
            &self.slots[idx],
            Slot::Resident { data_id: d, locked: true, .. } if *d != data_id
        )
    }

    /// Installs `mem` under `data_id`, locked, evicting any unlocked occupant. Callers
    /// must have already waited out a `blocked` slot; installing over one is a bug.
    pub fn install(&mut self, data_id: u64, mem: Arc<[u8]>) {
        debug_assert!(!self.blocked(data_id), "installing over a locked cache slot");
        let idx = self.index(data_id);
        self.slots[idx] = Slot::Resident {
            data_id,
            locked: true,
            mem,
        };
    }

    /// Unlocks `data_id`'s slot. Returns `false` if that slot does not currently hold
    /// `data_id` at all (already evicted, or never installed) — the caller's `release`
    /// should surface this as `FailedStore`.
    pub fn unlock(&mut self, data_id: u64) -> bool {
        let idx = self.index(data_id);
        match &mut self.slots[idx] {
            Slot::Resident {
                data_id: d, locked, ..
            } if *d == data_id => {
                *locked = false;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_install_then_hit() {
        let mut cache = DataCache::new(4);
        assert!(cache.hit(1).is_none());
        cache.install(1, Arc::from(b"hello".to_vec().into_boxed_slice()));
        assert_eq!(cache.hit(1).as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn locked_slot_blocks_eviction_until_unlocked() {
        let mut cache = DataCache::new(1);
        cache.install(0, Arc::from(b"a".to_vec().into_boxed_slice()));
        // data_id 1 maps to the same slot (cache_size 1): blocked while 0 is locked.
        assert!(cache.blocked(1));
        assert!(cache.unlock(0));
        assert!(!cache.blocked(1));
        cache.install(1, Arc::from(b"b".to_vec().into_boxed_slice()));
        assert!(cache.hit(0).is_none());
    }

    #[test]
    fn unlock_of_absent_data_id_fails() {
        let mut cache = DataCache::new(4);
        assert!(!cache.unlock(7));
    }
}
