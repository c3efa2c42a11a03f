//! Reference management: light references (a bare refcount bump/decrement) and heavy
//! "block" references (an allocated [`crate::block::RefBlock`] proxy carrying a discard
//! callback, spliced onto whatever list the holder wants the reference to live on).
//!
//! Both kinds manipulate the same refcount living on the target block; the difference is
//! only in whether the reference itself occupies a list slot. A light reference is just a
//! `BlockId` the caller already holds elsewhere (a struct field, a local variable); a heavy
//! reference is a block in its own right, so it can be queued, iterated, and recycled like
//! any other member of a list.

use std::any::Any;

use crate::block::{BlockId, DiscardCallback, Magic};
use crate::error::{Error, Result};
use crate::pool::Pool;

impl Pool {
    /// Allocates a fresh refcounted service-object block and returns one light
    /// reference to it (refcount starts at 1).
    pub fn make_dynamic_object(&mut self, magic: Magic, payload: Box<dyn Any>) -> Result<BlockId> {
        let id = self.alloc_generic_block(magic, payload)?;
        if let Some(rc) = self.nodes[id.index()].kind.refcount_mut() {
            *rc = 1;
        }
        Ok(id)
    }

    /// Bumps `target`'s refcount and returns `target` itself — the Rust equivalent of
    /// handing out a second copy of a pointer the caller must eventually release.
    pub fn duplicate_light_reference(&mut self, target: BlockId) -> Result<BlockId> {
        match self.nodes[target.index()].kind.refcount_mut() {
            Some(rc) => {
                *rc = rc
                    .checked_add(1)
                    .ok_or_else(|| Error::failed_os("refcount overflow"))?;
                Ok(target)
            }
            None => Err(Error::InvalidHandle),
        }
    }

    /// Releases one light reference to `target`. If this was the last reference, the
    /// block is moved to the recycled list (reclaimed on the next [`Pool::maintain`]).
    pub fn release_light_reference(&mut self, target: BlockId) {
        self.release_ref(target);
    }

    /// Allocates a heavy (block) reference to `target`: bumps `target`'s refcount and
    /// returns the id of a new `Ref` block the caller can splice onto any list. When the
    /// ref block is eventually recycled, `discard` (if given) fires once, then `target`'s
    /// refcount is released — the two-step sequence the original calls "notify, then
    /// drop", so a flow-control callback can still inspect the target's last-known state.
    pub fn make_block_ref(
        &mut self,
        target: BlockId,
        discard: Option<DiscardCallback>,
    ) -> Result<BlockId> {
        self.duplicate_light_reference(target)?;
        match self.alloc_ref(target, discard) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.release_light_reference(target);
                Err(e)
            }
        }
    }

    /// Allocates a second heavy reference to the same target as an existing `Ref` block
    /// `existing`, with its own (possibly different) discard callback.
    pub fn duplicate_block_reference(
        &mut self,
        existing: BlockId,
        discard: Option<DiscardCallback>,
    ) -> Result<BlockId> {
        let target = match &self.nodes[existing.index()].kind {
            crate::block::BlockKind::Ref(r) => r.target,
            _ => return Err(Error::InvalidHandle),
        };
        self.make_block_ref(target, discard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn light_reference_defers_recycle_until_last_release() {
        let mut pool = Pool::new(4);
        let id = pool.make_dynamic_object(1, Box::new(7i32)).unwrap();
        let dup = pool.duplicate_light_reference(id).unwrap();
        assert_eq!(dup, id);

        pool.release_light_reference(id);
        pool.maintain();
        assert!(pool.cast_generic_data(id, 1).is_some());

        pool.release_light_reference(id);
        pool.maintain();
        assert!(pool.cast_generic_data(id, 1).is_none());
    }

    #[test]
    fn block_ref_discard_fires_before_target_is_released() {
        let mut pool = Pool::new(4);
        let target = pool.make_dynamic_object(1, Box::new(1u8)).unwrap();

        let fired = Rc::new(RefCell::new(false));
        let fired_inner = fired.clone();
        let discard: DiscardCallback = Box::new(move |_event, _target| {
            *fired_inner.borrow_mut() = true;
        });

        let r = pool.make_block_ref(target, Some(discard)).unwrap();
        assert!(pool.cast_generic_data(target, 1).is_some());

        pool.recycle_block(r);
        assert!(!*fired.borrow(), "discard must not fire before maintain");

        pool.maintain();
        assert!(*fired.borrow());
        assert!(pool.cast_generic_data(target, 1).is_none());
    }

    #[test]
    fn duplicate_block_reference_shares_target() {
        let mut pool = Pool::new(4);
        let target = pool.make_dynamic_object(1, Box::new(1u8)).unwrap();
        let r1 = pool.make_block_ref(target, None).unwrap();
        let r2 = pool.duplicate_block_reference(r1, None).unwrap();

        pool.recycle_block(r1);
        pool.maintain();
        assert!(pool.cast_generic_data(target, 1).is_some());

        pool.recycle_block(r2);
        pool.maintain();
        assert!(pool.cast_generic_data(target, 1).is_none());
    }
}
