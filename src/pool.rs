//! The block arena: a fixed-size record allocator carved from one contiguous buffer,
//! plus the tag/cast accessors that make the arena's tagged union usable from safe
//! code.
//!
//! A [`Pool`] is created once with a fixed capacity and never grows — there is no
//! dynamic heap behind it (per `SPEC_FULL.md` Non-goals). Allocation pops a record
//! off the free list; recycling pushes a record onto a *recycled* list instead of
//! freeing it immediately, so that any discard callback fired on recycle can still
//! briefly observe the block's old contents without racing a reallocation. [`Pool::maintain`]
//! is the periodic pass that drains the recycled list back to `free`.

use std::any::Any;
use std::collections::HashMap;

use crate::block::{
    BlockId, BlockKind, CanonicalBlock, CanonicalLogical, CborDataBlock, DeliveryData,
    DtnTime, EventId, FlowBlock, InterfaceId, Magic, Node, PrimaryBlock, PrimaryLogical,
    RefBlock, SecondaryLinkBlock, ServiceObjectBlock, SubQueue, MAX_ENCODED_CHUNK_SIZE,
};
use crate::error::{Error, Result};
use crate::list;

#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub allocated: usize,
    pub recycle_pending: usize,
    pub reclaimed_total: u64,
}

/// A fixed-capacity arena of blocks, the free/recycled/active-flow lists that order
/// them, and the tag-indexed side table that backs [`Pool::get_generic_block_from_pointer`].
pub struct Pool {
    pub(crate) nodes: Vec<Node>,
    free_head: BlockId,
    recycled_head: BlockId,
    active_flows_head: BlockId,
    stats: PoolStats,
    service_object_index: HashMap<usize, BlockId>,
}

impl Pool {
    const RESERVED_HEADS: usize = 3;

    /// Creates a pool whose arena can hold `capacity` user records (primary,
    /// canonical, flow, and cbor_data blocks together, not counting the few extra
    /// records each structured block spends on its own embedded list heads).
    pub fn new(capacity: usize) -> Self {
        let total = capacity + Self::RESERVED_HEADS;
        let mut nodes = Vec::with_capacity(total);

        let free_head = BlockId::from_index(0);
        let recycled_head = BlockId::from_index(1);
        let active_flows_head = BlockId::from_index(2);
        nodes.push(Node::new_self_linked(free_head, BlockKind::Head));
        nodes.push(Node::new_self_linked(recycled_head, BlockKind::Head));
        nodes.push(Node::new_self_linked(active_flows_head, BlockKind::Head));

        let mut pool = Pool {
            nodes,
            free_head,
            recycled_head,
            active_flows_head,
            stats: PoolStats::default(),
            service_object_index: HashMap::new(),
        };

        for i in 0..capacity {
            let id = BlockId::from_index(Self::RESERVED_HEADS + i);
            pool.nodes.push(Node::new_self_linked(id, BlockKind::Free));
            list::insert_before(&mut pool.nodes, pool.free_head, id);
        }

        pool
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len() - Self::RESERVED_HEADS
    }

    /// Payload area of one record — the effective capacity of a single `cbor_data`
    /// chunk. Oversize user content is chained across multiple chunks.
    pub const fn generic_data_capacity() -> usize {
        MAX_ENCODED_CHUNK_SIZE
    }

    fn pop_free(&mut self) -> Result<BlockId> {
        if list::is_empty(&self.nodes, self.free_head) {
            log::warn!("pool exhausted: free list empty at allocation time");
            return Err(Error::OutOfMemory);
        }
        let id = self.nodes[self.free_head.index()].link.next;
        list::extract(&mut self.nodes, id);
        self.stats.allocated += 1;
        Ok(id)
    }

    fn push_free(&mut self, id: BlockId) {
        self.nodes[id.index()].kind = BlockKind::Free;
        list::insert_before(&mut self.nodes, self.free_head, id);
        self.stats.allocated = self.stats.allocated.saturating_sub(1);
    }

    fn alloc_list_head(&mut self) -> Result<BlockId> {
        let id = self.pop_free()?;
        self.nodes[id.index()].kind = BlockKind::Head;
        list::init_head(&mut self.nodes, id);
        Ok(id)
    }

    // --- typed allocation -------------------------------------------------------

    pub fn alloc_cbor_data_block(&mut self) -> Result<BlockId> {
        let id = self.pop_free()?;
        self.nodes[id.index()].kind = BlockKind::CborData(CborDataBlock::empty());
        Ok(id)
    }

    pub fn alloc_generic_block(&mut self, magic: Magic, payload: Box<dyn Any>) -> Result<BlockId> {
        let id = self.pop_free()?;
        let addr = payload.as_ref() as *const dyn Any as *const u8 as usize;
        self.nodes[id.index()].kind = BlockKind::ServiceObject(ServiceObjectBlock {
            refcount: 0,
            magic,
            payload,
        });
        self.service_object_index.insert(addr, id);
        Ok(id)
    }

    pub fn alloc_primary_block(&mut self) -> Result<BlockId> {
        let canonical_list = self.alloc_list_head()?;
        let chunk_list = match self.alloc_list_head() {
            Ok(id) => id,
            Err(e) => {
                self.push_free(canonical_list);
                return Err(e);
            }
        };
        let id = match self.pop_free() {
            Ok(id) => id,
            Err(e) => {
                self.push_free(canonical_list);
                self.push_free(chunk_list);
                return Err(e);
            }
        };
        self.nodes[id.index()].kind = BlockKind::Primary(PrimaryBlock {
            refcount: 0,
            canonical_list,
            chunk_list,
            block_encode_size_cache: 0,
            bundle_encode_size_cache: 0,
            logical: PrimaryLogical::default(),
            delivery: DeliveryData::default(),
        });
        Ok(id)
    }

    pub fn alloc_canonical_block(&mut self, bundle_ref: BlockId) -> Result<BlockId> {
        let chunk_list = self.alloc_list_head()?;
        let id = match self.pop_free() {
            Ok(id) => id,
            Err(e) => {
                self.push_free(chunk_list);
                return Err(e);
            }
        };
        self.nodes[id.index()].kind = BlockKind::Canonical(CanonicalBlock {
            refcount: 0,
            bundle_ref,
            chunk_list,
            block_encode_size_cache: 0,
            encoded_content_offset: 0,
            encoded_content_length: 0,
            logical: CanonicalLogical::default(),
        });
        Ok(id)
    }

    pub fn alloc_flow(
        &mut self,
        external_id: InterfaceId,
        input_depth_limit: usize,
        output_depth_limit: usize,
    ) -> Result<BlockId> {
        let input_list = self.alloc_list_head()?;
        let output_list = match self.alloc_list_head() {
            Ok(id) => id,
            Err(e) => {
                self.push_free(input_list);
                return Err(e);
            }
        };
        let id = match self.pop_free() {
            Ok(id) => id,
            Err(e) => {
                self.push_free(input_list);
                self.push_free(output_list);
                return Err(e);
            }
        };
        self.nodes[id.index()].kind = BlockKind::Flow(FlowBlock {
            refcount: 0,
            external_id,
            input: SubQueue {
                list: input_list,
                depth_limit: input_depth_limit,
                stats: Default::default(),
            },
            output: SubQueue {
                list: output_list,
                depth_limit: output_depth_limit,
                stats: Default::default(),
            },
            parent: None,
        });
        Ok(id)
    }

    pub(crate) fn alloc_ref(
        &mut self,
        target: BlockId,
        discard: Option<crate::block::DiscardCallback>,
    ) -> Result<BlockId> {
        let id = self.pop_free()?;
        self.nodes[id.index()].kind = BlockKind::Ref(RefBlock { target, discard });
        Ok(id)
    }

    pub fn init_secondary_link(&mut self, owner: BlockId) -> Result<BlockId> {
        let id = self.pop_free()?;
        self.nodes[id.index()].kind = BlockKind::SecondaryLink(SecondaryLinkBlock { owner });
        Ok(id)
    }

    // --- tag / cast ---------------------------------------------------------

    /// Unwraps through `ref` and `secondary_link` indirection to the owning block.
    pub fn obtain_base_block(&self, mut id: BlockId) -> BlockId {
        loop {
            match &self.nodes[id.index()].kind {
                BlockKind::SecondaryLink(link) => id = link.owner,
                BlockKind::Ref(r) => id = r.target,
                _ => return id,
            }
        }
    }

    pub fn cast_primary(&self, id: BlockId) -> Option<&PrimaryBlock> {
        let base = self.obtain_base_block(id);
        match &self.nodes[base.index()].kind {
            BlockKind::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn cast_primary_mut(&mut self, id: BlockId) -> Option<&mut PrimaryBlock> {
        let base = self.obtain_base_block(id);
        match &mut self.nodes[base.index()].kind {
            BlockKind::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn cast_canonical(&self, id: BlockId) -> Option<&CanonicalBlock> {
        let base = self.obtain_base_block(id);
        match &self.nodes[base.index()].kind {
            BlockKind::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn cast_canonical_mut(&mut self, id: BlockId) -> Option<&mut CanonicalBlock> {
        let base = self.obtain_base_block(id);
        match &mut self.nodes[base.index()].kind {
            BlockKind::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn cast_flow(&self, id: BlockId) -> Option<&FlowBlock> {
        let base = self.obtain_base_block(id);
        match &self.nodes[base.index()].kind {
            BlockKind::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn cast_flow_mut(&mut self, id: BlockId) -> Option<&mut FlowBlock> {
        let base = self.obtain_base_block(id);
        match &mut self.nodes[base.index()].kind {
            BlockKind::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn cast_cbor_data(&self, id: BlockId) -> Option<&CborDataBlock> {
        let base = self.obtain_base_block(id);
        match &self.nodes[base.index()].kind {
            BlockKind::CborData(c) => Some(c),
            _ => None,
        }
    }

    pub fn cast_cbor_data_mut(&mut self, id: BlockId) -> Option<&mut CborDataBlock> {
        let base = self.obtain_base_block(id);
        match &mut self.nodes[base.index()].kind {
            BlockKind::CborData(c) => Some(c),
            _ => None,
        }
    }

    /// Like `cast_*`, but additionally requires the stored magic number to match,
    /// giving user-defined payloads a data-integrity check on downcast.
    pub fn cast_generic_data(&self, id: BlockId, required_magic: Magic) -> Option<&dyn Any> {
        let base = self.obtain_base_block(id);
        match &self.nodes[base.index()].kind {
            BlockKind::ServiceObject(s) if s.magic == required_magic => Some(s.payload.as_ref()),
            _ => None,
        }
    }

    /// Recovers the containing block from a user-payload pointer previously handed
    /// out via [`Pool::cast_generic_data`], the way `get_generic_block_from_pointer`
    /// inverts the tag/cast relationship in the original design.
    ///
    /// # Safety invariant
    /// `ptr` must be a pointer obtained from a still-allocated service-object
    /// payload of this pool; it is only ever compared against a table of addresses
    /// this pool itself handed out, never dereferenced here.
    pub fn get_generic_block_from_pointer(
        &self,
        ptr: *const u8,
        required_magic: Magic,
    ) -> Option<BlockId> {
        let id = *self.service_object_index.get(&(ptr as usize))?;
        match &self.nodes[id.index()].kind {
            BlockKind::ServiceObject(s) if s.magic == required_magic => Some(id),
            _ => None,
        }
    }

    // --- recycle / maintain --------------------------------------------------

    /// Decrements `id`'s refcount and, if it reaches zero, moves it onto the
    /// recycled list. A no-op (other than the decrement) for blocks whose refcount
    /// has not yet reached zero; a bug-trap (debug log) for blocks that carry no
    /// refcount at all, since callers should never hold a light/heavy reference to
    /// one of those.
    pub(crate) fn release_ref(&mut self, id: BlockId) {
        let reached_zero = match self.nodes[id.index()].kind.refcount_mut() {
            Some(rc) => {
                debug_assert!(*rc > 0, "refcount underflow on block {:?}", id);
                *rc = rc.saturating_sub(1);
                *rc == 0
            }
            None => {
                log::warn!("release_ref on non-refcounted block {:?}", id);
                false
            }
        };
        if reached_zero {
            self.recycle_block(id);
        }
    }

    /// Moves a block that is no longer needed onto the recycled list. Any discard
    /// callback on a heavy (`ref`) block is *not* fired here — it is deferred to
    /// the next [`Pool::maintain`] pass so a recycle triggered from inside another
    /// callback cannot reenter the recycler.
    pub fn recycle_block(&mut self, id: BlockId) {
        list::extract(&mut self.nodes, id);
        list::insert_before(&mut self.nodes, self.recycled_head, id);
        self.stats.recycle_pending += 1;
    }

    /// Recycles every attached block in `list`, leaving `list` empty.
    pub fn recycle_all_blocks_in_list(&mut self, list_head: BlockId) {
        for id in list::iter_forward(&self.nodes, list_head) {
            self.recycle_block(id);
        }
    }

    /// Drains the recycled list back to free, firing any deferred heavy-ref
    /// discard callbacks (and releasing their targets) along the way. Never fails;
    /// failures during reclamation are logged and do not stop the sweep.
    pub fn maintain(&mut self) {
        let drained = list::iter_forward(&self.nodes, self.recycled_head);
        for &id in &drained {
            list::extract(&mut self.nodes, id);
        }

        for &id in &drained {
            if matches!(self.nodes[id.index()].kind, BlockKind::Ref(_)) {
                let kind = std::mem::replace(&mut self.nodes[id.index()].kind, BlockKind::Free);
                if let BlockKind::Ref(mut r) = kind {
                    if let Some(cb) = r.discard.as_mut() {
                        cb(EventId::Recycle, r.target);
                    }
                    self.release_ref(r.target);
                }
            }
        }

        for id in drained {
            if let BlockKind::ServiceObject(s) = &self.nodes[id.index()].kind {
                let addr = s.payload.as_ref() as *const dyn Any as *const u8 as usize;
                self.service_object_index.remove(&addr);
            }
            self.push_free(id);
            self.stats.recycle_pending = self.stats.recycle_pending.saturating_sub(1);
            self.stats.reclaimed_total += 1;
        }

        log::debug!(
            "pool maintain: {} blocks reclaimed, {} in use, {} still pending",
            self.stats.reclaimed_total,
            self.stats.allocated,
            self.stats.recycle_pending
        );
    }

    // --- active flow set -------------------------------------------------------

    pub(crate) fn active_flows_head(&self) -> BlockId {
        self.active_flows_head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_exhausts_and_recovers_after_maintain() {
        let mut pool = Pool::new(1);
        let a = pool.alloc_cbor_data_block().unwrap();
        assert!(pool.alloc_cbor_data_block().is_err());
        pool.recycle_block(a);
        // still exhausted: recycle does not free immediately
        assert!(pool.alloc_cbor_data_block().is_err());
        pool.maintain();
        assert!(pool.alloc_cbor_data_block().is_ok());
    }

    #[test]
    fn cast_rejects_wrong_type() {
        let mut pool = Pool::new(4);
        let cbor = pool.alloc_cbor_data_block().unwrap();
        assert!(pool.cast_primary(cbor).is_none());
        assert!(pool.cast_cbor_data(cbor).is_some());
    }

    #[test]
    fn generic_data_requires_matching_magic() {
        let mut pool = Pool::new(4);
        let id = pool.alloc_generic_block(0xCAFE, Box::new(42u32)).unwrap();
        assert!(pool.cast_generic_data(id, 0xCAFE).is_some());
        assert!(pool.cast_generic_data(id, 0xBEEF).is_none());
    }

    #[test]
    fn primary_block_owns_distinct_list_heads() {
        let mut pool = Pool::new(8);
        let pri = pool.alloc_primary_block().unwrap();
        let p = pool.cast_primary(pri).unwrap();
        assert_ne!(p.canonical_list, p.chunk_list);
    }
}
