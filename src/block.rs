//! The block taxonomy: a tagged sum type over every record the pool can carve out of
//! its arena, plus the typed-downcast (`cast_*`) accessors.

use crate::list::{Link, LinkStorage};

/// Maximum payload carried by a single [`BlockKind::CborData`] chunk.
pub const MAX_ENCODED_CHUNK_SIZE: usize = 320;

/// Index of a block within a [`crate::pool::Pool`]'s arena.
///
/// This is the safe, owned-storage replacement for the raw `bplib_mpool_block_t *`
/// of the original design: every "pointer" in this crate is really an index into the
/// pool's single contiguous `Vec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub(crate) fn from_index(i: usize) -> Self {
        BlockId(i as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Routing-table event a [`DiscardCallback`] may be notified of. Only `Recycle`
/// exists today; the enum is kept open the way the original event-id enum was, since
/// the mpool's event plumbing is shared with other notification paths upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    Recycle,
}

/// Callback fired when a heavy (block) reference is recycled, before its target's
/// refcount is decremented. Rust closures capture their own state, so unlike the
/// original `(notify_on_discard, notify_arg)` function-pointer pair, there is no
/// separate `arg` parameter — the closure's capture list is the argument.
pub type DiscardCallback = Box<dyn FnMut(EventId, BlockId)>;

/// An external interface identifier (ingress/egress/storage CLA handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

/// DTN time, seconds since the DTN epoch (out-of-scope encode/decode elsewhere; only
/// carried here as an opaque delivery-metadata field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DtnTime(pub u64);

/// Opaque storage identifier returned by [`crate::store::FileStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageId(pub u64);

impl StorageId {
    pub const VACANT: StorageId = StorageId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    BestEffort,
    Custody,
    Assured,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryData {
    pub policy: DeliveryPolicy,
    pub ingress_intf: InterfaceId,
    pub egress_intf: InterfaceId,
    pub storage_intf: InterfaceId,
    pub committed_storage_id: StorageId,
    pub retransmit_interval: DtnTime,
    pub ingress_time: DtnTime,
    pub egress_time: DtnTime,
}

impl Default for DeliveryData {
    fn default() -> Self {
        DeliveryData {
            policy: DeliveryPolicy::BestEffort,
            ingress_intf: InterfaceId(0),
            egress_intf: InterfaceId(0),
            storage_intf: InterfaceId(0),
            committed_storage_id: StorageId::VACANT,
            retransmit_interval: DtnTime(0),
            ingress_time: DtnTime(0),
            egress_time: DtnTime(0),
        }
    }
}

/// Primary-block logical fields. CBOR encode/decode of these is out of scope; this
/// crate only carries and chains the already-encoded chunks.
#[derive(Debug, Clone, Default)]
pub struct PrimaryLogical {
    pub version: u8,
    pub destination_eid: String,
    pub source_eid: String,
    pub report_to_eid: String,
    pub creation_timestamp: DtnTime,
    pub sequence_number: u64,
    pub lifetime: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalLogical {
    pub block_type: u8,
    pub block_number: u64,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub depth: usize,
}

pub struct RefBlock {
    pub target: BlockId,
    pub discard: Option<DiscardCallback>,
}

pub struct CborDataBlock {
    pub refcount: u32,
    pub len: u16,
    pub data: [u8; MAX_ENCODED_CHUNK_SIZE],
}

impl CborDataBlock {
    pub(crate) fn empty() -> Self {
        CborDataBlock {
            refcount: 0,
            len: 0,
            data: [0u8; MAX_ENCODED_CHUNK_SIZE],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

pub struct ServiceObjectBlock {
    pub refcount: u32,
    pub magic: u32,
    pub payload: Box<dyn std::any::Any>,
}

pub struct PrimaryBlock {
    pub refcount: u32,
    pub canonical_list: BlockId,
    pub chunk_list: BlockId,
    pub block_encode_size_cache: usize,
    pub bundle_encode_size_cache: usize,
    pub logical: PrimaryLogical,
    pub delivery: DeliveryData,
}

pub struct CanonicalBlock {
    pub refcount: u32,
    pub bundle_ref: BlockId,
    pub chunk_list: BlockId,
    pub block_encode_size_cache: usize,
    pub encoded_content_offset: usize,
    pub encoded_content_length: usize,
    pub logical: CanonicalLogical,
}

pub struct SubQueue {
    pub list: BlockId,
    pub depth_limit: usize,
    pub stats: QueueStats,
}

pub struct FlowBlock {
    pub refcount: u32,
    pub external_id: InterfaceId,
    pub input: SubQueue,
    pub output: SubQueue,
    pub parent: Option<BlockId>,
}

/// Tag value recorded on a block allocated via [`crate::pool::Pool::alloc_generic_block`]
/// so `cast_generic_data` can refuse a mismatched type at the boundary.
pub type Magic = u32;

pub struct SecondaryLinkBlock {
    pub owner: BlockId,
}

/// The payload carried by an arena slot. `Head` and `Free` carry nothing; every other
/// variant is a distinct record type, matching the original's `type` tag + union.
pub enum BlockKind {
    Free,
    Head,
    Ref(RefBlock),
    CborData(CborDataBlock),
    ServiceObject(ServiceObjectBlock),
    Primary(PrimaryBlock),
    Canonical(CanonicalBlock),
    Flow(FlowBlock),
    SecondaryLink(SecondaryLinkBlock),
}

impl BlockKind {
    pub(crate) fn tag_name(&self) -> &'static str {
        match self {
            BlockKind::Free => "free",
            BlockKind::Head => "head",
            BlockKind::Ref(_) => "ref",
            BlockKind::CborData(_) => "cbor_data",
            BlockKind::ServiceObject(_) => "service_object",
            BlockKind::Primary(_) => "primary",
            BlockKind::Canonical(_) => "canonical",
            BlockKind::Flow(_) => "flow",
            BlockKind::SecondaryLink(_) => "secondary_link",
        }
    }

    /// Refcount of this block, if it is a variant that carries one. `Ref`, `Head`,
    /// `Free`, and `SecondaryLink` are not independently refcounted: a ref block's
    /// lifetime is governed by whatever list it sits on, and a secondary link's by
    /// its owning block.
    pub(crate) fn refcount(&self) -> Option<u32> {
        match self {
            BlockKind::CborData(b) => Some(b.refcount),
            BlockKind::ServiceObject(b) => Some(b.refcount),
            BlockKind::Primary(b) => Some(b.refcount),
            BlockKind::Canonical(b) => Some(b.refcount),
            BlockKind::Flow(b) => Some(b.refcount),
            _ => None,
        }
    }

    pub(crate) fn refcount_mut(&mut self) -> Option<&mut u32> {
        match self {
            BlockKind::CborData(b) => Some(&mut b.refcount),
            BlockKind::ServiceObject(b) => Some(&mut b.refcount),
            BlockKind::Primary(b) => Some(&mut b.refcount),
            BlockKind::Canonical(b) => Some(&mut b.refcount),
            BlockKind::Flow(b) => Some(&mut b.refcount),
            _ => None,
        }
    }
}

/// One arena slot: the intrusive link pair plus the tagged payload.
pub(crate) struct Node {
    pub link: Link,
    pub kind: BlockKind,
}

impl Node {
    pub(crate) fn new_self_linked(id: BlockId, kind: BlockKind) -> Self {
        Node {
            link: Link { prev: id, next: id },
            kind,
        }
    }
}

/// Blanket impl so [`crate::list`] can operate directly on a pool's node arena.
impl LinkStorage for Vec<Node> {
    fn link(&self, id: BlockId) -> Link {
        self[id.index()].link
    }
    fn link_mut(&mut self, id: BlockId) -> &mut Link {
        &mut self[id.index()].link
    }
}
