//! Memory pool and file-backed persistent store for a Bundle Protocol (BP v7) node.
//!
//! # Memory pool
//!
//! A [`pool::Pool`] is a fixed-capacity arena of [`block::BlockKind`] records, carved
//! once from a contiguous `Vec` and never grown. Every record type the node needs while a
//! bundle is in flight — primary blocks, canonical blocks, encoded CBOR chunks, flows, and
//! the light/heavy references in [`refs`] that tie them together — is allocated from this
//! one arena and recycled back to it. Structure ([`block::PrimaryBlock::canonical_list`],
//! a flow's [`block::SubQueue`]) and work-queues (a flow's ingress/egress, the pool's
//! active-flow set) are both realized with the same [`list`] primitive: a circular
//! intrusive doubly-linked list addressed by arena index rather than raw pointer.
//!
//! A single pool is driven from one thread; nothing in [`pool`], [`block`], [`refs`], or
//! [`flow`] takes an internal lock. Callers serialize access externally, typically from
//! whatever thread runs the forwarder loop.
//!
//! # Persistent store
//!
//! [`store::FileStore`] spills bundles a node cannot forward immediately to disk: bundles
//! are appended to one of up to [`store::DEFAULT_MAX_STORES`] bucketed instances managed
//! by a [`store::StoreManager`], each bucket holding [`store::format::FILE_DATA_COUNT`]
//! records before a new file is opened. Unlike the pool, a `FileStore` is safe to share
//! across threads: every operation locks the handle's own mutex, and `dequeue`/`retrieve`
//! may block a caller-chosen [`store::WaitTimeout`] on an empty queue or a cache slot
//! locked by another in-flight read.
//!
//! # Error handling
//!
//! Every fallible operation in this crate returns [`error::Result`]; see [`error::Error`]
//! for the small, stable taxonomy callers use to decide whether to retry, reroute, or give
//! up. Nothing in this crate panics or unwinds on a caller error.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod block;
pub mod error;
pub mod flow;
mod list;
pub mod pool;
mod refs;
pub mod store;

pub use block::{BlockId, BlockKind, StorageId};
pub use error::{Error, Result};
pub use flow::SubQueueKind;
pub use pool::Pool;
pub use store::{FileStore, StoreAttrs, StoreHandle, StoreManager, WaitTimeout};
