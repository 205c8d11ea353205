//! The fixed-size, dual-shadow-slot node record.
//!
//! Every node is exactly 1280 bytes so the pool's allocator can hand out
//! uniformly-sized, cache-aligned slabs (see [`crate::pool`]). A node holds
//! two independent copies ("shadow slots") of its pair array, `midkey`, and
//! sibling-pointer bookkeeping; [`header::Header::version_parity`] selects
//! which one is currently live. A structural edit writes the *other* slot,
//! flushes it, then publishes the switch with one header store — the update
//! is atomic from a reader's point of view because it is a single aligned
//! 64-bit write.
//!
//! `max_key` and `right` additionally keep two copies each (`right_gen`
//! rather than version parity selects between them), because a split or
//! merge needs to republish a node's right sibling without bumping the
//! node's own version — readers mid-traversal only care whether the sibling
//! link changed, not whether the node's content did.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::{AtomicHeader, Header};
use crate::mutex::PersistentMutex;
use crate::pair::{Pair, F};

/// A deferred single-slot edit recorded directly in the node rather than
/// applied in place. See the module docs on why this crate represents the
/// lazy-box as an explicit record instead of packing a sign-extended
/// pointer-style value, as the original does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LazyBox {
    pub key: u64,
    pub value: u64,
    /// Index within the live shadow slot's raw array the edit applies at.
    pub pos: u32,
}

/// Offset of a node within the pool, in node-sized units. `NIL` marks "no
/// node" (used only during bootstrap before the tail sentinel exists).
pub type NodeOff = u64;

/// Sentinel `NodeOff` meaning "no node" — never a valid allocation result.
pub const NIL: NodeOff = u64::MAX;

/// One node: a header, an optional pending lazy-box edit, and two shadow
/// slots of routing/leaf pairs plus their associated `midkey`/`maxKey`/
/// `right` bookkeeping.
#[repr(C, align(64))]
pub struct Node {
    pub header: AtomicHeader,
    lazy_box: UnsafeCell<LazyBox>,
    mid_key: UnsafeCell<[u64; 2]>,
    max_key: [AtomicU64; 2],
    right: [AtomicU64; 2],
    slots: UnsafeCell<[[Pair; F]; 2]>,
    pub mutex: PersistentMutex<()>,
}

// SAFETY: every field reachable without holding `mutex` (header, max_key,
// right) is itself atomic; `lazy_box`, `mid_key`, and `slots` are mutated
// only by the thread holding `mutex`, and published to readers exclusively
// through the header store that follows. Readers that race a writer either
// observe the old, still-internally-consistent shadow slot or the new one,
// never a partial write, because they re-validate the header before trusting
// what they read (see `header::Header::read_check`).
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    /// A freshly zeroed node: version 0, empty, internal, live.
    pub fn new() -> Self {
        Node {
            header: AtomicHeader::new(Header::EMPTY),
            lazy_box: UnsafeCell::new(LazyBox::default()),
            mid_key: UnsafeCell::new([0, 0]),
            max_key: [AtomicU64::new(0), AtomicU64::new(0)],
            right: [AtomicU64::new(NIL), AtomicU64::new(NIL)],
            slots: UnsafeCell::new([[Pair::EMPTY; F]; 2]),
            mutex: PersistentMutex::new(()),
        }
    }

    #[inline]
    pub fn max_key(&self, gen: usize) -> u64 {
        self.max_key[gen].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_max_key(&self, gen: usize, key: u64) {
        self.max_key[gen].store(key, Ordering::Release);
    }

    #[inline]
    pub fn right(&self, gen: usize) -> NodeOff {
        self.right[gen].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_right(&self, gen: usize, off: NodeOff) {
        self.right[gen].store(off, Ordering::Release);
    }

    #[inline]
    pub fn mid_key(&self, parity: usize) -> u64 {
        // SAFETY: `mid_key` is only written by the mutex-holding writer
        // immediately before a header publish; a reader that races this
        // store will fail its subsequent `read_check` and restart.
        unsafe { (*self.mid_key.get())[parity] }
    }

    #[inline]
    pub fn set_mid_key(&self, parity: usize, key: u64) {
        unsafe { (*self.mid_key.get())[parity] = key };
    }

    #[inline]
    pub fn lazy_box(&self) -> LazyBox {
        unsafe { *self.lazy_box.get() }
    }

    #[inline]
    pub fn set_lazy_box(&self, lb: LazyBox) {
        unsafe { *self.lazy_box.get() = lb };
    }

    /// Live shadow slot for the given header snapshot.
    #[inline]
    pub fn slot(&self, header: Header) -> &[Pair; F] {
        unsafe { &(*self.slots.get())[header.version_parity()] }
    }

    /// The *other* shadow slot: where the next structural edit is written.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn shadow_slot_mut(&self, header: Header) -> &mut [Pair; F] {
        unsafe { &mut (*self.slots.get())[header.version_parity() ^ 1] }
    }

    #[inline]
    pub fn slot_mut(&self, parity: usize) -> &mut [Pair; F] {
        unsafe { &mut (*self.slots.get())[parity] }
    }

    /// Byte span covering this node's body (everything but the header word),
    /// used to flush a shadow slot and its sidecar fields before the header
    /// publish that makes it live.
    #[inline]
    pub fn body_ptr(&self) -> *const u8 {
        (&self.lazy_box as *const _ as *const u8)
    }

    #[inline]
    pub fn body_len() -> usize {
        std::mem::size_of::<Node>() - std::mem::size_of::<AtomicHeader>()
    }

    #[inline]
    pub fn header_ptr(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// Reset a freed node to its pristine state before handing it back out
    /// of the allocator's free list.
    pub fn reset(&self) {
        self.header.store(Header::EMPTY);
        self.set_lazy_box(LazyBox::default());
        self.set_mid_key(0, 0);
        self.set_mid_key(1, 0);
        self.set_max_key(0, 0);
        self.set_max_key(1, 0);
        self.set_right(0, NIL);
        self.set_right(1, NIL);
        *self.slot_mut(0) = [Pair::EMPTY; F];
        *self.slot_mut(1) = [Pair::EMPTY; F];
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

/// Resolves a [`NodeOff`] to the `Node` it names. Implemented by
/// [`crate::pool::Pool`]; kept as a trait here so [`crate::node_ops`] and
/// [`crate::tree`] don't need to depend on the pool's storage details, only
/// on the ability to dereference an offset and allocate a fresh one.
pub trait NodeSource {
    fn node_at(&self, off: NodeOff) -> &Node;
    fn alloc_node(&self) -> crate::error::Result<NodeOff>;
    fn offset_of(&self, node: &Node) -> NodeOff;
}
