//! Single-node structural operators: search, insert/delete resolution
//! through the lazy-box, split, and merge.
//!
//! These are the direct counterparts of the original's `linear_search`,
//! `upKey`, `downKey`, `split`, and `merge`. The index algebra here is
//! simplified relative to the original's pointer-offset juggling: every
//! operator first materializes a node's *logical* content (raw shadow slot
//! plus any pending lazy-box edit, in key order) into a scratch buffer, then
//! works against that flat view. The externally observable behavior is the
//! same — one deferred edit is cheap, a second edit against an
//! already-pending node forces a copy-on-write into the other shadow slot —
//! it is only the bookkeeping that is less exotic.

use crate::header::{Header, LazyFlag};
use crate::node::{Node, NodeOff, NodeSource};
use crate::pair::{Pair, F, MID_INDEX};
use crate::pr;

/// A node's logical content: every live pair in key order, including any
/// pending lazy-box edit.
pub struct Materialized {
    pub pairs: [Pair; 2 * F],
    pub count: usize,
}

impl Materialized {
    #[inline]
    pub fn as_slice(&self) -> &[Pair] {
        &self.pairs[..self.count]
    }
}

/// Combine a node's raw shadow slot with its pending lazy-box edit (if any)
/// into a flat, key-ordered view.
pub fn materialize(node: &Node, header: Header) -> Materialized {
    let raw = node.slot(header);
    let raw_end = header.raw_end();
    let mut pairs = [Pair::EMPTY; 2 * F];

    let count = match header.lazy_flag() {
        LazyFlag::Empty => {
            let n = (raw_end + 1).max(0) as usize;
            pairs[..n].copy_from_slice(&raw[..n]);
            n
        }
        LazyFlag::PendingInsert => {
            let raw_n = (raw_end + 1).max(0) as usize;
            let lb = node.lazy_box();
            let pos = (lb.pos as usize).min(raw_n);
            pairs[..pos].copy_from_slice(&raw[..pos]);
            pairs[pos] = Pair::new(lb.key, lb.value);
            pairs[pos + 1..raw_n + 1].copy_from_slice(&raw[pos..raw_n]);
            raw_n + 1
        }
        LazyFlag::PendingDelete => {
            let raw_n = (raw_end + 1).max(1) as usize;
            let lb = node.lazy_box();
            let pos = (lb.pos as usize).min(raw_n - 1);
            pairs[..pos].copy_from_slice(&raw[..pos]);
            pairs[pos..raw_n - 1].copy_from_slice(&raw[pos + 1..raw_n]);
            raw_n - 1
        }
    };

    Materialized { pairs, count }
}

/// Result of locating a key within a node's logical content: `pos` is the
/// insertion point (index of the first entry with a strictly greater key,
/// i.e. an upper bound), and `found` is the entry at `pos - 1` when its key
/// equals the query.
pub struct Located {
    pub materialized: Materialized,
    pub pos: usize,
    key_hint: u64,
}

impl Located {
    #[inline]
    pub fn exact(&self) -> Option<Pair> {
        if self.pos == 0 {
            return None;
        }
        let p = self.materialized.pairs[self.pos - 1];
        (p.key == self.key_hint).then_some(p)
    }

    #[inline]
    pub fn predecessor(&self) -> Option<Pair> {
        if self.pos == 0 {
            None
        } else {
            Some(self.materialized.pairs[self.pos - 1])
        }
    }
}

/// Find the position of the first pair with a key strictly greater than
/// `key` within `pairs[..count]` (an upper bound / the original's
/// `linear_search`).
pub fn upper_bound(pairs: &[Pair], count: usize, key: u64) -> usize {
    let mut k = 0;
    while k < count && pairs[k].key <= key {
        k += 1;
    }
    k
}

/// Materialize `node` and locate `key` within it.
pub fn locate(node: &Node, header: Header, key: u64) -> Located {
    let materialized = materialize(node, header);
    let pos = upper_bound(materialized.as_slice(), materialized.count, key);
    Located { materialized, pos, key_hint: key }
}

/// Flush a single pair write.
fn flush_pair(p: *const Pair) {
    unsafe { pr::flush(p as *const u8, std::mem::size_of::<Pair>(), false, false) };
}

fn flush_slice(p: *const Pair, n: usize) {
    unsafe { pr::flush(p as *const u8, n * std::mem::size_of::<Pair>(), false, false) };
}

fn publish(node: &Node, new_header: Header) {
    unsafe { pr::flush(node.header_ptr(), 8, true, true) };
    node.header.store(new_header);
}

/// Apply an insert of `pair` into `node`, whose current header snapshot is
/// `header`. Returns the new header value, which has already been published
/// (flushed and stored) by the time this returns — callers only need to
/// check whether the node has grown past its split threshold.
pub fn insert(node: &Node, header: Header, pair: Pair) -> Header {
    let located = locate(node, header, pair.key);
    let count = located.materialized.count;
    let pos = located.pos;

    if header.lazy_flag() == LazyFlag::Empty && pos == count {
        // Fast path: append past the live slot's current end. Safe to mutate
        // the live slot directly because position `count` is unused tail
        // space no concurrent reader can have validated as in-range yet.
        let parity = header.version_parity();
        let slot = node.slot_mut(parity);
        slot[count] = pair;
        flush_pair(&slot[count]);
        if count == MID_INDEX {
            node.set_mid_key(parity, pair.key);
        }
        let new_header = header.to_builder().add_count(1).bump_version(2).build();
        publish(node, new_header);
        return new_header;
    }

    if header.lazy_flag() == LazyFlag::Empty {
        // Defer: record the edit without touching the array.
        node.set_lazy_box(crate::node::LazyBox { key: pair.key, value: pair.value, pos: pos as u32 });
        let new_header = header.to_builder().add_count(1).set_lazy_flag(LazyFlag::PendingInsert).build();
        publish(node, new_header);
        return new_header;
    }

    // Resolve: a second edit landed while one was pending. Shift the
    // materialized view and copy it into the other shadow slot.
    let mut pairs = located.materialized.pairs;
    for i in (pos..count).rev() {
        pairs[i + 1] = pairs[i];
    }
    pairs[pos] = pair;
    let new_count = count + 1;

    let new_parity = header.version_parity() ^ 1;
    let shadow = node.slot_mut(new_parity);
    shadow[..new_count].copy_from_slice(&pairs[..new_count]);
    flush_slice(shadow.as_ptr(), new_count);
    if new_count > MID_INDEX {
        node.set_mid_key(new_parity, pairs[MID_INDEX].key);
    }
    let new_header = header
        .to_builder()
        .bump_version(1)
        .add_count(1)
        .set_lazy_flag(LazyFlag::Empty)
        .build();
    publish(node, new_header);
    new_header
}

/// Apply a delete of `key` from `node`. Returns `None` if the key is not
/// present (no-op, nothing published); otherwise the published new header.
pub fn delete(node: &Node, header: Header, key: u64) -> Option<Header> {
    let located = locate(node, header, key);
    if located.pos == 0 || located.materialized.pairs[located.pos - 1].key != key {
        return None;
    }
    let count = located.materialized.count;
    let idx = located.pos - 1;

    if header.lazy_flag() == LazyFlag::Empty {
        let victim = located.materialized.pairs[idx];
        node.set_lazy_box(crate::node::LazyBox { key: victim.key, value: victim.value, pos: idx as u32 });
        let new_header = header.to_builder().add_count(-1).set_lazy_flag(LazyFlag::PendingDelete).build();
        publish(node, new_header);
        return Some(new_header);
    }

    let mut pairs = located.materialized.pairs;
    for i in idx..count - 1 {
        pairs[i] = pairs[i + 1];
    }
    let new_count = count - 1;

    let new_parity = header.version_parity() ^ 1;
    let shadow = node.slot_mut(new_parity);
    shadow[..new_count].copy_from_slice(&pairs[..new_count]);
    if new_count > 0 {
        flush_slice(shadow.as_ptr(), new_count);
    }
    if new_count > MID_INDEX {
        node.set_mid_key(new_parity, pairs[MID_INDEX].key);
    }
    let new_header = header
        .to_builder()
        .bump_version(1)
        .add_count(-1)
        .set_lazy_flag(LazyFlag::Empty)
        .build();
    publish(node, new_header);
    Some(new_header)
}

/// Split `node` if its logical count has reached capacity, allocating a new
/// right sibling that takes the upper half. Returns the new sibling's offset
/// on split, `None` if the node was under threshold.
pub fn maybe_split<S: NodeSource>(source: &S, node: &Node, header: Header) -> crate::error::Result<Option<NodeOff>> {
    if (header.number() as usize) < F {
        return Ok(None);
    }

    let materialized = materialize(node, header);
    let count = materialized.count;
    let mid = (count + 1) / 2;
    let upper = count - mid;

    let new_off = source.alloc_node()?;
    let new_node = source.node_at(new_off);
    let gen = header.right_gen();

    new_node.set_right(gen, node.right(gen));
    new_node.set_max_key(gen, node.max_key(gen));
    let new_slot = new_node.slot_mut(0);
    new_slot[..upper].copy_from_slice(&materialized.pairs[mid..count]);
    if upper > MID_INDEX {
        new_node.set_mid_key(0, new_slot[MID_INDEX].key);
    }
    flush_slice(new_slot.as_ptr(), upper);
    let new_node_header = Header::builder().set_count(upper as u16).build();
    unsafe { pr::flush(new_node.header_ptr(), 8, false, false) };
    new_node.header.store(new_node_header);

    // Shrink the original node in place to its lower half, then republish
    // the right link to point at the new sibling.
    let keep_parity = header.version_parity();
    let keep_slot = node.slot_mut(keep_parity);
    keep_slot[..mid].copy_from_slice(&materialized.pairs[..mid]);
    if mid > MID_INDEX {
        node.set_mid_key(keep_parity, keep_slot[MID_INDEX].key);
    }
    flush_slice(keep_slot.as_ptr(), mid);

    let flipped_gen = gen ^ 1;
    node.set_right(flipped_gen, new_off);
    node.set_max_key(flipped_gen, new_slot[0].key);
    let shrunk_header = header
        .to_builder()
        .set_count(mid as u16)
        .set_lazy_flag(LazyFlag::Empty)
        .flip_right_gen()
        .build();
    publish(node, shrunk_header);

    Ok(Some(new_off))
}

/// Merge `node` with its right sibling if their combined count has fallen
/// below the tree's low-water threshold. Returns the retired sibling's
/// offset and the separator key that routed to it in `node`'s parent — the
/// caller must remove that key from the parent, or a stale routing entry
/// will eventually point at whatever the sibling's recycled offset becomes.
/// Never merges across `tail_off`: the tail sentinel is never a real
/// sibling to absorb, and retiring it would destroy the terminator every
/// rightward scan relies on.
pub fn maybe_merge<S: NodeSource>(source: &S, node: &Node, lnum: u32, tail_off: NodeOff) -> Option<(NodeOff, u64)> {
    let _node_guard = node.mutex.lock();
    let header = node.header.load();
    if header.is_obsolete() {
        return None;
    }
    let gen = header.right_gen();
    let sib_off = node.right(gen);
    if sib_off == tail_off {
        return None;
    }
    let sibling = source.node_at(sib_off);
    let _sib_guard = sibling.mutex.lock();
    let sib_header = sibling.header.load();
    if sib_header.is_obsolete() {
        return None;
    }
    if header.number() as u32 + sib_header.number() as u32 >= lnum {
        return None;
    }

    let left = materialize(node, header);
    let right = materialize(sibling, sib_header);
    let new_count = left.count + right.count;
    debug_assert!(new_count <= 2 * F, "merge target must fit a single node");
    let separator_key = right.as_slice()[0].key;

    let parity = header.version_parity();
    let slot = node.slot_mut(parity);
    slot[..left.count].copy_from_slice(left.as_slice());
    slot[left.count..new_count].copy_from_slice(right.as_slice());
    if new_count > MID_INDEX {
        node.set_mid_key(parity, slot[MID_INDEX].key);
    }
    flush_slice(slot[left.count..].as_ptr(), right.count);

    let sib_gen = sib_header.right_gen();
    node.set_right(gen ^ 1, sibling.right(sib_gen));
    node.set_max_key(gen ^ 1, sibling.max_key(sib_gen));
    let merged_header = header
        .to_builder()
        .set_count(new_count as u16)
        .set_lazy_flag(LazyFlag::Empty)
        .flip_right_gen()
        .build();
    publish(node, merged_header);

    let retired_header = sib_header.to_builder().set_obsolete(true).build();
    sibling.header.store(retired_header);

    Some((sib_off, separator_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NIL;
    use std::cell::RefCell;

    struct FakeSource {
        nodes: RefCell<Vec<Box<Node>>>,
    }

    impl FakeSource {
        fn new() -> Self {
            FakeSource { nodes: RefCell::new(Vec::new()) }
        }
    }

    impl NodeSource for FakeSource {
        fn node_at(&self, off: NodeOff) -> &Node {
            let nodes = self.nodes.borrow();
            let ptr: *const Node = &*nodes[off as usize];
            unsafe { &*ptr }
        }

        fn alloc_node(&self) -> crate::error::Result<NodeOff> {
            let mut nodes = self.nodes.borrow_mut();
            nodes.push(Box::new(Node::new()));
            Ok((nodes.len() - 1) as u64)
        }

        fn offset_of(&self, _node: &Node) -> NodeOff {
            unreachable!("not exercised by these tests")
        }
    }

    #[test]
    fn insert_then_delete_round_trips() {
        let node = Node::new();
        node.set_max_key(0, crate::pair::MAX_KEY);
        node.set_right(0, NIL);
        let mut header = Header::EMPTY;
        header = insert(&node, header, Pair::new(10, 100));
        header = insert(&node, header, Pair::new(20, 200));
        let located = locate(&node, header, 10);
        assert_eq!(located.exact(), Some(Pair::new(10, 100)));

        let header = delete(&node, header, 10).unwrap();
        let located = locate(&node, header, 10);
        assert_eq!(located.exact(), None);
        let located20 = locate(&node, header, 20);
        assert_eq!(located20.exact(), Some(Pair::new(20, 200)));
    }

    #[test]
    fn two_pending_inserts_force_resolution() {
        let node = Node::new();
        let mut header = Header::EMPTY;
        header = insert(&node, header, Pair::new(5, 50));
        // First insert beyond the current end takes the append fast path and
        // leaves no pending lazy-box; force a genuine defer by inserting
        // below an existing key, then another below that.
        header = insert(&node, header, Pair::new(1, 10));
        assert_eq!(header.lazy_flag(), LazyFlag::PendingInsert);
        header = insert(&node, header, Pair::new(2, 20));
        assert_eq!(header.lazy_flag(), LazyFlag::Empty);
        assert_eq!(header.number(), 3);
        let located = locate(&node, header, 2);
        assert_eq!(located.exact(), Some(Pair::new(2, 20)));
    }

    #[test]
    fn split_divides_a_full_node() {
        let source = FakeSource::new();
        let off = source.alloc_node().unwrap();
        let node = source.node_at(off);
        let mut header = Header::EMPTY;
        for i in 0..F as u64 {
            header = insert(node, header, Pair::new(i + 1, i * 10));
        }
        let new_off = maybe_split(&source, node, header).unwrap();
        assert!(new_off.is_some());
        let header_after = node.header.load();
        assert!((header_after.number() as usize) < F);
    }

    #[test]
    fn maybe_merge_combines_undersized_siblings_and_reports_the_separator() {
        let source = FakeSource::new();
        let left_off = source.alloc_node().unwrap();
        let right_off = source.alloc_node().unwrap();
        let left = source.node_at(left_off);
        let right = source.node_at(right_off);

        let mut right_header = Header::EMPTY;
        right_header = insert(right, right_header, Pair::new(20, 200));
        right.set_max_key(right_header.right_gen(), crate::pair::MAX_KEY);
        right.set_right(right_header.right_gen(), NIL);

        let mut left_header = Header::EMPTY;
        left_header = insert(left, left_header, Pair::new(10, 100));
        left.set_right(left_header.right_gen(), right_off);
        left.set_max_key(left_header.right_gen(), crate::pair::MAX_KEY);

        let (retired, separator) = maybe_merge(&source, left, 14, NIL).unwrap();
        assert_eq!(retired, right_off);
        assert_eq!(separator, 20);
        assert!(source.node_at(right_off).header.load().is_obsolete());

        let merged_header = left.header.load();
        assert_eq!(merged_header.number(), 2);
        let located = locate(left, merged_header, 20);
        assert_eq!(located.exact(), Some(Pair::new(20, 200)));
    }

    #[test]
    fn maybe_merge_never_absorbs_the_tail_sentinel() {
        let source = FakeSource::new();
        let leaf_off = source.alloc_node().unwrap();
        let tail_off = source.alloc_node().unwrap();
        let leaf = source.node_at(leaf_off);

        let mut header = Header::EMPTY;
        header = insert(leaf, header, Pair::new(10, 100));
        leaf.set_right(header.right_gen(), tail_off);
        leaf.set_max_key(header.right_gen(), crate::pair::MAX_KEY);

        assert!(maybe_merge(&source, leaf, 14, tail_off).is_none());
        assert!(!source.node_at(tail_off).header.load().is_obsolete());
    }
}
