//! Root/head growth and shrinkage.
//!
//! The original repeats this logic inline at the end of `upKey` (grow) and
//! inside `downKey` (shrink) three times over. Both are one-node operations
//! guarded by the head node's own lock, so they're factored out here instead
//! of duplicated at each call site.

use crate::header::Header;
use crate::node::{Node, NodeOff, NodeSource};
use crate::pair::{Pair, MAX_KEY};

/// Grow the tree by one level: allocate a fresh head whose sole routing
/// entry points at the current head, which becomes an ordinary internal
/// node. Called when a split promotes a new separator key all the way up
/// through the current head.
pub fn grow_head<S: NodeSource>(source: &S, old_head_off: NodeOff, tail_off: NodeOff) -> crate::error::Result<NodeOff> {
    let new_off = source.alloc_node()?;
    let new_head = source.node_at(new_off);
    new_head.set_right(0, tail_off);
    new_head.set_max_key(0, MAX_KEY);
    new_head.slot_mut(0)[0] = Pair::new(0, old_head_off);
    new_head.header.store(Header::builder().set_count(1).build());
    Ok(new_off)
}

/// Mark `node` obsolete so the epoch reclaimer can retire it once no reader
/// can still be mid-traversal through it.
pub fn mark_obsolete(node: &Node) {
    let header = node.header.load();
    node.header.store(header.to_builder().set_obsolete(true).build());
}

/// Shrink the tree by one level: the mirror image of [`grow_head`]. Called
/// when removing a stale separator has reduced `old_head` to a single
/// routing entry; marks `old_head` obsolete and returns `sole_child_off` for
/// the caller (already holding `old_head`'s lock) to republish as the
/// tree's new head, then retire `old_head` through its epoch guard.
pub fn shrink_head(old_head: &Node, sole_child_off: NodeOff) -> NodeOff {
    mark_obsolete(old_head);
    sole_child_off
}
