//! Pool creation and recovery: the counterpart of the original's
//! `pmdk_constructor` and `reStart`.
//!
//! A fresh tree needs three bootstrap nodes laid down before any operator
//! can run:
//!
//! - **tail**: the universal terminator. Every rightward scan stops when it
//!   reaches the tail's offset; it is bottom (leaf) and carries the maximum
//!   sentinel key so no real key ever compares past it.
//! - **root**: the initial (empty) leaf, holding the single sentinel pair
//!   `{0, 0}` that every lookup below the smallest real key resolves to.
//! - **head**: a one-entry internal node routing everything to the root
//!   leaf. Mutating operators (`put`/`update`/`remove`) always start their
//!   descent from the head rather than the root directly, because growing
//!   the tree by one level replaces the head, and an operator must see that
//!   replacement to avoid walking a stale entry point.
//!
//! Recovery skips all of this: the pool's root record already names the
//! live head/tail/root offsets from the last successful run.

use crate::header::Header;
use crate::node::{NodeOff, NodeSource, NIL};
use crate::pair::{Pair, MAX_KEY};
use crate::pool::Pool;

/// Create a brand-new pool file and install the head/tail/root bootstrap
/// nodes.
pub fn create(path: impl AsRef<std::path::Path>, pool_size: u64, lnum: u32, rnum: u32) -> crate::error::Result<Pool> {
    let pool = Pool::create(path, pool_size, lnum, rnum)?;

    let tail_off = pool.alloc_node()?;
    let tail = pool.node_at(tail_off);
    tail.set_right(0, NIL);
    tail.set_max_key(0, MAX_KEY);
    tail.slot_mut(0)[0] = Pair::new(MAX_KEY, 0);
    tail.header.store(Header::builder().set_count(1).set_bottom(true).build());

    let root_off = pool.alloc_node()?;
    let root = pool.node_at(root_off);
    root.set_right(0, tail_off);
    root.set_max_key(0, MAX_KEY);
    root.slot_mut(0)[0] = Pair::new(0, 0);
    root.header.store(Header::builder().set_count(1).set_bottom(true).build());

    let head_off = pool.alloc_node()?;
    let head = pool.node_at(head_off);
    head.set_right(0, tail_off);
    head.set_max_key(0, MAX_KEY);
    head.slot_mut(0)[0] = Pair::new(0, root_off);
    head.header.store(Header::builder().set_count(1).build());

    pool.set_tail_off(tail_off);
    pool.set_root_off(root_off);
    pool.set_head_off(head_off);

    Ok(pool)
}

/// Reopen an existing pool, trusting its root record's head/tail/root
/// offsets without replaying any journal.
pub fn recover(path: impl AsRef<std::path::Path>) -> crate::error::Result<Pool> {
    Pool::recover(path)
}

/// True if `off` names the pool's current head (used by the shrink-on-merge
/// path to detect when the root has become single-child and collapse one
/// level, mirroring the original's `head->pairs[0].value` comparison).
pub fn is_current_head(pool: &Pool, off: NodeOff) -> bool {
    pool.head_off() == off
}
