//! A concurrent, persistent-memory-resident ordered key-value index built
//! from fixed-size, dual-shadow-slot nodes with lock-free optimistic reads.
//!
//! # Module organization
//!
//! ### Foundation
//! - [`error`] — the crate's error taxonomy.
//! - [`pair`] — the key-value pair type and node capacity constants.
//!
//! ### Core primitives
//! - [`backoff`] — exponential backoff for contention management.
//! - [`mutex`] — the cache-line-sized persistent spinlock each node embeds.
//! - [`header`] — the node's single-word published-state header.
//!
//! ### Node-level structure
//! - [`node`] — the fixed-size, dual-shadow-slot node record.
//! - [`node_ops`] — single-node search, insert/delete, split, and merge.
//! - [`root`] — root/head growth and shrinkage.
//!
//! ### Storage and lifecycle
//! - [`pool`] — the memory-mapped backing pool.
//! - [`bootstrap`] — pool creation and recovery.
//! - [`epoch`] — epoch-based reclamation.
//!
//! ### Tree operators
//! - [`tree`] — `lookup`, `put`, `update`, `upsert`, `remove`, `scan`.
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod pair;

pub mod pr;

pub mod backoff;
pub mod mutex;

pub mod header;

pub mod node;
pub mod node_ops;
pub mod root;

pub mod pool;
pub mod bootstrap;
pub mod epoch;

pub mod tree;

pub use epoch::ThreadInfo;
pub use error::{Error, Result};
pub use tree::Tree;

/// Constructor-supplied sizing and rebalancing knobs.
///
/// `lnum`/`rnum` are the merge-low-watermark and split-high-watermark on a
/// node's combined live-pair count; the crate's invariant requires
/// `lnum <= rnum <= 2*F`. The validated defaults below match the original's
/// choice for `F = 35`.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Size in bytes of the backing pool file to create.
    pub pool_size: u64,
    /// Merge threshold: a leaf at or below this combined count with its
    /// right sibling is eligible to merge.
    pub lnum: u32,
    /// Split threshold: a node at or above this count is eligible to split.
    pub rnum: u32,
}

impl TreeConfig {
    /// The original's validated default: `Lnum=14, Rnum=27` for `F=35`.
    pub const DEFAULT_LNUM: u32 = 14;
    /// See [`Self::DEFAULT_LNUM`].
    pub const DEFAULT_RNUM: u32 = 27;

    /// A config with the default thresholds and the given pool size.
    pub fn new(pool_size: u64) -> Self {
        TreeConfig { pool_size, lnum: Self::DEFAULT_LNUM, rnum: Self::DEFAULT_RNUM }
    }

    fn validate(&self) -> Result<()> {
        let max = 2 * pair::F as u32;
        if self.lnum > self.rnum || self.rnum > max {
            return Err(Error::InvalidThresholds { lnum: self.lnum, rnum: self.rnum, max });
        }
        Ok(())
    }
}

impl Tree {
    /// Create a fresh pool at `path` per `config` and return its tree
    /// handle, ready for [`Tree::register_thread`].
    pub fn open(path: impl AsRef<std::path::Path>, config: TreeConfig) -> Result<Tree> {
        config.validate()?;
        let pool = bootstrap::create(path, config.pool_size, config.lnum, config.rnum)?;
        tracing::info!(lnum = config.lnum, rnum = config.rnum, "created pool");
        Ok(Tree::new(pool))
    }

    /// Reopen an existing pool at `path`, trusting its stored thresholds.
    pub fn recover(path: impl AsRef<std::path::Path>) -> Result<Tree> {
        let pool = bootstrap::recover(path)?;
        tracing::info!("recovered pool");
        Ok(Tree::new(pool))
    }
}
