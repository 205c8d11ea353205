//! Error taxonomy for the tree's fallible operations.
//!
//! Per the error handling design, only two conditions are ever surfaced as
//! `Result::Err`: failure to open/recover the backing pool, and exhaustion of
//! the pool's node allocator. Precondition violations (operating on a
//! sentinel key) are programmer errors and abort via `assert!`. Contention
//! and not-found conditions are handled internally and never reach the
//! caller as an error.

use std::io;
use std::path::PathBuf;

/// Errors returned by [`crate::Tree::open`] and the mutating operators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool file could not be created, opened, or mapped.
    #[error("failed to open pool at {path}: {source}")]
    PoolOpen {
        /// Path to the pool file that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The pool file exists but its root record is not one this crate wrote
    /// (wrong magic, truncated, or an incompatible layout).
    #[error("pool at {path} is not a valid pmbtree pool")]
    InvalidPool {
        /// Path to the offending pool file.
        path: PathBuf,
    },

    /// `Lnum`/`Rnum` do not satisfy `Lnum <= Rnum <= 2*F`.
    #[error("invalid rebalancing thresholds: Lnum={lnum} Rnum={rnum} (require Lnum <= Rnum <= {max})")]
    InvalidThresholds {
        /// The requested merge threshold.
        lnum: u32,
        /// The requested split threshold.
        rnum: u32,
        /// `2*F`, the hard ceiling for `Rnum`.
        max: u32,
    },

    /// The node allocator has no room left in the pool.
    #[error("pool exhausted: no free node slots remain")]
    PoolExhausted,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
