//! The node header: an opaque 64-bit word that is simultaneously state,
//! version, and publication act.
//!
//! Rather than scattering bitmask macros through the node and tree code (as
//! the C++ original does), the header is modeled as a `Copy` newtype with
//! accessor and "with"-style mutator methods, stored behind an
//! [`AtomicHeader`] for the single atomic load/store that is the node's only
//! publishing act.
//!
//! ```text
//! bit:   63        48 47        32 31 30 29 28 27 26 25 24           0
//!       |  version    |  number    |lazy |bot|obs| rightGen |reserved |
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

const VERSION_SHIFT: u32 = 48;
const NUMBER_SHIFT: u32 = 32;
const LAZY_SHIFT: u32 = 30;
const BOTTOM_BIT: u64 = 1 << 29;
const OBSOLETE_BIT: u64 = 1 << 28;
const RIGHT_GEN_SHIFT: u32 = 26;

const VERSION_MASK: u64 = 0xFFFF << VERSION_SHIFT;
const NUMBER_MASK: u64 = 0xFFFF << NUMBER_SHIFT;
const LAZY_MASK: u64 = 0b11 << LAZY_SHIFT;
const RIGHT_GEN_MASK: u64 = 0b1 << RIGHT_GEN_SHIFT;

/// Whether a node has a pending single-slot edit recorded in its lazy-box,
/// and if so which kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyFlag {
    /// No pending edit.
    Empty,
    /// One pending insertion.
    PendingInsert,
    /// One pending deletion.
    PendingDelete,
}

impl LazyFlag {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => LazyFlag::Empty,
            1 => LazyFlag::PendingInsert,
            2 => LazyFlag::PendingDelete,
            // bit pattern 3 is reserved and never produced by this crate.
            _ => LazyFlag::Empty,
        }
    }

    #[inline]
    fn to_bits(self) -> u64 {
        match self {
            LazyFlag::Empty => 0,
            LazyFlag::PendingInsert => 1,
            LazyFlag::PendingDelete => 2,
        }
    }

    /// The net effect of this flag on the logical pair count relative to the
    /// live shadow slot's raw length (`lazyAdj` in the data model).
    #[inline]
    pub fn count_adjustment(self) -> i32 {
        match self {
            LazyFlag::Empty => 0,
            LazyFlag::PendingInsert => 1,
            LazyFlag::PendingDelete => -1,
        }
    }
}

/// An immutable snapshot of a node's header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(u64);

impl Header {
    /// The all-zero header: version 0, count 0, no lazy-box, internal node,
    /// live, right generation 0.
    pub const EMPTY: Header = Header(0);

    #[inline]
    pub const fn from_raw(bits: u64) -> Self {
        Header(bits)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn version(self) -> u16 {
        ((self.0 & VERSION_MASK) >> VERSION_SHIFT) as u16
    }

    /// Parity of the version counter; selects which shadow slot is live.
    #[inline]
    pub fn version_parity(self) -> usize {
        (self.version() & 1) as usize
    }

    #[inline]
    pub fn number(self) -> u16 {
        ((self.0 & NUMBER_MASK) >> NUMBER_SHIFT) as u16
    }

    #[inline]
    pub fn lazy_flag(self) -> LazyFlag {
        LazyFlag::from_bits((self.0 & LAZY_MASK) >> LAZY_SHIFT)
    }

    #[inline]
    pub fn is_bottom(self) -> bool {
        self.0 & BOTTOM_BIT != 0
    }

    #[inline]
    pub fn is_obsolete(self) -> bool {
        self.0 & OBSOLETE_BIT != 0
    }

    #[inline]
    pub fn right_gen(self) -> usize {
        ((self.0 & RIGHT_GEN_MASK) >> RIGHT_GEN_SHIFT) as usize
    }

    /// The length of the live shadow slot's raw array data, derived from
    /// `number` and the lazy-box's count adjustment (`oldend`/`endlocation`
    /// in the original: the index of the last occupied raw slot).
    #[inline]
    pub fn raw_end(self) -> i32 {
        self.number() as i32 - 1 - self.lazy_flag().count_adjustment()
    }

    #[inline]
    pub fn builder() -> HeaderBuilder {
        HeaderBuilder(Header::EMPTY)
    }

    #[inline]
    pub fn to_builder(self) -> HeaderBuilder {
        HeaderBuilder(self)
    }

    /// True iff `self` and `other` describe the same structural state for
    /// read validation purposes: either the version is unchanged, or it
    /// advanced by exactly one step and the new state carries no pending
    /// lazy-box (a version bump with an empty lazy-box can only be a
    /// no-op-for-readers cache-line republish, never a structural change a
    /// reader must re-derive against).
    #[inline]
    pub fn read_check(self, other: Header) -> bool {
        let (ov, nv) = (self.version(), other.version());
        ov == nv || (ov.wrapping_add(1) == nv && other.lazy_flag() == LazyFlag::Empty)
    }

    /// True iff the logical pair count did not change between `self` and
    /// `other`; tolerates pure version/cache-line churn that left the
    /// node's content identical.
    #[inline]
    pub fn write_check(self, other: Header) -> bool {
        self.number() == other.number()
    }

    /// True iff the right-sibling generation selector is unchanged, i.e. the
    /// right pointer a reader cached is still the live one.
    #[inline]
    pub fn right_check(self, other: Header) -> bool {
        (self.0 & RIGHT_GEN_MASK) == (other.0 & RIGHT_GEN_MASK)
    }
}

/// Builder for producing a new [`Header`] value from an old one via small,
/// named deltas, mirroring the `header +/- addXxx_BITS` arithmetic of the
/// original without scattering bit shifts through the call sites.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBuilder(Header);

impl HeaderBuilder {
    #[inline]
    pub fn bump_version(mut self, by: u16) -> Self {
        let v = self.0.version().wrapping_add(by);
        self.0 .0 = (self.0 .0 & !VERSION_MASK) | ((v as u64) << VERSION_SHIFT);
        self
    }

    #[inline]
    pub fn add_count(mut self, delta: i32) -> Self {
        let n = (self.0.number() as i32 + delta) as u16;
        self.0 .0 = (self.0 .0 & !NUMBER_MASK) | ((n as u64) << NUMBER_SHIFT);
        self
    }

    #[inline]
    pub fn set_count(mut self, n: u16) -> Self {
        self.0 .0 = (self.0 .0 & !NUMBER_MASK) | ((n as u64) << NUMBER_SHIFT);
        self
    }

    #[inline]
    pub fn set_lazy_flag(mut self, flag: LazyFlag) -> Self {
        self.0 .0 = (self.0 .0 & !LAZY_MASK) | (flag.to_bits() << LAZY_SHIFT);
        self
    }

    #[inline]
    pub fn set_bottom(mut self, bottom: bool) -> Self {
        if bottom {
            self.0 .0 |= BOTTOM_BIT;
        } else {
            self.0 .0 &= !BOTTOM_BIT;
        }
        self
    }

    #[inline]
    pub fn set_obsolete(mut self, obsolete: bool) -> Self {
        if obsolete {
            self.0 .0 |= OBSOLETE_BIT;
        } else {
            self.0 .0 &= !OBSOLETE_BIT;
        }
        self
    }

    #[inline]
    pub fn flip_right_gen(mut self) -> Self {
        self.0 .0 ^= RIGHT_GEN_MASK;
        self
    }

    #[inline]
    pub fn build(self) -> Header {
        self.0
    }
}

/// An atomic cell holding a [`Header`]; `load`/`store` are the node's sole
/// publication points.
#[derive(Debug)]
pub struct AtomicHeader(AtomicU64);

impl AtomicHeader {
    #[inline]
    pub fn new(initial: Header) -> Self {
        AtomicHeader(AtomicU64::new(initial.raw()))
    }

    #[inline]
    pub fn load(&self) -> Header {
        Header::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Publish a new header. Callers are responsible for having flushed the
    /// body bytes this header makes reachable *before* calling this, and for
    /// flushing the header word itself afterward (see [`crate::pr::flush`]).
    #[inline]
    pub fn store(&self, new: Header) {
        self.0.store(new.raw(), Ordering::Release);
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u64 {
        self.0.as_ptr().cast_const()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let h = Header::builder()
            .bump_version(3)
            .set_count(7)
            .set_lazy_flag(LazyFlag::PendingInsert)
            .set_bottom(true)
            .build();
        assert_eq!(h.version(), 3);
        assert_eq!(h.number(), 7);
        assert_eq!(h.lazy_flag(), LazyFlag::PendingInsert);
        assert!(h.is_bottom());
        assert!(!h.is_obsolete());
        assert_eq!(h.right_gen(), 0);
    }

    #[test]
    fn read_check_tolerates_single_empty_bump() {
        let a = Header::builder().bump_version(4).build();
        let b = a.to_builder().bump_version(1).build();
        assert!(a.read_check(b));
    }

    #[test]
    fn read_check_rejects_bump_with_pending_lazybox() {
        let a = Header::builder().bump_version(4).build();
        let b = a
            .to_builder()
            .bump_version(1)
            .set_lazy_flag(LazyFlag::PendingInsert)
            .build();
        assert!(!a.read_check(b));
    }

    #[test]
    fn read_check_rejects_multi_version_jump() {
        let a = Header::builder().bump_version(4).build();
        let b = a.to_builder().bump_version(2).build();
        assert!(!a.read_check(b));
    }

    #[test]
    fn write_check_only_cares_about_count() {
        let a = Header::builder().set_count(5).build();
        let b = a.to_builder().bump_version(9).flip_right_gen().build();
        assert!(a.write_check(b));
        let c = a.to_builder().add_count(1).build();
        assert!(!a.write_check(c));
    }

    #[test]
    fn right_check_tracks_generation_only() {
        let a = Header::builder().build();
        let same = a.to_builder().bump_version(1).build();
        assert!(a.right_check(same));
        let flipped = a.to_builder().flip_right_gen().build();
        assert!(!a.right_check(flipped));
    }

    #[test]
    fn raw_end_accounts_for_lazy_adjustment() {
        let empty = Header::builder().set_count(5).build();
        assert_eq!(empty.raw_end(), 4);
        let pending_insert = empty.to_builder().set_lazy_flag(LazyFlag::PendingInsert).build();
        assert_eq!(pending_insert.raw_end(), 3);
        let pending_delete = empty.to_builder().set_lazy_flag(LazyFlag::PendingDelete).build();
        assert_eq!(pending_delete.raw_end(), 5);
    }
}
