//! Atomic memory barriers and the persistent flush primitive.
//!
//! This module provides the handful of low-level operations every other
//! module in the crate is built from: memory fences with explicit ordering
//! semantics, a CPU pause hint for spin loops, and [`flush`], the cache-line
//! writeback that gives the tree its crash-consistency guarantees.
//!
//! # Memory ordering
//!
//! - [`fence_acquire`]: acquire fence.
//! - [`fence_release`]: release fence.
//! - [`fence_memory`]: full (sequentially consistent) fence, used as the
//!   store-drain half of [`flush`].
//!
//! # Durability
//!
//! [`flush`] writes back whole cache lines covering a byte range and,
//! depending on `fence_before`/`fence_after`, brackets the writeback with a
//! store-drain. The contract matches the original design: bytes are durable
//! before a trailing fence returns. On targets without a cache-line
//! writeback instruction the flush degrades to a fence-only no-op; callers
//! still get ordering, just not a hardware guarantee of durability, which is
//! adequate for the `mmap`-backed pool this crate ships (the kernel's own
//! writeback eventually persists the pages).

use std::sync::atomic::{fence, Ordering};

/// Cache line size assumed by [`flush`]. Correct for essentially all
/// current x86_64 and aarch64 parts; a device with a different granularity
/// would need its own build of this module.
pub const CACHE_LINE_SIZE: usize = 64;

/// Acquire fence - operations before it cannot be reordered after it.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence - operations after it cannot be reordered before it.
#[inline(always)]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Full (store-drain) fence - the strongest ordering guarantee available.
#[inline(always)]
pub fn fence_memory() {
    fence(Ordering::SeqCst);
}

/// CPU pause hint for spin loops; reduces power draw and contention on the
/// coherence fabric while a spinlock or restart loop is spinning.
#[inline(always)]
pub fn stall() {
    std::hint::spin_loop();
}

/// Flush `len` bytes starting at `addr` to persistence.
///
/// Issues a cache-line writeback for every whole cache line covering
/// `[addr, addr+len)`, in ascending address order, optionally bracketed by a
/// store-drain fence. `fence_before` drains outstanding stores before the
/// first writeback is issued (needed when the caller cares that writes
/// older than this flush are also ordered ahead of it); `fence_after` drains
/// after the last writeback (needed when the caller is about to treat the
/// flushed range as durable, e.g. right before or after the header store
/// that publishes it).
///
/// # Safety
///
/// `addr` must be valid for reads of `len` bytes for the duration of the
/// call.
pub unsafe fn flush(addr: *const u8, len: usize, fence_before: bool, fence_after: bool) {
    if fence_before {
        fence_memory();
    }

    if len != 0 {
        let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            writeback_line(line as *const u8);
            line += CACHE_LINE_SIZE;
        }
    }

    if fence_after {
        fence_memory();
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn writeback_line(line: *const u8) {
    // `clwb`/`clflushopt` would be cheaper, but this toolchain's
    // `std::arch::x86_64` does not expose those intrinsics (nor does
    // `is_x86_feature_detected!` accept their feature strings), so we use
    // the always-available `clflush`, which gives the same writeback.
    std::arch::x86_64::_mm_clflush(line);
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
unsafe fn writeback_line(_line: *const u8) {
    // No portable cache-line writeback instruction; durability rests on the
    // store-drain fences around the call plus the OS's own page writeback
    // for the mmap-backed pool.
}

/// One-ahead software prefetch used by the linear node search.
#[inline(always)]
pub fn prefetch(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(addr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_does_not_panic_on_unaligned_ranges() {
        let buf = [0u8; 200];
        unsafe {
            flush(buf.as_ptr().add(3), 130, true, true);
        }
    }

    #[test]
    fn flush_zero_length_is_a_no_op_walk() {
        let buf = [0u8; 64];
        unsafe {
            flush(buf.as_ptr(), 0, false, false);
        }
    }
}
