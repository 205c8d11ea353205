//! The persistent mutex primitive embedded in every node.
//!
//! The real PM allocator this crate's pool module stands in for would
//! normally also supply a persistent mutex (one that survives a crash in a
//! known-unlocked state, since the process holding it is gone). A byte-sized
//! lock word living inside the node itself gives us the same property
//! without needing OS/libpmemobj support: after a crash the mapped file is
//! reopened with every mutex word intact, and since nothing reads the lock
//! bit to decide correctness (only to serialize concurrent writers within a
//! single run), a stale "locked" bit left over from a crash would simply
//! wedge that node — which cannot happen, because the lock is only ever held
//! across a handful of non-blocking instructions before one of the
//! `upKey`/`downKey`/`split`/`merge` helpers returns.
//!
//! This is a compare-and-swap spinlock, the simplest variant from the
//! teacher's spinlock module, sized to one cache line so it never shares a
//! line with the header word it protects.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::Backoff;
use crate::pr;

/// A cache-line-sized, crash-safe (always starts unlocked) spinlock guarding
/// a node's body and header during structural mutation.
#[repr(C, align(64))]
pub struct PersistentMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> PersistentMutex<T> {
    /// Create a new, unlocked mutex.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock without blocking. Returns `None` if already held.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(MutexGuard { lock: self })
        }
    }

    /// Acquire the lock, spinning with exponential backoff if contended.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        pr::fence_acquire();
        MutexGuard { lock: self }
    }

    /// True if currently held by some thread. Racy by nature; used only for
    /// diagnostics.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

// SAFETY: access to the inner data is serialized by `locked`, exactly as for
// a standard library `Mutex`.
unsafe impl<T: Send + ?Sized> Send for PersistentMutex<T> {}
unsafe impl<T: Send + ?Sized> Sync for PersistentMutex<T> {}

/// RAII guard releasing a [`PersistentMutex`] on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a PersistentMutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        pr::fence_release();
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_unlocked() {
        let m = PersistentMutex::new(0u64);
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = PersistentMutex::new(0u64);
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let m = Arc::new(PersistentMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 8000);
    }
}
