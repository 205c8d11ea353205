//! The memory-mapped backing pool.
//!
//! The original targets Intel's `libpmemobj`: a persistent-memory object
//! store that supplies typed allocation, an allocation-class sized to the
//! node record, and crash-safe mutexes. None of that is available as an
//! off-the-shelf Rust crate, so this module is this crate's own reference
//! stand-in — clearly isolated behind the [`crate::node::NodeSource`] trait
//! so a real deployment on PM hardware could swap it for one built on
//! `libpmemobj`-sys or a raw `/dev/dax` mapping without touching
//! [`crate::node_ops`] or [`crate::tree`].
//!
//! Layout: a fixed-size [`RootRecord`] at the start of the file, followed by
//! a flat array of [`Node`](crate::node::Node) slots. Allocation is a free
//! list (for reclaimed slots) backed by a bump pointer (for slots never
//! used); both live only in memory; since this crate does not replay any
//! allocator journal on recovery, a slot that was allocated but never linked
//! in before a crash is leaked rather than reclaimed; the real PM
//! allocator's own leak recovery (out of scope here) handles that case.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::node::{Node, NodeOff, NodeSource};

const MAGIC: u64 = 0x504D_4254_5245_4531; // "PMBTREE1" packed into 8 bytes, little-endian-agnostic.

/// The pool's root record: everything needed to resume a tree after
/// recovery, without replaying any log.
#[repr(C)]
struct RootRecord {
    magic: u64,
    head_off: AtomicU64,
    tail_off: AtomicU64,
    root_off: AtomicU64,
    lnum: u32,
    rnum: u32,
    node_capacity: u64,
    bump_next: AtomicU64,
}

const ROOT_REGION_SIZE: usize = 256; // one allocation-class alignment unit.

/// A memory-mapped, node-addressable arena plus a free list for reclaimed
/// slots.
pub struct Pool {
    _file: File,
    mmap: MmapMut,
    free_list: Mutex<Vec<NodeOff>>,
}

impl Pool {
    fn root(&self) -> &RootRecord {
        unsafe { &*(self.mmap.as_ptr() as *const RootRecord) }
    }

    fn node_region(&self) -> *const Node {
        unsafe { self.mmap.as_ptr().add(ROOT_REGION_SIZE) as *const Node }
    }

    fn node_capacity(&self) -> u64 {
        self.root().node_capacity
    }

    /// Create a fresh pool file of `pool_size` bytes at `path`, laying down
    /// an empty root record. The tree's bootstrap (see [`crate::bootstrap`])
    /// is responsible for installing the head/tail/root nodes afterward.
    pub fn create(path: impl AsRef<Path>, pool_size: u64, lnum: u32, rnum: u32) -> Result<Pool> {
        let path = path.as_ref();
        let open = |p: &Path| -> std::io::Result<File> {
            let f = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(p)?;
            f.set_len(pool_size)?;
            Ok(f)
        };
        let file = open(path).map_err(|source| Error::PoolOpen { path: PathBuf::from(path), source })?;
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|source| Error::PoolOpen { path: PathBuf::from(path), source })?;

        let node_capacity = (pool_size as usize - ROOT_REGION_SIZE) / std::mem::size_of::<Node>();
        let root = RootRecord {
            magic: MAGIC,
            head_off: AtomicU64::new(crate::node::NIL),
            tail_off: AtomicU64::new(crate::node::NIL),
            root_off: AtomicU64::new(crate::node::NIL),
            lnum,
            rnum,
            node_capacity: node_capacity as u64,
            bump_next: AtomicU64::new(0),
        };
        unsafe {
            std::ptr::write(mmap.as_mut_ptr() as *mut RootRecord, root);
        }
        mmap.flush().map_err(|source| Error::PoolOpen { path: PathBuf::from(path), source })?;

        Ok(Pool { _file: file, mmap, free_list: Mutex::new(Vec::new()) })
    }

    /// Reopen an existing pool file and validate its root record.
    pub fn recover(path: impl AsRef<Path>) -> Result<Pool> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::PoolOpen { path: PathBuf::from(path), source })?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|source| Error::PoolOpen { path: PathBuf::from(path), source })?;

        let pool = Pool { _file: file, mmap, free_list: Mutex::new(Vec::new()) };
        if pool.root().magic != MAGIC {
            return Err(Error::InvalidPool { path: PathBuf::from(path) });
        }
        Ok(pool)
    }

    pub fn head_off(&self) -> NodeOff {
        self.root().head_off.load(Ordering::Acquire)
    }

    pub fn set_head_off(&self, off: NodeOff) {
        self.root().head_off.store(off, Ordering::Release);
    }

    pub fn tail_off(&self) -> NodeOff {
        self.root().tail_off.load(Ordering::Acquire)
    }

    pub fn set_tail_off(&self, off: NodeOff) {
        self.root().tail_off.store(off, Ordering::Release);
    }

    pub fn root_off(&self) -> NodeOff {
        self.root().root_off.load(Ordering::Acquire)
    }

    pub fn set_root_off(&self, off: NodeOff) {
        self.root().root_off.store(off, Ordering::Release);
    }

    pub fn lnum(&self) -> u32 {
        self.root().lnum
    }

    pub fn rnum(&self) -> u32 {
        self.root().rnum
    }

    /// Return a previously allocated node to the free list for reuse, once
    /// the epoch reclaimer has established no reader can still see it.
    pub fn retire(&self, off: NodeOff) {
        self.free_list.lock().unwrap().push(off);
    }
}

impl NodeSource for Pool {
    fn node_at(&self, off: NodeOff) -> &Node {
        assert!(off < self.node_capacity(), "node offset out of range");
        unsafe { &*self.node_region().add(off as usize) }
    }

    fn alloc_node(&self) -> Result<NodeOff> {
        if let Some(off) = self.free_list.lock().unwrap().pop() {
            self.node_at(off).reset();
            return Ok(off);
        }
        let off = self.root().bump_next.fetch_add(1, Ordering::AcqRel);
        if off >= self.node_capacity() {
            return Err(Error::PoolExhausted);
        }
        Ok(off)
    }

    fn offset_of(&self, node: &Node) -> NodeOff {
        let base = self.node_region() as usize;
        let addr = node as *const Node as usize;
        ((addr - base) / std::mem::size_of::<Node>()) as NodeOff
    }
}

// SAFETY: every mutation through `Pool` goes through `Node`'s own interior
// synchronization (atomics + `PersistentMutex`) or the free list's `Mutex`;
// the raw mmap pointer itself is never written outside of `create`/`alloc_node`.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_then_recover_round_trips_thresholds() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let pool = Pool::create(tmp.path(), 4 << 20, 14, 27).unwrap();
            assert_eq!(pool.lnum(), 14);
            assert_eq!(pool.rnum(), 27);
        }
        let pool = Pool::recover(tmp.path()).unwrap();
        assert_eq!(pool.lnum(), 14);
        assert_eq!(pool.rnum(), 27);
    }

    #[test]
    fn recover_rejects_a_foreign_file() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a pool").unwrap();
        assert!(Pool::recover(tmp.path()).is_err());
    }

    #[test]
    fn alloc_node_reuses_retired_offsets() {
        let tmp = NamedTempFile::new().unwrap();
        let pool = Pool::create(tmp.path(), 1 << 20, 14, 27).unwrap();
        let a = pool.alloc_node().unwrap();
        pool.retire(a);
        let b = pool.alloc_node().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_node_fails_once_capacity_is_exhausted() {
        let tmp = NamedTempFile::new().unwrap();
        // A pool just big enough for the root record plus two nodes.
        let size = ROOT_REGION_SIZE as u64 + 2 * std::mem::size_of::<Node>() as u64;
        let pool = Pool::create(tmp.path(), size, 14, 27).unwrap();
        pool.alloc_node().unwrap();
        pool.alloc_node().unwrap();
        assert!(matches!(pool.alloc_node(), Err(Error::PoolExhausted)));
    }
}
