//! End-to-end, multi-threaded scenarios exercising the public `Tree` facade.

use std::sync::Arc;
use std::thread;

use pmbtree::{Tree, TreeConfig};

fn open_tmp(pool_size: u64) -> (tempfile::TempPath, Tree) {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.into_temp_path();
    let tree = Tree::open(&path, TreeConfig::new(pool_size)).unwrap();
    (path, tree)
}

/// E1: sequential insert, then point lookups and a full-range scan agree.
#[test]
fn sequential_insert_then_lookup_and_scan() {
    let (_path, tree) = open_tmp(16 << 20);
    let thread = tree.register_thread();

    for i in 1..1000u64 {
        tree.put(i, i, &thread).unwrap();
    }
    for i in 1..1000u64 {
        assert_eq!(tree.lookup(i, &thread), Some(i));
    }

    let mut results = [0u64; 1000];
    let n = tree.scan(1, 999, &mut results, &thread);
    assert_eq!(n, 999);
    for (idx, value) in results[..n].iter().enumerate() {
        assert_eq!(*value, (idx + 1) as u64);
    }
}

/// E2: a removed key disappears, and can be reinserted with a new value.
#[test]
fn delete_then_reinsert() {
    let (_path, tree) = open_tmp(16 << 20);
    let thread = tree.register_thread();

    for i in 1..1000u64 {
        tree.put(i, i, &thread).unwrap();
    }

    tree.remove(500, &thread).unwrap();
    assert_eq!(tree.lookup(500, &thread), None);

    tree.put(500, 999, &thread).unwrap();
    assert_eq!(tree.lookup(500, &thread), Some(999));
}

/// E3: `update` overwrites an existing key's value in place.
#[test]
fn update_existing_key() {
    let (_path, tree) = open_tmp(4 << 20);
    let thread = tree.register_thread();

    tree.put(7, 7, &thread).unwrap();
    tree.update(7, 42, &thread).unwrap();
    assert_eq!(tree.lookup(7, &thread), Some(42));
}

/// `update` on an absent key is a no-op: it must not insert.
#[test]
fn update_on_absent_key_is_a_no_op() {
    let (_path, tree) = open_tmp(4 << 20);
    let thread = tree.register_thread();

    tree.update(9, 90, &thread).unwrap();
    assert_eq!(tree.lookup(9, &thread), None);
}

/// `upsert` does insert on an absent key, unlike `update`.
#[test]
fn upsert_inserts_when_absent() {
    let (_path, tree) = open_tmp(4 << 20);
    let thread = tree.register_thread();

    tree.upsert(9, 90, &thread).unwrap();
    assert_eq!(tree.lookup(9, &thread), Some(90));

    tree.upsert(9, 91, &thread).unwrap();
    assert_eq!(tree.lookup(9, &thread), Some(91));
}

/// E4: a bounded scan returns exactly the keys within `[min, max]`.
#[test]
fn bounded_scan_returns_exact_window() {
    let (_path, tree) = open_tmp(16 << 20);
    let thread = tree.register_thread();

    for i in 1..1000u64 {
        tree.put(i, i, &thread).unwrap();
    }

    let mut results = [0u64; 100];
    let n = tree.scan(250, 260, &mut results, &thread);
    assert_eq!(n, 11);
    let expected: Vec<u64> = (250..=260).collect();
    assert_eq!(&results[..n], expected.as_slice());
}

/// E5: several threads hammering disjoint key ranges never lose or
/// corrupt a value that should be present, and lookups never observe a
/// partially-written pair.
#[test]
fn concurrent_disjoint_ranges_stay_consistent() {
    let (_path, tree) = open_tmp(64 << 20);
    let tree = Arc::new(tree);
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 2000;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let info = tree.register_thread();
                let base = t * PER_THREAD;
                for offset in 0..PER_THREAD {
                    let key = base + offset + 1;
                    tree.put(key, key * 2, &info).unwrap();
                    assert_eq!(tree.lookup(key, &info), Some(key * 2));
                }
                for offset in (0..PER_THREAD).step_by(2) {
                    let key = base + offset + 1;
                    tree.remove(key, &info).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let info = tree.register_thread();
    for t in 0..THREADS {
        let base = t * PER_THREAD;
        for offset in 0..PER_THREAD {
            let key = base + offset + 1;
            let expected = if offset % 2 == 0 { None } else { Some(key * 2) };
            assert_eq!(tree.lookup(key, &info), expected);
        }
    }
}

/// E6 (crash recovery, approximated): everything acknowledged before the
/// pool is dropped and reopened via recovery is still present afterward;
/// nothing half-written is ever observed.
#[test]
fn recovery_preserves_every_acknowledged_key() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.into_temp_path();

    {
        let tree = Tree::open(&path, TreeConfig::new(16 << 20)).unwrap();
        let thread = tree.register_thread();
        for i in 1..500u64 {
            tree.put(i, i, &thread).unwrap();
        }
    }

    let tree = Tree::recover(&path).unwrap();
    let thread = tree.register_thread();
    for i in 1..500u64 {
        assert_eq!(tree.lookup(i, &thread), Some(i));
    }
}

/// `TreeConfig` rejects thresholds that violate `Lnum <= Rnum <= 2*F`.
#[test]
fn open_rejects_invalid_thresholds() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.into_temp_path();
    let bad = TreeConfig { pool_size: 4 << 20, lnum: 30, rnum: 10 };
    assert!(Tree::open(&path, bad).is_err());
}
