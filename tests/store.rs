//! End-to-end tests against the public `KvStore` API, exercising the
//! scenarios spec.md §8 names directly (S3, S8-style permutation
//! invariance) plus a close/reopen durability round trip.

use std::collections::BTreeSet;

use kvstore::KvStore;
use quickcheck_macros::quickcheck;
use tempfile::tempdir;

fn store_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("store.kv")
}

#[test]
fn persistence_round_trip_s3() {
    let dir = tempdir().unwrap();
    let path = store_path(&dir);

    {
        let mut store = KvStore::open(&path).unwrap();
        for k in 1u64..=1000 {
            store.put(k, k * 10).unwrap();
        }
        store.close().unwrap();
    }

    let mut store = KvStore::open(&path).unwrap();
    assert_eq!(store.get(500).unwrap(), Some(5000));
    assert_eq!(store.record_num(), 1000);

    let mut cursor = store.open_cursor(0, u64::MAX).unwrap();
    let mut count = 0;
    while store.cursor_next(&mut cursor).unwrap().is_some() {
        count += 1;
    }
    store.close_cursor(cursor);
    assert_eq!(count, 1000);
    store.close().unwrap();
}

#[test]
fn reopen_preserves_every_value() {
    let dir = tempdir().unwrap();
    let path = store_path(&dir);

    let keys: Vec<u64> = (0..500).map(|i| i * 7 + 3).collect();
    {
        let mut store = KvStore::open(&path).unwrap();
        for &k in &keys {
            store.put(k, k.wrapping_mul(31)).unwrap();
        }
        store.close().unwrap();
    }

    let mut store = KvStore::open(&path).unwrap();
    for &k in &keys {
        assert_eq!(store.get(k).unwrap(), Some(k.wrapping_mul(31)));
    }
    store.close().unwrap();
}

#[test]
fn delete_to_empty_then_reopen_is_empty() {
    let dir = tempdir().unwrap();
    let path = store_path(&dir);

    {
        let mut store = KvStore::open(&path).unwrap();
        store.put(1, 1).unwrap();
        store.put(2, 2).unwrap();
        assert!(store.del(1).unwrap());
        assert!(store.del(2).unwrap());
        assert!(store.is_empty());
        store.close().unwrap();
    }

    let mut store = KvStore::open(&path).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.record_num(), 0);
    assert_eq!(store.get(1).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn range_cursor_excludes_upper_bound() {
    let dir = tempdir().unwrap();
    let mut store = KvStore::open(store_path(&dir)).unwrap();
    for k in [10u64, 20, 30, 40, 50] {
        store.put(k, k).unwrap();
    }
    let mut cursor = store.open_cursor(20, 40).unwrap();
    let mut out = Vec::new();
    while let Some(kv) = store.cursor_next(&mut cursor).unwrap() {
        out.push(kv);
    }
    store.close_cursor(cursor);
    assert_eq!(out, vec![(20, 20), (30, 30)]);
    store.close().unwrap();
}

#[quickcheck]
fn cursor_yields_permutation_in_sorted_order(keys: Vec<u64>) -> bool {
    let distinct: BTreeSet<u64> = keys.into_iter().collect();
    let dir = tempdir().unwrap();
    let mut store = KvStore::open(store_path(&dir)).unwrap();
    for &k in &distinct {
        store.put(k, k).unwrap();
    }

    let mut cursor = store.open_cursor(0, u64::MAX).unwrap();
    let mut seen = Vec::new();
    while let Some((k, v)) = store.cursor_next(&mut cursor).unwrap() {
        seen.push((k, v));
    }
    store.close_cursor(cursor);
    store.close().unwrap();

    let expected: Vec<(u64, u64)> = distinct.iter().map(|&k| (k, k)).collect();
    seen == expected
}

#[quickcheck]
fn replace_is_idempotent_on_record_num(k: u64, v1: u64, v2: u64) -> bool {
    let dir = tempdir().unwrap();
    let mut store = KvStore::open(store_path(&dir)).unwrap();
    store.put(k, v1).unwrap();
    let after_first = store.record_num();
    store.put(k, v2).unwrap();
    let after_second = store.record_num();
    let got = store.get(k).unwrap();
    store.close().unwrap();
    after_first == after_second && got == Some(v2)
}

#[quickcheck]
fn put_then_delete_is_not_found(k: u64, v: u64) -> bool {
    let dir = tempdir().unwrap();
    let mut store = KvStore::open(store_path(&dir)).unwrap();
    store.put(k, v).unwrap();
    let deleted = store.del(k).unwrap();
    let got = store.get(k).unwrap();
    store.close().unwrap();
    deleted && got.is_none()
}
