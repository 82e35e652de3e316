// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// LRU ordering, rate-limited repositioning, refcount-aware eviction, and
// the lifecycle laws (replace, idempotent unlink, deref-frees).

use flatcache::{FlatStorage, ItemFlags, ItemPtr, UnlinkCause};

const MAXBYTES: usize = 8192;

fn engine() -> FlatStorage {
    FlatStorage::new(MAXBYTES).unwrap()
}

/// alloc + link + deref: a stored, unpinned item.
fn store(fs: &mut FlatStorage, key: &[u8], nbytes: usize) -> ItemPtr {
    let it = fs.item_alloc(key, 0, 0, nbytes, None).unwrap();
    fs.item_link(it, key);
    fs.item_deref(it);
    it
}

// --- ordering ---

#[test]
fn linked_items_count_and_ordering() {
    let mut fs = engine();
    store(&mut fs, b"a", 4);
    store(&mut fs, b"b", 4);
    store(&mut fs, b"c", 4);

    assert_eq!(fs.cache_stats().curr_items, 3);
    assert_eq!(fs.cache_stats().total_items, 3);
    fs.check_invariants();

    // newest first: the dump begins with the last stored key
    let dump = fs.cachedump(flatcache::ChunkClass::Small, 1);
    assert!(dump.starts_with("ITEM c "), "dump was {dump:?}");
}

#[test]
fn update_repositions_after_the_interval() {
    let mut fs = engine();
    let a = store(&mut fs, b"a", 4);
    store(&mut fs, b"b", 4);

    // too soon: a stays at the tail
    let before = fs.item_time(a);
    fs.item_update(a);
    assert_eq!(fs.item_time(a), before);

    // after the interval, a moves to the head
    fs.set_current_time(100);
    fs.item_update(a);
    assert_eq!(fs.item_time(a), 100);
    let dump = fs.cachedump(flatcache::ChunkClass::Small, 1);
    assert!(dump.starts_with("ITEM a "), "dump was {dump:?}");
    fs.check_invariants();
}

// --- eviction ---

#[test]
fn filling_past_capacity_evicts_the_tail() {
    let mut fs = engine();
    // four 2-chunk large items fill all 8 large chunks
    for i in 0..4 {
        let key = format!("key{i}");
        store(&mut fs, key.as_bytes(), 1000);
    }
    assert_eq!(fs.large_free_list_sz(), 0);
    assert_eq!(fs.unused_memory(), 0);

    // one more forces the oldest out
    store(&mut fs, b"key4", 1000);
    assert_eq!(fs.cache_stats().evictions, 1);
    assert_eq!(fs.cache_stats().curr_items, 4);
    assert!(fs.item_get(b"key0").is_none());
    let it = fs.item_get(b"key4").unwrap();
    fs.item_deref(it);
    fs.check_invariants();
}

#[test]
fn pinned_tail_items_are_skipped() {
    let mut fs = engine();
    for i in 0..4 {
        let key = format!("key{i}");
        store(&mut fs, key.as_bytes(), 1000);
    }

    // pin the oldest item; the evictor must pass over it
    let pinned = fs.item_get(b"key0").unwrap();
    store(&mut fs, b"key4", 1000);

    assert_eq!(fs.cache_stats().evictions, 1);
    assert!(fs.item_get(b"key1").is_none(), "key1 should have been evicted");
    let still = fs.item_get(b"key0");
    assert_eq!(still, Some(pinned));

    fs.item_deref(pinned);
    fs.item_deref(pinned);
    fs.check_invariants();
}

#[test]
fn eviction_fails_when_every_item_is_pinned() {
    let mut fs = engine();
    let mut pinned = Vec::new();
    for i in 0..4 {
        let key = format!("key{i}");
        let it = fs.item_alloc(key.as_bytes(), 0, 0, 1000, None).unwrap();
        fs.item_link(it, key.as_bytes());
        pinned.push(it); // keep the allocation reference
    }

    assert!(fs.item_alloc(b"key4", 0, 0, 1000, None).is_none());
    assert_eq!(fs.cache_stats().evictions, 0);

    for it in pinned {
        fs.item_deref(it);
    }
    fs.check_invariants();
}

// --- lifecycle laws ---

#[test]
fn replace_swaps_the_mapping_and_frees_the_old_item() {
    let mut fs = engine();
    let a = store(&mut fs, b"k", 10);
    let b = fs.item_alloc(b"k", 0, 0, 20, None).unwrap();

    fs.item_replace(a, b, b"k");

    let got = fs.item_get(b"k").unwrap();
    assert_eq!(got, b);
    assert_eq!(fs.item_nbytes(got), 20);
    assert_eq!(fs.cache_stats().curr_items, 1);
    // a's chunk was freed and is available again
    fs.check_invariants();

    fs.item_deref(b); // the get reference
    fs.item_deref(b); // the allocation reference
    fs.check_invariants();
}

#[test]
fn unlink_is_idempotent() {
    let mut fs = engine();
    let a = store(&mut fs, b"once", 4);
    let b = store(&mut fs, b"keep", 4);

    fs.item_unlink(a, UnlinkCause::Normal, Some(b"once"));
    assert_eq!(fs.cache_stats().curr_items, 1);

    // a was freed; a second unlink of the survivor is exercised instead,
    // twice, to prove idempotence on a live header
    let held = fs.item_get(b"keep").unwrap();
    assert_eq!(held, b);
    fs.item_unlink(b, UnlinkCause::Normal, Some(b"keep"));
    fs.item_unlink(b, UnlinkCause::Normal, Some(b"keep"));
    assert_eq!(fs.cache_stats().curr_items, 0);
    assert!(!fs.item_it_flags(b).contains(ItemFlags::LINKED));

    fs.item_deref(b); // frees it
    fs.check_invariants();
}

#[test]
fn deref_after_unlink_frees_the_item() {
    let mut fs = engine();
    let it = fs.item_alloc(b"held", 0, 0, 4, None).unwrap();
    fs.item_link(it, b"held");

    // still referenced by the allocator caller: unlink must not free
    fs.item_unlink(it, UnlinkCause::Normal, Some(b"held"));
    assert_eq!(fs.stats().small_title_chunks, 1);

    // the last deref does
    fs.item_deref(it);
    assert_eq!(fs.stats().small_title_chunks, 0);
    fs.check_invariants();
}

#[test]
fn unlink_without_key_recovers_it_from_the_chunks() {
    let mut fs = engine();
    let key = vec![b'q'; 200]; // spans the title into a body chunk
    let it = fs.item_alloc(&key, 0, 0, 10, None).unwrap();
    fs.item_link(it, &key);
    fs.item_deref(it);

    fs.item_unlink(it, UnlinkCause::Normal, None);
    assert_eq!(fs.cache_stats().curr_items, 0);
    assert!(fs.item_get(&key).is_none());
    fs.check_invariants();
}
