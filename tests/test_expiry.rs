// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// Time-driven behaviour: per-item exptime, the oldest_live flush barrier,
// the flush sweep, and delete-locks.

use flatcache::{FlatStorage, ItemPtr};

const MAXBYTES: usize = 8192;

fn engine() -> FlatStorage {
    FlatStorage::new(MAXBYTES).unwrap()
}

fn store(fs: &mut FlatStorage, key: &[u8], exptime: u32) -> ItemPtr {
    let it = fs.item_alloc(key, 0, exptime, 4, None).unwrap();
    fs.item_link(it, key);
    fs.item_deref(it);
    it
}

// --- per-item expiry ---

#[test]
fn get_expires_items_past_their_exptime() {
    let mut fs = engine();
    fs.set_current_time(5);
    store(&mut fs, b"mortal", 8);
    store(&mut fs, b"eternal", 0);

    fs.set_current_time(9);
    assert!(fs.item_get(b"mortal").is_none());
    assert_eq!(fs.cache_stats().expires, 1);
    assert_eq!(fs.cache_stats().evictions, 0);

    let it = fs.item_get(b"eternal").unwrap();
    fs.item_deref(it);
    assert_eq!(fs.cache_stats().curr_items, 1);
    fs.check_invariants();
}

#[test]
fn get_just_before_exptime_still_hits() {
    let mut fs = engine();
    fs.set_current_time(5);
    store(&mut fs, b"k", 8);

    fs.set_current_time(7);
    let it = fs.item_get(b"k").unwrap();
    fs.item_deref(it);

    // exptime is inclusive: at t == exptime the item is gone
    fs.set_current_time(8);
    assert!(fs.item_get(b"k").is_none());
    fs.check_invariants();
}

// --- flush barrier ---

#[test]
fn oldest_live_expires_on_access() {
    let mut fs = engine();
    fs.set_current_time(5);
    store(&mut fs, b"stale", 0);

    fs.set_oldest_live(5);
    fs.set_current_time(10);

    assert!(fs.item_get(b"stale").is_none());
    assert_eq!(fs.cache_stats().expires, 1);
    assert_eq!(fs.cache_stats().evictions, 0);
    fs.check_invariants();
}

#[test]
fn flush_expired_sweeps_items_at_or_after_the_barrier() {
    let mut fs = engine();
    fs.set_current_time(5);
    store(&mut fs, b"t5", 0);
    fs.set_current_time(6);
    store(&mut fs, b"t6", 0);
    fs.set_current_time(7);
    store(&mut fs, b"t7", 0);

    fs.set_oldest_live(6);
    fs.set_current_time(8);
    fs.item_flush_expired();

    // items stored at or after the barrier were swept eagerly
    assert_eq!(fs.cache_stats().curr_items, 1);
    assert_eq!(fs.cache_stats().expires, 2);
    fs.check_invariants();
}

#[test]
fn flush_expired_without_a_barrier_is_a_no_op() {
    let mut fs = engine();
    fs.set_current_time(5);
    store(&mut fs, b"k", 0);
    fs.item_flush_expired();
    assert_eq!(fs.cache_stats().curr_items, 1);
    fs.check_invariants();
}

// --- delete-lock ---

#[test]
fn delete_locked_items_report_as_locked_not_missing() {
    let mut fs = engine();
    fs.set_current_time(10);
    store(&mut fs, b"dl", 0);

    // take a reference and lock the item for five seconds
    let held = fs.item_get(b"dl").unwrap();
    fs.item_mark_deleted(held, 15);

    let (it, locked) = fs.item_get_notedeleted(b"dl");
    assert!(it.is_none());
    assert!(locked, "should be reported as delete-locked");

    // a plain miss is not delete-locked
    let (it, locked) = fs.item_get_notedeleted(b"absent");
    assert!(it.is_none());
    assert!(!locked);

    // nocheck bypasses the lock entirely
    let raw = fs.item_get_nocheck(b"dl").unwrap();
    assert_eq!(raw, held);
    fs.item_deref(raw);

    // lock holder releases
    fs.item_unmark_deleted(held);
    fs.item_deref(held);
    fs.check_invariants();
}

#[test]
fn lapsed_delete_lock_expires_the_item() {
    let mut fs = engine();
    fs.set_current_time(10);
    store(&mut fs, b"dl", 0);

    let held = fs.item_get(b"dl").unwrap();
    fs.item_mark_deleted(held, 15);
    assert!(!fs.item_delete_lock_over(held));

    fs.set_current_time(20);
    assert!(fs.item_delete_lock_over(held));

    // past the lock, the exptime check reclaims it on access
    let (it, locked) = fs.item_get_notedeleted(b"dl");
    assert!(it.is_none());
    assert!(!locked);
    assert_eq!(fs.cache_stats().curr_items, 0);

    // the holder's reference kept the chunks alive until now
    fs.item_unmark_deleted(held);
    fs.item_deref(held);
    fs.check_invariants();
}
