// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// The engine handle: region, chunk metadata, both free lists, the LRU
// ends, counters, and the external collaborators (assoc table, clock,
// settings).  `&mut self` is the cache lock: every mutation of this
// state runs to completion from the caller's perspective.
//
// This file carries construction, region growth, and the free-list /
// break / unbreak machinery.  The coalescer, the LRU, and the item
// lifecycle live in sibling files as further impl blocks.

use std::io;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::assoc::{AssocTable, HashAssoc};
use crate::chunk::{
    chunks_needed_in_class, ChunkClass, ChunkPtr, ItemPtr, RelTime, FLAT_STORAGE_INCREMENT_DELTA,
    KEY_MAX_LENGTH, SMALL_CHUNKS_PER_LARGE_CHUNK,
};
use crate::header::{ItemFlags, ItemHeader, LargeChunkState, SmallChunkState};
use crate::region::Region;
use crate::stats::{CacheStats, FlatStats};

/// The flat storage engine.
///
/// All chunk metadata is held here, one tagged variant per initialized
/// large chunk; the region holds payload bytes only.  Items are
/// identified by the `ChunkPtr` of their title chunk.
pub struct FlatStorage<A: AssocTable = HashAssoc> {
    pub(crate) region: Region,
    /// One entry per initialized large chunk; `meta.len()` is the
    /// initialized watermark.
    pub(crate) meta: Vec<LargeChunkState>,
    pub(crate) large_free_list: ChunkPtr,
    pub(crate) large_free_list_sz: usize,
    pub(crate) small_free_list: ChunkPtr,
    pub(crate) small_free_list_sz: usize,
    pub(crate) lru_head: ItemPtr,
    pub(crate) lru_tail: ItemPtr,
    pub(crate) stats: FlatStats,
    pub(crate) cache_stats: Mutex<CacheStats>,
    pub(crate) assoc: A,
    /// Wall-clock epoch of engine start, in seconds.
    started: u64,
    /// Relative seconds since start; advanced by the caller.
    current_time: RelTime,
    /// Flush barrier: items stored at or before this time are dead.
    oldest_live: RelTime,
}

impl FlatStorage<HashAssoc> {
    /// Create an engine over `maxbytes` of capacity with the default
    /// hash-map assoc table.
    pub fn new(maxbytes: usize) -> io::Result<Self> {
        Self::with_assoc(maxbytes, HashAssoc::new())
    }
}

impl<A: AssocTable> FlatStorage<A> {
    /// Create an engine over `maxbytes` of capacity.  `maxbytes` must be
    /// a nonzero multiple of both `LARGE_CHUNK_SZ` and
    /// `FLAT_STORAGE_INCREMENT_DELTA`.
    pub fn with_assoc(maxbytes: usize, assoc: A) -> io::Result<Self> {
        let region = Region::new(maxbytes)?;
        let total = region.total_large();

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut fs = FlatStorage {
            region,
            meta: Vec::with_capacity(total),
            large_free_list: ChunkPtr::NULL,
            large_free_list_sz: 0,
            small_free_list: ChunkPtr::NULL,
            small_free_list_sz: 0,
            lru_head: ChunkPtr::NULL,
            lru_tail: ChunkPtr::NULL,
            stats: FlatStats::new(),
            cache_stats: Mutex::new(CacheStats::default()),
            assoc,
            started,
            current_time: 0,
            oldest_live: 0,
        };

        // seed the large free list; cannot fail with a validated maxbytes
        let grew = fs.grow();
        assert!(grew && fs.large_free_list_sz != 0);

        Ok(fs)
    }

    /// Commit `FLAT_STORAGE_INCREMENT_DELTA` more bytes of the region and
    /// push the new slots onto the large free list.  Returns false when
    /// the capacity budget is exhausted.
    pub fn grow(&mut self) -> bool {
        let Some(range) = self.region.commit() else {
            return false;
        };
        self.cache_stats.lock().unwrap().item_storage_allocated +=
            FLAT_STORAGE_INCREMENT_DELTA as u64;
        for idx in range {
            assert_eq!(idx, self.meta.len());
            self.meta.push(LargeChunkState::Reserved);
            self.push_free_large(ChunkPtr::from_parts(idx, 0));
        }
        true
    }

    // -----------------------------------------------------------------------
    // Collaborator access
    // -----------------------------------------------------------------------

    /// Relative seconds since engine start.
    pub fn current_time(&self) -> RelTime {
        self.current_time
    }

    /// Advance (or rewind, in tests) the relative clock.
    pub fn set_current_time(&mut self, now: RelTime) {
        self.current_time = now;
    }

    /// Wall-clock epoch of engine start, in seconds.
    pub fn started(&self) -> u64 {
        self.started
    }

    /// The flush barrier.
    pub fn oldest_live(&self) -> RelTime {
        self.oldest_live
    }

    /// Set the flush barrier: items stored at or before `t` are treated
    /// as expired.
    pub fn set_oldest_live(&mut self, t: RelTime) {
        self.oldest_live = t;
    }

    /// Allocator counters.
    pub fn stats(&self) -> &FlatStats {
        &self.stats
    }

    /// Snapshot of the item-level counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats.lock().unwrap().clone()
    }

    /// The assoc table.
    pub fn assoc(&self) -> &A {
        &self.assoc
    }

    /// Current length of the large free list.
    pub fn large_free_list_sz(&self) -> usize {
        self.large_free_list_sz
    }

    /// Current length of the small free list.
    pub fn small_free_list_sz(&self) -> usize {
        self.small_free_list_sz
    }

    /// Bytes of capacity not yet committed.
    pub fn unused_memory(&self) -> usize {
        self.region.unused_memory()
    }

    // -----------------------------------------------------------------------
    // Metadata access
    // -----------------------------------------------------------------------

    /// State of the small chunk `chunk`.  The parent must be broken.
    pub(crate) fn small_state(&self, chunk: ChunkPtr) -> &SmallChunkState {
        match &self.meta[chunk.large_index()] {
            LargeChunkState::Broken { children, .. } => &children[chunk.small_index()],
            other => panic!("parent of {chunk:?} is not broken: {other:?}"),
        }
    }

    pub(crate) fn small_state_mut(&mut self, chunk: ChunkPtr) -> &mut SmallChunkState {
        match &mut self.meta[chunk.large_index()] {
            LargeChunkState::Broken { children, .. } => &mut children[chunk.small_index()],
            other => panic!("parent of {chunk:?} is not broken: {other:?}"),
        }
    }

    /// Header of the item whose title chunk is `it`.
    pub(crate) fn header(&self, it: ItemPtr) -> &ItemHeader {
        match &self.meta[it.large_index()] {
            LargeChunkState::Title(h) => h,
            LargeChunkState::Broken { children, .. } => match &children[it.small_index()] {
                SmallChunkState::Title(h) => h,
                other => panic!("{it:?} is not a title chunk: {other:?}"),
            },
            other => panic!("{it:?} is not a title chunk: {other:?}"),
        }
    }

    pub(crate) fn header_mut(&mut self, it: ItemPtr) -> &mut ItemHeader {
        match &mut self.meta[it.large_index()] {
            LargeChunkState::Title(h) => h,
            LargeChunkState::Broken { children, .. } => match &mut children[it.small_index()] {
                SmallChunkState::Title(h) => h,
                other => panic!("{it:?} is not a title chunk: {other:?}"),
            },
            other => panic!("{it:?} is not a title chunk: {other:?}"),
        }
    }

    /// Whether `it` is stored in large chunks.
    pub fn is_item_large_chunk(&self, it: ItemPtr) -> bool {
        match &self.meta[it.large_index()] {
            LargeChunkState::Title(_) => true,
            LargeChunkState::Broken { .. } => false,
            other => panic!("{it:?} is not a title chunk: {other:?}"),
        }
    }

    /// The size class `it` is stored in.
    pub fn item_class(&self, it: ItemPtr) -> ChunkClass {
        if self.is_item_large_chunk(it) {
            ChunkClass::Large
        } else {
            ChunkClass::Small
        }
    }

    /// Number of chunks in `it`'s chain.
    pub(crate) fn chunks_in_item(&self, it: ItemPtr) -> usize {
        let h = self.header(it);
        chunks_needed_in_class(self.item_class(it), h.nkey as usize, h.nbytes as usize)
    }

    // -----------------------------------------------------------------------
    // Free lists
    // -----------------------------------------------------------------------

    /// Push a reserved large chunk onto the large free list.  Large-class
    /// pushes never merge.
    pub(crate) fn push_free_large(&mut self, chunk: ChunkPtr) {
        let idx = chunk.large_index();
        assert!(matches!(&self.meta[idx], LargeChunkState::Reserved));
        self.meta[idx] = LargeChunkState::Free {
            next: self.large_free_list,
        };
        self.large_free_list = chunk;
        self.large_free_list_sz += 1;
    }

    /// Pop the most recently freed large chunk.  The returned chunk is
    /// reserved: allocated but not yet typed.
    pub(crate) fn pop_free_large(&mut self) -> Option<ChunkPtr> {
        if self.large_free_list_sz == 0 {
            return None;
        }
        let chunk = self.large_free_list;
        let next = match &self.meta[chunk.large_index()] {
            LargeChunkState::Free { next } => *next,
            other => panic!("large free list head is {other:?}"),
        };
        self.large_free_list = next;
        self.large_free_list_sz -= 1;
        self.meta[chunk.large_index()] = LargeChunkState::Reserved;
        Some(chunk)
    }

    /// Push a reserved small chunk onto the small free list, adjusting
    /// the parent's allocated count and the histogram.  When `try_merge`
    /// is set, unbreak the parent if this made it fully free.
    pub(crate) fn push_free_small(&mut self, chunk: ChunkPtr, try_merge: bool) {
        let parent = chunk.large_index();

        let old_alloc = match &mut self.meta[parent] {
            LargeChunkState::Broken { allocated, .. } => {
                let old = *allocated as usize;
                assert!(old > 0);
                *allocated -= 1;
                old
            }
            other => panic!("parent of {chunk:?} is not broken: {other:?}"),
        };
        self.stats.broken_chunk_histogram[old_alloc] -= 1;
        self.stats.broken_chunk_histogram[old_alloc - 1] += 1;

        let head = self.small_free_list;
        if !head.is_null() {
            match self.small_state_mut(head) {
                SmallChunkState::Free { prev, .. } => *prev = chunk,
                other => panic!("small free list head is {other:?}"),
            }
        }
        *self.small_state_mut(chunk) = SmallChunkState::Free {
            next: head,
            prev: ChunkPtr::NULL,
        };
        self.small_free_list = chunk;
        self.small_free_list_sz += 1;

        if try_merge {
            self.unbreak_large_chunk(parent, false);
        }
    }

    /// Pop the most recently freed small chunk.  The returned chunk is
    /// reserved: allocated but not yet typed.
    pub(crate) fn pop_free_small(&mut self) -> Option<ChunkPtr> {
        if self.small_free_list_sz == 0 {
            return None;
        }
        let chunk = self.small_free_list;

        match &mut self.meta[chunk.large_index()] {
            LargeChunkState::Broken { allocated, .. } => {
                let old = *allocated as usize;
                *allocated += 1;
                assert!(*allocated as usize <= SMALL_CHUNKS_PER_LARGE_CHUNK);
                self.stats.broken_chunk_histogram[old] -= 1;
                self.stats.broken_chunk_histogram[old + 1] += 1;
            }
            other => panic!("parent of {chunk:?} is not broken: {other:?}"),
        }

        let next = match self.small_state(chunk) {
            SmallChunkState::Free { next, prev } => {
                assert!(prev.is_null());
                *next
            }
            other => panic!("small free list head is {other:?}"),
        };
        self.small_free_list = next;
        if !next.is_null() {
            match self.small_state_mut(next) {
                SmallChunkState::Free { prev, .. } => *prev = ChunkPtr::NULL,
                other => panic!("small free list link is {other:?}"),
            }
        }
        self.small_free_list_sz -= 1;
        *self.small_state_mut(chunk) = SmallChunkState::Reserved;
        Some(chunk)
    }

    /// Remove an arbitrary free small chunk from the free list without
    /// touching the parent's allocated count.  The chunk's state is left
    /// for the caller to overwrite.
    pub(crate) fn splice_small_free(&mut self, chunk: ChunkPtr) {
        let (next, prev) = match self.small_state(chunk) {
            SmallChunkState::Free { next, prev } => (*next, *prev),
            other => panic!("splice of non-free chunk {chunk:?}: {other:?}"),
        };
        if prev.is_null() {
            assert_eq!(self.small_free_list, chunk);
            self.small_free_list = next;
        } else {
            match self.small_state_mut(prev) {
                SmallChunkState::Free { next: n, .. } => *n = next,
                other => panic!("small free list link is {other:?}"),
            }
        }
        if !next.is_null() {
            match self.small_state_mut(next) {
                SmallChunkState::Free { prev: p, .. } => *p = prev,
                other => panic!("small free list link is {other:?}"),
            }
        }
        self.small_free_list_sz -= 1;
    }

    // -----------------------------------------------------------------------
    // Break / unbreak
    // -----------------------------------------------------------------------

    /// Subdivide a reserved large chunk into small chunks and push them
    /// all onto the small free list.
    pub(crate) fn break_large_chunk(&mut self, chunk: ChunkPtr) {
        let idx = chunk.large_index();
        assert!(matches!(&self.meta[idx], LargeChunkState::Reserved));

        // starts with every child counted as allocated so the pushes can
        // decrement without going through zero
        self.meta[idx] = LargeChunkState::broken();
        self.stats.broken_chunk_histogram[SMALL_CHUNKS_PER_LARGE_CHUNK] += 1;

        for i in (0..SMALL_CHUNKS_PER_LARGE_CHUNK).rev() {
            self.push_free_small(ChunkPtr::from_parts(idx, i), false);
        }

        self.stats.large_broken_chunks += 1;
        self.stats.break_events += 1;
        debug!("broke large chunk {idx}");
    }

    /// Reclaim a broken large chunk whose children are all unallocated.
    /// When not mandatory, returns silently if any child is still in use;
    /// when mandatory, every child must already be free or parked by the
    /// coalescer.
    pub(crate) fn unbreak_large_chunk(&mut self, parent: usize, mandatory: bool) {
        let allocated = match &self.meta[parent] {
            LargeChunkState::Broken { allocated, .. } => *allocated,
            other => panic!("unbreak of non-broken chunk {parent}: {other:?}"),
        };
        if mandatory {
            assert_eq!(allocated, 0);
        } else if allocated != 0 {
            return;
        }

        for i in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
            let child = ChunkPtr::from_parts(parent, i);
            let free = match self.small_state(child) {
                SmallChunkState::Free { .. } => true,
                SmallChunkState::CoalescePending => false,
                other => panic!("unbreak with live child {child:?}: {other:?}"),
            };
            if free {
                self.splice_small_free(child);
            }
        }

        self.meta[parent] = LargeChunkState::Reserved;
        self.push_free_large(ChunkPtr::from_parts(parent, 0));

        self.stats.large_broken_chunks -= 1;
        self.stats.broken_chunk_histogram[0] -= 1;
        self.stats.unbreak_events += 1;
        debug!("unbroke large chunk {parent}");
    }

    // -----------------------------------------------------------------------
    // Consistency checking
    // -----------------------------------------------------------------------

    /// Walk every structure and cross-check the counters.  Cheap enough
    /// for tests to call after every operation; a violation means the
    /// engine state is corrupt.
    pub fn check_invariants(&self) {
        // large free list
        let mut n = 0usize;
        let mut iter = self.large_free_list;
        while !iter.is_null() {
            match &self.meta[iter.large_index()] {
                LargeChunkState::Free { next } => iter = *next,
                other => panic!("large free list entry is {other:?}"),
            }
            n += 1;
        }
        assert_eq!(n, self.large_free_list_sz, "large free list length");

        // small free list, including back-link consistency
        let mut n = 0usize;
        let mut iter = self.small_free_list;
        let mut prev = ChunkPtr::NULL;
        while !iter.is_null() {
            match self.small_state(iter) {
                SmallChunkState::Free { next, prev: p } => {
                    assert_eq!(*p, prev, "small free list back link");
                    prev = iter;
                    iter = *next;
                }
                other => panic!("small free list entry is {other:?}"),
            }
            n += 1;
        }
        assert_eq!(n, self.small_free_list_sz, "small free list length");

        // chunk states, histogram, and population counters
        let mut hist = [0u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1];
        let mut broken = 0u64;
        let (mut lt, mut lb, mut st, mut sb) = (0u64, 0u64, 0u64, 0u64);
        for (idx, state) in self.meta.iter().enumerate() {
            match state {
                LargeChunkState::Reserved => panic!("reserved large chunk {idx} is observable"),
                LargeChunkState::Free { .. } => {}
                LargeChunkState::Title(_) => lt += 1,
                LargeChunkState::Body { .. } => lb += 1,
                LargeChunkState::Broken {
                    children,
                    allocated,
                } => {
                    broken += 1;
                    let mut used = 0usize;
                    for (i, c) in children.iter().enumerate() {
                        match c {
                            SmallChunkState::Reserved => {
                                panic!("reserved small chunk {idx}/{i} is observable")
                            }
                            SmallChunkState::CoalescePending => {
                                panic!("coalesce-pending small chunk {idx}/{i} is observable")
                            }
                            SmallChunkState::Free { .. } => {}
                            SmallChunkState::Title(_) => {
                                st += 1;
                                used += 1;
                            }
                            SmallChunkState::Body { .. } => {
                                sb += 1;
                                used += 1;
                            }
                        }
                    }
                    assert_eq!(used, *allocated as usize, "allocated count of chunk {idx}");
                    hist[*allocated as usize] += 1;
                }
            }
        }
        assert_eq!(hist, self.stats.broken_chunk_histogram, "histogram");
        assert_eq!(broken, self.stats.large_broken_chunks);
        assert_eq!(lt, self.stats.large_title_chunks);
        assert_eq!(lb, self.stats.large_body_chunks);
        assert_eq!(st, self.stats.small_title_chunks);
        assert_eq!(sb, self.stats.small_body_chunks);
        assert_eq!(
            self.stats.break_events - self.stats.unbreak_events,
            self.stats.large_broken_chunks,
            "break/unbreak parity"
        );

        // LRU closure and assoc ownership
        assert_eq!(self.lru_head.is_null(), self.lru_tail.is_null());
        let mut scratch = [0u8; KEY_MAX_LENGTH];
        let mut count = 0u64;
        let mut iter = self.lru_head;
        let mut last = ChunkPtr::NULL;
        while !iter.is_null() {
            let (next, prev, it_flags) = {
                let h = self.header(iter);
                (h.next, h.prev, h.it_flags)
            };
            assert!(it_flags.contains(ItemFlags::VALID | ItemFlags::LINKED));
            assert_eq!(prev, last, "LRU back link");
            let key = self.key_copy(iter, &mut scratch);
            assert_eq!(self.assoc.find(key), Some(iter), "linked item not findable");
            last = iter;
            iter = next;
            count += 1;
        }
        assert_eq!(last, self.lru_tail, "LRU tail");
        assert_eq!(count, self.cache_stats.lock().unwrap().curr_items);
    }
}
