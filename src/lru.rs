// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// The global LRU: one doubly-linked list of linked items, most recently
// touched at the head.  Eviction scans from the tail with a bounded probe
// depth so a run of pinned items cannot turn a miss into an O(n) walk.

use log::debug;

use crate::chunk::{ChunkClass, ChunkPtr, ItemPtr, LRU_SEARCH_DEPTH, SMALL_CHUNKS_PER_LARGE_CHUNK};
use crate::coalesce::CoalesceProgress;
use crate::item::UnlinkCause;
use crate::storage::FlatStorage;
use crate::AssocTable;

impl<A: AssocTable> FlatStorage<A> {
    /// Insert `it` at the LRU head.
    pub(crate) fn item_link_q(&mut self, it: ItemPtr) {
        {
            let h = self.header(it);
            assert!(h.next.is_null());
            assert!(h.prev.is_null());
        }
        assert_eq!(self.lru_head.is_null(), self.lru_tail.is_null());

        let head = self.lru_head;
        if !head.is_null() {
            self.header_mut(it).next = head;
            self.header_mut(head).prev = it;
        }
        self.lru_head = it;
        if self.lru_tail.is_null() {
            self.lru_tail = it;
        }
    }

    /// Remove `it` from the LRU.
    pub(crate) fn item_unlink_q(&mut self, it: ItemPtr) {
        let (next, prev) = {
            let h = self.header(it);
            (h.next, h.prev)
        };

        if it == self.lru_head {
            assert!(prev.is_null());
            self.lru_head = next;
        }
        if it == self.lru_tail {
            assert!(next.is_null());
            self.lru_tail = prev;
        }

        if !next.is_null() {
            self.header_mut(next).prev = prev;
        }
        if !prev.is_null() {
            self.header_mut(prev).next = next;
        }

        let h = self.header_mut(it);
        h.next = ChunkPtr::NULL;
        h.prev = ChunkPtr::NULL;
    }

    /// The oldest item with no outstanding references, scanning at most
    /// `LRU_SEARCH_DEPTH` entries from the tail.
    pub(crate) fn get_lru_item(&self) -> Option<ItemPtr> {
        let mut iter = self.lru_tail;
        let mut depth = 0;
        while depth < LRU_SEARCH_DEPTH && !iter.is_null() {
            let h = self.header(iter);
            if h.refcount == 0 {
                return Some(iter);
            }
            iter = h.prev;
            depth += 1;
        }
        None
    }

    /// Evict from the LRU tail until the free capacity of `class` can
    /// cover `nchunks`, or no eviction candidate remains.
    ///
    /// For the small class, large free chunks count at their broken-down
    /// rate; the caller breaks them as needed.  For the large class, a
    /// coalesce pass is attempted once the combined capacity is
    /// numerically sufficient.
    pub(crate) fn lru_evict(&mut self, class: ChunkClass, nchunks: usize) -> bool {
        loop {
            let Some(victim) = self.get_lru_item() else {
                return false;
            };
            debug!("evicting {victim:?} for {nchunks} {class:?} chunks");
            self.item_unlink(victim, UnlinkCause::MaybeEvict, None);

            match class {
                ChunkClass::Small => {
                    if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK
                        + self.small_free_list_sz
                        >= nchunks
                    {
                        return true;
                    }
                }
                ChunkClass::Large => {
                    if self.large_free_list_sz >= nchunks {
                        return true;
                    }
                    if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK
                        + self.small_free_list_sz
                        >= nchunks * SMALL_CHUNKS_PER_LARGE_CHUNK
                    {
                        if self.coalesce_free_small_chunks() == CoalesceProgress::NoProgress {
                            continue;
                        }
                        if self.large_free_list_sz >= nchunks {
                            return true;
                        }
                    }
                }
            }
        }
    }
}
