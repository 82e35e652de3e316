// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// The coalescer: recover whole large chunks from small-chunk
// fragmentation.  A donor broken chunk with no referenced children is
// found via the small free list, its free children are parked off the
// list, its live children are migrated to replacement slots elsewhere,
// and the emptied donor is mandatorily unbroken back into a large chunk.

use log::debug;

use crate::chunk::{ChunkPtr, SMALL_CHUNKS_PER_LARGE_CHUNK};
use crate::header::{LargeChunkState, SmallChunkState};
use crate::storage::FlatStorage;
use crate::AssocTable;

/// Outcome of a coalesce pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceProgress {
    /// No donor could be found; nothing changed.
    NoProgress,
    /// At least one large chunk was formed.
    LargeChunkFormed,
}

impl<A: AssocTable> FlatStorage<A> {
    /// Whether any item occupying `chunk` still has outstanding
    /// references.  Free chunks count as unreferenced; used chunks are
    /// walked back through their `prev_chunk` links to the title, whose
    /// refcount decides.
    fn small_chunk_referenced(&self, chunk: ChunkPtr) -> bool {
        let mut cur = chunk;
        loop {
            match self.small_state(cur) {
                SmallChunkState::Free { .. } => return false,
                SmallChunkState::Title(h) => return h.refcount != 0,
                SmallChunkState::Body { prev_chunk, .. } => cur = *prev_chunk,
                other => panic!("referenced-walk hit {cur:?}: {other:?}"),
            }
        }
    }

    /// Whether any child of the broken chunk `parent` is referenced.
    fn large_broken_chunk_referenced(&self, parent: usize) -> bool {
        (0..SMALL_CHUNKS_PER_LARGE_CHUNK)
            .any(|i| self.small_chunk_referenced(ChunkPtr::from_parts(parent, i)))
    }

    /// Walk the small free list for a broken chunk whose children are all
    /// unreferenced.  A `search_depth` of 0 means unlimited.
    fn find_unreferenced_broken_chunk(&self, search_depth: usize) -> Option<usize> {
        let mut iter = self.small_free_list;
        let mut counter = 0usize;
        while !iter.is_null() && (search_depth == 0 || counter < search_depth) {
            let parent = iter.large_index();
            if !self.large_broken_chunk_referenced(parent) {
                return Some(parent);
            }
            iter = match self.small_state(iter) {
                SmallChunkState::Free { next, .. } => *next,
                other => panic!("small free list entry is {other:?}"),
            };
            counter += 1;
        }
        None
    }

    /// Coalesce as many free small chunks as possible into free large
    /// chunks.  Needs at least `SMALL_CHUNKS_PER_LARGE_CHUNK` free small
    /// chunks and an unreferenced donor; stops (rather than looping
    /// forever) as soon as no donor can be found.
    pub fn coalesce_free_small_chunks(&mut self) -> CoalesceProgress {
        let mut retval = CoalesceProgress::NoProgress;

        while self.small_free_list_sz >= SMALL_CHUNKS_PER_LARGE_CHUNK {
            let Some(donor) = self.find_unreferenced_broken_chunk(0) else {
                return retval;
            };

            let allocated = match &self.meta[donor] {
                LargeChunkState::Broken { allocated, .. } => *allocated as usize,
                other => panic!("donor {donor} is {other:?}"),
            };
            debug!("coalescing donor chunk {donor} with {allocated} live children");

            self.stats.broken_chunk_histogram[allocated] -= 1;
            self.stats.migrates += allocated as u64;

            if allocated != 0 {
                // Pull the donor's own free children off the free list so
                // they cannot be handed back as migration destinations.
                for i in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                    let child = ChunkPtr::from_parts(donor, i);
                    if matches!(self.small_state(child), SmallChunkState::Free { .. }) {
                        self.splice_small_free(child);
                        *self.small_state_mut(child) = SmallChunkState::CoalescePending;
                    }
                }

                for i in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                    let old = ChunkPtr::from_parts(donor, i);
                    if matches!(self.small_state(old), SmallChunkState::CoalescePending) {
                        continue;
                    }
                    self.migrate_small_chunk(donor, old);
                }
            }

            self.stats.broken_chunk_histogram[0] += 1;
            self.unbreak_large_chunk(donor, true);

            retval = CoalesceProgress::LargeChunkFormed;
        }

        retval
    }

    /// Move the live small chunk `old` (a child of `donor`) onto a fresh
    /// slot from the free list, rewriting every pointer that referred to
    /// the old slot.  The vacated slot is parked as coalesce-pending so it
    /// cannot be picked as a destination later in the same pass.
    fn migrate_small_chunk(&mut self, donor: usize, old: ChunkPtr) {
        let Some(replacement) = self.pop_free_small() else {
            unreachable!("free list underflow during migration");
        };
        assert_ne!(replacement.large_index(), donor);

        self.region.migrate_small(old, replacement);

        let state = std::mem::replace(
            self.small_state_mut(old),
            SmallChunkState::CoalescePending,
        );
        match state {
            SmallChunkState::Title(header) => {
                // relink the LRU neighbours
                if header.next.is_null() {
                    assert_eq!(self.lru_tail, old);
                    self.lru_tail = replacement;
                } else {
                    assert_eq!(self.header(header.next).prev, old);
                    self.header_mut(header.next).prev = replacement;
                }
                if header.prev.is_null() {
                    assert_eq!(self.lru_head, old);
                    self.lru_head = replacement;
                } else {
                    assert_eq!(self.header(header.prev).next, old);
                    self.header_mut(header.prev).next = replacement;
                }

                // the first body chunk points back at the title
                if !header.next_chunk.is_null() {
                    match self.small_state_mut(header.next_chunk) {
                        SmallChunkState::Body { prev_chunk, .. } => *prev_chunk = replacement,
                        other => panic!("body link of migrated title is {other:?}"),
                    }
                }

                self.assoc.update(old, replacement);
                *self.small_state_mut(replacement) = SmallChunkState::Title(header);
            }
            SmallChunkState::Body {
                prev_chunk,
                next_chunk,
            } => {
                // the previous chunk's forward link, title or body
                match self.small_state_mut(prev_chunk) {
                    SmallChunkState::Title(h) => h.next_chunk = replacement,
                    SmallChunkState::Body { next_chunk: n, .. } => *n = replacement,
                    other => panic!("prev link of migrated body is {other:?}"),
                }
                if !next_chunk.is_null() {
                    match self.small_state_mut(next_chunk) {
                        SmallChunkState::Body { prev_chunk: p, .. } => *p = replacement,
                        other => panic!("next link of migrated body is {other:?}"),
                    }
                }
                *self.small_state_mut(replacement) = SmallChunkState::Body {
                    prev_chunk,
                    next_chunk,
                };
            }
            other => panic!("migration source is {other:?}"),
        }

        match &mut self.meta[donor] {
            LargeChunkState::Broken { allocated, .. } => *allocated -= 1,
            other => panic!("donor {donor} is {other:?}"),
        }
    }
}
