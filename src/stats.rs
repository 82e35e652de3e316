// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// Counters and the textual stats surfaces.
//
// Two accounting domains with different locking:
//   FlatStats:  allocator bookkeeping (chunk populations, break/unbreak,
//               histogram).  Only ever touched under the cache lock, so
//               plain fields.
//   CacheStats: item-level accounting (counts, sizes, evictions).  Kept
//               behind its own Mutex so a stats reader does not need the
//               cache lock.

use std::fmt::Write as _;

use crate::chunk::{
    ChunkClass, ItemPtr, ITEM_CACHEDUMP_LIMIT, KEY_MAX_LENGTH, LARGE_CHUNK_SZ, MAX_ITEM_SIZE,
    SMALL_CHUNKS_PER_LARGE_CHUNK, SMALL_CHUNK_SZ,
};
use crate::storage::FlatStorage;
use crate::AssocTable;

/// Allocator counters.  `broken_chunk_histogram[k]` counts broken large
/// chunks with exactly `k` small children allocated.
#[derive(Debug, Clone)]
pub struct FlatStats {
    pub large_title_chunks: u64,
    pub large_body_chunks: u64,
    pub large_broken_chunks: u64,
    pub small_title_chunks: u64,
    pub small_body_chunks: u64,
    pub broken_chunk_histogram: [u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],
    pub break_events: u64,
    pub unbreak_events: u64,
    pub migrates: u64,
}

impl FlatStats {
    pub(crate) fn new() -> Self {
        FlatStats {
            large_title_chunks: 0,
            large_body_chunks: 0,
            large_broken_chunks: 0,
            small_title_chunks: 0,
            small_body_chunks: 0,
            broken_chunk_histogram: [0; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],
            break_events: 0,
            unbreak_events: 0,
            migrates: 0,
        }
    }
}

/// Item-level counters, the `STATS_LOCK` domain.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub curr_items: u64,
    pub total_items: u64,
    /// Sum of nkey + nbytes over linked items.
    pub item_total_size: u64,
    /// Bytes of region capacity committed so far.
    pub item_storage_allocated: u64,
    pub evictions: u64,
    pub expires: u64,
}

// ---------------------------------------------------------------------------
// Text surfaces
// ---------------------------------------------------------------------------

impl<A: AssocTable> FlatStorage<A> {
    /// Allocator stats in the classic `STAT <name> <value>` text format,
    /// closed with `END\r\n`.
    pub fn flat_allocator_stats(&self) -> String {
        let mut buf = String::with_capacity(2048);

        let oldest_item_lifetime = match self.get_lru_item() {
            Some(it) => self.current_time() - self.header(it).time,
            None => 0,
        };

        let s = &self.stats;
        let _ = write!(
            buf,
            "STAT large_chunk_sz {LARGE_CHUNK_SZ}\n\
             STAT small_chunk_sz {SMALL_CHUNK_SZ}\n\
             STAT large_title_chunks {}\n\
             STAT large_body_chunks {}\n\
             STAT large_broken_chunks {}\n\
             STAT small_title_chunks {}\n\
             STAT small_body_chunks {}\n",
            s.large_title_chunks,
            s.large_body_chunks,
            s.large_broken_chunks,
            s.small_title_chunks,
            s.small_body_chunks,
        );

        for (k, count) in s.broken_chunk_histogram.iter().enumerate() {
            let _ = writeln!(buf, "STAT broken_chunk_histogram {k} {count}");
        }

        let _ = write!(
            buf,
            "STAT break_events {}\n\
             STAT unbreak_events {}\n\
             STAT migrates {}\n\
             STAT unused_memory {}\n\
             STAT large_free_list_sz {}\n\
             STAT small_free_list_sz {}\n\
             STAT oldest_item_lifetime {}s\n",
            s.break_events,
            s.unbreak_events,
            s.migrates,
            self.region.unused_memory(),
            self.large_free_list_sz,
            self.small_free_list_sz,
            oldest_item_lifetime,
        );

        buf.push_str("END\r\n");
        buf
    }

    /// Dump up to `limit` items (0 = no limit) as
    /// `ITEM <key> [<nbytes> b; <abs_time> s]` lines, closed with
    /// `END\r\n`.  Walks the whole LRU newest-first; the class argument is
    /// accepted for interface compatibility but does not filter.
    pub fn cachedump(&self, _class: ChunkClass, limit: usize) -> String {
        let mut buf = String::new();
        let mut scratch = [0u8; KEY_MAX_LENGTH];
        let mut shown = 0usize;
        let mut iter = self.lru_head;

        while !iter.is_null() && (limit == 0 || shown < limit) {
            let (nbytes, time, next) = {
                let h = self.header(iter);
                (h.nbytes, h.time, h.next)
            };
            let key = self.key_copy(iter, &mut scratch);
            let line = format!(
                "ITEM {} [{} b; {} s]\r\n",
                String::from_utf8_lossy(key),
                nbytes,
                time as u64 + self.started()
            );
            // leave room for the terminator
            if buf.len() + line.len() + 5 > ITEM_CACHEDUMP_LIMIT {
                break;
            }
            buf.push_str(&line);
            shown += 1;
            iter = next;
        }

        buf.push_str("END\r\n");
        buf
    }

    /// Histogram of item footprints in 32-byte buckets:
    /// `<bucket_floor> <count>` lines for nonempty buckets, closed with
    /// `END\r\n`.  Single pass over the LRU through the shared header.
    pub fn stats_sizes(&self) -> String {
        let max_item_size = LARGE_CHUNK_SZ + KEY_MAX_LENGTH + MAX_ITEM_SIZE;
        let num_buckets = max_item_size.div_ceil(32);
        let mut histogram = vec![0u64; num_buckets];

        let mut iter = self.lru_head;
        while !iter.is_null() {
            let ntotal = self.item_ntotal(iter);
            let bucket = ntotal.div_ceil(32);
            if bucket < num_buckets {
                histogram[bucket] += 1;
            }
            iter = self.header(iter).next;
        }

        let mut buf = String::new();
        for (i, count) in histogram.iter().enumerate() {
            if *count != 0 {
                let _ = writeln!(buf, "{} {}\r", i * 32, count);
            }
        }
        buf.push_str("END\r\n");
        buf
    }

    /// Total chunk bytes occupied by an item.
    fn item_ntotal(&self, it: ItemPtr) -> usize {
        let n = self.chunks_in_item(it);
        if self.is_item_large_chunk(it) {
            n * LARGE_CHUNK_SZ
        } else {
            n * SMALL_CHUNK_SZ
        }
    }
}
