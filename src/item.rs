// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// Item assembly and lifecycle.
//
// An item's logical byte stream is its key immediately followed by its
// value, laid out across the title chunk's payload and then each body
// chunk's payload in chain order.  The walk primitive exposes that stream
// as contiguous runs; memcpy_to/from, key_compare, and key_copy are all
// built on it.  Allocation runs the class-specific acquisition strategies
// (grow, break, coalesce, evict) before chaining chunks.

use std::cmp::Ordering;
use std::mem;
use std::net::Ipv4Addr;

use crate::chunk::{
    body_data_sz, chain_capacity, chunks_needed, chunks_needed_in_class, is_large_chunk,
    title_data_sz, ChunkClass, ChunkPtr, ItemPtr, RelTime, ITEM_UPDATE_INTERVAL, KEY_MAX_LENGTH,
    LARGE_BODY_CHUNK_DATA_SZ, LARGE_TITLE_CHUNK_DATA_SZ, MAX_ITEM_SIZE, SMALL_BODY_CHUNK_DATA_SZ,
    SMALL_CHUNKS_PER_LARGE_CHUNK, SMALL_TITLE_CHUNK_DATA_SZ,
};
use crate::header::{ItemFlags, ItemHeader, LargeChunkState, SmallChunkState};
use crate::storage::FlatStorage;
use crate::AssocTable;

/// Why an item is being unlinked.  `MaybeEvict` asks the engine to decide
/// between eviction and expiry from the item's exptime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkCause {
    Normal,
    MaybeEvict,
    Evict,
    Expired,
}

/// Whether an item of this size fits in the cache at all.
pub fn item_size_ok(nkey: usize, _flags: u32, nbytes: usize) -> bool {
    nkey <= KEY_MAX_LENGTH && nbytes <= MAX_ITEM_SIZE
}

impl<A: AssocTable> FlatStorage<A> {
    // -----------------------------------------------------------------------
    // Header accessors
    // -----------------------------------------------------------------------

    pub fn item_nkey(&self, it: ItemPtr) -> usize {
        self.header(it).nkey as usize
    }

    pub fn item_nbytes(&self, it: ItemPtr) -> usize {
        self.header(it).nbytes as usize
    }

    /// The caller-supplied opaque flags word.
    pub fn item_flags(&self, it: ItemPtr) -> u32 {
        self.header(it).flags
    }

    pub fn item_exptime(&self, it: ItemPtr) -> RelTime {
        self.header(it).exptime
    }

    /// Last-touch time used for LRU ordering.
    pub fn item_time(&self, it: ItemPtr) -> RelTime {
        self.header(it).time
    }

    pub fn item_refcount(&self, it: ItemPtr) -> u16 {
        self.header(it).refcount
    }

    pub fn item_it_flags(&self, it: ItemPtr) -> ItemFlags {
        self.header(it).it_flags
    }

    /// Payload bytes the item's chain holds beyond nkey + nbytes.
    pub fn item_slackspace(&self, it: ItemPtr) -> usize {
        let h = self.header(it);
        let used = h.nkey as usize + h.nbytes as usize;
        chain_capacity(self.item_class(it), self.chunks_in_item(it)) - used
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate an item for `key` and an (uninitialized) value of `nbytes`
    /// bytes.  The key, flags, and exptime are stored; the returned item
    /// has refcount 1 and is not yet linked.  Returns `None` when every
    /// acquisition strategy fails or the size is not acceptable.
    pub fn item_alloc(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        addr: Option<Ipv4Addr>,
    ) -> Option<ItemPtr> {
        if !item_size_ok(key.len(), flags, nbytes) {
            return None;
        }
        if is_large_chunk(key.len(), nbytes) {
            self.item_alloc_large(key, flags, exptime, nbytes, addr)
        } else {
            self.item_alloc_small(key, flags, exptime, nbytes, addr)
        }
    }

    fn item_alloc_large(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        addr: Option<Ipv4Addr>,
    ) -> Option<ItemPtr> {
        let nkey = key.len();
        let needed = chunks_needed_in_class(ChunkClass::Large, nkey, nbytes);

        // Strategies, in order: commit more region, coalesce if the
        // combined free capacity would suffice, evict.  Every iteration
        // must advance the free list or we would spin.
        let mut prev_free = self.large_free_list_sz.wrapping_sub(1);
        while self.large_free_list_sz < needed {
            assert_ne!(prev_free, self.large_free_list_sz);
            prev_free = self.large_free_list_sz;

            if self.grow() {
                continue;
            }

            if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK + self.small_free_list_sz
                >= needed * SMALL_CHUNKS_PER_LARGE_CHUNK
            {
                self.coalesce_free_small_chunks();
            }
            if prev_free != self.large_free_list_sz {
                continue;
            }

            if self.lru_evict(ChunkClass::Large, needed) {
                continue;
            }

            return None;
        }

        // chain up the chunks
        let Some(title) = self.pop_free_large() else {
            unreachable!("large free list underflow");
        };
        let mut header = ItemHeader::new(nkey as u8, nbytes as u32, flags, exptime);

        self.stats.large_title_chunks += 1;
        self.stats.large_body_chunks += (needed - 1) as u64;

        let mut remaining = needed;
        let mut write_offset = nkey + nbytes;
        let mut key_rest = key;

        let cap = LARGE_TITLE_CHUNK_DATA_SZ;
        let kw = key_rest.len().min(cap);
        self.region
            .data_mut(title, 0, kw)
            .copy_from_slice(&key_rest[..kw]);
        key_rest = &key_rest[kw..];
        if remaining == 1 {
            header.it_flags |= self.stamp_on_block(title, write_offset, cap, addr);
        }
        remaining -= 1;
        write_offset = write_offset.saturating_sub(cap);

        let mut prev = title;
        while remaining > 0 {
            let Some(body) = self.pop_free_large() else {
                unreachable!("large free list underflow");
            };
            if prev == title {
                header.next_chunk = body;
            } else {
                match &mut self.meta[prev.large_index()] {
                    LargeChunkState::Body { next_chunk } => *next_chunk = body,
                    other => panic!("chain predecessor is {other:?}"),
                }
            }
            self.meta[body.large_index()] = LargeChunkState::Body {
                next_chunk: ChunkPtr::NULL,
            };

            let cap = LARGE_BODY_CHUNK_DATA_SZ;
            let kw = key_rest.len().min(cap);
            if kw > 0 {
                self.region
                    .data_mut(body, 0, kw)
                    .copy_from_slice(&key_rest[..kw]);
                key_rest = &key_rest[kw..];
            }
            if remaining == 1 {
                header.it_flags |= self.stamp_on_block(body, write_offset, cap, addr);
            }
            remaining -= 1;
            write_offset = write_offset.saturating_sub(cap);
            prev = body;
        }

        self.meta[title.large_index()] = LargeChunkState::Title(header);
        Some(title)
    }

    fn item_alloc_small(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        addr: Option<Ipv4Addr>,
    ) -> Option<ItemPtr> {
        let nkey = key.len();
        let needed = chunks_needed_in_class(ChunkClass::Small, nkey, nbytes);

        // Strategies, in order: break a free large chunk, commit more
        // region, evict.
        let mut small_prev = self.small_free_list_sz.wrapping_sub(1);
        let mut large_prev = self.large_free_list_sz;
        while self.small_free_list_sz < needed {
            assert!(
                small_prev != self.small_free_list_sz || large_prev != self.large_free_list_sz
            );
            small_prev = self.small_free_list_sz;
            large_prev = self.large_free_list_sz;

            if self.large_free_list_sz > 0 {
                let Some(lc) = self.pop_free_large() else {
                    unreachable!("large free list underflow");
                };
                self.break_large_chunk(lc);
                continue;
            }

            if self.grow() {
                continue;
            }

            if self.lru_evict(ChunkClass::Small, needed) {
                continue;
            }

            return None;
        }

        // chain up the chunks
        let Some(title) = self.pop_free_small() else {
            unreachable!("small free list underflow");
        };
        let mut header = ItemHeader::new(nkey as u8, nbytes as u32, flags, exptime);

        self.stats.small_title_chunks += 1;
        self.stats.small_body_chunks += (needed - 1) as u64;

        let mut remaining = needed;
        let mut write_offset = nkey + nbytes;
        let mut key_rest = key;

        let cap = SMALL_TITLE_CHUNK_DATA_SZ;
        let kw = key_rest.len().min(cap);
        self.region
            .data_mut(title, 0, kw)
            .copy_from_slice(&key_rest[..kw]);
        key_rest = &key_rest[kw..];
        if remaining == 1 {
            header.it_flags |= self.stamp_on_block(title, write_offset, cap, addr);
        }
        remaining -= 1;
        write_offset = write_offset.saturating_sub(cap);

        let mut prev = title;
        while remaining > 0 {
            let Some(body) = self.pop_free_small() else {
                unreachable!("small free list underflow");
            };
            if prev == title {
                header.next_chunk = body;
            } else {
                match self.small_state_mut(prev) {
                    SmallChunkState::Body { next_chunk, .. } => *next_chunk = body,
                    other => panic!("chain predecessor is {other:?}"),
                }
            }
            *self.small_state_mut(body) = SmallChunkState::Body {
                prev_chunk: prev,
                next_chunk: ChunkPtr::NULL,
            };

            let cap = SMALL_BODY_CHUNK_DATA_SZ;
            let kw = key_rest.len().min(cap);
            if kw > 0 {
                self.region
                    .data_mut(body, 0, kw)
                    .copy_from_slice(&key_rest[..kw]);
                key_rest = &key_rest[kw..];
            }
            if remaining == 1 {
                header.it_flags |= self.stamp_on_block(body, write_offset, cap, addr);
            }
            remaining -= 1;
            write_offset = write_offset.saturating_sub(cap);
            prev = body;
        }

        *self.small_state_mut(title) = SmallChunkState::Title(header);
        Some(title)
    }

    /// Write the trailing stamp into a chunk's slack: the store time if
    /// four bytes fit after the value, then the client IPv4 if four more
    /// do.  Returns the header flags to set.
    fn stamp_on_block(
        &mut self,
        chunk: ChunkPtr,
        block_offset: usize,
        block_sz: usize,
        addr: Option<Ipv4Addr>,
    ) -> ItemFlags {
        assert!(block_offset <= block_sz);
        let mut flags = ItemFlags::empty();
        let mut off = block_offset;

        let now = self.current_time();
        if block_sz - off >= mem::size_of::<RelTime>() {
            self.region
                .data_mut(chunk, off, mem::size_of::<RelTime>())
                .copy_from_slice(&now.to_ne_bytes());
            flags |= ItemFlags::HAS_TIMESTAMP;
            off += mem::size_of::<RelTime>();
        }

        if let Some(ip) = addr {
            let octets = ip.octets();
            if block_sz - off >= octets.len() {
                self.region
                    .data_mut(chunk, off, octets.len())
                    .copy_from_slice(&octets);
                flags |= ItemFlags::HAS_IP_ADDRESS;
            }
        }

        flags
    }

    /// Return every chunk of `it` to its free list.  Small-class frees
    /// merge opportunistically: a parent whose last child is freed here is
    /// unbroken on the spot.
    pub(crate) fn item_free(&mut self, it: ItemPtr) {
        {
            let h = self.header(it);
            assert_eq!(
                h.it_flags & !(ItemFlags::HAS_TIMESTAMP | ItemFlags::HAS_IP_ADDRESS),
                ItemFlags::VALID
            );
            assert_eq!(h.refcount, 0);
            assert!(h.next.is_null());
            assert!(h.prev.is_null());
            assert!(h.h_next.is_null());
        }
        let is_large = self.is_item_large_chunk(it);
        let expected = self.chunks_in_item(it);
        let mut next_chunk = self.header(it).next_chunk;
        let mut freed = 1usize; // the title

        if is_large {
            while !next_chunk.is_null() {
                let nn = match &self.meta[next_chunk.large_index()] {
                    LargeChunkState::Body { next_chunk } => *next_chunk,
                    other => panic!("chain link is {other:?}"),
                };
                self.meta[next_chunk.large_index()] = LargeChunkState::Reserved;
                self.push_free_large(next_chunk);
                next_chunk = nn;
                freed += 1;
            }
            self.stats.large_body_chunks -= (freed - 1) as u64;

            self.meta[it.large_index()] = LargeChunkState::Reserved;
            self.push_free_large(it);
            self.stats.large_title_chunks -= 1;
        } else {
            while !next_chunk.is_null() {
                let nn = match self.small_state(next_chunk) {
                    SmallChunkState::Body { next_chunk, .. } => *next_chunk,
                    other => panic!("chain link is {other:?}"),
                };
                *self.small_state_mut(next_chunk) = SmallChunkState::Reserved;
                self.push_free_small(next_chunk, true);
                next_chunk = nn;
                freed += 1;
            }
            self.stats.small_body_chunks -= (freed - 1) as u64;

            *self.small_state_mut(it) = SmallChunkState::Reserved;
            self.push_free_small(it, true);
            self.stats.small_title_chunks -= 1;
        }

        assert_eq!(freed, expected);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Insert `it` into the assoc table and the LRU.
    pub fn item_link(&mut self, it: ItemPtr, key: &[u8]) {
        let now = self.current_time();
        {
            let h = self.header_mut(it);
            assert!(h.it_flags.contains(ItemFlags::VALID));
            assert!(!h.it_flags.contains(ItemFlags::LINKED));
            h.it_flags |= ItemFlags::LINKED;
            h.time = now;
        }
        self.assoc.insert(key, it);

        let (nkey, nbytes) = {
            let h = self.header(it);
            (h.nkey as u64, h.nbytes as u64)
        };
        {
            let mut cs = self.cache_stats.lock().unwrap();
            cs.item_total_size += nkey + nbytes;
            cs.curr_items += 1;
            cs.total_items += 1;
        }

        self.item_link_q(it);
    }

    /// Remove `it` from the assoc table and the LRU, freeing it if no
    /// references remain.  Idempotent: a second unlink of the same item is
    /// a no-op.  When `key` is not supplied it is recovered from the
    /// item's chunks.
    pub fn item_unlink(&mut self, it: ItemPtr, cause: UnlinkCause, key: Option<&[u8]>) {
        let mut scratch = [0u8; KEY_MAX_LENGTH];
        let key: &[u8] = match key {
            Some(k) => k,
            None => {
                let nkey = self.header(it).nkey as usize;
                let mut off = 0usize;
                self.item_walk(it, 0, nkey, false, |run| {
                    scratch[off..off + run.len()].copy_from_slice(run);
                    off += run.len();
                });
                &scratch[..nkey]
            }
        };

        assert!(self.header(it).it_flags.contains(ItemFlags::VALID));
        if !self.header(it).it_flags.contains(ItemFlags::LINKED) {
            return;
        }

        let now = self.current_time();
        let cause = if cause == UnlinkCause::MaybeEvict {
            let exptime = self.header(it).exptime;
            if exptime == 0 || exptime > now {
                UnlinkCause::Evict
            } else {
                UnlinkCause::Expired
            }
        } else {
            cause
        };

        self.header_mut(it).it_flags.remove(ItemFlags::LINKED);

        let (nkey, nbytes) = {
            let h = self.header(it);
            (h.nkey as u64, h.nbytes as u64)
        };
        {
            let mut cs = self.cache_stats.lock().unwrap();
            cs.item_total_size -= nkey + nbytes;
            cs.curr_items -= 1;
            match cause {
                UnlinkCause::Evict => cs.evictions += 1,
                UnlinkCause::Expired => cs.expires += 1,
                _ => {}
            }
        }

        let deleted = self.assoc.delete(key);
        assert!(deleted, "unlinked item was missing from the assoc table");
        self.header_mut(it).h_next = ChunkPtr::NULL;
        self.item_unlink_q(it);
        if self.header(it).refcount == 0 {
            self.item_free(it);
        }
    }

    /// Drop one reference.  Frees the item when the count reaches zero
    /// and it is no longer linked; tolerates being called after unlink.
    pub fn item_deref(&mut self, it: ItemPtr) {
        {
            let h = self.header_mut(it);
            assert!(h.it_flags.contains(ItemFlags::VALID));
            if h.refcount != 0 {
                h.refcount -= 1;
            }
            assert!(!h.it_flags.contains(ItemFlags::DELETED) || h.refcount != 0);
        }
        let h = self.header(it);
        if h.refcount == 0 && !h.it_flags.contains(ItemFlags::LINKED) {
            self.item_free(it);
        }
    }

    /// Refresh `it`'s LRU position.  Rate-limited: items touched within
    /// the last `ITEM_UPDATE_INTERVAL` seconds stay put.
    pub fn item_update(&mut self, it: ItemPtr) {
        let now = self.current_time();
        let (time, it_flags) = {
            let h = self.header(it);
            (h.time, h.it_flags)
        };
        if time < now.saturating_sub(ITEM_UPDATE_INTERVAL) {
            assert!(it_flags.contains(ItemFlags::VALID));
            if it_flags.contains(ItemFlags::LINKED) {
                self.item_unlink_q(it);
                self.header_mut(it).time = now;
                self.item_link_q(it);
            }
        }
    }

    /// Unlink `old` and link `new` under the same key.
    pub fn item_replace(&mut self, old: ItemPtr, new: ItemPtr, key: &[u8]) {
        assert!(self
            .header(old)
            .it_flags
            .contains(ItemFlags::VALID | ItemFlags::LINKED));
        self.item_unlink(old, UnlinkCause::Normal, Some(key));

        assert!(self.header(new).it_flags.contains(ItemFlags::VALID));
        self.item_link(new, key);
    }

    /// Look up `key`, honouring delete-locks, the flush barrier, and
    /// per-item expiry.  On a hit the refcount is bumped; the caller owns
    /// a reference and must `item_deref` it.
    pub fn item_get(&mut self, key: &[u8]) -> Option<ItemPtr> {
        self.item_get_notedeleted(key).0
    }

    /// As `item_get`, additionally reporting whether the miss was a
    /// delete-locked item rather than a plain miss.
    pub fn item_get_notedeleted(&mut self, key: &[u8]) -> (Option<ItemPtr>, bool) {
        let now = self.current_time();
        let mut delete_locked = false;
        let mut it = self.assoc.find(key);

        if let Some(p) = it {
            if self.header(p).it_flags.contains(ItemFlags::DELETED)
                && !self.item_delete_lock_over(p)
            {
                delete_locked = true;
                it = None;
            }
        }
        if let Some(p) = it {
            let oldest = self.oldest_live();
            if oldest != 0 && oldest <= now && self.header(p).time <= oldest {
                self.item_unlink(p, UnlinkCause::Expired, Some(key));
                it = None;
            }
        }
        if let Some(p) = it {
            let exptime = self.header(p).exptime;
            if exptime != 0 && exptime <= now {
                self.item_unlink(p, UnlinkCause::Expired, Some(key));
                it = None;
            }
        }

        if let Some(p) = it {
            self.header_mut(p).refcount += 1;
        }
        (it, delete_locked)
    }

    /// Look up `key` with no expiry or delete-lock checks.
    pub fn item_get_nocheck(&mut self, key: &[u8]) -> Option<ItemPtr> {
        let it = self.assoc.find(key);
        if let Some(p) = it {
            self.header_mut(p).refcount += 1;
        }
        it
    }

    /// Whether a delete-locked item's lock has lapsed.
    pub fn item_delete_lock_over(&self, it: ItemPtr) -> bool {
        let h = self.header(it);
        assert!(h.it_flags.contains(ItemFlags::DELETED));
        self.current_time() >= h.exptime
    }

    /// Delete-lock `it`: it stays findable (reported as delete-locked)
    /// until `until` passes, then expires naturally.  The caller must hold
    /// a reference for the duration of the lock and clear it with
    /// `item_unmark_deleted` before the final deref.
    pub fn item_mark_deleted(&mut self, it: ItemPtr, until: RelTime) {
        let h = self.header_mut(it);
        assert!(h.it_flags.contains(ItemFlags::VALID));
        assert!(h.refcount > 0);
        h.it_flags |= ItemFlags::DELETED;
        h.exptime = until;
    }

    /// Lift a delete-lock set by `item_mark_deleted`.
    pub fn item_unmark_deleted(&mut self, it: ItemPtr) {
        let h = self.header_mut(it);
        assert!(h.it_flags.contains(ItemFlags::DELETED));
        h.it_flags.remove(ItemFlags::DELETED);
    }

    /// Unlink every linked item stored at or after the flush barrier.
    /// The LRU is newest-first, so the walk stops at the first survivor.
    pub fn item_flush_expired(&mut self) {
        let oldest = self.oldest_live();
        if oldest == 0 {
            return;
        }
        let mut iter = self.lru_head;
        while !iter.is_null() {
            let (time, next, it_flags) = {
                let h = self.header(iter);
                (h.time, h.next, h.it_flags)
            };
            if time < oldest {
                break;
            }
            assert!(it_flags.contains(ItemFlags::VALID | ItemFlags::LINKED));
            self.item_unlink(iter, UnlinkCause::Expired, None);
            iter = next;
        }
    }

    /// Whether storing `new_nkey`/`new_nbytes` in place of `it` would
    /// change its class or chunk count.
    pub fn item_need_realloc(
        &self,
        it: ItemPtr,
        new_nkey: usize,
        _new_flags: u32,
        new_nbytes: usize,
    ) -> bool {
        self.is_item_large_chunk(it) != is_large_chunk(new_nkey, new_nbytes)
            || self.chunks_in_item(it) != chunks_needed(new_nkey, new_nbytes)
    }

    // -----------------------------------------------------------------------
    // Walk primitive and the operations built on it
    // -----------------------------------------------------------------------

    /// Forward link out of `chunk` within an item chain of `class`.
    fn next_chunk_of(&self, chunk: ChunkPtr, class: ChunkClass) -> ChunkPtr {
        match class {
            ChunkClass::Large => match &self.meta[chunk.large_index()] {
                LargeChunkState::Title(h) => h.next_chunk,
                LargeChunkState::Body { next_chunk } => *next_chunk,
                other => panic!("chain link is {other:?}"),
            },
            ChunkClass::Small => match self.small_state(chunk) {
                SmallChunkState::Title(h) => h.next_chunk,
                SmallChunkState::Body { next_chunk, .. } => *next_chunk,
                other => panic!("chain link is {other:?}"),
            },
        }
    }

    /// Apply `applier` to the contiguous payload runs covering
    /// `start_offset .. start_offset + nbytes` of the item's logical
    /// stream (key, then value).  With `past_value_end` the window may
    /// extend into the trailing slack, which is where the stamp lives.
    pub(crate) fn item_walk<F: FnMut(&[u8])>(
        &self,
        it: ItemPtr,
        start_offset: usize,
        nbytes: usize,
        past_value_end: bool,
        mut applier: F,
    ) {
        let class = self.item_class(it);
        let limit = if past_value_end {
            chain_capacity(class, self.chunks_in_item(it))
        } else {
            let h = self.header(it);
            h.nkey as usize + h.nbytes as usize
        };
        assert!(start_offset + nbytes <= limit);

        let mut skip = start_offset;
        let mut left = nbytes;
        let mut chunk = it;
        let mut cap = title_data_sz(class);
        loop {
            if left == 0 {
                break;
            }
            if skip >= cap {
                skip -= cap;
            } else {
                let take = (cap - skip).min(left);
                applier(self.region.data(chunk, skip, take));
                left -= take;
                skip = 0;
            }
            if left == 0 {
                break;
            }
            chunk = self.next_chunk_of(chunk, class);
            assert!(!chunk.is_null());
            cap = body_data_sz(class);
        }
    }

    /// Mutable variant of `item_walk`.
    pub(crate) fn item_walk_mut<F: FnMut(&mut [u8])>(
        &mut self,
        it: ItemPtr,
        start_offset: usize,
        nbytes: usize,
        past_value_end: bool,
        mut applier: F,
    ) {
        let class = self.item_class(it);
        let limit = if past_value_end {
            chain_capacity(class, self.chunks_in_item(it))
        } else {
            let h = self.header(it);
            h.nkey as usize + h.nbytes as usize
        };
        assert!(start_offset + nbytes <= limit);

        let mut skip = start_offset;
        let mut left = nbytes;
        let mut chunk = it;
        let mut cap = title_data_sz(class);
        loop {
            if left == 0 {
                break;
            }
            if skip >= cap {
                skip -= cap;
            } else {
                let take = (cap - skip).min(left);
                applier(self.region.data_mut(chunk, skip, take));
                left -= take;
                skip = 0;
            }
            if left == 0 {
                break;
            }
            chunk = self.next_chunk_of(chunk, class);
            assert!(!chunk.is_null());
            cap = body_data_sz(class);
        }
    }

    /// Copy `src` into the item's value at `offset` bytes past the value
    /// start.  `beyond_item_boundary` permits writing into trailing slack.
    pub fn item_memcpy_to(
        &mut self,
        it: ItemPtr,
        offset: usize,
        src: &[u8],
        beyond_item_boundary: bool,
    ) {
        let nkey = self.header(it).nkey as usize;
        let mut rest = src;
        self.item_walk_mut(it, nkey + offset, src.len(), beyond_item_boundary, |run| {
            let (head, tail) = rest.split_at(run.len());
            run.copy_from_slice(head);
            rest = tail;
        });
    }

    /// Copy `nbytes` of the item's value at `offset` into `dst`.
    pub fn item_memcpy_from(
        &self,
        dst: &mut [u8],
        it: ItemPtr,
        offset: usize,
        nbytes: usize,
        beyond_item_boundary: bool,
    ) {
        assert!(dst.len() >= nbytes);
        let nkey = self.header(it).nkey as usize;
        let mut rest = &mut dst[..nbytes];
        self.item_walk(it, nkey + offset, nbytes, beyond_item_boundary, |run| {
            let (head, tail) = mem::take(&mut rest).split_at_mut(run.len());
            head.copy_from_slice(run);
            rest = tail;
        });
    }

    /// Compare the item's key with `key`: length first, then bytes.
    pub fn item_key_compare(&self, it: ItemPtr, key: &[u8]) -> Ordering {
        let nkey = self.header(it).nkey as usize;
        if nkey != key.len() {
            return nkey.cmp(&key.len());
        }
        let mut scratch = [0u8; KEY_MAX_LENGTH];
        self.key_copy(it, &mut scratch).cmp(key)
    }

    /// The item's key, flattened.  Zero-copy when the key fits in the
    /// title payload; otherwise assembled into `scratch`.
    pub fn key_copy<'a>(&'a self, it: ItemPtr, scratch: &'a mut [u8]) -> &'a [u8] {
        let nkey = self.header(it).nkey as usize;
        if nkey <= title_data_sz(self.item_class(it)) {
            return self.region.data(it, 0, nkey);
        }

        assert!(scratch.len() >= nkey);
        let mut off = 0usize;
        self.item_walk(it, 0, nkey, false, |run| {
            scratch[off..off + run.len()].copy_from_slice(run);
            off += run.len();
        });
        &scratch[..nkey]
    }
}
