// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// The item header and the per-chunk metadata variants.
//
// Chunk metadata is held out-of-band in the engine, one tagged variant
// per chunk, while the region holds payload bytes only.  The variant tag
// plays the role a flags byte plays in an overlaid-union layout: a chunk
// is exactly one of free / title / body / broken at any observable point,
// and decoding a ChunkPtr is a lookup in the metadata table rather than
// a cast.

use bitflags::bitflags;

use crate::chunk::{ChunkPtr, RelTime, SMALL_CHUNKS_PER_LARGE_CHUNK};

bitflags! {
    /// Item state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        /// Header fields are meaningful.
        const VALID          = 0x01;
        /// Present in both the assoc table and the LRU.
        const LINKED         = 0x02;
        /// Delete-locked: stays findable until its exptime passes.
        const DELETED        = 0x04;
        /// Trailing slack holds a store timestamp.
        const HAS_TIMESTAMP  = 0x08;
        /// Trailing slack holds the client IPv4 address.
        const HAS_IP_ADDRESS = 0x10;
    }
}

/// Header of an item, carried by its title chunk.
///
/// `next`/`prev` are the LRU neighbours, `next_chunk` is the first body
/// chunk.  `h_next` is the assoc table's chain slot; the engine never
/// interprets it beyond clearing it on alloc and unlink.
#[derive(Debug, Clone)]
pub(crate) struct ItemHeader {
    pub h_next: ChunkPtr,
    pub next: ChunkPtr,
    pub prev: ChunkPtr,
    pub next_chunk: ChunkPtr,
    pub time: RelTime,
    pub exptime: RelTime,
    pub nbytes: u32,
    pub nkey: u8,
    pub flags: u32,
    pub refcount: u16,
    pub it_flags: ItemFlags,
}

impl ItemHeader {
    /// A freshly allocated header: refcount 1 (the caller's reference),
    /// VALID, all links null.
    pub(crate) fn new(nkey: u8, nbytes: u32, flags: u32, exptime: RelTime) -> Self {
        ItemHeader {
            h_next: ChunkPtr::NULL,
            next: ChunkPtr::NULL,
            prev: ChunkPtr::NULL,
            next_chunk: ChunkPtr::NULL,
            time: 0,
            exptime,
            nbytes,
            nkey,
            flags,
            refcount: 1,
            it_flags: ItemFlags::VALID,
        }
    }
}

/// State of a small chunk inside a broken large chunk.
///
/// `Reserved` is the just-popped / just-vacated transient: allocated but
/// not yet typed.  It never survives past the operation that created it.
/// `CoalescePending` parks chunks the coalescer has claimed as migration
/// sources or pulled off the free list as ineligible destinations; they
/// are neither free-listed nor in use for the duration of one pass.
#[derive(Debug)]
pub(crate) enum SmallChunkState {
    Reserved,
    Free { next: ChunkPtr, prev: ChunkPtr },
    Title(ItemHeader),
    Body { prev_chunk: ChunkPtr, next_chunk: ChunkPtr },
    CoalescePending,
}

/// State of a large chunk.
#[derive(Debug)]
pub(crate) enum LargeChunkState {
    Reserved,
    Free {
        next: ChunkPtr,
    },
    Title(ItemHeader),
    Body {
        next_chunk: ChunkPtr,
    },
    Broken {
        children: Box<[SmallChunkState; SMALL_CHUNKS_PER_LARGE_CHUNK]>,
        /// Count of children currently allocated (not free).
        allocated: u8,
    },
}

impl LargeChunkState {
    /// A fresh broken chunk: every child `Reserved`, all counted as
    /// allocated so the initial free-list pushes can decrement safely.
    pub(crate) fn broken() -> Self {
        LargeChunkState::Broken {
            children: Box::new(std::array::from_fn(|_| SmallChunkState::Reserved)),
            allocated: SMALL_CHUNKS_PER_LARGE_CHUNK as u8,
        }
    }
}
