// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// Chunk geometry: the tunable size constants, the compact chunk pointer,
// and the arithmetic that decides which class an item belongs to and how
// many chunks it needs.
//
// The region is partitioned into LARGE_CHUNK_SZ slots.  A large chunk may
// be broken into SMALL_CHUNKS_PER_LARGE_CHUNK small chunks.  A ChunkPtr
// addresses any chunk boundary at CHUNK_ADDRESSING_SZ granularity, so one
// pointer space covers both classes:
//
//   byte offset = ptr * CHUNK_ADDRESSING_SZ
//   large index = ptr / (LARGE_CHUNK_SZ / CHUNK_ADDRESSING_SZ)
//   small index = offset within the large chunk / SMALL_CHUNK_SZ

use std::fmt;

use static_assertions::{const_assert, const_assert_eq};

/// Size of a large chunk in bytes.
pub const LARGE_CHUNK_SZ: usize = 1024;
/// Size of a small chunk in bytes.
pub const SMALL_CHUNK_SZ: usize = 128;
/// Number of small chunks a broken large chunk yields.
pub const SMALL_CHUNKS_PER_LARGE_CHUNK: usize = LARGE_CHUNK_SZ / SMALL_CHUNK_SZ;
/// Granularity of chunk-pointer addressing.
pub const CHUNK_ADDRESSING_SZ: usize = SMALL_CHUNK_SZ;

/// Payload capacity of a large title chunk.
pub const LARGE_TITLE_CHUNK_DATA_SZ: usize = 960;
/// Payload capacity of a large body chunk.
pub const LARGE_BODY_CHUNK_DATA_SZ: usize = 1008;
/// Payload capacity of a small title chunk.
pub const SMALL_TITLE_CHUNK_DATA_SZ: usize = 96;
/// Payload capacity of a small body chunk.
pub const SMALL_BODY_CHUNK_DATA_SZ: usize = 120;

/// Bytes committed per region growth step.
pub const FLAT_STORAGE_INCREMENT_DELTA: usize = 4096;

/// Maximum key length in bytes.
pub const KEY_MAX_LENGTH: usize = 250;
/// Maximum value length in bytes.
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;
/// How many pinned items the eviction scan steps over from the tail
/// before giving up.
pub const LRU_SEARCH_DEPTH: usize = 50;
/// Minimum age, in seconds, before a touched item is repositioned to the
/// LRU head again.
pub const ITEM_UPDATE_INTERVAL: RelTime = 60;
/// Upper bound on a cachedump response, in bytes.
pub const ITEM_CACHEDUMP_LIMIT: usize = 2 * 1024 * 1024;

// Structural checks.  Violations are configuration bugs, so they fail the
// build instead of the process.
const_assert!(LARGE_CHUNK_SZ >= SMALL_CHUNK_SZ);
const_assert!(LARGE_CHUNK_SZ >= CHUNK_ADDRESSING_SZ);
const_assert_eq!(LARGE_CHUNK_SZ % CHUNK_ADDRESSING_SZ, 0);
const_assert_eq!(LARGE_CHUNK_SZ % SMALL_CHUNK_SZ, 0);
const_assert!(SMALL_CHUNKS_PER_LARGE_CHUNK >= 2);
const_assert!(SMALL_CHUNKS_PER_LARGE_CHUNK <= LARGE_CHUNK_SZ / CHUNK_ADDRESSING_SZ);
const_assert_eq!(SMALL_CHUNK_SZ % CHUNK_ADDRESSING_SZ, 0);
const_assert!(LARGE_TITLE_CHUNK_DATA_SZ >= KEY_MAX_LENGTH);
const_assert!(LARGE_TITLE_CHUNK_DATA_SZ <= LARGE_CHUNK_SZ);
const_assert!(LARGE_BODY_CHUNK_DATA_SZ <= LARGE_CHUNK_SZ);
const_assert!(SMALL_TITLE_CHUNK_DATA_SZ <= SMALL_CHUNK_SZ);
const_assert!(SMALL_BODY_CHUNK_DATA_SZ <= SMALL_CHUNK_SZ);
const_assert_eq!(FLAT_STORAGE_INCREMENT_DELTA % LARGE_CHUNK_SZ, 0);
const_assert!(KEY_MAX_LENGTH <= u8::MAX as usize);

/// Relative seconds since engine start.
pub type RelTime = u32;

/// Addressing units per large chunk.
const ADDRS_PER_LARGE: u32 = (LARGE_CHUNK_SZ / CHUNK_ADDRESSING_SZ) as u32;
/// Addressing units per small chunk.
const ADDRS_PER_SMALL: u32 = (SMALL_CHUNK_SZ / CHUNK_ADDRESSING_SZ) as u32;

/// The two chunk size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClass {
    Small,
    Large,
}

/// Compact identifier for a chunk boundary within the region.
///
/// The value is the chunk's byte offset divided by `CHUNK_ADDRESSING_SZ`.
/// `ChunkPtr::NULL` (`u32::MAX`) is the "none" sentinel; headers and
/// free-list links store these densely, so a reserved extreme value beats
/// an `Option` here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPtr(u32);

/// An item is identified by the chunk pointer of its title chunk.
pub type ItemPtr = ChunkPtr;

impl ChunkPtr {
    /// The "no chunk" sentinel.
    pub const NULL: ChunkPtr = ChunkPtr(u32::MAX);

    /// Whether this is the sentinel.
    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Pointer to large chunk `large` (or to small chunk `small` inside it).
    #[inline]
    pub(crate) fn from_parts(large: usize, small: usize) -> Self {
        debug_assert!(small < SMALL_CHUNKS_PER_LARGE_CHUNK);
        ChunkPtr(large as u32 * ADDRS_PER_LARGE + small as u32 * ADDRS_PER_SMALL)
    }

    /// Index of the large chunk this pointer falls inside.
    #[inline]
    pub(crate) fn large_index(self) -> usize {
        debug_assert!(!self.is_null());
        (self.0 / ADDRS_PER_LARGE) as usize
    }

    /// Index of the small chunk within its parent large chunk.
    #[inline]
    pub(crate) fn small_index(self) -> usize {
        debug_assert!(!self.is_null());
        ((self.0 % ADDRS_PER_LARGE) / ADDRS_PER_SMALL) as usize
    }

    /// Byte offset of this chunk from the region base.
    #[inline]
    pub(crate) fn byte_offset(self) -> usize {
        debug_assert!(!self.is_null());
        self.0 as usize * CHUNK_ADDRESSING_SZ
    }
}

impl fmt::Debug for ChunkPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ChunkPtr(NULL)")
        } else {
            write!(f, "ChunkPtr({}+{})", self.large_index(), self.small_index())
        }
    }
}

// ---------------------------------------------------------------------------
// Size arithmetic
// ---------------------------------------------------------------------------

/// Payload capacity of a title chunk of the given class.
#[inline]
pub(crate) fn title_data_sz(class: ChunkClass) -> usize {
    match class {
        ChunkClass::Small => SMALL_TITLE_CHUNK_DATA_SZ,
        ChunkClass::Large => LARGE_TITLE_CHUNK_DATA_SZ,
    }
}

/// Payload capacity of a body chunk of the given class.
#[inline]
pub(crate) fn body_data_sz(class: ChunkClass) -> usize {
    match class {
        ChunkClass::Small => SMALL_BODY_CHUNK_DATA_SZ,
        ChunkClass::Large => LARGE_BODY_CHUNK_DATA_SZ,
    }
}

/// Largest key+value that still fits in a small-class chain.  A small item
/// must fit in a title plus as many bodies as one broken large chunk can
/// supply; anything bigger goes to the large class.
const SMALL_CHAIN_MAX_SZ: usize =
    SMALL_TITLE_CHUNK_DATA_SZ + (SMALL_CHUNKS_PER_LARGE_CHUNK - 1) * SMALL_BODY_CHUNK_DATA_SZ;

/// Whether an item of this size is stored in the large class.
#[inline]
pub fn is_large_chunk(nkey: usize, nbytes: usize) -> bool {
    nkey + nbytes > SMALL_CHAIN_MAX_SZ
}

/// The class an item of this size is stored in.
#[inline]
pub fn chunk_class(nkey: usize, nbytes: usize) -> ChunkClass {
    if is_large_chunk(nkey, nbytes) {
        ChunkClass::Large
    } else {
        ChunkClass::Small
    }
}

/// Number of chunks (title + bodies) needed to store `nkey + nbytes`
/// payload bytes in the given class.
pub(crate) fn chunks_needed_in_class(class: ChunkClass, nkey: usize, nbytes: usize) -> usize {
    let total = nkey + nbytes;
    let title = title_data_sz(class);
    if total <= title {
        1
    } else {
        let body = body_data_sz(class);
        1 + (total - title).div_ceil(body)
    }
}

/// Number of chunks needed to store an item of this size, in its natural
/// class.
#[inline]
pub fn chunks_needed(nkey: usize, nbytes: usize) -> usize {
    chunks_needed_in_class(chunk_class(nkey, nbytes), nkey, nbytes)
}

/// Total payload capacity of a chain of `nchunks` chunks of `class`.
#[inline]
pub(crate) fn chain_capacity(class: ChunkClass, nchunks: usize) -> usize {
    debug_assert!(nchunks >= 1);
    title_data_sz(class) + (nchunks - 1) * body_data_sz(class)
}
