// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// The backing region: one anonymous private mapping covering the whole
// configured capacity, handed out to the allocator in
// FLAT_STORAGE_INCREMENT_DELTA steps.
//
// Layout:
//
//   [ large chunk 0 ][ large chunk 1 ] ... [ large chunk n-1 ]
//   `---- initialized prefix ----'`-- uninitialized suffix --'
//
// Only the initialized prefix is ever read or written, so the kernel
// never pages in the suffix.  The region stores payload bytes only; chunk
// metadata lives out-of-band in the engine.

use std::io;
use std::ops::Range;
use std::slice;

use log::debug;

use crate::chunk::{ChunkPtr, FLAT_STORAGE_INCREMENT_DELTA, LARGE_CHUNK_SZ, SMALL_CHUNK_SZ};
use crate::platform;

/// Owner of the contiguous backing memory.
pub struct Region {
    base: *mut u8,
    maxbytes: usize,
    /// Large-chunk slots handed out so far (the initialized watermark).
    initialized_large: usize,
    /// Bytes of capacity not yet committed.
    unused_memory: usize,
}

// Safety: the region exclusively owns its mapping; shared references only
// ever read initialized payload bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `maxbytes` of anonymous memory.  `maxbytes` must be a nonzero
    /// multiple of both `LARGE_CHUNK_SZ` and `FLAT_STORAGE_INCREMENT_DELTA`.
    pub fn new(maxbytes: usize) -> io::Result<Self> {
        if maxbytes == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "maxbytes is 0"));
        }
        if maxbytes % LARGE_CHUNK_SZ != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "maxbytes is not a multiple of the large chunk size",
            ));
        }
        if maxbytes % FLAT_STORAGE_INCREMENT_DELTA != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "maxbytes is not a multiple of the increment delta",
            ));
        }

        let base = platform::map_anon(maxbytes)?;
        debug!("mapped {maxbytes} byte region at {base:p}");

        Ok(Region {
            base,
            maxbytes,
            initialized_large: 0,
            unused_memory: maxbytes,
        })
    }

    /// Commit the next `FLAT_STORAGE_INCREMENT_DELTA` bytes.  Returns the
    /// range of newly initialized large-chunk slots, or `None` when the
    /// capacity budget is exhausted.
    pub(crate) fn commit(&mut self) -> Option<Range<usize>> {
        if FLAT_STORAGE_INCREMENT_DELTA > self.unused_memory {
            return None;
        }
        let start = self.initialized_large;
        let end = start + FLAT_STORAGE_INCREMENT_DELTA / LARGE_CHUNK_SZ;
        self.initialized_large = end;
        self.unused_memory -= FLAT_STORAGE_INCREMENT_DELTA;
        debug!(
            "committed large chunks {start}..{end}, {} bytes of budget left",
            self.unused_memory
        );
        Some(start..end)
    }

    /// Configured capacity in bytes.
    pub fn maxbytes(&self) -> usize {
        self.maxbytes
    }

    /// Total large-chunk slots the region can ever hold.
    pub fn total_large(&self) -> usize {
        self.maxbytes / LARGE_CHUNK_SZ
    }

    /// Large-chunk slots initialized so far.
    pub fn initialized_large(&self) -> usize {
        self.initialized_large
    }

    /// Bytes of capacity not yet committed.
    pub fn unused_memory(&self) -> usize {
        self.unused_memory
    }

    /// Payload bytes of `chunk`, starting `offset` bytes into its slot.
    #[inline]
    pub(crate) fn data(&self, chunk: ChunkPtr, offset: usize, len: usize) -> &[u8] {
        let off = chunk.byte_offset() + offset;
        assert!(off + len <= self.initialized_large * LARGE_CHUNK_SZ);
        unsafe { slice::from_raw_parts(self.base.add(off), len) }
    }

    /// Mutable payload bytes of `chunk`, starting `offset` bytes into its
    /// slot.
    #[inline]
    pub(crate) fn data_mut(&mut self, chunk: ChunkPtr, offset: usize, len: usize) -> &mut [u8] {
        let off = chunk.byte_offset() + offset;
        assert!(off + len <= self.initialized_large * LARGE_CHUNK_SZ);
        unsafe { slice::from_raw_parts_mut(self.base.add(off), len) }
    }

    /// Byte-copy the whole small-chunk slot `from` onto `to`.  Used by the
    /// coalescer when migrating a live small chunk to a fresh slot.
    pub(crate) fn migrate_small(&mut self, from: ChunkPtr, to: ChunkPtr) {
        assert_ne!(from, to);
        let src = from.byte_offset();
        let dst = to.byte_offset();
        let end = self.initialized_large * LARGE_CHUNK_SZ;
        assert!(src + SMALL_CHUNK_SZ <= end && dst + SMALL_CHUNK_SZ <= end);
        // Slots are disjoint, so a non-overlapping copy is fine.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(src), self.base.add(dst), SMALL_CHUNK_SZ);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.base, self.maxbytes) };
    }
}
