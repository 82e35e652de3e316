// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// POSIX anonymous mapping via mmap(MAP_PRIVATE | MAP_ANON).  Pages are
// zero-filled and paged in on first touch, which is what keeps the
// resident set proportional to the initialized watermark rather than to
// the configured capacity.

use std::io;
use std::ptr;

/// Map `len` bytes of zeroed, private, anonymous memory.
pub(crate) fn map_anon(len: usize) -> io::Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// Release a mapping created by `map_anon`.
///
/// # Safety
/// `mem` must be the pointer returned by `map_anon(len)` and must not be
/// used afterwards.
pub(crate) unsafe fn unmap(mem: *mut u8, len: usize) {
    libc::munmap(mem as *mut libc::c_void, len);
}
