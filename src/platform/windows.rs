// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 flatcache contributors
//
// Windows anonymous mapping via VirtualAlloc.  MEM_COMMIT only reserves
// zeroed demand-paged memory; physical pages still arrive on first touch,
// matching the POSIX behaviour.

use std::io;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};

/// Map `len` bytes of zeroed, private, anonymous memory.
pub(crate) fn map_anon(len: usize) -> io::Result<*mut u8> {
    let mem = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    if mem.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// Release a mapping created by `map_anon`.
///
/// # Safety
/// `mem` must be the pointer returned by `map_anon` and must not be used
/// afterwards.
pub(crate) unsafe fn unmap(mem: *mut u8, _len: usize) {
    VirtualFree(mem as *mut core::ffi::c_void, 0, MEM_RELEASE);
}
