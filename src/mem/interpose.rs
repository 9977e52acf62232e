//! C-callable allocator interposition.
//!
//! With the `interpose` feature enabled the crate exports the standard
//! allocation entry points, shadowing the libc versions at link time.
//! Every call routes through the calling thread's place stack, so plain
//! `malloc` in any linked code allocates on the current place's node.
//!
//! Departures from POSIX:
//!
//! - `realloc` grows only: a shrinking request returns the pointer
//!   unchanged.
//! - `malloc_stats` and `mallopt` are no-ops.
//!
//! Build as a `cdylib`/`staticlib` and link (or `LD_PRELOAD`) into the
//! target process.

use std::ptr;

use libc::{c_int, c_void, size_t};

use crate::mem::msource::MemSource;
use crate::mem::place;
use crate::mem::sysalloc::PAGE_SIZE;

#[inline]
fn stackedmalloc(sz: size_t) -> *mut c_void {
    place::curr_msource().alloc(sz) as *mut c_void
}

#[inline]
fn stackedmalloc_aligned(align: size_t, sz: size_t) -> *mut c_void {
    if sz == 0 {
        return ptr::null_mut();
    }
    place::curr_msource().alloc_aligned(align, sz) as *mut c_void
}

/// `malloc(3)` routed through the place stack.
#[no_mangle]
pub extern "C" fn malloc(sz: size_t) -> *mut c_void {
    stackedmalloc(sz)
}

/// `free(3)` for pointers from any memory source.
#[no_mangle]
pub extern "C" fn free(p: *mut c_void) {
    MemSource::free(p as *mut u8);
}

/// `calloc(3)`: zero-filled allocation.
#[no_mangle]
pub extern "C" fn calloc(n: size_t, sz: size_t) -> *mut c_void {
    let total = match n.checked_mul(sz) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let p = stackedmalloc(total);
    if !p.is_null() {
        // Safety: fresh allocation of `total` bytes.
        unsafe { ptr::write_bytes(p as *mut u8, 0, total) };
    }
    p
}

/// `realloc(3)`. Shrinking requests return `p` unchanged.
#[no_mangle]
pub extern "C" fn realloc(p: *mut c_void, sz: size_t) -> *mut c_void {
    let old_size = if p.is_null() {
        0
    } else {
        MemSource::usable_size(p as *mut u8)
    };
    if sz <= old_size && !p.is_null() {
        return p;
    }

    let pnew = stackedmalloc(sz);
    if pnew.is_null() {
        return ptr::null_mut();
    }

    if !p.is_null() {
        // Safety: both blocks are live; old_size bytes are readable from
        // p and writable at pnew (pnew holds >= sz > old_size bytes).
        unsafe { ptr::copy(p as *const u8, pnew as *mut u8, old_size) };
        MemSource::free(p as *mut u8);
    }
    pnew
}

/// `posix_memalign(3)`.
#[no_mangle]
pub extern "C" fn posix_memalign(out: *mut *mut c_void, align: size_t, sz: size_t) -> c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    if sz == 0 {
        // Safety: out checked non-null.
        unsafe { *out = ptr::null_mut() };
        return 0;
    }
    let p = stackedmalloc_aligned(align, sz);
    if p.is_null() {
        return libc::ENOMEM;
    }
    // Safety: out checked non-null.
    unsafe { *out = p };
    0
}

/// `memalign(3)`.
#[no_mangle]
pub extern "C" fn memalign(align: size_t, sz: size_t) -> *mut c_void {
    stackedmalloc_aligned(align, sz)
}

/// `aligned_alloc(3)`: size must be a multiple of alignment.
#[no_mangle]
pub extern "C" fn aligned_alloc(align: size_t, sz: size_t) -> *mut c_void {
    if align == 0 || sz % align != 0 {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    stackedmalloc_aligned(align, sz)
}

/// `valloc(3)`: page-aligned allocation.
#[no_mangle]
pub extern "C" fn valloc(sz: size_t) -> *mut c_void {
    stackedmalloc_aligned(PAGE_SIZE, sz)
}

/// `pvalloc(3)`: page-aligned, size rounded up to whole pages.
#[no_mangle]
pub extern "C" fn pvalloc(sz: size_t) -> *mut c_void {
    let rounded = crate::mem::sysalloc::align_up(sz, PAGE_SIZE);
    stackedmalloc_aligned(PAGE_SIZE, rounded)
}

/// `malloc_stats(3)`: intentionally a no-op.
#[no_mangle]
pub extern "C" fn malloc_stats() {}

/// `mallopt(3)`: intentionally a no-op.
#[no_mangle]
pub extern "C" fn mallopt(_cmd: c_int, _value: c_int) -> c_int {
    0
}

#[inline]
fn set_errno(err: c_int) {
    // Safety: __errno_location returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = err };
}
