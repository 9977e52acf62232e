//! Anonymous page mapping bound to NUMA nodes.
//!
//! Thin wrappers over `mmap`/`munmap`/`madvise` plus the NUMA policy
//! syscalls. The policy syscalls (`mbind`, `move_pages`) have no libc
//! wrapper on all targets, so they go through `libc::syscall` with the
//! policy constants defined here.
//!
//! All functions degrade gracefully on hosts without NUMA support: mapping
//! succeeds without binding, page moves report failure without touching
//! memory.

use std::io;
use std::ptr;

/// Memory page size. The runtime assumes 4 KiB pages; huge pages are
/// handled transparently by the kernel underneath these mappings.
pub const PAGE_SIZE: usize = 4096;

// Policy constants from <numaif.h>; not exported by the libc crate on
// every target.
#[cfg(target_os = "linux")]
const MPOL_BIND: libc::c_int = 2;
#[cfg(target_os = "linux")]
const MPOL_MF_MOVE: libc::c_int = 1 << 1;

/// Nodemask large enough for 1024 nodes.
#[cfg(target_os = "linux")]
const NODEMASK_WORDS: usize = 16;
#[cfg(target_os = "linux")]
const MAX_NODES: usize = NODEMASK_WORDS * 64;

/// Round `v` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Round `v` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(v: usize, align: usize) -> usize {
    v & !(align - 1)
}

/// Map `len` bytes of zeroed anonymous memory, bound to physical node
/// `node` when `node >= 0`. Returns null on exhaustion.
pub fn map_pages(len: usize, node: i32) -> *mut u8 {
    let len = align_up(len, PAGE_SIZE);

    // Safety: anonymous private mapping with no address hint; result is
    // checked against MAP_FAILED before use.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return ptr::null_mut();
    }

    if node >= 0 {
        bind_to_node(ptr as *mut u8, len, node);
    }

    ptr as *mut u8
}

/// Apply an MPOL_BIND policy for `node` to `[ptr, ptr+len)`.
///
/// Binding failure is not fatal: the mapping stays usable, only locality
/// is lost.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, len: usize, node: i32) {
    if node as usize >= MAX_NODES {
        log_critical!("cannot bind memory: node {} exceeds nodemask capacity", node);
        return;
    }

    let mut nodemask = [0u64; NODEMASK_WORDS];
    nodemask[node as usize / 64] = 1u64 << (node as usize % 64);

    // Safety: ptr/len describe the mapping created by the caller; the
    // nodemask is a live stack array of MAX_NODES bits.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr,
            len,
            MPOL_BIND,
            nodemask.as_ptr(),
            MAX_NODES + 1,
            0,
        )
    };
    if rc != 0 {
        log_critical!(
            "mbind to node {} failed: {} (memory stays unbound)",
            node,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: *mut u8, _len: usize, _node: i32) {}

/// Unmap a region created by [`map_pages`].
///
/// # Safety
///
/// `ptr`/`len` must describe exactly one live mapping and nothing may
/// reference it afterwards.
pub unsafe fn unmap(ptr: *mut u8, len: usize) {
    let len = align_up(len, PAGE_SIZE);
    if libc::munmap(ptr as *mut libc::c_void, len) != 0 {
        log_critical!("munmap failed: {}", io::Error::last_os_error());
    }
}

/// Touch one byte per page so the pages are faulted in (onto the bound
/// node, under first-touch or the region's policy). Returns bytes touched.
pub fn touch_pages(ptr: *mut u8, len: usize) -> usize {
    let mut off = 0;
    while off < len {
        // Safety: caller guarantees [ptr, ptr+len) is mapped writable.
        // A volatile read-write cycle defeats dead-store elimination.
        unsafe {
            let p = ptr.add(off);
            let v = ptr::read_volatile(p);
            ptr::write_volatile(p, v);
        }
        off += PAGE_SIZE;
    }
    len
}

/// Tell the kernel the page-aligned interior of `[ptr, ptr+len)` is not
/// needed; it will fault back in on the current policy node on next use.
///
/// # Safety
///
/// The range must lie inside one live mapping; its contents are lost.
pub unsafe fn advise_dont_need(ptr: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        if libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
            log_debug!("madvise(DONTNEED) failed: {}", io::Error::last_os_error());
        }
    }
}

/// Outcome of a bulk page move.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveReport {
    /// Pages confirmed on the destination node.
    pub moved: usize,
    /// Pages that still failed after all retries.
    pub failed: usize,
}

/// Move the given pages to physical node `dst`, retrying `EBUSY` pages up
/// to `max_retries` times. Other per-page errors are logged and counted
/// as failed, never fatal.
///
/// # Safety
///
/// Every entry must point into a mapping owned by this process.
#[cfg(target_os = "linux")]
pub unsafe fn move_pages_to_node(
    pages: &[*mut libc::c_void],
    dst: i32,
    max_retries: usize,
) -> MoveReport {
    let mut report = MoveReport::default();
    if pages.is_empty() {
        return report;
    }

    let mut pending: Vec<*mut libc::c_void> = pages.to_vec();
    let mut attempt = 0;

    loop {
        let count = pending.len();
        let nodes = vec![dst; count];
        let mut status = vec![0i32; count];

        let rc = libc::syscall(
            libc::SYS_move_pages,
            0, // this process
            count,
            pending.as_ptr(),
            nodes.as_ptr(),
            status.as_mut_ptr(),
            MPOL_MF_MOVE,
        );
        if rc < 0 {
            log_critical!(
                "move_pages({} pages -> node {}): {}",
                count,
                dst,
                io::Error::last_os_error()
            );
            report.failed += count;
            return report;
        }

        let mut busy = Vec::new();
        for (i, &st) in status.iter().enumerate() {
            if st >= 0 {
                report.moved += 1;
            } else if st == -libc::EBUSY {
                busy.push(pending[i]);
            } else {
                log_debug!(
                    "move_pages: page {:p} -> node {} failed with status {}",
                    pending[i],
                    dst,
                    st
                );
                report.failed += 1;
            }
        }

        if busy.is_empty() || attempt >= max_retries {
            report.failed += busy.len();
            return report;
        }
        pending = busy;
        attempt += 1;
    }
}

/// Non-Linux stub: page migration is unavailable.
#[cfg(not(target_os = "linux"))]
pub unsafe fn move_pages_to_node(
    pages: &[*mut libc::c_void],
    _dst: i32,
    _max_retries: usize,
) -> MoveReport {
    MoveReport {
        moved: 0,
        failed: pages.len(),
    }
}

/// Physical node currently backing the page at `ptr`, or -1.
pub fn node_of_page(ptr: *const u8) -> i32 {
    #[cfg(target_os = "linux")]
    {
        let pages = [ptr as *mut libc::c_void];
        let mut status = [-1i32; 1];
        // Safety: a null nodes array turns move_pages into a query.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0,
                1usize,
                pages.as_ptr(),
                ptr::null::<libc::c_int>(),
                status.as_mut_ptr(),
                0,
            )
        };
        if rc == 0 && status[0] >= 0 {
            return status[0];
        }
    }
    let _ = ptr;
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
    }

    #[test]
    fn test_map_touch_unmap() {
        let len = 16 * PAGE_SIZE;
        let ptr = map_pages(len, -1);
        assert!(!ptr.is_null());
        assert_eq!(touch_pages(ptr, len), len);
        // Safety: mapping was just created and is unused elsewhere.
        unsafe {
            ptr.write(0xA5);
            assert_eq!(ptr.read(), 0xA5);
            unmap(ptr, len);
        }
    }

    #[test]
    fn test_map_bound_to_first_node() {
        let node = *crate::topology::Topology::get().node_ids().first().unwrap();
        let ptr = map_pages(PAGE_SIZE, node);
        assert!(!ptr.is_null());
        touch_pages(ptr, PAGE_SIZE);
        let backing = node_of_page(ptr);
        // Either the kernel reports the bound node or the query is
        // unsupported on this host.
        assert!(backing == node || backing == -1);
        unsafe { unmap(ptr, PAGE_SIZE) };
    }
}
