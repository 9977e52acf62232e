//! Arenas and chunk footers.
//!
//! An arena is a bounded virtual region bound to one physical node,
//! served by the sequential [`BestFit`] allocator behind a spinlock.
//! Every block handed out carries a [`ChunkFooter`] immediately below the
//! user pointer, recording the owning memory source and arena — that is
//! how `free(ptr)` finds its way home without any global lookup table.
//!
//! Arena headers are *placed*, not boxed: the native arena sits inside
//! its memory source's own mapping, later arenas at the base of fresh
//! mappings. All linkage is raw pointers owned by the source.

use std::ptr;

use crate::mem::bestfit::BestFit;
use crate::mem::msource::MemSourceImpl;
use crate::mem::sysalloc::{self, PAGE_SIZE};
use crate::sync::RawSpinLock;

/// Footer placed directly below every user pointer.
///
/// Interpretation:
/// - `source` set, `arena` set — block lives in `arena`.
/// - `source` set, `arena` null — block is a direct OS mapping
///   ([`MmapChunkFooter`]).
/// - `source` null — *fake footer* created by an aligned allocation;
///   `arena` is really a link to the actual footer (one hop at most).
#[repr(C)]
pub struct ChunkFooter {
    pub(crate) source: *mut MemSourceImpl,
    pub(crate) arena: *mut Arena,
}

/// Distance between a footer and the user pointer above it.
pub const FOOTER_OFFSET: usize = {
    let sz = std::mem::size_of::<ChunkFooter>();
    (sz + 15) & !15
};

impl ChunkFooter {
    /// Footer location for a user pointer.
    #[inline]
    pub(crate) unsafe fn from_pointer(p: *mut u8) -> *mut ChunkFooter {
        p.sub(FOOTER_OFFSET) as *mut ChunkFooter
    }

    /// User pointer for a footer location.
    #[inline]
    pub(crate) unsafe fn to_pointer(footer: *mut ChunkFooter) -> *mut u8 {
        (footer as *mut u8).add(FOOTER_OFFSET)
    }

    /// Resolve fake footers to the actual one. Terminates in one hop by
    /// construction.
    #[inline]
    pub(crate) unsafe fn resolve(p: *mut u8) -> *mut ChunkFooter {
        let mut footer = Self::from_pointer(p);
        while (*footer).source.is_null() {
            footer = (*footer).arena as *mut ChunkFooter;
        }
        footer
    }
}

/// Footer of a directly OS-mapped block; embeds the regular footer at its
/// exact end so the shared `from_pointer` arithmetic works unchanged.
#[repr(C)]
pub struct MmapChunkFooter {
    /// Total mapping size (payload + this header).
    pub(crate) size: usize,
    /// Neighbors in the owning source's mmap list.
    pub(crate) prev: *mut MmapChunkFooter,
    pub(crate) next: *mut MmapChunkFooter,
    _pad: usize,
    pub(crate) footer: ChunkFooter,
}

/// Distance between an mmap footer and the user pointer above it.
pub const MMAP_FOOTER_OFFSET: usize = std::mem::size_of::<MmapChunkFooter>();

const _: () = assert!(
    std::mem::size_of::<MmapChunkFooter>() % 16 == 0,
    "mmap footer must keep user pointers 16-aligned"
);

impl MmapChunkFooter {
    #[inline]
    pub(crate) unsafe fn from_pointer(p: *mut u8) -> *mut MmapChunkFooter {
        p.sub(MMAP_FOOTER_OFFSET) as *mut MmapChunkFooter
    }

    #[inline]
    pub(crate) unsafe fn to_pointer(footer: *mut MmapChunkFooter) -> *mut u8 {
        (footer as *mut u8).add(MMAP_FOOTER_OFFSET)
    }

    /// Initialize a fresh mapping's footer fields.
    pub(crate) unsafe fn init(
        footer: *mut MmapChunkFooter,
        source: *mut MemSourceImpl,
        size: usize,
    ) {
        ptr::write(
            footer,
            MmapChunkFooter {
                size,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                _pad: 0,
                footer: ChunkFooter {
                    source,
                    arena: ptr::null_mut(),
                },
            },
        );
    }
}

/// A bounded region served by a best-fit allocator.
pub struct Arena {
    pub(crate) msource: *mut MemSourceImpl,
    /// Size of the allocator region in bytes.
    pub(crate) size: usize,
    /// Highest observed end-of-allocation offset from the region base;
    /// sizes the page list for migration.
    pub(crate) alloc_end: usize,
    /// The native arena is embedded in its source's mapping; others own a
    /// separate mapping that must be returned on destruction.
    pub(crate) native: bool,
    /// Start of the allocator region.
    pub(crate) base: *mut u8,
    pub(crate) heap: BestFit,
    pub(crate) lock: RawSpinLock,
    /// Newest-first chain owned by the source.
    pub(crate) prev: *mut Arena,
    pub(crate) next: *mut Arena,
}

impl Arena {
    /// Construct an arena header at `mem`, which is the base of a mapping
    /// of `total` bytes.
    ///
    /// With `dst_node < 0` the allocator region follows the header inside
    /// the same mapping ("native" placement relative to this header).
    /// Otherwise a separate region of `total` bytes is mapped on
    /// `dst_node` — used by home-node sources whose metadata must stay on
    /// the home node while payload lives on the data node. Returns null
    /// when that extra mapping fails.
    ///
    /// # Safety
    ///
    /// `mem..mem+total` must be a fresh writable mapping with nothing
    /// else placed in it.
    pub(crate) unsafe fn init_in_place(
        mem: *mut u8,
        total: usize,
        msource: *mut MemSourceImpl,
        dst_node: i32,
    ) -> *mut Arena {
        let arena = mem as *mut Arena;
        let header_end = sysalloc::align_up(mem as usize + std::mem::size_of::<Arena>(), 64);

        let (base, size, native) = if dst_node < 0 {
            let base = header_end as *mut u8;
            let size = (mem as usize + total) - header_end;
            (base, size, true)
        } else {
            let base = sysalloc::map_pages(total, dst_node);
            if base.is_null() {
                return ptr::null_mut();
            }
            (base, total, false)
        };

        ptr::write(
            arena,
            Arena {
                msource,
                size,
                alloc_end: 0,
                native,
                base,
                heap: BestFit::new(base, size),
                lock: RawSpinLock::new(),
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            },
        );

        arena
    }

    /// Tear down the arena header; returns the payload mapping if it was
    /// separate. The header's own mapping is the caller's to unmap.
    ///
    /// # Safety
    ///
    /// No blocks from this arena may be referenced afterwards.
    pub(crate) unsafe fn destroy(arena: *mut Arena) {
        if !(*arena).native {
            sysalloc::unmap((*arena).base, (*arena).size);
        }
    }

    /// Allocate `sz` user bytes. Returns the *footer* (the caller derives
    /// the user pointer), or null when this arena is exhausted.
    pub(crate) unsafe fn alloc(arena: *mut Arena, sz: usize) -> *mut ChunkFooter {
        let this = &mut *arena;
        this.lock.lock();

        let chunk = this.heap.alloc(sz + FOOTER_OFFSET) as *mut ChunkFooter;
        if !chunk.is_null() {
            let rel_end = (chunk as usize) - (this.base as usize) + sz + FOOTER_OFFSET;
            if this.alloc_end < rel_end {
                this.alloc_end = rel_end;
            }
            (*chunk).source = this.msource;
            (*chunk).arena = arena;
        }

        this.lock.unlock();
        chunk
    }

    /// Return a block to the allocator.
    pub(crate) unsafe fn free(arena: *mut Arena, footer: *mut ChunkFooter) {
        let this = &mut *arena;
        this.lock.lock();
        if cfg!(debug_assertions) {
            // Poison the footer so stale pointers fault loudly.
            ptr::write_bytes(footer as *mut u8, 0xCC, FOOTER_OFFSET);
        }
        this.heap.free(footer as *mut u8);
        this.lock.unlock();
    }

    /// Usable payload size of a block in this arena.
    pub(crate) unsafe fn usable_size(arena: *mut Arena, footer: *mut ChunkFooter) -> usize {
        let this = &mut *arena;
        this.lock.lock();
        let size = this.heap.usable_size(footer as *mut u8) - FOOTER_OFFSET;
        this.lock.unlock();
        size
    }

    /// Fault in the first `min(bytes, size)` bytes of the region.
    pub(crate) unsafe fn prefault(arena: *mut Arena, bytes: usize) -> usize {
        let this = &*arena;
        let max = bytes.min(this.size);
        sysalloc::touch_pages(this.base, max)
    }

    /// Append this arena's backing pages (up to the top chunk) to `pages`
    /// and drop the unused tail. Caller holds the arena lock.
    pub(crate) unsafe fn collect_pages_locked(
        arena: *mut Arena,
        pages: &mut Vec<*mut libc::c_void>,
    ) {
        let this = &*arena;

        let (top_start, top_len) = this.heap.top_chunk_extent();

        // Pages holding the header (native arenas share their first pages
        // with the source header) plus everything up to the top chunk.
        let span_start = if this.native {
            sysalloc::align_down(arena as usize, PAGE_SIZE)
        } else {
            sysalloc::align_down(this.base as usize, PAGE_SIZE)
        };
        // With no top chunk the span covers the whole region; the -1
        // keeps a page-aligned region end from adding a page beyond the
        // mapping.
        let top_addr = if top_len == 0 {
            (top_start as usize).saturating_sub(1)
        } else {
            top_start as usize
        };
        let span_end = sysalloc::align_down(top_addr.max(span_start), PAGE_SIZE);
        let mut page = span_start;
        while page <= span_end {
            pages.push(page as *mut libc::c_void);
            page += PAGE_SIZE;
        }

        // Unused tail pages fault back in on the destination node on
        // demand; no point copying them.
        if top_len > 2 * PAGE_SIZE {
            let dn_start = sysalloc::align_up(top_start as usize + 64, PAGE_SIZE);
            let dn_end = sysalloc::align_down(top_start as usize + top_len - 64, PAGE_SIZE);
            if dn_end > dn_start {
                sysalloc::advise_dont_need(dn_start as *mut u8, dn_end - dn_start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_offsets() {
        assert_eq!(FOOTER_OFFSET % 16, 0);
        assert!(FOOTER_OFFSET >= std::mem::size_of::<ChunkFooter>());
        assert_eq!(MMAP_FOOTER_OFFSET % 16, 0);
        // The embedded footer sits at the exact end of the mmap footer.
        assert_eq!(
            std::mem::size_of::<MmapChunkFooter>(),
            memoffset_footer() + std::mem::size_of::<ChunkFooter>()
        );
    }

    fn memoffset_footer() -> usize {
        // offset_of in stable form: measure via a dummy value.
        let dummy = MmapChunkFooter {
            size: 0,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            _pad: 0,
            footer: ChunkFooter {
                source: std::ptr::null_mut(),
                arena: std::ptr::null_mut(),
            },
        };
        (&dummy.footer as *const _ as usize) - (&dummy as *const _ as usize)
    }

    #[test]
    fn test_arena_alloc_free() {
        let total = 1 << 20;
        let mem = sysalloc::map_pages(total, -1);
        assert!(!mem.is_null());

        unsafe {
            let arena = Arena::init_in_place(mem, total, std::ptr::null_mut(), -1);
            assert!(!arena.is_null());
            assert!((*arena).native);

            let footer = Arena::alloc(arena, 256);
            assert!(!footer.is_null());
            assert_eq!((*footer).arena, arena);

            let user = ChunkFooter::to_pointer(footer);
            user.write_bytes(0x5A, 256);
            assert!(Arena::usable_size(arena, footer) >= 256);

            Arena::free(arena, footer);
            Arena::destroy(arena);
            sysalloc::unmap(mem, total);
        }
    }

    #[test]
    fn test_arena_alloc_end_tracks_high_water() {
        let total = 1 << 20;
        let mem = sysalloc::map_pages(total, -1);
        unsafe {
            let arena = Arena::init_in_place(mem, total, std::ptr::null_mut(), -1);
            let f1 = Arena::alloc(arena, 128);
            let end1 = (*arena).alloc_end;
            let f2 = Arena::alloc(arena, 128);
            let end2 = (*arena).alloc_end;
            assert!(end2 > end1);
            Arena::free(arena, f2);
            // High-water mark never shrinks.
            assert_eq!((*arena).alloc_end, end2);
            Arena::free(arena, f1);
            Arena::destroy(arena);
            sysalloc::unmap(mem, total);
        }
    }

    #[test]
    fn test_arena_exhaustion() {
        let total = 1 << 16;
        let mem = sysalloc::map_pages(total, -1);
        unsafe {
            let arena = Arena::init_in_place(mem, total, std::ptr::null_mut(), -1);
            assert!(Arena::alloc(arena, 1 << 20).is_null());
            Arena::destroy(arena);
            sysalloc::unmap(mem, total);
        }
    }
}
