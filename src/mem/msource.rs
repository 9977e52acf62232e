//! Node-bound memory sources.
//!
//! A [`MemSource`] owns a chain of arenas plus a list of directly-mapped
//! large blocks, all bound to one physical NUMA node. It is the unit of
//! allocation routing: the place stack resolves every ordinary heap call
//! to some source, and `free` finds the source again through the chunk
//! footer below the pointer.
//!
//! ## Lifetime
//!
//! Sources are kept alive by a *combined* counter packing the number of
//! outstanding blocks (low 40 bits) and the number of handle references
//! (high 24 bits) into one atomic word. Whichever operation brings the
//! whole word to zero — the last `free` or the last handle drop — runs
//! destruction, exactly once.
//!
//! ## Placement
//!
//! The source header lives at the base of its own mapping; the *native*
//! arena is constructed directly behind it. With a home node set, the
//! header mapping is bound to the home node and only arena payload is
//! bound to the data node (metadata stays close to the threads that walk
//! it).

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::mem::arena::{Arena, ChunkFooter, MmapChunkFooter, FOOTER_OFFSET, MMAP_FOOTER_OFFSET};
use crate::mem::sysalloc::{self, PAGE_SIZE};
use crate::node::{Node, NodeList};
use crate::sync::RawSpinLock;
use crate::topology::Topology;

/// Default cutoff above which blocks get a dedicated OS mapping.
pub const MMAP_THRESHOLD: usize = 1 << 20;
/// Size of each follow-up arena mapping.
const ARENA_CHUNK_SIZE: usize = 64 << 20;
/// Size of the global and per-node singleton sources.
const GLOBAL_SOURCE_SIZE: usize = 1 << 24;
/// Page-migration retries for EBUSY pages.
const MIGRATE_RETRIES: usize = 10;

const NAME_LENGTH: usize = 128;

// ============================================================================
// Combined block / reference counter
// ============================================================================

const BLOCK_BITS: u32 = 40;
const REF_UNIT: u64 = 1 << BLOCK_BITS;
const BLOCK_MASK: u64 = REF_UNIT - 1;

/// Outstanding-block count and handle refcount in one atomic word.
struct BlockCount {
    value: CachePadded<AtomicU64>,
}

impl BlockCount {
    fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn blocks(&self) -> u64 {
        self.value.load(Ordering::Relaxed) & BLOCK_MASK
    }

    fn refs(&self) -> u64 {
        self.value.load(Ordering::Relaxed) >> BLOCK_BITS
    }

    fn add_ref(&self) {
        self.value.fetch_add(REF_UNIT, Ordering::AcqRel);
    }

    /// Returns true when this release brought the whole word to zero.
    fn release_ref(&self) -> bool {
        self.value.fetch_sub(REF_UNIT, Ordering::AcqRel) == REF_UNIT
    }

    fn add_block(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this release brought the whole word to zero.
    fn release_block(&self) -> bool {
        self.value.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

// ============================================================================
// Source implementation header
// ============================================================================

/// Usage statistics of one source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    /// Number of arenas (including the native one).
    pub arena_count: usize,
    /// Page-granular memory touched by arenas.
    pub arena_used: usize,
    /// Payload bytes currently allocated from arenas.
    pub arena_size: usize,
    /// Number of direct OS mappings.
    pub hugeobj_count: usize,
    /// Page-granular memory held by direct mappings.
    pub hugeobj_used: usize,
    /// Bytes of direct mappings (including headers).
    pub hugeobj_size: usize,
}

/// The in-mapping source header. Only ever handled through raw pointers;
/// the public face is [`MemSource`].
pub struct MemSourceImpl {
    description: [u8; NAME_LENGTH],
    description_len: usize,

    /// Where the memory comes from.
    node: i32,
    /// Where the metadata lies, or -1 if identical to `node`.
    node_home: i32,

    mmap_threshold: AtomicUsize,
    /// Size of the header mapping.
    mem_size: usize,

    arena_lock: RawSpinLock,
    native_arena: *mut Arena,
    active_arena: *mut Arena,

    mmap_lock: RawSpinLock,
    mmap_head: *mut MmapChunkFooter,

    counter: BlockCount,
}

impl MemSourceImpl {
    /// Map a fresh region and construct a source in it.
    ///
    /// Returns null when the OS refuses the mapping.
    unsafe fn create(phys_node: i32, size: usize, name: &str, home_node: i32) -> *mut MemSourceImpl {
        let map_node = if home_node >= 0 { home_node } else { phys_node };
        let mem = sysalloc::map_pages(size, map_node);
        if mem.is_null() {
            return ptr::null_mut();
        }

        let ms = mem as *mut MemSourceImpl;

        let mut description = [0u8; NAME_LENGTH];
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(NAME_LENGTH);
        description[..len].copy_from_slice(&name_bytes[..len]);

        ptr::write(
            ms,
            MemSourceImpl {
                description,
                description_len: len,
                node: phys_node,
                node_home: home_node,
                mmap_threshold: AtomicUsize::new(MMAP_THRESHOLD),
                mem_size: size,
                arena_lock: RawSpinLock::new(),
                native_arena: ptr::null_mut(),
                active_arena: ptr::null_mut(),
                mmap_lock: RawSpinLock::new(),
                mmap_head: ptr::null_mut(),
                counter: BlockCount::new(),
            },
        );

        // Native arena directly behind the header.
        let arena_start =
            sysalloc::align_up(mem as usize + std::mem::size_of::<MemSourceImpl>(), 64);
        let arena_total = (mem as usize + size) - arena_start;
        let dst_node = if home_node >= 0 { phys_node } else { -1 };
        let arena = Arena::init_in_place(arena_start as *mut u8, arena_total, ms, dst_node);
        if arena.is_null() {
            sysalloc::unmap(mem, size);
            return ptr::null_mut();
        }
        (*ms).native_arena = arena;
        (*ms).active_arena = arena;

        registry().register(ms);
        ms
    }

    /// Tear the source down and return all memory to the OS.
    unsafe fn destroy(ms: *mut MemSourceImpl) {
        debug_assert_eq!((*ms).counter.blocks(), 0);
        debug_assert_eq!((*ms).counter.refs(), 0);

        registry().unregister(ms);

        // Arenas, newest first. Non-native arenas own a payload mapping;
        // arenas other than the native one additionally own their header
        // mapping.
        let native = (*ms).native_arena;
        let mut curr = (*ms).active_arena;
        while !curr.is_null() {
            let next = (*curr).next;
            Arena::destroy(curr);
            if curr != native {
                sysalloc::unmap(curr as *mut u8, ARENA_CHUNK_SIZE);
            }
            curr = next;
        }

        // Directly-mapped blocks.
        let mut mch = (*ms).mmap_head;
        while !mch.is_null() {
            let next = (*mch).next;
            sysalloc::unmap(mch as *mut u8, (*mch).size);
            mch = next;
        }

        let size = (*ms).mem_size;
        sysalloc::unmap(ms as *mut u8, size);
    }

    unsafe fn add_ref(ms: *mut MemSourceImpl) {
        (*ms).counter.add_ref();
    }

    unsafe fn release_ref(ms: *mut MemSourceImpl) {
        // Last handle gone: the source lingers only while blocks remain.
        if (*ms).counter.refs() == 1 {
            log_debug!("abandon MemSource {}", Self::describe(ms));
        }
        if (*ms).counter.release_ref() {
            Self::destroy(ms);
        }
    }

    unsafe fn describe(ms: *mut MemSourceImpl) -> String {
        let name =
            std::str::from_utf8(&(&(*ms).description)[..(*ms).description_len]).unwrap_or("<?>");
        format!(
            "{} [{:p}] n={} blks={}",
            name,
            ms,
            (*ms).node,
            (*ms).counter.blocks()
        )
    }

    /// Chain a fresh arena in front of the active one. Caller holds the
    /// arena-list lock.
    unsafe fn create_new_arena(ms: *mut MemSourceImpl) -> *mut Arena {
        debug_assert!(!(*ms).active_arena.is_null());
        debug_assert!((*(*ms).active_arena).prev.is_null());

        let home = (*ms).node_home;
        let node = (*ms).node;
        let header_node = if home >= 0 { home } else { node };
        let mem = sysalloc::map_pages(ARENA_CHUNK_SIZE, header_node);
        if mem.is_null() {
            return ptr::null_mut();
        }

        let dst_node = if home >= 0 { node } else { -1 };
        let arena = Arena::init_in_place(mem, ARENA_CHUNK_SIZE, ms, dst_node);
        if arena.is_null() {
            sysalloc::unmap(mem, ARENA_CHUNK_SIZE);
            return ptr::null_mut();
        }

        (*arena).next = (*ms).active_arena;
        (*(*ms).active_arena).prev = arena;
        (*ms).active_arena = arena;
        arena
    }

    unsafe fn alloc(ms: *mut MemSourceImpl, bytes: usize) -> *mut u8 {
        let result;

        if bytes >= (*ms).mmap_threshold.load(Ordering::Relaxed) {
            // Dedicated OS mapping.
            let size = bytes + MMAP_FOOTER_OFFSET;
            let mem = sysalloc::map_pages(size, (*ms).node);
            if mem.is_null() {
                return ptr::null_mut();
            }

            let chunk = mem as *mut MmapChunkFooter;
            MmapChunkFooter::init(chunk, ms, size);

            (*ms).mmap_lock.lock();
            (*chunk).next = (*ms).mmap_head;
            if !(*ms).mmap_head.is_null() {
                (*(*ms).mmap_head).prev = chunk;
            }
            (*ms).mmap_head = chunk;
            (*ms).mmap_lock.unlock();

            result = MmapChunkFooter::to_pointer(chunk);
        } else {
            (*ms).arena_lock.lock();

            let mut chunk = Arena::alloc((*ms).active_arena, bytes);
            if chunk.is_null() {
                let arena = Self::create_new_arena(ms);
                if !arena.is_null() {
                    chunk = Arena::alloc(arena, bytes);
                }
            }

            (*ms).arena_lock.unlock();

            if chunk.is_null() {
                return ptr::null_mut();
            }
            result = ChunkFooter::to_pointer(chunk);
        }

        (*ms).counter.add_block();
        result
    }

    unsafe fn alloc_aligned(ms: *mut MemSourceImpl, align: usize, sz: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());

        // Over-allocate to make room for the alignment shift plus a fake
        // footer below the shifted pointer.
        let alloc_size = sz + align + FOOTER_OFFSET;
        let p = Self::alloc(ms, alloc_size);
        if p.is_null() {
            return ptr::null_mut();
        }

        if (p as usize) & (align - 1) == 0 {
            return p;
        }

        let shifted = sysalloc::align_up(p as usize + FOOTER_OFFSET, align) as *mut u8;
        let actual = ChunkFooter::from_pointer(p);
        let fake = ChunkFooter::from_pointer(shifted);
        (*fake).source = ptr::null_mut();
        (*fake).arena = actual as *mut Arena;
        shifted
    }

    /// Returns true when the freed block was the last thing keeping the
    /// source alive.
    unsafe fn free_impl(ms: *mut MemSourceImpl, footer: *mut ChunkFooter) -> bool {
        if !(*footer).arena.is_null() {
            Arena::free((*footer).arena, footer);
        } else {
            let user = ChunkFooter::to_pointer(footer);
            let mch = MmapChunkFooter::from_pointer(user);

            (*ms).mmap_lock.lock();
            if (*mch).prev.is_null() {
                (*ms).mmap_head = (*mch).next;
            } else {
                (*(*mch).prev).next = (*mch).next;
            }
            if !(*mch).next.is_null() {
                (*(*mch).next).prev = (*mch).prev;
            }
            (*ms).mmap_lock.unlock();

            sysalloc::unmap(mch as *mut u8, (*mch).size);
        }

        (*ms).counter.release_block()
    }

    unsafe fn free_ptr(p: *mut u8) {
        if p.is_null() {
            return;
        }
        let footer = ChunkFooter::resolve(p);
        let source = (*footer).source;
        if Self::free_impl(source, footer) {
            Self::destroy(source);
        }
    }

    unsafe fn block_size(p: *mut u8) -> usize {
        let footer = ChunkFooter::resolve(p);
        if !(*footer).arena.is_null() {
            Arena::usable_size((*footer).arena, footer)
        } else {
            let user = ChunkFooter::to_pointer(footer);
            (*MmapChunkFooter::from_pointer(user)).size - MMAP_FOOTER_OFFSET
        }
    }

    unsafe fn physical_node_of(p: *mut u8) -> i32 {
        if p.is_null() {
            return -1;
        }
        let footer = ChunkFooter::resolve(p);
        (*(*footer).source).node
    }

    /// Move every backing page onto `dst`. Blocks all allocation on this
    /// source for the duration. Returns the number of pages processed.
    unsafe fn migrate(ms: *mut MemSourceImpl, dst: i32) -> usize {
        let mut pages: Vec<*mut libc::c_void> = Vec::new();

        // Lock order: arena list, mmap list, then each arena.
        (*ms).arena_lock.lock();
        (*ms).mmap_lock.lock();

        let mut curr = (*ms).active_arena;
        while !curr.is_null() {
            (*curr).lock.lock();
            Arena::collect_pages_locked(curr, &mut pages);
            curr = (*curr).next;
        }

        let mut mch = (*ms).mmap_head;
        while !mch.is_null() {
            let start = sysalloc::align_down(mch as usize, PAGE_SIZE);
            let end = sysalloc::align_down(mch as usize + (*mch).size - 1, PAGE_SIZE);
            let mut page = start;
            while page <= end {
                pages.push(page as *mut libc::c_void);
                page += PAGE_SIZE;
            }
            mch = (*mch).next;
        }

        let report = sysalloc::move_pages_to_node(&pages, dst, MIGRATE_RETRIES);
        if report.failed > 0 {
            log_critical!(
                "migrate to node {}: {} pages moved, {} failed",
                dst,
                report.moved,
                report.failed
            );
        }

        (*ms).node = dst;

        let mut curr = (*ms).active_arena;
        while !curr.is_null() {
            (*curr).lock.unlock();
            curr = (*curr).next;
        }
        (*ms).mmap_lock.unlock();
        (*ms).arena_lock.unlock();

        pages.len()
    }

    unsafe fn stats(ms: *mut MemSourceImpl) -> SourceStats {
        let mut result = SourceStats::default();

        (*ms).arena_lock.lock();
        let mut arena = (*ms).active_arena;
        while !arena.is_null() {
            (*arena).lock.lock();
            let header_base = if (*arena).native {
                sysalloc::align_down(arena as usize, PAGE_SIZE)
            } else {
                (*arena).base as usize
            };
            let end = (*arena).base as usize + (*arena).alloc_end;
            result.arena_used += sysalloc::align_up(end.saturating_sub(header_base), PAGE_SIZE);
            result.arena_size += (*arena).heap.used_bytes();
            result.arena_count += 1;
            (*arena).lock.unlock();
            arena = (*arena).next;
        }
        (*ms).arena_lock.unlock();

        (*ms).mmap_lock.lock();
        let mut mch = (*ms).mmap_head;
        while !mch.is_null() {
            result.hugeobj_used += sysalloc::align_up((*mch).size, PAGE_SIZE);
            result.hugeobj_size += (*mch).size;
            result.hugeobj_count += 1;
            mch = (*mch).next;
        }
        (*ms).mmap_lock.unlock();

        result
    }

    unsafe fn prefault(ms: *mut MemSourceImpl, bytes: usize) -> usize {
        Arena::prefault((*ms).native_arena, bytes)
    }
}

// ============================================================================
// Process-wide source registry (termination diagnostics)
// ============================================================================

struct SourceRegistry {
    sources: Mutex<Vec<usize>>,
}

impl SourceRegistry {
    fn register(&self, ms: *mut MemSourceImpl) {
        self.sources.lock().push(ms as usize);
    }

    fn unregister(&self, ms: *mut MemSourceImpl) {
        let mut sources = self.sources.lock();
        if let Some(pos) = sources.iter().position(|&p| p == ms as usize) {
            sources[pos] = 0;
        }
    }

    fn dump(&self) {
        let sources = self.sources.lock();
        for &addr in sources.iter() {
            if addr == 0 {
                continue;
            }
            // Safety: live entries are never destroyed without
            // unregistering first.
            unsafe {
                log_debug!(
                    "on-exit MemSource {}",
                    MemSourceImpl::describe(addr as *mut MemSourceImpl)
                );
            }
        }
    }
}

fn registry() -> &'static SourceRegistry {
    static REGISTRY: OnceLock<SourceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        extern "C" fn dump_at_exit() {
            if crate::log::enabled(crate::log::LogLevel::Debug) {
                registry().dump();
            }
        }
        // Safety: registering a no-capture extern fn.
        unsafe {
            libc::atexit(dump_at_exit);
        }
        SourceRegistry {
            sources: Mutex::new(Vec::new()),
        }
    })
}

// ============================================================================
// Public handle
// ============================================================================

/// Reference-counted handle to a node-bound memory source.
///
/// Cloning and dropping adjust the source's combined counter; the source
/// is destroyed when the last handle is gone *and* no allocated blocks
/// remain.
pub struct MemSource {
    ptr: *mut MemSourceImpl,
}

// Safety: all mutation of the shared header goes through its internal
// locks and atomics.
unsafe impl Send for MemSource {}
unsafe impl Sync for MemSource {}

impl MemSource {
    /// A handle referring to no source.
    pub const fn invalid() -> Self {
        Self {
            ptr: ptr::null_mut(),
        }
    }

    /// Does this handle refer to a source?
    pub fn valid(&self) -> bool {
        !self.ptr.is_null()
    }

    fn from_impl(ptr: *mut MemSourceImpl) -> Self {
        debug_assert!(!ptr.is_null());
        // Safety: caller hands over a live source.
        unsafe { MemSourceImpl::add_ref(ptr) };
        Self { ptr }
    }

    /// Create a source of `size` bytes drawing memory from `node`.
    ///
    /// Returns an invalid handle when the OS mapping fails.
    pub fn create(node: Node, size: usize, name: &str) -> MemSource {
        Self::create_on_physical(node.physical_id(), size, name, -1)
    }

    /// Create a source whose payload lives on physical node `phys_node`
    /// while its metadata (and arena headers) stay on `home_node`.
    pub fn create_with_home(phys_node: i32, size: usize, name: &str, home_node: i32) -> MemSource {
        Self::create_on_physical(phys_node, size, name, home_node)
    }

    fn create_on_physical(phys_node: i32, size: usize, name: &str, home_node: i32) -> MemSource {
        // Safety: create maps fresh memory and builds a valid header.
        let ms = unsafe { MemSourceImpl::create(phys_node, size, name, home_node) };
        if ms.is_null() {
            return Self::invalid();
        }
        log_debug!("created MemSource \"{}\" on node {}", name, phys_node);
        Self::from_impl(ms)
    }

    /// The process-wide source, bound to no particular node. Lazily
    /// created and alive until process exit.
    pub fn global() -> &'static MemSource {
        static GLOBAL: OnceLock<MemSource> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let ms = Self::create_on_physical(-1, GLOBAL_SOURCE_SIZE, "global", -1);
            assert!(ms.valid(), "cannot map the global memory source");
            ms
        })
    }

    /// The per-node source for physical node `phys_node`. Lazily created
    /// and alive until process exit.
    pub fn for_node(phys_node: i32) -> MemSource {
        static TABLE: OnceLock<Mutex<Vec<MemSource>>> = OnceLock::new();
        let table = TABLE.get_or_init(|| {
            // Physical IDs may have gaps; index by ID and accept holes.
            let max_id = Topology::get().node_ids().last().copied().unwrap_or(0);
            Mutex::new(
                (0..=max_id)
                    .map(|_| MemSource::invalid())
                    .collect::<Vec<_>>(),
            )
        });

        let mut table = table.lock();
        assert!(
            (phys_node as usize) < table.len(),
            "unknown physical node {}",
            phys_node
        );
        if !table[phys_node as usize].valid() {
            let name = format!("node_global({})", phys_node);
            table[phys_node as usize] =
                Self::create_on_physical(phys_node, GLOBAL_SOURCE_SIZE, &name, -1);
            assert!(table[phys_node as usize].valid());
            log_debug!("created nodeGlobal MemSource ({})", phys_node);
        }
        table[phys_node as usize].clone()
    }

    /// Allocate `sz` bytes from this source. Null on exhaustion.
    pub fn alloc(&self, sz: usize) -> *mut u8 {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::alloc(self.ptr, sz) }
    }

    /// Allocate `sz` bytes aligned to `align` (a power of two).
    pub fn alloc_aligned(&self, align: usize, sz: usize) -> *mut u8 {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::alloc_aligned(self.ptr, align, sz) }
    }

    /// Free a pointer obtained from *any* source. Null is a no-op.
    pub fn free(p: *mut u8) {
        // Safety: p originates from a source allocation per contract.
        unsafe { MemSourceImpl::free_ptr(p) }
    }

    /// Usable payload size behind `p`.
    ///
    /// # Panics
    ///
    /// Debug builds assert `p` is non-null.
    pub fn usable_size(p: *mut u8) -> usize {
        debug_assert!(!p.is_null());
        // Safety: p originates from a source allocation per contract.
        unsafe { MemSourceImpl::block_size(p) }
    }

    /// The node whose source allocated `p`, as a logical [`Node`].
    /// Invalid node for null or for pointers on disabled nodes.
    pub fn node_of(p: *mut u8) -> Node {
        // Safety: p originates from a source allocation per contract.
        let phys = unsafe { MemSourceImpl::physical_node_of(p) };
        let logical = NodeList::physical_to_logical(phys);
        if logical < 0 {
            return Node::invalid();
        }
        NodeList::logical()[logical as usize]
    }

    /// Physical node this source draws memory from.
    pub fn physical_node(&self) -> i32 {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { (*self.ptr).node }
    }

    /// Logical node this source draws memory from (invalid if the node is
    /// not enabled).
    pub fn logical_node(&self) -> Node {
        let logical = NodeList::physical_to_logical(self.physical_node());
        if logical < 0 {
            return Node::invalid();
        }
        NodeList::logical()[logical as usize]
    }

    /// Move all backing pages to physical node `dst`. Returns the number
    /// of pages processed.
    pub fn migrate(&self, dst: i32) -> usize {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::migrate(self.ptr, dst) }
    }

    /// Usage statistics.
    pub fn stats(&self) -> SourceStats {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::stats(self.ptr) }
    }

    /// Current cutoff above which blocks get dedicated OS mappings.
    pub fn mmap_threshold(&self) -> usize {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { (*self.ptr).mmap_threshold.load(Ordering::Relaxed) }
    }

    /// Override the direct-mapping cutoff. Must stay at least one page.
    pub fn set_mmap_threshold(&self, threshold: usize) {
        debug_assert!(self.valid());
        assert!(threshold >= PAGE_SIZE);
        // Safety: handle keeps the source alive.
        unsafe { (*self.ptr).mmap_threshold.store(threshold, Ordering::Relaxed) };
    }

    /// Fault in the first `bytes` of the native arena. Returns bytes
    /// touched.
    pub fn prefault(&self, bytes: usize) -> usize {
        debug_assert!(self.valid());
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::prefault(self.ptr, bytes) }
    }

    /// Human-readable description (name, address, node, live blocks).
    pub fn description(&self) -> String {
        if !self.valid() {
            return "<invalid>".into();
        }
        // Safety: handle keeps the source alive.
        unsafe { MemSourceImpl::describe(self.ptr) }
    }

    /// Identity comparison: do both handles refer to the same source?
    pub fn same_as(&self, other: &MemSource) -> bool {
        self.ptr == other.ptr
    }
}

impl Default for MemSource {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Clone for MemSource {
    fn clone(&self) -> Self {
        if self.valid() {
            // Safety: self keeps the source alive across the add_ref.
            unsafe { MemSourceImpl::add_ref(self.ptr) };
        }
        Self { ptr: self.ptr }
    }
}

impl Drop for MemSource {
    fn drop(&mut self) {
        if self.valid() {
            // Safety: each handle holds exactly one reference.
            unsafe { MemSourceImpl::release_ref(self.ptr) };
            self.ptr = ptr::null_mut();
        }
    }
}

impl fmt::Debug for MemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemSource({})", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_node() -> Node {
        NodeList::logical()[0]
    }

    #[test]
    fn test_block_count_packing() {
        let c = BlockCount::new();
        c.add_ref();
        c.add_block();
        c.add_block();
        assert_eq!(c.refs(), 1);
        assert_eq!(c.blocks(), 2);
        assert!(!c.release_block());
        assert!(!c.release_ref());
        assert!(c.release_block());
    }

    #[test]
    fn test_block_count_many_blocks() {
        let c = BlockCount::new();
        for _ in 0..10_000 {
            c.add_block();
        }
        assert_eq!(c.blocks(), 10_000);
        assert_eq!(c.refs(), 0);
    }

    #[test]
    fn test_create_alloc_free() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_create_alloc_free");
        assert!(ms.valid());

        let p = ms.alloc(1000);
        assert!(!p.is_null());
        assert!(MemSource::usable_size(p) >= 1000);
        // Safety: fresh allocation of at least 1000 bytes.
        unsafe { p.write_bytes(0x11, 1000) };

        let back = MemSource::node_of(p);
        assert_eq!(back.physical_id(), ms.physical_node());

        MemSource::free(p);
    }

    #[test]
    fn test_alloc_zero() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_alloc_zero");
        let p = ms.alloc(0);
        // Minimal-size pointer or null are both permitted; free must
        // accept whichever came back.
        if !p.is_null() {
            MemSource::free(p);
        }
    }

    #[test]
    fn test_aligned_alloc() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_aligned_alloc");
        for align in [16usize, 64, 256, 4096] {
            let p = ms.alloc_aligned(align, 3 * align);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "alignment {}", align);
            unsafe { p.write_bytes(0x22, 3 * align) };
            MemSource::free(p);
        }
    }

    #[test]
    fn test_large_alloc_uses_mmap_path() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_large_alloc");
        let p = ms.alloc(2 * MMAP_THRESHOLD);
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x33, 2 * MMAP_THRESHOLD) };

        let stats = ms.stats();
        assert_eq!(stats.hugeobj_count, 1);
        assert!(stats.hugeobj_size >= 2 * MMAP_THRESHOLD);

        MemSource::free(p);
        assert_eq!(ms.stats().hugeobj_count, 0);
    }

    #[test]
    fn test_arena_overflow_chains_new_arena() {
        let ms = MemSource::create(first_node(), 1 << 21, "test_arena_overflow");
        // Fill past the native arena; stay under the mmap threshold.
        let mut ptrs = Vec::new();
        for _ in 0..16 {
            let p = ms.alloc(512 * 1024);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        assert!(ms.stats().arena_count > 1);
        for p in ptrs {
            MemSource::free(p);
        }
    }

    #[test]
    fn test_source_survives_handle_drop_with_live_blocks() {
        let p;
        {
            let ms = MemSource::create(first_node(), 1 << 22, "test_survive");
            p = ms.alloc(64);
            assert!(!p.is_null());
        }
        // Handle gone, block still owns the source.
        assert!(MemSource::usable_size(p) >= 64);
        // Last block release destroys the source.
        MemSource::free(p);
    }

    #[test]
    fn test_global_and_for_node() {
        let g = MemSource::global();
        assert!(g.valid());
        let p = g.alloc(128);
        assert!(!p.is_null());
        MemSource::free(p);

        let phys = first_node().physical_id();
        let ms = MemSource::for_node(phys);
        assert!(ms.valid());
        assert_eq!(ms.physical_node(), phys);
        let ms2 = MemSource::for_node(phys);
        assert!(ms.same_as(&ms2));
    }

    #[test]
    fn test_stats_track_usage() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_stats");
        let before = ms.stats();
        let p = ms.alloc(8192);
        let during = ms.stats();
        assert!(during.arena_size >= before.arena_size + 8192);
        MemSource::free(p);
        let after = ms.stats();
        assert!(after.arena_size < during.arena_size);
    }

    #[test]
    fn test_prefault_bounded_by_size() {
        let ms = MemSource::create(first_node(), 1 << 22, "test_prefault");
        let touched = ms.prefault(usize::MAX >> 1);
        assert!(touched > 0);
        assert!(touched <= 1 << 22);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_migrate_two_nodes() {
        let nodes = NodeList::logical();
        if nodes.len() < 2 {
            return; // single-node host
        }
        let src = nodes[0].physical_id();
        let dst = nodes[1].physical_id();

        let ms = MemSource::create_with_home(src, 1 << 22, "test_migrate", -1);
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            let p = ms.alloc(4096);
            assert!(!p.is_null());
            unsafe { p.write_bytes(0x44, 4096) };
            ptrs.push(p);
        }

        let pages = ms.migrate(dst);
        assert!(pages > 0);
        assert_eq!(ms.physical_node(), dst);

        for &p in ptrs.iter().take(10) {
            let backing = crate::mem::sysalloc::node_of_page(p);
            if backing >= 0 {
                assert_eq!(backing, dst);
            }
        }
        for p in ptrs {
            MemSource::free(p);
        }
    }
}
