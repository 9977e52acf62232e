//! Fiber execution contexts.
//!
//! A [`Context`] is a stack (allocated from a memory source) plus a saved
//! machine-register snapshot. Switching is a handful of assembly
//! instructions saving the callee-saved registers on the current stack,
//! swapping stack pointers, and restoring the other side — the classic
//! fcontext discipline. Every switch carries one machine word of payload
//! through to the resumed side; the runtime uses it to pass the
//! [`WorkerThread`](crate::task::worker::WorkerThread) pointer between
//! fibers.
//!
//! Fresh contexts begin execution at their entry function with the first
//! payload as argument; the entry function must never return (it jumps
//! somewhere else instead).

use std::cell::UnsafeCell;

use crate::mem::msource::MemSource;
use crate::mem::sysalloc::align_down;
use crate::sync::SpinLock;

/// Default fiber stack size.
pub const DEFAULT_STACK_SIZE: usize = 80 * 1024;

/// Entry function of a fresh context. Receives the first switch payload.
pub type ContextFn = extern "C" fn(usize) -> !;

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    // nodal_ctx_switch(save: *mut usize [rdi], target: usize [rsi],
    //                  payload: usize [rdx]) -> usize [rax]
    //
    // System V callee-saved registers plus the return address live on the
    // suspended stack; the stack pointer is the whole snapshot.
    ".text",
    ".globl nodal_ctx_switch",
    ".p2align 4",
    "nodal_ctx_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov rax, rdx",
    "ret",
    // First activation of a fresh context lands here via the `ret`
    // above: rbx holds the entry function, rax the payload.
    ".globl nodal_ctx_entry",
    ".p2align 4",
    "nodal_ctx_entry:",
    "mov rdi, rax",
    "xor rbp, rbp",
    "call rbx",
    "ud2",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    // nodal_ctx_switch(save: *mut usize [x0], target: usize [x1],
    //                  payload: usize [x2]) -> usize [x0]
    ".text",
    ".globl nodal_ctx_switch",
    ".p2align 4",
    "nodal_ctx_switch:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8,  d9,  [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8,  d9,  [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "mov x0, x2",
    "ret",
    // First activation: x19 holds the entry function, x0 the payload.
    ".globl nodal_ctx_entry",
    ".p2align 4",
    "nodal_ctx_entry:",
    "mov x29, xzr",
    "mov x30, xzr",
    "blr x19",
    "brk #0x1",
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is implemented for x86_64 and aarch64 only");

extern "C" {
    fn nodal_ctx_switch(save: *mut usize, target: usize, payload: usize) -> usize;
    fn nodal_ctx_entry();
}

/// Lay out the initial snapshot of a fresh context on its stack.
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a live stack with
/// room for the snapshot below it.
unsafe fn make_context(stack_top: *mut u8, entry: ContextFn) -> usize {
    let base = align_down(stack_top as usize, 16) as *mut usize;

    #[cfg(target_arch = "x86_64")]
    {
        // ret consumes the entry-trampoline address, leaving rsp
        // 16-aligned at trampoline entry.
        *base.sub(1) = nodal_ctx_entry as usize; // return address
        *base.sub(2) = 0; //                        rbp
        *base.sub(3) = entry as usize; //           rbx
        *base.sub(4) = 0; //                        r12
        *base.sub(5) = 0; //                        r13
        *base.sub(6) = 0; //                        r14
        *base.sub(7) = 0; //                        r15
        base.sub(7) as usize
    }

    #[cfg(target_arch = "aarch64")]
    {
        let sp = base.sub(20); // 160-byte save area, 16-aligned
        sp.write_bytes(0, 20);
        *sp.add(0) = entry as usize; //  x19
        *sp.add(11) = nodal_ctx_entry as usize; // x30
        sp as usize
    }
}

/// A fiber stack plus its saved register snapshot.
pub struct Context {
    msource: MemSource,
    stack: *mut u8,
    stack_size: usize,
    /// Saved stack pointer while the context is suspended. Only the
    /// thread currently running (or resuming) the context touches it.
    sp: UnsafeCell<usize>,
}

// Safety: a context is only ever *used* by one OS thread at a time; the
// scheduler's handoff protocol serializes access to `sp`.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Allocate a stack of `size` bytes from `msource` and prepare the
    /// context to start in `entry` on first switch.
    ///
    /// Returns `None` when the source is exhausted.
    pub fn new(entry: ContextFn, size: usize, msource: &MemSource) -> Option<Context> {
        let stack = msource.alloc(size);
        if stack.is_null() {
            return None;
        }
        // Safety: the stack was just allocated with `size` bytes.
        let sp = unsafe { make_context(stack.add(size), entry) };
        Some(Context {
            msource: msource.clone(),
            stack,
            stack_size: size,
            sp: UnsafeCell::new(sp),
        })
    }

    /// Re-arm a parked context to start fresh in `entry`.
    ///
    /// # Safety
    ///
    /// The context must be suspended with no live frames worth keeping.
    pub unsafe fn reset(&self, entry: ContextFn) {
        *self.sp.get() = make_context(self.stack.add(self.stack_size), entry);
    }

    /// Switch from the currently-running context *into* this one, saving
    /// the current continuation into `save`. Returns the payload passed
    /// by whoever later switches back.
    ///
    /// # Safety
    ///
    /// `self` must be suspended; `save` must stay valid until the saved
    /// continuation is resumed.
    pub unsafe fn jump_from(&self, save: *mut usize, payload: usize) -> usize {
        nodal_ctx_switch(save, *self.sp.get(), payload)
    }

    /// Switch from this (currently-running) context into `dest`.
    ///
    /// # Safety
    ///
    /// The calling code must actually be executing on `self`, and `dest`
    /// must be suspended.
    pub unsafe fn jump_to(&self, dest: &Context, payload: usize) -> usize {
        nodal_ctx_switch(self.sp.get(), *dest.sp.get(), payload)
    }

    /// Switch from this (currently-running) context to a bare saved
    /// stack pointer (a native continuation outside any [`Context`]).
    ///
    /// # Safety
    ///
    /// As for [`jump_to`](Self::jump_to); `dest_sp` must be a snapshot
    /// produced by an earlier switch.
    pub unsafe fn jump_to_sp(&self, dest_sp: usize, payload: usize) -> usize {
        nodal_ctx_switch(self.sp.get(), dest_sp, payload)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        MemSource::free(self.stack);
    }
}

// ============================================================================
// ContextCache
// ============================================================================

use std::sync::Arc;

/// Reusable contexts, owned by a scheduler.
pub struct ContextCache {
    msource: MemSource,
    cache: SpinLock<Vec<Arc<Context>>>,
}

impl ContextCache {
    /// Create an empty cache drawing stacks from `msource`.
    pub fn new(msource: MemSource) -> Self {
        Self {
            msource,
            cache: SpinLock::new(Vec::new()),
        }
    }

    /// Hand out a cached context, or build a fresh one starting in
    /// `entry`. Cached contexts resume wherever they were parked.
    pub fn get(&self, entry: ContextFn) -> Arc<Context> {
        if let Some(ctx) = self.cache.lock().pop() {
            return ctx;
        }
        Arc::new(
            Context::new(entry, DEFAULT_STACK_SIZE, &self.msource)
                .expect("context stack allocation failed"),
        )
    }

    /// Park a context for reuse.
    pub fn store(&self, ctx: Arc<Context>) {
        self.cache.lock().push(ctx);
    }
}
