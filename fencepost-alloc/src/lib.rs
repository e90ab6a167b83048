//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! A boundary-tag, arena-growing dynamic memory allocator.
//!
//! [`FencepostAlloc`] is the public entry point: a process-wide,
//! lock-guarded heap that grows by requesting fresh 2 MiB arenas from
//! the OS as needed, and serves allocations with first-fit search over
//! a free list threaded directly through the blocks themselves. It can
//! be used directly as a malloc-style API, or installed as
//! `#[global_allocator]` via its [`GlobalAlloc`] implementation.
//!
//! ```no_run
//! use fencepost_alloc::FencepostAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: FencepostAlloc = FencepostAlloc::new();
//!
//! fn main() {
//!     ALLOCATOR.install_exit_report();
//!     let v: Vec<u8> = Vec::with_capacity(128);
//!     drop(v);
//! }
//! ```

mod arena;
mod block;
mod config;
mod heap;
mod os;

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};

pub use heap::Stats;
pub use os::HeapError;

use block::Header;
use heap::{FreeListSnapshot, Heap, ALIGN};

fn render_free_list(snapshot: &FreeListSnapshot) -> String {
    let mut out = snapshot
        .entries()
        .iter()
        .map(|(offset, size)| format!("[offset:{offset},size:{size}]"))
        .collect::<Vec<_>>()
        .join("->");
    if snapshot.truncated {
        out.push_str("->...(truncated)");
    }
    out
}

/// A process-wide dynamic memory allocator, safe to install as
/// `#[global_allocator]`.
///
/// State is initialized lazily, on first use, behind a
/// [`parking_lot::Mutex`]. A `FencepostAlloc` is cheap to construct
/// (`const fn new()`) so it can live in a `static`.
pub struct FencepostAlloc {
    // The free list's sentinel lives here, inline, rather than behind
    // a `Box`: this struct is typically itself a `static`, installed as
    // the process's `#[global_allocator]`, so allocating the sentinel
    // would recursively call back into this same allocator while it is
    // still initializing.
    sentinel: UnsafeCell<Header>,
    heap: OnceLock<Mutex<Heap>>,
}

impl Default for FencepostAlloc {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `sentinel` is only ever written to by `Heap::new`, once, from
// inside `OnceLock::get_or_init`'s internal synchronization; every
// subsequent access goes through the free list it anchors, which is
// itself guarded by `heap`'s mutex.
unsafe impl Sync for FencepostAlloc {}

impl FencepostAlloc {
    /// Construct an allocator with no heap yet: the first arena isn't
    /// requested from the OS until the first allocation.
    pub const fn new() -> Self {
        FencepostAlloc {
            sentinel: UnsafeCell::new(Header::sentinel()),
            heap: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap
            .get_or_init(|| {
                // SAFETY: `sentinel` has a fixed address for the life of
                // this (typically `'static`) allocator, and this is the
                // only place that ever constructs a `List` over it.
                let sentinel = unsafe { NonNull::new_unchecked(self.sentinel.get()) };
                let heap = unsafe { Heap::new(sentinel) }
                    .unwrap_or_else(|e| panic!("failed to initialize heap: {e}"));
                Mutex::new(heap)
            })
            .lock()
    }

    fn try_alloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate(size)
    }

    /// Allocate a block large enough for `size` payload bytes.
    ///
    /// # Panics
    /// Panics if the OS refuses to extend the heap further.
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.lock().note_alloc_call();
        self.try_alloc(size)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Allocate a zeroed block for `count` elements of `size` bytes
    /// each (calloc-style). Like the reference implementation, this
    /// does not check `count * size` for overflow, and its internal
    /// allocation does not also count as a plain `alloc` call.
    ///
    /// # Panics
    /// Panics if the OS refuses to extend the heap further.
    pub fn zero_alloc(&self, count: usize, size: usize) -> NonNull<u8> {
        self.lock().note_zero_alloc();
        let total = count * size;
        let ptr = self
            .try_alloc(total)
            .unwrap_or_else(|e| panic!("{e}"));
        // SAFETY: `try_alloc` just returned a fresh block of at least
        // `total` writable bytes.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        ptr
    }

    /// Return the block owning `ptr` to the free list, coalescing with
    /// free neighbors.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator's `alloc`,
    /// `zero_alloc`, or `realloc`, and must not already have been
    /// freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.lock().note_free_call();
        self.lock().free(ptr);
    }

    /// Free `ptr` without counting it as a plain `free` call. Used by
    /// `realloc`, whose internal free of the old block counts only
    /// under `realloc_calls`.
    ///
    /// # Safety
    /// Same contract as [`FencepostAlloc::free`].
    unsafe fn free_uncounted(&self, ptr: NonNull<u8>) {
        self.lock().free(ptr);
    }

    /// Resize the allocation at `ptr` (or allocate fresh, if `ptr` is
    /// `None`) to hold `size` payload bytes, preserving the leading
    /// `min(size_of(ptr), size)` bytes of content. A `size` of zero
    /// still yields a minimum-size block.
    ///
    /// The heap lock is not held across the content copy: per this
    /// allocator's contract, a caller may not concurrently free or
    /// reallocate the same pointer, so its metadata stays stable while
    /// unlocked.
    ///
    /// # Safety
    /// `ptr`, if present, must have been returned by this allocator and
    /// must not already have been freed.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> NonNull<u8> {
        self.lock().note_realloc();
        let Some(old) = ptr else {
            return self.try_alloc(size).unwrap_or_else(|e| panic!("{e}"));
        };

        let new_ptr = self.try_alloc(size).unwrap_or_else(|e| panic!("{e}"));
        let old_size = self.lock().size_of(old);
        let copy_len = old_size.min(size);
        core::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), copy_len);
        self.free_uncounted(old);
        new_ptr
    }

    /// The full block size (including both metadata words) backing
    /// `ptr`.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not yet
    /// freed.
    pub unsafe fn size_of(&self, ptr: NonNull<u8>) -> usize {
        self.lock().size_of(ptr)
    }

    /// Render the free list as a diagnostic string of
    /// `[offset:<o>,size:<s>]` tuples, in address order.
    ///
    /// The lock is released before this builds the string: formatting
    /// allocates, which would call back into this same allocator,
    /// mid-lock, if it is installed as `#[global_allocator]`.
    pub fn dump_free_list(&self) -> String {
        let snapshot = { self.lock().free_list_snapshot() };
        render_free_list(&snapshot)
    }

    /// A snapshot of the call-count and heap-size statistics.
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// Register this allocator to print its statistics at process
    /// exit, unless `MALLOCVERBOSE=NO`.
    ///
    /// Only one allocator instance per process should call this: the
    /// OS exit-handler slot this uses is process-wide, not
    /// per-instance.
    pub fn install_exit_report(&'static self) {
        EXIT_TARGET.get_or_init(|| ExitTarget(self as *const FencepostAlloc));
        // SAFETY: `report_stats` takes no arguments and does not unwind.
        unsafe { libc::atexit(report_stats) };
    }

    fn print_exit_report(&self) {
        // Gather everything and drop the lock before formatting or
        // printing anything: both allocate, which would call back into
        // this same allocator, mid-lock, since it's installed as
        // `#[global_allocator]`.
        let (verbose, stats, snapshot) = {
            let heap = self.lock();
            (heap.verbose, heap.stats(), heap.free_list_snapshot())
        };
        if !verbose {
            return;
        }
        println!("calls to alloc: {}", stats.alloc_calls);
        println!("calls to realloc: {}", stats.realloc_calls);
        println!("calls to zero_alloc: {}", stats.zero_alloc_calls);
        println!("calls to free: {}", stats.free_calls);
        println!("size of heap: {} bytes", stats.heap_bytes);
        println!("free list: {}", render_free_list(&snapshot));
    }
}

struct ExitTarget(*const FencepostAlloc);

// SAFETY: the pointer is only ever dereferenced from `report_stats`,
// called at process exit, by which point the referent (a `'static`
// allocator) is guaranteed to still be alive.
unsafe impl Send for ExitTarget {}
unsafe impl Sync for ExitTarget {}

static EXIT_TARGET: OnceLock<ExitTarget> = OnceLock::new();

extern "C" fn report_stats() {
    if let Some(target) = EXIT_TARGET.get() {
        // SAFETY: see `ExitTarget`'s safety comment.
        let alloc = unsafe { &*target.0 };
        alloc.print_exit_report();
    }
}

// SAFETY: every operation is guarded by the internal mutex; `alloc`
// never hands out a pointer still reachable from the free list, and
// `dealloc`/`realloc` only ever receive pointers this allocator
// produced.
unsafe impl GlobalAlloc for FencepostAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        self.lock().note_alloc_call();
        self.try_alloc(layout.size())
            .map(|p| p.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            self.free(p);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        let ptr = GlobalAlloc::alloc(self, layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        self.lock().note_realloc();
        let Some(old) = NonNull::new(ptr) else {
            return self.try_alloc(new_size).map(|p| p.as_ptr()).unwrap_or(core::ptr::null_mut());
        };
        let new_ptr = match self.try_alloc(new_size) {
            Ok(p) => p,
            Err(_) => return core::ptr::null_mut(),
        };
        let old_size = self.lock().size_of(old);
        let copy_len = old_size.min(new_size);
        core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), copy_len);
        self.free_uncounted(old);
        new_ptr.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> FencepostAlloc {
        FencepostAlloc::new()
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let a = fresh();
        let p = a.alloc(64);
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xAB, 64);
            a.free(p);
        }
    }

    #[test]
    fn allocations_are_disjoint_and_big_enough() {
        let a = fresh();
        let p1 = a.alloc(32);
        let p2 = a.alloc(32);
        assert_ne!(p1, p2);
        unsafe {
            assert!(a.size_of(p1) >= 32);
            assert!(a.size_of(p2) >= 32);
            a.free(p1);
            a.free(p2);
        }
    }

    #[test]
    fn small_allocation_does_not_overlap_neighbor() {
        let a = fresh();
        let p1 = a.alloc(8);
        let p2 = a.alloc(8);
        unsafe {
            core::ptr::write_bytes(p1.as_ptr(), 0x11, 8);
            core::ptr::write_bytes(p2.as_ptr(), 0x22, 8);
            let s1 = core::slice::from_raw_parts(p1.as_ptr(), 8);
            assert!(s1.iter().all(|&b| b == 0x11));
            a.free(p1);
            a.free(p2);
        }
    }

    #[test]
    fn free_then_alloc_reuses_coalesced_space() {
        let a = fresh();
        let p1 = a.alloc(256);
        let p2 = a.alloc(256);
        unsafe {
            a.free(p1);
            a.free(p2);
        }
        let p3 = a.alloc(256);
        unsafe { a.free(p3) };
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        let a = fresh();
        let p = a.alloc(16);
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0x5A, 16);
            let grown = a.realloc(Some(p), 256);
            let slice = core::slice::from_raw_parts(grown.as_ptr(), 16);
            assert!(slice.iter().all(|&b| b == 0x5A));
            a.free(grown);
        }
    }

    #[test]
    fn realloc_null_is_alloc() {
        let a = fresh();
        let p = unsafe { a.realloc(None, 32) };
        unsafe { a.free(p) };
    }

    #[test]
    fn realloc_to_zero_yields_minimum_block() {
        let a = fresh();
        let p = a.alloc(64);
        let shrunk = unsafe { a.realloc(Some(p), 0) };
        unsafe { a.free(shrunk) };
    }

    #[test]
    fn zero_alloc_is_zeroed() {
        let a = fresh();
        let p = a.zero_alloc(16, 4);
        unsafe {
            let slice = core::slice::from_raw_parts(p.as_ptr(), 64);
            assert!(slice.iter().all(|&b| b == 0));
            a.free(p);
        }
    }

    #[test]
    fn stats_count_calls() {
        let a = fresh();
        let p = a.alloc(16);
        let p = unsafe { a.realloc(Some(p), 64) };
        let z = a.zero_alloc(4, 4);
        unsafe {
            a.free(p);
            a.free(z);
        }
        let stats = a.stats();
        // `realloc` and `zero_alloc` count only under their own
        // buckets: their internal alloc/free does not also bump
        // `alloc_calls`/`free_calls`.
        assert_eq!(stats.alloc_calls, 1);
        assert_eq!(stats.realloc_calls, 1);
        assert_eq!(stats.zero_alloc_calls, 1);
        assert_eq!(stats.free_calls, 2);
        assert!(stats.heap_bytes > 0);
    }

    #[test]
    fn growth_beyond_one_arena_succeeds() {
        let a = fresh();
        let mut live = Vec::new();
        for _ in 0..32 {
            live.push(a.alloc(128 * 1024));
        }
        for p in live {
            unsafe { a.free(p) };
        }
    }

    #[test]
    fn global_alloc_respects_layout_alignment() {
        let a = fresh();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&a, layout) };
        assert!(!ptr.is_null());
        unsafe { GlobalAlloc::dealloc(&a, ptr, layout) };
    }

    #[test]
    fn global_alloc_rejects_over_aligned_layout() {
        let a = fresh();
        let layout = Layout::from_size_align(64, 4096).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&a, layout) };
        assert!(ptr.is_null());
    }

    #[quickcheck_macros::quickcheck]
    fn realloc_preserves_the_shared_prefix(old_size: u8, new_size: u8) -> bool {
        let old_size = (old_size as usize) + 1;
        let new_size = (new_size as usize) + 1;
        let a = fresh();
        let p = a.alloc(old_size);
        unsafe {
            let src = core::slice::from_raw_parts_mut(p.as_ptr(), old_size);
            for (i, b) in src.iter_mut().enumerate() {
                *b = i as u8;
            }
            let grown = a.realloc(Some(p), new_size);
            let shared = old_size.min(new_size);
            let dst = core::slice::from_raw_parts(grown.as_ptr(), shared);
            let ok = dst.iter().enumerate().all(|(i, &b)| b == i as u8);
            a.free(grown);
            ok
        }
    }

    #[quickcheck_macros::quickcheck]
    fn zero_alloc_of_any_shape_is_all_zero(count: u8, size: u8) -> bool {
        let count = (count as usize) + 1;
        let size = (size as usize) + 1;
        let a = fresh();
        let p = a.zero_alloc(count, size);
        unsafe {
            let bytes = core::slice::from_raw_parts(p.as_ptr(), count * size);
            let ok = bytes.iter().all(|&b| b == 0);
            a.free(p);
            ok
        }
    }
}
