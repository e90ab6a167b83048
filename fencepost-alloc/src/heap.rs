//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! The free list and the allocate/free algorithms that operate over
//! boundary-tagged blocks. This is the block allocator layer: it knows
//! nothing about locking or the public surface, only about blocks,
//! arenas, and the free list threaded through them.

use core::ptr::NonNull;

use tagged_list::List;

use crate::arena::{self, ARENA_SIZE};
use crate::block::{Footer, Header, Status, FOOTER_SIZE, HEADER_SIZE};
use crate::os::HeapError;

/// Alignment quantum every block size is rounded up to.
pub const ALIGN: usize = 8;

/// Smallest payload a request is ever rounded down to.
pub const MIN_PAYLOAD: usize = 8;

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// The total block size (including both metadata words) needed to
/// satisfy a request for `size` user bytes.
fn total_request(size: usize) -> usize {
    let payload = size.max(MIN_PAYLOAD);
    round_up(payload + HEADER_SIZE + FOOTER_SIZE, ALIGN)
}

/// Upper bound on the number of entries [`Heap::free_list_snapshot`]
/// captures. Diagnostic-only; allocation and free never consult it.
const FREE_LIST_SNAPSHOT_CAP: usize = 256;

/// A fixed-capacity snapshot of the free list's `(offset, size)` pairs,
/// taken without allocating. See [`Heap::free_list_snapshot`].
pub struct FreeListSnapshot {
    entries: [(isize, usize); FREE_LIST_SNAPSHOT_CAP],
    len: usize,
    /// Set if the free list had more entries than this snapshot could
    /// hold; the trailing entries are simply missing.
    pub truncated: bool,
}

impl FreeListSnapshot {
    /// The captured `(offset, size)` pairs, in free-list order.
    pub fn entries(&self) -> &[(isize, usize)] {
        &self.entries[..self.len]
    }
}

/// Call-count and heap-size bookkeeping, reported at process exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Total bytes requested from the OS across all arenas.
    pub heap_bytes: usize,
    /// Number of `alloc` calls served.
    pub alloc_calls: u64,
    /// Number of `realloc` calls served.
    pub realloc_calls: u64,
    /// Number of `zero_alloc` calls served.
    pub zero_alloc_calls: u64,
    /// Number of `free` calls served.
    pub free_calls: u64,
}

/// Per-instance allocator state: the free list, the arena bookkeeping
/// needed for diagnostics, and the call-count statistics.
///
/// Does not own its sentinel: the caller (normally `FencepostAlloc`)
/// holds it at a fixed, non-heap-allocated address and passes a
/// pointer to it, since obtaining that address by allocating (e.g.
/// `Box::new`) would recursively call back into this same allocator
/// while it is still being constructed.
pub struct Heap {
    free_list: List<Header>,
    /// Header address of the first arena's interior block, used as the
    /// zero point for the diagnostic list dump's offsets.
    mem_start: Option<NonNull<Header>>,
    /// Whether exit-time statistics should be printed (`MALLOCVERBOSE`).
    pub verbose: bool,
    stats: Stats,
}

// SAFETY: `Heap` is only ever reached through a `Mutex<Heap>`; nothing
// here is thread-local.
unsafe impl Send for Heap {}

impl Heap {
    /// Build a fresh heap anchored at `sentinel`, then create and
    /// install the first arena.
    ///
    /// # Safety
    /// `sentinel` must point to a valid, pinned `Header` that will
    /// outlive this `Heap` and will not be accessed through any other
    /// path while linked.
    pub unsafe fn new(sentinel: NonNull<Header>) -> Result<Self, HeapError> {
        let free_list = List::new(sentinel);
        let mut heap = Heap {
            free_list,
            mem_start: None,
            verbose: crate::config::verbose(),
            stats: Stats::default(),
        };
        heap.grow()?;
        Ok(heap)
    }

    /// Request one more arena from the OS and publish its interior
    /// block into the free list.
    fn grow(&mut self) -> Result<(), HeapError> {
        let interior = arena::create_arena()?;
        log::debug!(
            "grew heap: new arena interior at {:?}, size {}",
            interior.as_ptr(),
            ARENA_SIZE
        );
        if self.mem_start.is_none() {
            self.mem_start = Some(interior);
        }
        // SAFETY: `interior` was just created by `create_arena` and is
        // not linked anywhere yet.
        unsafe { self.free_list.insert_ordered(interior) };
        self.stats.heap_bytes += ARENA_SIZE + 2 * HEADER_SIZE + 2 * FOOTER_SIZE;
        Ok(())
    }

    /// First-fit allocate: round the request, search the free list,
    /// growing the heap and retrying if no block fits.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let want = total_request(size);
        loop {
            // SAFETY: every member of `free_list` is a live `Header`.
            let found = self
                .free_list
                .iter()
                .find(|&b| unsafe { b.as_ref().size() } >= want);
            if let Some(block) = found {
                // SAFETY: `block` came out of `free_list` and is
                // currently linked there.
                return Ok(unsafe { self.split_or_consume(block, want) });
            }
            self.grow()?;
        }
    }

    /// Carve `want` bytes out of `block` (splitting off a residual free
    /// block if there's enough left over), or consume it whole.
    ///
    /// # Safety
    /// `block` must currently be linked in `self.free_list`, and
    /// `block.size() >= want`.
    unsafe fn split_or_consume(&mut self, mut block: NonNull<Header>, want: usize) -> NonNull<u8> {
        let size = block.as_ref().size();
        let remainder = size - want;

        if remainder >= HEADER_SIZE + FOOTER_SIZE + MIN_PAYLOAD {
            block.as_mut().set_size(want);
            block.as_mut().set_status(Status::Used);
            Footer::write(Header::footer(block), want, Status::Used);

            let split_at = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(want));
            let residual = Header::write(split_at, remainder, Status::Free);
            Footer::write(Header::footer(residual), remainder, Status::Free);

            self.free_list.replace(block, residual);
        } else {
            block.as_mut().set_status(Status::Used);
            Footer::write(Header::footer(block), size, Status::Used);
            self.free_list.remove(block);
        }

        Header::payload(block)
    }

    /// Free the block owning `payload`, coalescing with either or both
    /// neighbors as their status dictates.
    ///
    /// # Safety
    /// `payload` must be a non-null pointer previously returned by this
    /// heap's `allocate` (or survived from a prior `realloc`), and must
    /// not already have been freed.
    pub unsafe fn free(&mut self, payload: NonNull<u8>) {
        let middle = Header::from_payload(payload);
        let left_foot = Header::left_footer(middle);
        let right_head = Header::right_header(middle);

        let left_free = left_foot.as_ref().status() == Status::Free;
        let right_free = right_head.as_ref().status() == Status::Free;

        match (left_free, right_free) {
            (false, false) => {
                let mut middle = middle;
                middle.as_mut().set_status(Status::Free);
                let size = middle.as_ref().size();
                Footer::write(Header::footer(middle), size, Status::Free);
                self.free_list.insert_ordered(middle);
            }
            (true, false) => {
                let left_size = left_foot.as_ref().size();
                let mut left_head =
                    NonNull::new_unchecked(middle.as_ptr().cast::<u8>().sub(left_size))
                        .cast::<Header>();
                let new_size = left_head.as_ref().size() + middle.as_ref().size();
                left_head.as_mut().set_size(new_size);
                Footer::write(Header::footer(left_head), new_size, Status::Free);
                // `left_head` keeps its existing list position; `middle`
                // was never linked.
            }
            (false, true) => {
                let mut middle = middle;
                let new_size = middle.as_ref().size() + right_head.as_ref().size();
                middle.as_mut().set_size(new_size);
                middle.as_mut().set_status(Status::Free);
                Footer::write(Header::footer(middle), new_size, Status::Free);
                self.free_list.replace(right_head, middle);
            }
            (true, true) => {
                self.free_list.remove(right_head);
                let left_size = left_foot.as_ref().size();
                let mut left_head =
                    NonNull::new_unchecked(middle.as_ptr().cast::<u8>().sub(left_size))
                        .cast::<Header>();
                let new_size =
                    left_head.as_ref().size() + middle.as_ref().size() + right_head.as_ref().size();
                left_head.as_mut().set_size(new_size);
                Footer::write(Header::footer(left_head), new_size, Status::Free);
            }
        }
    }

    /// The full block size (including both metadata words) of the
    /// block owning `payload`.
    ///
    /// # Safety
    /// `payload` must be a non-null pointer previously returned by this
    /// heap's `allocate`, not yet freed.
    pub unsafe fn size_of(&self, payload: NonNull<u8>) -> usize {
        Header::from_payload(payload).as_ref().size()
    }

    /// Current call-count and heap-size statistics.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Note a plain `alloc` call in the statistics. Not called on
    /// `zero_alloc`'s or `realloc`'s internal use of [`Heap::allocate`];
    /// those count themselves under their own buckets instead.
    pub fn note_alloc_call(&mut self) {
        self.stats.alloc_calls += 1;
    }

    /// Note a plain `free` call in the statistics. Not called on
    /// `realloc`'s internal use of [`Heap::free`], which does not count
    /// against this bucket.
    pub fn note_free_call(&mut self) {
        self.stats.free_calls += 1;
    }

    /// Note a `zero_alloc` (calloc-style) call in the statistics. The
    /// allocation itself still goes through [`Heap::allocate`], but
    /// uncounted: it does not also bump `alloc_calls`.
    pub fn note_zero_alloc(&mut self) {
        self.stats.zero_alloc_calls += 1;
    }

    /// Note a `realloc` call in the statistics. The allocation and free
    /// it performs internally still go through [`Heap::allocate`] and
    /// [`Heap::free`], but uncounted: they do not also bump
    /// `alloc_calls`/`free_calls`.
    pub fn note_realloc(&mut self) {
        self.stats.realloc_calls += 1;
    }

    /// A snapshot of the free list's `(offset, size)` pairs, offsets
    /// relative to the first arena's interior block.
    ///
    /// Collected into a fixed stack buffer rather than a `Vec`: this is
    /// called while holding the heap's lock, including from this
    /// allocator's own exit-time report, so it must not itself
    /// allocate (doing so would call back into this same allocator,
    /// mid-lock, if it's installed as `#[global_allocator]`).
    pub fn free_list_snapshot(&self) -> FreeListSnapshot {
        let mut snapshot = FreeListSnapshot {
            entries: [(0, 0); FREE_LIST_SNAPSHOT_CAP],
            len: 0,
            truncated: false,
        };
        let mem_start = match self.mem_start {
            Some(p) => p,
            None => return snapshot,
        };
        for b in self.free_list.iter() {
            if snapshot.len == FREE_LIST_SNAPSHOT_CAP {
                snapshot.truncated = true;
                break;
            }
            let offset = b.as_ptr() as isize - mem_start.as_ptr() as isize;
            // SAFETY: every member of `free_list` is a live `Header`.
            let size = unsafe { b.as_ref().size() };
            snapshot.entries[snapshot.len] = (offset, size);
            snapshot.len += 1;
        }
        snapshot
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    #[cfg(test)]
    pub(crate) fn free_list_sizes(&self) -> Vec<usize> {
        self.free_list
            .iter()
            .map(|b| unsafe { b.as_ref().size() })
            .collect()
    }

    #[cfg(test)]
    fn free_list_entries(&self) -> Vec<(isize, usize)> {
        let mem_start = self.mem_start.expect("heap not initialized");
        self.free_list
            .iter()
            .map(|b| {
                let offset = b.as_ptr() as isize - mem_start.as_ptr() as isize;
                let size = unsafe { b.as_ref().size() };
                (offset, size)
            })
            .collect()
    }

    /// Checks the universal free-list invariants: ascending address
    /// order, every size a positive multiple of `ALIGN` and at least
    /// large enough to hold its own metadata plus the minimum payload,
    /// and no two members adjacent (coalesce maximality).
    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        let entries = self.free_list_entries();
        for w in entries.windows(2) {
            if w[0].0 >= w[1].0 {
                return false;
            }
        }
        for &(_, size) in &entries {
            if size % ALIGN != 0 || size < HEADER_SIZE + FOOTER_SIZE + MIN_PAYLOAD {
                return false;
            }
        }
        for w in entries.windows(2) {
            if w[0].0 + w[0].1 as isize == w[1].0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        // Leaking the sentinel mirrors how `FencepostAlloc` pins one at
        // a fixed, never-moving address for the life of the process;
        // tests just don't bother reclaiming it afterward.
        let sentinel = Box::leak(Box::new(Header::sentinel()));
        unsafe { Heap::new(NonNull::from(sentinel)).expect("test heap should initialize") }
    }

    #[test]
    fn fresh_heap_has_one_free_block() {
        let h = heap();
        assert_eq!(h.free_list_len(), 1);
    }

    #[test]
    fn allocate_splits_a_large_block() {
        let mut h = heap();
        let before = h.free_list_sizes();
        assert_eq!(before.len(), 1);

        let ptr = h.allocate(64).unwrap();
        assert_eq!(h.free_list_len(), 1);
        let after = h.free_list_sizes();
        assert!(after[0] < before[0]);

        unsafe { h.free(ptr) };
        assert_eq!(h.free_list_len(), 1);
        assert_eq!(h.free_list_sizes(), before);
    }

    #[test]
    fn allocate_consumes_whole_block_when_remainder_too_small() {
        let mut h = heap();
        let total = h.free_list_sizes()[0];
        // Request just enough less than the whole block that the
        // leftover falls below the split threshold.
        let want = total - HEADER_SIZE - FOOTER_SIZE - MIN_PAYLOAD;
        let ptr = h.allocate(want).unwrap();
        assert_eq!(h.free_list_len(), 0, "remainder should be too small to split");
        unsafe { h.free(ptr) };
    }

    #[test]
    fn free_coalesces_both_neighbors() {
        let mut h = heap();
        let whole = h.free_list_sizes();

        // Each allocation splits off the front of the one residual free
        // block, so `a`, `b`, `c` land contiguously, followed by
        // whatever residual remains.
        let a = h.allocate(64).unwrap();
        let b = h.allocate(64).unwrap();
        let c = h.allocate(64).unwrap();

        // `b` has two Used neighbors: no coalescing, just a new entry.
        unsafe { h.free(b) };
        assert_eq!(h.free_list_len(), 2);

        // `a`'s right neighbor (`b`) is now free: left-to-right merge.
        unsafe { h.free(a) };
        assert_eq!(h.free_list_len(), 2);

        // `c` is flanked by the merged `a`+`b` run on the left and the
        // residual block on the right: a three-way merge collapses
        // everything back into the original single free block.
        unsafe { h.free(c) };
        assert_eq!(h.free_list_len(), 1);
        assert_eq!(h.free_list_sizes(), whole);
    }

    #[test]
    fn growing_beyond_one_arena_adds_capacity() {
        let mut h = heap();
        let mut live = Vec::new();
        for _ in 0..(ARENA_SIZE / (128 * 1024) + 4) {
            live.push(h.allocate(128 * 1024).unwrap());
        }
        assert!(h.stats().heap_bytes > ARENA_SIZE);
        for p in live {
            unsafe { h.free(p) };
        }
    }

    #[test]
    fn right_coalesce_then_left_coalesce_reach_the_same_state() {
        let mut h = heap();
        let whole = h.free_list_sizes();

        let a = h.allocate(64).unwrap();
        let b = h.allocate(64).unwrap();
        unsafe { h.free(b) };
        unsafe { h.free(a) };
        assert_eq!(h.free_list_len(), 1);
        assert!(h.invariants_hold());
        assert_eq!(h.free_list_sizes(), whole);

        let mut h2 = heap();
        let a2 = h2.allocate(64).unwrap();
        let b2 = h2.allocate(64).unwrap();
        unsafe { h2.free(a2) };
        unsafe { h2.free(b2) };
        assert_eq!(h2.free_list_len(), 1);
        assert!(h2.invariants_hold());

        assert_eq!(h.free_list_sizes(), h2.free_list_sizes());
    }

    #[quickcheck_macros::quickcheck]
    fn alloc_free_in_reverse_order_recombines_to_one_block(sizes: Vec<u8>) -> quickcheck::TestResult {
        if sizes.is_empty() || sizes.len() > 16 {
            return quickcheck::TestResult::discard();
        }
        let mut h = heap();
        let whole = h.free_list_sizes();

        let mut ptrs = Vec::new();
        for &s in &sizes {
            match h.allocate((s as usize) + 1) {
                Ok(p) => ptrs.push(p),
                Err(_) => return quickcheck::TestResult::discard(),
            }
            if !h.invariants_hold() {
                return quickcheck::TestResult::failed();
            }
        }

        for p in ptrs.into_iter().rev() {
            unsafe { h.free(p) };
            if !h.invariants_hold() {
                return quickcheck::TestResult::failed();
            }
        }

        quickcheck::TestResult::from_bool(h.free_list_len() == 1 && h.free_list_sizes() == whole)
    }
}
