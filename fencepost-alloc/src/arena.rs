//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! The arena manager: produces a fresh, fenceposted region of memory on
//! demand and hands back its single interior free block.

use core::ptr::NonNull;

use crate::block::{Footer, Header, Status, FOOTER_SIZE, HEADER_SIZE};
use crate::os::{extend_heap, HeapError};

/// Usable interior bytes per arena (2 MiB), matching the reference
/// implementation's `ARENA_SIZE`.
pub const ARENA_SIZE: usize = 2 * 1024 * 1024;

/// Bytes requested from the OS for one arena: the interior plus both
/// fenceposts (a lone footer on the left, a lone header on the right).
const ARENA_REQUEST: usize = ARENA_SIZE + 2 * HEADER_SIZE + 2 * FOOTER_SIZE;

/// Lay out a fresh arena and return the header of its single interior
/// free block.
///
/// Layout, low to high address: left fencepost (one footer, `size=0,
/// status=Used`), the interior block (header + `ARENA_SIZE` bytes +
/// footer, `status=Free`), right fencepost (one header, `size=0,
/// status=Used`).
pub fn create_arena() -> Result<NonNull<Header>, HeapError> {
    // SAFETY: `extend_heap` hands back a fresh, exclusively-owned
    // region of `ARENA_REQUEST` bytes.
    let base = unsafe { extend_heap(ARENA_REQUEST)? };
    let base = NonNull::new(base).expect("sbrk succeeded but returned a null pointer");

    unsafe {
        // Left fencepost: a lone footer at the very start of the arena.
        Footer::write(base.cast::<Footer>(), 0, Status::Used);

        // Interior block header, immediately after the left fencepost.
        let interior_size = HEADER_SIZE + ARENA_SIZE + FOOTER_SIZE;
        let header_ptr = NonNull::new_unchecked(base.as_ptr().add(FOOTER_SIZE));
        let header = Header::write(header_ptr, interior_size, Status::Free);

        // Interior block footer, at the high end of the interior block.
        let footer = Header::footer(header);
        Footer::write(footer, interior_size, Status::Free);

        // Right fencepost: a lone header immediately after the
        // interior footer.
        let right_ptr =
            NonNull::new_unchecked(footer.as_ptr().cast::<u8>().add(FOOTER_SIZE));
        Header::write(right_ptr, 0, Status::Used);

        Ok(header)
    }
}
