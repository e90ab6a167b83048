//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! The OS memory provider: the one primitive the arena manager needs
//! from the outside world ("extend the process's data segment by `n`
//! bytes and return the start of the new region").
//!
//! Implemented with `sbrk(2)`, matching the reference implementation.
//! Regions obtained this way are not required to abut earlier ones by
//! this crate's contract, even though `sbrk` happens to make them
//! contiguous in practice.

use thiserror::Error;

/// The one unrecoverable failure mode this crate names: the OS refused
/// to extend the process's address space.
#[derive(Debug, Error)]
pub enum HeapError {
    /// `sbrk` returned its failure sentinel.
    #[error("sbrk({requested}) failed: the OS would not extend the heap")]
    OsAllocationFailed {
        /// The byte count that was requested.
        requested: usize,
    },
}

/// Request `size` fresh bytes from the OS.
///
/// # Safety
/// The returned pointer is valid for `size` bytes and is not aliased by
/// any other live reference, provided no other code in this process
/// also calls `sbrk` concurrently without going through this allocator.
pub unsafe fn extend_heap(size: usize) -> Result<*mut u8, HeapError> {
    let ptr = libc::sbrk(size as isize);
    if ptr as isize == -1 {
        return Err(HeapError::OsAllocationFailed { requested: size });
    }
    Ok(ptr as *mut u8)
}
