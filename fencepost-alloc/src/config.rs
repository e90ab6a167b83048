//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! Reads the `MALLOCVERBOSE` environment variable.
//!
//! This deliberately goes through `libc::getenv` rather than
//! `std::env::var`: the latter allocates a `String`, and this lookup
//! runs during the heap's own lazy initialization, before this
//! allocator is ready to serve a request on its own behalf.

use std::ffi::CStr;

const MALLOCVERBOSE: &CStr = c"MALLOCVERBOSE";

/// Whether exit-time statistics should be printed: suppressed only
/// when `MALLOCVERBOSE` is set to exactly `"NO"`.
pub fn verbose() -> bool {
    // SAFETY: `getenv` returns either null or a pointer to a
    // NUL-terminated string owned by the environment; we only read it
    // before it could plausibly be mutated by this single-threaded
    // bootstrap step.
    let value = unsafe { libc::getenv(MALLOCVERBOSE.as_ptr()) };
    if value.is_null() {
        return true;
    }
    // SAFETY: `value` is non-null and NUL-terminated, per `getenv`'s
    // contract.
    let value = unsafe { CStr::from_ptr(value) };
    value.to_bytes() != b"NO"
}
