//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! Boundary-tag block layout.
//!
//! Every block of arena memory carries identical metadata at both ends:
//! a [`Header`] at the low address and a [`Footer`] at the high address.
//! The header additionally carries the free-list links, unconditionally
//! reserving room for them whether or not the block is currently free.
//! A used block simply leaves those link bytes dead rather than handing
//! them to the caller as payload.

use core::mem::size_of;
use core::ptr::NonNull;
use tagged_list::{Linked, Links};

/// A block's allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// On the free list, available to satisfy a request.
    Free,
    /// Handed out to a caller; must not be touched by the allocator.
    Used,
    /// The free list's anchor node. Never allocated, never coalesced.
    Sentinel,
}

/// The metadata word written at the low end of every block.
#[repr(C)]
pub struct Header {
    size: usize,
    status: Status,
    links: Links<Header>,
}

/// The metadata word written at the high end of every block.
#[repr(C)]
pub struct Footer {
    size: usize,
    status: Status,
}

/// Size in bytes of a [`Header`], including its (sometimes unused) free
/// list links.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Size in bytes of a [`Footer`].
pub const FOOTER_SIZE: usize = size_of::<Footer>();

unsafe impl Linked for Header {
    fn links(&self) -> &Links<Self> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<Self> {
        &mut self.links
    }
}

impl Header {
    /// A detached sentinel value: `status = Sentinel`, `size = 0`. Never
    /// placed inside arena memory; owned directly by the heap that
    /// anchors its free list on it.
    pub(crate) const fn sentinel() -> Header {
        Header {
            size: 0,
            status: Status::Sentinel,
            links: Links::none(),
        }
    }

    /// Write a new header at `at`, with unlinked free-list links.
    ///
    /// # Safety
    /// `at` must point to at least `HEADER_SIZE` writable bytes.
    pub unsafe fn write(at: NonNull<u8>, size: usize, status: Status) -> NonNull<Header> {
        let header = at.cast::<Header>();
        header.as_ptr().write(Header {
            size,
            status,
            links: Links::none(),
        });
        header
    }

    /// This block's total size, including both metadata words.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// This block's allocation status.
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    #[inline]
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// The payload pointer for this block: the address immediately
    /// after the header.
    #[inline]
    pub fn payload(this: NonNull<Header>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(this.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Recover the owning header from a payload pointer previously
    /// returned by [`Header::payload`].
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by this
    /// allocator's payload-producing operations.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Header> {
        NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast::<Header>()
    }

    /// The footer belonging to this header, derived from its `size`.
    ///
    /// # Safety
    /// `this` must point to a live header whose `size` field is
    /// accurate and whose block fits entirely within mapped memory.
    pub unsafe fn footer(this: NonNull<Header>) -> NonNull<Footer> {
        let size = this.as_ref().size;
        NonNull::new_unchecked(this.as_ptr().cast::<u8>().add(size - FOOTER_SIZE)).cast::<Footer>()
    }

    /// The footer of whatever block immediately precedes this one (a
    /// real block's footer, or a left fencepost).
    ///
    /// # Safety
    /// `this` must not be the left fencepost of its arena (there must
    /// be a valid footer immediately before it).
    pub unsafe fn left_footer(this: NonNull<Header>) -> NonNull<Footer> {
        NonNull::new_unchecked(this.as_ptr().cast::<u8>().sub(FOOTER_SIZE)).cast::<Footer>()
    }

    /// The header of whatever block immediately follows this one (a
    /// real block's header, or a right fencepost).
    ///
    /// # Safety
    /// `this` must point to a live header whose `size` field is
    /// accurate, and the following header must lie within mapped
    /// memory (true for every non-right-fencepost block, since a right
    /// fencepost always terminates the arena).
    pub unsafe fn right_header(this: NonNull<Header>) -> NonNull<Header> {
        let footer = Self::footer(this);
        NonNull::new_unchecked(footer.as_ptr().cast::<u8>().add(FOOTER_SIZE)).cast::<Header>()
    }
}

impl Footer {
    /// Write a new footer at `at`.
    ///
    /// # Safety
    /// `at` must point to at least `FOOTER_SIZE` writable bytes.
    pub unsafe fn write(at: NonNull<Footer>, size: usize, status: Status) {
        at.as_ptr().write(Footer { size, status });
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }
}
