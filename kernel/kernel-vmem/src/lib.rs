//! # Virtual Memory
//!
//! Four-level x86-64 page table management: typed addresses, the page table
//! entry layout, and an [`AddressSpace`] that walks and edits a live paging
//! hierarchy through a [`PhysMapper`].
//!
//! The crate owns the copy-on-write machinery. [`AddressSpace::copy_for_fork`]
//! clones an address space by aliasing the kernel half of the root table and
//! downgrading user leaf pages to read-only, with sharing tracked through the
//! [`FrameRefs`] trait. Faults on such pages are resolved by
//! [`AddressSpace::resolve_cow_fault`], and teardown funnels frames through a
//! [`FrameReaper`] so nothing is returned to the allocator while a table walk
//! is still in flight.
//!
//! Everything here is policy-free with respect to where frames come from:
//! callers supply a [`FrameAlloc`]. That keeps the walks testable on a host,
//! with plain heap memory standing in for physical frames.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod addresses;
pub mod arch;
mod page_entry_bits;
mod page_table;
mod reaper;
mod refs;

pub use address_space::{AddressSpace, PageSize, VmemError};
pub use addresses::{PhysAddr, VirtAddr};
pub use page_entry_bits::PageEntryBits;
pub use page_table::{PageTable, TABLE_ENTRY_COUNT};
pub use reaper::FrameReaper;
pub use refs::{FrameRefs, RefCount, RefError, RefKind};

use kernel_info::memory::PAGE_SIZE;

/// Source of physical frames for table and page allocation.
///
/// Frames are 4 KiB ([`PAGE_SIZE`]); multi-frame requests are physically
/// contiguous. Allocation failure is reported as `None` and mapped to
/// [`VmemError::OutOfMemory`] at the call sites.
pub trait FrameAlloc {
    /// Allocate `count` contiguous frames. Contents are undefined.
    fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr>;

    /// Return `count` contiguous frames starting at `base`.
    fn free_frames(&mut self, base: PhysAddr, count: usize);

    /// Single-frame convenience used for page tables.
    fn alloc_4k(&mut self) -> Option<PhysAddr> {
        self.alloc_frames(1)
    }

    /// Single-frame convenience.
    fn free_4k(&mut self, base: PhysAddr) {
        self.free_frames(base, 1);
    }
}

/// Translates physical addresses into dereferenceable pointers.
///
/// In the kernel proper this is the higher-half direct map; in host tests it
/// is an identity view onto heap-allocated frames.
pub trait PhysMapper {
    /// Produce a pointer through which the frame at `phys` can be accessed.
    ///
    /// # Safety
    ///
    /// `phys` must refer to a frame that is valid for reads and writes of `T`
    /// for as long as the pointer is used, and the caller must uphold Rust's
    /// aliasing rules for the accesses it performs.
    unsafe fn phys_to_mut<T>(&self, phys: PhysAddr) -> *mut T;
}

/// Round `value` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Frame count needed to back `bytes` bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn frames_for(bytes: u64) -> usize {
    (align_up(bytes, PAGE_SIZE) / PAGE_SIZE) as usize
}
