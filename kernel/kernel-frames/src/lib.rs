//! # Physical Frame Management
//!
//! The binary buddy allocator that owns all usable physical memory above
//! [`kernel_info::memory::FREE_PAGE_BEGIN`], plus the [`FrameTable`] that
//! counts how many address spaces share each allocatable frame.
//!
//! Both structures keep their bulk state inside the physical frames they
//! manage (free-list nodes in free frames, reference counters in frames
//! carved out at init), reached through a [`kernel_vmem::PhysMapper`]. The
//! resident cost is therefore a few hundred bytes of list heads and section
//! descriptors.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod buddy;
mod frame_table;

pub use buddy::{BuddyAllocator, MAX_ORDER, ORDER_COUNT};
pub use frame_table::FrameTable;

/// Errors from frame management setup.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FramesError {
    /// Not enough physical memory to satisfy the request.
    #[error("out of physical memory")]
    OutOfMemory,
    /// More distinct memory sections than the fixed tables can describe.
    #[error("frame table capacity exhausted")]
    CapacityExhausted,
}
