//! # Kernel Heap Allocators
//!
//! Two byte-granular allocators layered on the frame allocator:
//!
//! * [`SlabAllocator`] serves small fixed-size classes (8 bytes to 1 KiB)
//!   from frames carved into equal slots. Constant-time, no coalescing.
//! * [`RegionAllocator`] serves everything larger from a first-fit free list
//!   with address-ordered coalescing, growing by whole frame batches.
//!
//! Both hand out pointers into mapped physical memory obtained through a
//! [`kernel_vmem::PhysMapper`], and both speak [`AllocatorOps`] so the
//! `kmalloc` front-end can route by size without caring which one it hits.
//! Callers keep track of allocation sizes; there are no per-allocation
//! headers at this layer.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod region;
mod slab;

pub use region::RegionAllocator;
pub use slab::{SlabAllocator, SLAB_CLASSES, SLAB_MAX};

use core::ptr::NonNull;
use kernel_vmem::FrameAlloc;

/// Common surface of the heap allocators.
pub trait AllocatorOps {
    /// Allocate `size` bytes at the given power-of-two alignment, pulling
    /// fresh frames from `frames` on demand. `None` when the request cannot
    /// be served even after growing.
    fn allocate(
        &mut self,
        frames: &mut impl FrameAlloc,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>>;

    /// Return an allocation of `size` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// with the same `size` and `align`, and must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize);
}

#[cfg(test)]
pub(crate) mod tests {
    use kernel_vmem::{FrameAlloc, PhysAddr, PhysMapper};
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Identity mapper: test "physical" addresses are host pointers.
    pub(crate) struct TestPhys;

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<T>(&self, phys: PhysAddr) -> *mut T {
            phys.as_u64() as *mut T
        }
    }

    /// Frame source backed by the host allocator, optionally rationed.
    pub(crate) struct HostFrames {
        blocks: Vec<(*mut u8, Layout)>,
        budget: Option<usize>,
    }

    impl Default for HostFrames {
        fn default() -> Self {
            Self {
                blocks: Vec::new(),
                budget: None,
            }
        }
    }

    impl HostFrames {
        pub(crate) fn with_budget(frames: usize) -> Self {
            Self {
                blocks: Vec::new(),
                budget: Some(frames),
            }
        }

        /// Number of `alloc_frames` calls served.
        pub(crate) fn allocated(&self) -> usize {
            self.blocks.len()
        }
    }

    impl Drop for HostFrames {
        fn drop(&mut self) {
            for &(ptr, layout) in &self.blocks {
                unsafe { dealloc(ptr, layout) };
            }
        }
    }

    impl FrameAlloc for HostFrames {
        fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
            if let Some(budget) = &mut self.budget {
                if *budget < count {
                    return None;
                }
                *budget -= count;
            }
            let layout = Layout::from_size_align(count * 4096, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.blocks.push((ptr, layout));
            Some(PhysAddr::new(ptr as u64))
        }

        fn free_frames(&mut self, _base: PhysAddr, _count: usize) {}
    }
}
