//! First-fit region allocator for large heap objects.

use crate::AllocatorOps;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{frames_for, FrameAlloc, PhysMapper};

/// Granularity of every block; also the size of a free-list node.
const MIN_BLOCK: usize = 16;

/// Frames pulled per growth step: 256 KiB at a time, so moderate churn does
/// not hammer the buddy allocator.
pub const REGION_GROW_FRAMES: usize = 64;

/// Free-list node written into the first bytes of every free block.
struct ListNode {
    size: usize,
    next: *mut ListNode,
}

/// First-fit free-list allocator over frame-backed regions.
///
/// The list is kept sorted by address and adjacent free blocks are merged on
/// free, so fragmentation stays bounded by the actual allocation pattern.
/// When no block fits, a batch of contiguous frames is pulled from the frame
/// allocator and added as one new region. Regions are never returned.
pub struct RegionAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    head: *mut ListNode,
}

// Safety: the raw node pointers reference physical memory owned by this
// allocator; access is serialized by the memory manager's lock.
unsafe impl<M: PhysMapper + Sync> Send for RegionAllocator<'_, M> {}

impl<'m, M: PhysMapper> RegionAllocator<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            head: core::ptr::null_mut(),
        }
    }

    /// Round a request up to block granularity.
    const fn block_size(size: usize) -> usize {
        let size = if size < MIN_BLOCK { MIN_BLOCK } else { size };
        (size + MIN_BLOCK - 1) & !(MIN_BLOCK - 1)
    }

    /// Pull a fresh region big enough for `size` bytes.
    #[allow(clippy::cast_possible_truncation)]
    fn grow(&mut self, frames: &mut impl FrameAlloc, size: usize) -> Option<()> {
        let count = frames_for(size as u64).max(REGION_GROW_FRAMES);
        let base = frames.alloc_frames(count)?;
        log::debug!("heap region grew by {count} frames at {base}");
        // Safety: the frames were just allocated for exclusive heap use.
        let ptr = unsafe { self.mapper.phys_to_mut::<u8>(base) };
        unsafe { self.insert_free(ptr, count * PAGE_SIZE as usize) };
        Some(())
    }

    /// Detach the first block that can serve `size` bytes at `align`.
    ///
    /// Blocks and alignments are both `MIN_BLOCK`-granular, so any front
    /// padding or tail remainder is itself a valid free block and stays on
    /// the list.
    fn take_first_fit(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut prev: *mut ListNode = core::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            // Safety: cur is a live node on our list.
            let node_size = unsafe { (*cur).size };
            let node_next = unsafe { (*cur).next };

            let start = cur as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let pad = aligned - start;
            if node_size >= pad + size {
                let tail_size = node_size - pad - size;
                // Safety: the tail remainder lies inside the block.
                let tail = (tail_size > 0).then(|| unsafe {
                    let rest = cur.cast::<u8>().add(pad + size).cast::<ListNode>();
                    (*rest).size = tail_size;
                    (*rest).next = node_next;
                    rest
                });
                let after = tail.unwrap_or(node_next);

                if pad > 0 {
                    // The padding stays on the list as a shrunken block.
                    // Safety: cur is live and keeps at least MIN_BLOCK bytes.
                    unsafe {
                        (*cur).size = pad;
                        (*cur).next = after;
                    }
                } else if prev.is_null() {
                    self.head = after;
                } else {
                    // Safety: prev is a live node on our list.
                    unsafe { (*prev).next = after };
                }
                return NonNull::new(aligned as *mut u8);
            }
            prev = cur;
            cur = node_next;
        }
        None
    }

    /// Insert a free block sorted by address, merging with both neighbours
    /// where they touch.
    ///
    /// # Safety
    ///
    /// The block at `ptr`..`ptr+size` must be unused and owned by this
    /// allocator.
    unsafe fn insert_free(&mut self, ptr: *mut u8, size: usize) {
        let mut prev: *mut ListNode = core::ptr::null_mut();
        let mut next = self.head;
        while !next.is_null() && next.cast::<u8>() < ptr {
            prev = next;
            // Safety: next is a live node on our list.
            next = unsafe { (*next).next };
        }

        let mut base = ptr.cast::<ListNode>();
        let mut size = size;

        // Merge with the following block when contiguous.
        if !next.is_null() && unsafe { ptr.add(size) } == next.cast::<u8>() {
            // Safety: next is a live node being absorbed.
            unsafe {
                size += (*next).size;
                next = (*next).next;
            }
        }
        // Merge into the preceding block when contiguous.
        if !prev.is_null() && unsafe { prev.cast::<u8>().add((*prev).size) } == ptr {
            base = prev;
            // Safety: prev stays on the list, only grows.
            unsafe { size += (*prev).size };
            // prev keeps its own predecessor link.
            unsafe {
                (*base).size = size;
                (*base).next = next;
            }
            return;
        }

        // Safety: base points at the (possibly grown) free block.
        unsafe {
            (*base).size = size;
            (*base).next = next;
        }
        if prev.is_null() {
            self.head = base;
        } else {
            // Safety: prev is a live node on our list.
            unsafe { (*prev).next = base };
        }
    }

    /// Sum of all free block sizes, for diagnostics and tests.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            // Safety: cur is a live node on our list.
            unsafe {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }
}

impl<M: PhysMapper> AllocatorOps for RegionAllocator<'_, M> {
    #[allow(clippy::cast_possible_truncation)]
    fn allocate(
        &mut self,
        frames: &mut impl FrameAlloc,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // Fresh regions are page-aligned, so anything beyond that cannot be
        // guaranteed.
        if align > PAGE_SIZE as usize {
            return None;
        }
        let size = Self::block_size(size);
        let align = align.max(MIN_BLOCK);
        if let Some(ptr) = self.take_first_fit(size, align) {
            return Some(ptr);
        }
        self.grow(frames, size)?;
        self.take_first_fit(size, align)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) {
        // Safety: contract forwarded from the caller. Front padding never
        // left the list, so the block starts exactly at ptr.
        unsafe { self.insert_free(ptr.as_ptr(), Self::block_size(size)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{HostFrames, TestPhys};

    const REGION_BYTES: usize = REGION_GROW_FRAMES * 4096;

    #[test]
    fn block_sizes_are_granular() {
        type R<'m> = RegionAllocator<'m, TestPhys>;
        assert_eq!(R::block_size(1), 16);
        assert_eq!(R::block_size(16), 16);
        assert_eq!(R::block_size(17), 32);
        assert_eq!(R::block_size(4096), 4096);
    }

    #[test]
    fn grows_once_then_serves_from_the_region() {
        let phys = TestPhys;
        let mut frames = HostFrames::default();
        let mut region = RegionAllocator::new(&phys);

        let a = region.allocate(&mut frames, 2048, 16).unwrap();
        let b = region.allocate(&mut frames, 2048, 16).unwrap();
        assert_eq!(frames.allocated(), 1);
        // First fit from the front: consecutive blocks.
        assert_eq!(unsafe { a.as_ptr().add(2048) }, b.as_ptr());
        assert_eq!(region.free_bytes(), REGION_BYTES - 4096);
    }

    #[test]
    fn coalescing_restores_the_full_region() {
        let phys = TestPhys;
        let mut frames = HostFrames::with_budget(REGION_GROW_FRAMES);
        let mut region = RegionAllocator::new(&phys);

        let a = region.allocate(&mut frames, 4096, 16).unwrap();
        let b = region.allocate(&mut frames, 4096, 16).unwrap();
        let c = region.allocate(&mut frames, 4096, 16).unwrap();

        // Free out of order; neighbours must still merge.
        unsafe {
            region.free(a, 4096, 16);
            region.free(c, 4096, 16);
            region.free(b, 4096, 16);
        }
        assert_eq!(region.free_bytes(), REGION_BYTES);

        // The budget is spent, so only a fully merged region can serve this.
        assert!(region.allocate(&mut frames, REGION_BYTES, 16).is_some());
    }

    #[test]
    fn aligned_requests_leave_the_padding_free() {
        let phys = TestPhys;
        let mut frames = HostFrames::default();
        let mut region = RegionAllocator::new(&phys);

        // Push the cursor off page alignment, then ask for a page-aligned block.
        let small = region.allocate(&mut frames, 16, 16).unwrap();
        let aligned = region.allocate(&mut frames, 512, 4096).unwrap();
        assert_eq!(aligned.as_ptr() as usize % 4096, 0);

        // Padding plus tail are still free: only the two live blocks are out.
        assert_eq!(region.free_bytes(), REGION_BYTES - 16 - 512);
        drop(small);
    }

    #[test]
    fn oversized_requests_pull_enough_frames() {
        let phys = TestPhys;
        let mut frames = HostFrames::default();
        let mut region = RegionAllocator::new(&phys);

        let big = REGION_BYTES * 2;
        let ptr = region.allocate(&mut frames, big, 16).unwrap();
        assert!(!ptr.as_ptr().is_null());
        assert_eq!(frames.allocated(), 1);
    }

    #[test]
    fn over_aligned_requests_are_refused() {
        let phys = TestPhys;
        let mut frames = HostFrames::default();
        let mut region = RegionAllocator::new(&phys);

        assert!(region.allocate(&mut frames, 64, 8192).is_none());
        // Nothing was pulled for the refused request.
        assert_eq!(frames.allocated(), 0);

        // Page alignment itself stays served.
        assert!(region.allocate(&mut frames, 64, 4096).is_some());
    }

    #[test]
    fn allocation_failure_is_clean() {
        let phys = TestPhys;
        let mut frames = HostFrames::with_budget(0);
        let mut region = RegionAllocator::new(&phys);
        assert!(region.allocate(&mut frames, 64, 16).is_none());
        assert_eq!(region.free_bytes(), 0);
    }
}
