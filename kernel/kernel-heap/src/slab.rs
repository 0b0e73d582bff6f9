//! Fixed-size-class slab allocator.

use crate::AllocatorOps;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper};

/// The served size classes. Every frame is carved into slots of exactly one
/// class, so within a class allocation is a list pop.
pub const SLAB_CLASSES: [usize; 8] = [8, 16, 32, 64, 128, 256, 512, 1024];

/// Largest slab-served request; anything bigger goes to the region allocator.
pub const SLAB_MAX: usize = 1024;

/// Link stored inside every free slot.
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Slab allocator with one free-slot list per size class.
///
/// Frames pulled from the frame allocator are dedicated to a class for good;
/// slots return to their class list on free but the frame itself is never
/// given back. Class churn is what this allocator exists for, so that is the
/// right trade.
pub struct SlabAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    heads: [*mut FreeSlot; SLAB_CLASSES.len()],
}

// Safety: the raw slot pointers reference physical memory owned by this
// allocator; access is serialized by the memory manager's lock.
unsafe impl<M: PhysMapper + Sync> Send for SlabAllocator<'_, M> {}

impl<'m, M: PhysMapper> SlabAllocator<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            heads: [core::ptr::null_mut(); SLAB_CLASSES.len()],
        }
    }

    /// The class index serving `size`, or `None` above [`SLAB_MAX`].
    #[must_use]
    pub fn class_for(size: usize) -> Option<usize> {
        SLAB_CLASSES.iter().position(|&slot| size <= slot)
    }

    /// Carve one fresh frame into slots of the given class.
    #[allow(clippy::cast_possible_truncation)]
    fn refill(&mut self, frames: &mut impl FrameAlloc, class: usize) -> Option<()> {
        let frame = frames.alloc_4k()?;
        // Safety: the frame was just allocated for exclusive use.
        let base = unsafe { self.mapper.phys_to_mut::<u8>(frame) };
        let slot_size = SLAB_CLASSES[class];
        let count = PAGE_SIZE as usize / slot_size;

        // Link back to front so the list ends up address-ascending.
        for index in (0..count).rev() {
            // Safety: each slot lies fully inside the carved frame.
            unsafe {
                let slot = base.add(index * slot_size).cast::<FreeSlot>();
                (*slot).next = self.heads[class];
                self.heads[class] = slot;
            }
        }
        Some(())
    }
}

impl<M: PhysMapper> AllocatorOps for SlabAllocator<'_, M> {
    fn allocate(
        &mut self,
        frames: &mut impl FrameAlloc,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // Slots of a class are aligned to the class size, so serving from
        // the class covering both size and align satisfies the layout.
        let class = Self::class_for(size.max(align))?;
        if self.heads[class].is_null() {
            self.refill(frames, class)?;
        }
        let slot = self.heads[class];
        // Safety: slot is a live free-slot node from our own list.
        self.heads[class] = unsafe { (*slot).next };
        NonNull::new(slot.cast())
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        let Some(class) = Self::class_for(size.max(align)) else {
            debug_assert!(false, "slab free above SLAB_MAX");
            return;
        };
        let slot = ptr.as_ptr().cast::<FreeSlot>();
        // Safety: per contract the slot came from this class and is unused.
        unsafe { (*slot).next = self.heads[class] };
        self.heads[class] = slot;
    }
}
