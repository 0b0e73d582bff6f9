//! Binary buddy allocator over 4 KiB frames.

use kernel_info::memory::{FREE_PAGE_BEGIN, PAGE_SIZE};
use kernel_memmap::MemoryMap;
use kernel_vmem::{align_down, align_up, FrameAlloc, PhysAddr, PhysMapper};

/// Largest block order: `2^10` frames, 4 MiB.
pub const MAX_ORDER: usize = 10;
/// Number of per-order free lists.
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// List head sentinel. Frame 0 is never managed (everything below
/// [`FREE_PAGE_BEGIN`] is off limits), so the zero address is free for this.
const NIL: u64 = 0;

/// Link stored in the first bytes of every free block.
#[repr(C)]
struct FreeNode {
    next: u64,
}

/// Power-of-two frame allocator with one address-ordered free list per order.
///
/// A block of order `k` spans `2^k` frames and is aligned to its own size,
/// so its buddy is found by flipping one address bit. Allocation splits the
/// smallest sufficient block; freeing greedily re-merges with the buddy as
/// long as the buddy is also free.
///
/// Requests are rounded up to whole blocks: `allocate(5)` hands out an
/// order-3 block of eight frames and `free(addr, 5)` returns all eight, so
/// the pair is always balanced.
pub struct BuddyAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    heads: [u64; ORDER_COUNT],
    free_frames: usize,
    total_frames: usize,
}

impl<'m, M: PhysMapper> BuddyAllocator<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            heads: [NIL; ORDER_COUNT],
            free_frames: 0,
            total_frames: 0,
        }
    }

    /// Seed the allocator from the usable ranges of `map`.
    ///
    /// Each range is clamped to whole frames above [`FREE_PAGE_BEGIN`] and
    /// carved greedily into the largest blocks the current alignment allows.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(&mut self, map: &MemoryMap) {
        for (base, size) in map.usable_ranges() {
            let start = align_up(base.max(FREE_PAGE_BEGIN), PAGE_SIZE);
            let end = align_down(base.saturating_add(size), PAGE_SIZE);
            if start < end {
                self.add_range(start, end);
            }
        }
        log::info!(
            "buddy allocator initialized with {} frames ({} MiB)",
            self.total_frames,
            self.total_frames * PAGE_SIZE as usize / (1024 * 1024)
        );
    }

    /// Frames currently free.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frames handed to the allocator at init.
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Allocate `frames` contiguous frames, rounded up to a whole block.
    ///
    /// Returns the block base, aligned to the rounded size. `None` when the
    /// request exceeds [`MAX_ORDER`] or no block can be carved.
    #[must_use]
    pub fn allocate(&mut self, frames: usize) -> Option<PhysAddr> {
        let order = Self::order_for(frames)?;

        let mut have = order;
        while have <= MAX_ORDER && self.heads[have] == NIL {
            have += 1;
        }
        if have > MAX_ORDER {
            return None;
        }

        let base = self.pop(have);
        // Split back down, returning the upper half at each step.
        while have > order {
            have -= 1;
            self.push_sorted(have, base.add(PAGE_SIZE << have));
        }
        self.free_frames -= 1 << order;
        Some(base)
    }

    /// Return the block of `frames` frames at `base`, merging with free
    /// buddies. The count must match the one passed to [`allocate`](Self::allocate).
    pub fn free(&mut self, base: PhysAddr, frames: usize) {
        let Some(order) = Self::order_for(frames) else {
            debug_assert!(false, "free of unallocatable block size");
            return;
        };
        debug_assert!(base.is_aligned(PAGE_SIZE << order));
        self.free_frames += 1 << order;
        self.insert_merged(base, order);
    }

    fn add_range(&mut self, mut start: u64, end: u64) {
        while start < end {
            let align_order = ((start >> 12).trailing_zeros() as usize).min(MAX_ORDER);
            let mut order = align_order;
            while order > 0 && start + (PAGE_SIZE << order) > end {
                order -= 1;
            }
            if start + (PAGE_SIZE << order) > end {
                break;
            }
            self.total_frames += 1 << order;
            self.free_frames += 1 << order;
            self.insert_merged(PhysAddr::new(start), order);
            start += PAGE_SIZE << order;
        }
    }

    fn insert_merged(&mut self, base: PhysAddr, order: usize) {
        let mut base = base.as_u64();
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = base ^ (PAGE_SIZE << order);
            if !self.remove(order, PhysAddr::new(buddy)) {
                break;
            }
            base = base.min(buddy);
            order += 1;
        }
        self.push_sorted(order, PhysAddr::new(base));
    }

    /// The free-list order serving a request of `frames` frames.
    fn order_for(frames: usize) -> Option<usize> {
        if frames == 0 {
            return None;
        }
        let order = frames.next_power_of_two().trailing_zeros() as usize;
        (order <= MAX_ORDER).then_some(order)
    }

    fn pop(&mut self, order: usize) -> PhysAddr {
        let head = self.heads[order];
        debug_assert_ne!(head, NIL);
        self.heads[order] = self.next_of(PhysAddr::new(head));
        PhysAddr::new(head)
    }

    /// Insert `addr` keeping the list sorted ascending by address.
    fn push_sorted(&mut self, order: usize, addr: PhysAddr) {
        let mut prev = NIL;
        let mut cur = self.heads[order];
        while cur != NIL && cur < addr.as_u64() {
            prev = cur;
            cur = self.next_of(PhysAddr::new(cur));
        }
        self.set_next(addr, cur);
        if prev == NIL {
            self.heads[order] = addr.as_u64();
        } else {
            self.set_next(PhysAddr::new(prev), addr.as_u64());
        }
    }

    /// Unlink `addr` from the order's list if present. Sortedness allows an
    /// early exit once the walk passes the address.
    fn remove(&mut self, order: usize, addr: PhysAddr) -> bool {
        if addr.as_u64() == NIL {
            // The buddy of the lowest managed block computes to address 0;
            // it is never free.
            return false;
        }
        let mut prev = NIL;
        let mut cur = self.heads[order];
        while cur != NIL && cur < addr.as_u64() {
            prev = cur;
            cur = self.next_of(PhysAddr::new(cur));
        }
        if cur != addr.as_u64() {
            return false;
        }
        let next = self.next_of(addr);
        if prev == NIL {
            self.heads[order] = next;
        } else {
            self.set_next(PhysAddr::new(prev), next);
        }
        true
    }

    fn next_of(&self, addr: PhysAddr) -> u64 {
        // Safety: addr is the base of a free block we own; the node was
        // written by set_next before the block entered the list.
        unsafe { (*self.mapper.phys_to_mut::<FreeNode>(addr)).next }
    }

    fn set_next(&mut self, addr: PhysAddr, next: u64) {
        // Safety: addr is the base of a free block we own exclusively.
        unsafe { (*self.mapper.phys_to_mut::<FreeNode>(addr)).next = next };
    }
}

impl<M: PhysMapper> FrameAlloc for BuddyAllocator<'_, M> {
    fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
        self.allocate(count)
    }

    fn free_frames(&mut self, base: PhysAddr, count: usize) {
        self.free(base, count);
    }
}
