//! Deferred frame release.

use crate::{FrameAlloc, PhysAddr, PhysMapper};

/// List terminator; frame 0 is never subject to reaping.
const NIL: u64 = 0;

/// Link written into the first bytes of every collected frame.
#[repr(C)]
struct ReapNode {
    next: u64,
}

/// Collects frames that became free during a page table walk and returns
/// them to the allocator only after the walk has finished.
///
/// Freeing a table frame while the walk still iterates it would let the
/// allocator scribble a free-list node over live entries. Teardown and unmap
/// therefore push into a reaper and the caller drains it afterwards.
///
/// The list is intrusive: a pushed frame is dead by definition, so its first
/// bytes hold the link. The reaper itself needs no heap, which matters
/// because it runs under the same lock the heap allocators do.
pub struct FrameReaper<'m, M: PhysMapper> {
    mapper: &'m M,
    head: u64,
    len: usize,
}

impl<'m, M: PhysMapper> FrameReaper<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            head: NIL,
            len: 0,
        }
    }

    /// Schedule one 4 KiB frame for release. The frame's previous contents
    /// are clobbered; callers must be done reading it.
    pub fn push(&mut self, frame: PhysAddr) {
        debug_assert_ne!(frame.as_u64(), NIL);
        // Safety: the frame is dead; we own its contents from here on.
        unsafe { (*self.mapper.phys_to_mut::<ReapNode>(frame)).next = self.head };
        self.head = frame.as_u64();
        self.len += 1;
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `frame` is waiting to be reaped. Linear walk, meant for
    /// assertions.
    #[must_use]
    pub fn contains(&self, frame: PhysAddr) -> bool {
        let mut cur = self.head;
        while cur != NIL {
            if cur == frame.as_u64() {
                return true;
            }
            // Safety: cur is a frame we linked in push.
            cur = unsafe { (*self.mapper.phys_to_mut::<ReapNode>(PhysAddr::new(cur))).next };
        }
        false
    }

    /// Hand every pending frame back to `alloc`. Returns how many were freed.
    pub fn reap(&mut self, alloc: &mut impl FrameAlloc) -> usize {
        let count = self.len;
        while self.head != NIL {
            let frame = PhysAddr::new(self.head);
            // Safety: frame is a dead frame we linked in push.
            self.head = unsafe { (*self.mapper.phys_to_mut::<ReapNode>(frame)).next };
            alloc.free_4k(frame);
        }
        self.len = 0;
        count
    }
}
