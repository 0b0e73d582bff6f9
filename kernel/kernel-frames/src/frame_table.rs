//! Per-frame sharing counters backing the copy-on-write machinery.

use crate::{BuddyAllocator, FramesError};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{FREE_PAGE_BEGIN, MAX_MEMORY_RANGES, PAGE_SIZE};
use kernel_memmap::MemoryMap;
use kernel_vmem::{
    align_down, align_up, frames_for, FrameRefs, PhysAddr, PhysMapper, RefCount, RefError, RefKind,
};

/// Bit 0 of a raw counter selects the sharing kind.
const KIND_SHARED: u64 = 1;
const COUNT_SHIFT: u32 = 1;
const MAX_COUNT: u64 = u64::MAX >> COUNT_SHIFT;

/// One contiguous run of tracked frames and its counter storage.
#[derive(Copy, Clone)]
struct Section {
    first: u64,
    frames: usize,
    storage: PhysAddr,
}

impl Section {
    const EMPTY: Self = Self {
        first: 0,
        frames: 0,
        storage: PhysAddr::new(0),
    };
}

/// Reference counters for every allocatable frame.
///
/// Counters live in frames carved from the buddy allocator at init, one
/// `u64` per tracked frame, reached through the [`PhysMapper`]. A raw value
/// of zero means exclusively owned; otherwise bit 0 holds the sharing kind
/// and the remaining bits the share count.
///
/// The atomics only make the counters safe to read concurrently; updates
/// are serialized by the memory manager's lock. Frames outside every
/// tracked section are reported exclusive and cannot be shared.
pub struct FrameTable<'m, M: PhysMapper> {
    mapper: &'m M,
    sections: [Section; MAX_MEMORY_RANGES],
    section_count: usize,
}

impl<'m, M: PhysMapper> FrameTable<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            sections: [Section::EMPTY; MAX_MEMORY_RANGES],
            section_count: 0,
        }
    }

    /// Carve counter storage for every usable range of `map` out of `buddy`.
    ///
    /// Runs after [`BuddyAllocator::init`] so the storage comes from the
    /// arena itself; the clamping must mirror the allocator's so the two
    /// agree on which frames exist.
    ///
    /// # Errors
    ///
    /// [`FramesError::OutOfMemory`] when the counter storage cannot be
    /// allocated, [`FramesError::CapacityExhausted`] when `map` has more
    /// usable ranges than sections are available.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(
        &mut self,
        buddy: &mut BuddyAllocator<'m, M>,
        map: &MemoryMap,
    ) -> Result<(), FramesError> {
        for (base, size) in map.usable_ranges() {
            let start = align_up(base.max(FREE_PAGE_BEGIN), PAGE_SIZE);
            let end = align_down(base.saturating_add(size), PAGE_SIZE);
            if start >= end {
                continue;
            }
            if self.section_count == MAX_MEMORY_RANGES {
                return Err(FramesError::CapacityExhausted);
            }

            let frames = ((end - start) / PAGE_SIZE) as usize;
            let bytes = frames * core::mem::size_of::<u64>();
            let storage = buddy
                .allocate(frames_for(bytes as u64))
                .ok_or(FramesError::OutOfMemory)?;
            // Safety: the storage block was just allocated for our use.
            unsafe {
                core::ptr::write_bytes(self.mapper.phys_to_mut::<u8>(storage), 0, bytes);
            }

            self.sections[self.section_count] = Section {
                first: start,
                frames,
                storage,
            };
            self.section_count += 1;
        }
        Ok(())
    }

    /// Total number of frames with a counter.
    #[must_use]
    pub fn tracked_frames(&self) -> usize {
        self.sections[..self.section_count]
            .iter()
            .map(|s| s.frames)
            .sum()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, frame: PhysAddr) -> Option<&AtomicU64> {
        let addr = frame.as_u64();
        for section in &self.sections[..self.section_count] {
            if addr < section.first {
                continue;
            }
            let index = ((addr - section.first) / PAGE_SIZE) as usize;
            if index < section.frames {
                // Safety: storage holds section.frames counters, zeroed at
                // init; index is in range.
                let counters = unsafe { self.mapper.phys_to_mut::<AtomicU64>(section.storage) };
                return Some(unsafe { &*counters.add(index) });
            }
        }
        None
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn decode(raw: u64) -> RefCount {
    if raw == 0 {
        RefCount::One
    } else if raw & KIND_SHARED == 0 {
        RefCount::Cow((raw >> COUNT_SHIFT) as usize)
    } else {
        RefCount::Shared((raw >> COUNT_SHIFT) as usize)
    }
}

const fn kind_bit(kind: RefKind) -> u64 {
    match kind {
        RefKind::Cow => 0,
        RefKind::Shared => KIND_SHARED,
    }
}

impl<M: PhysMapper> FrameRefs for FrameTable<'_, M> {
    fn add_ref(&self, frame: PhysAddr, kind: RefKind) -> Result<usize, RefError> {
        let Some(slot) = self.slot(frame) else {
            log::warn!("add_ref on untracked frame {frame}");
            return Err(RefError::RcOverflow);
        };
        loop {
            let raw = slot.load(Ordering::Relaxed);
            let (new_raw, count) = if raw == 0 {
                ((2 << COUNT_SHIFT) | kind_bit(kind), 2)
            } else {
                if raw & KIND_SHARED != kind_bit(kind) {
                    return Err(match kind {
                        RefKind::Shared => RefError::CowToShared,
                        RefKind::Cow => RefError::SharedToCow,
                    });
                }
                let count = raw >> COUNT_SHIFT;
                if count == MAX_COUNT {
                    return Err(RefError::RcOverflow);
                }
                (((count + 1) << COUNT_SHIFT) | kind_bit(kind), count + 1)
            };
            if slot
                .compare_exchange(raw, new_raw, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                #[allow(clippy::cast_possible_truncation)]
                return Ok(count as usize);
            }
        }
    }

    fn remove_ref(&self, frame: PhysAddr) -> Option<RefCount> {
        let slot = self.slot(frame)?;
        loop {
            let raw = slot.load(Ordering::Relaxed);
            if raw == 0 {
                // Exclusive: the caller held the only reference.
                return None;
            }
            let count = raw >> COUNT_SHIFT;
            // Draining to a single owner resets the frame to untracked.
            let new_raw = if count == 2 {
                0
            } else {
                ((count - 1) << COUNT_SHIFT) | (raw & KIND_SHARED)
            };
            if slot
                .compare_exchange(raw, new_raw, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(decode(new_raw));
            }
        }
    }

    fn refcount(&self, frame: PhysAddr) -> RefCount {
        self.slot(frame)
            .map_or(RefCount::One, |slot| decode(slot.load(Ordering::Relaxed)))
    }
}
