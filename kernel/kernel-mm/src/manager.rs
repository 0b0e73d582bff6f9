//! The memory manager: every allocator of the kernel behind one structure.

use crate::page_fault::PageFaultCode;
use core::ptr::NonNull;
use kernel_frames::{BuddyAllocator, FrameTable, FramesError};
use kernel_heap::{AllocatorOps, RegionAllocator, SlabAllocator, SLAB_MAX};
use kernel_info::memory::{HHDM_BASE, PAGE_SIZE, VMALLOC_BASE};
use kernel_memmap::MemoryMap;
use kernel_vmem::{
    align_up, frames_for, AddressSpace, FrameRefs, FrameReaper, PageEntryBits, PageSize, PageTable,
    PhysAddr, PhysMapper, RefCount, VirtAddr, VmemError, TABLE_ENTRY_COUNT,
};

/// Bytes of bookkeeping in front of every `kmalloc`/`vmalloc` payload.
const HEADER_SIZE: usize = 16;

const KMALLOC_MAGIC: u32 = 0x6B6D_616C;
const VMALLOC_MAGIC: u32 = 0x766D_616C;

/// Header written immediately before each heap payload, so `kfree` and
/// `vfree` need nothing but the pointer.
#[repr(C)]
struct AllocHeader {
    size: u64,
    magic: u32,
    kind: u32,
}

/// How an allocation participates in fork.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Private memory; copied on write after a fork.
    Normal,
    /// Memory meant to stay shared across forks; mappings of it carry the
    /// shared page bit instead of being downgraded to copy-on-write.
    Shared,
}

impl MemoryKind {
    const fn as_raw(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::Shared => 1,
        }
    }

    const fn from_raw(raw: u32) -> Self {
        if raw == 0 { Self::Normal } else { Self::Shared }
    }
}

/// Errors surfaced by the memory manager.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MmError {
    /// No physical memory left for the request.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The memory manager has not been initialized yet.
    #[error("memory manager is not initialized")]
    NotInitialized,
    /// An operation needed the kernel page tables before
    /// [`MemoryManager::setup_paging`] built them.
    #[error("paging has not been initialized")]
    PagingNotInitialized,
    /// A pointer handed to `kfree`/`vfree` does not carry a valid header.
    #[error("pointer does not belong to this allocator")]
    BadPointer,
    #[error(transparent)]
    Vmem(#[from] VmemError),
    #[error(transparent)]
    Frames(#[from] FramesError),
}

/// Owner of physical frames, kernel heap and the kernel page tables.
///
/// Generic over the [`PhysMapper`] so the full stack runs in host tests
/// against plain memory. In the kernel there is exactly one instance, behind
/// the lock in the crate root.
pub struct MemoryManager<'m, M: PhysMapper> {
    mapper: &'m M,
    buddy: BuddyAllocator<'m, M>,
    frame_table: FrameTable<'m, M>,
    slab: SlabAllocator<'m, M>,
    region: RegionAllocator<'m, M>,
    kernel_root: Option<PhysAddr>,
    vmalloc_next: u64,
}

impl<'m, M: PhysMapper> MemoryManager<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            buddy: BuddyAllocator::new(mapper),
            frame_table: FrameTable::new(mapper),
            slab: SlabAllocator::new(mapper),
            region: RegionAllocator::new(mapper),
            kernel_root: None,
            vmalloc_next: VMALLOC_BASE,
        }
    }

    /// Take ownership of all usable physical memory described by `map`.
    ///
    /// # Errors
    ///
    /// Propagates [`FramesError`] when the frame table cannot be built.
    pub fn init(&mut self, map: &MemoryMap) -> Result<(), MmError> {
        self.buddy.init(map);
        self.frame_table.init(&mut self.buddy, map)?;
        Ok(())
    }

    /// Frames currently free in the buddy allocator.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.buddy.free_frames()
    }

    /// Frames handed to the buddy allocator at init.
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.buddy.total_frames()
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// # Errors
    ///
    /// [`MmError::OutOfMemory`] when the buddy allocator cannot serve it.
    pub fn page_alloc(&mut self, count: usize) -> Result<PhysAddr, MmError> {
        self.buddy.allocate(count).ok_or(MmError::OutOfMemory)
    }

    /// Return frames from [`page_alloc`](Self::page_alloc).
    pub fn page_free(&mut self, base: PhysAddr, count: usize) {
        self.buddy.free(base, count);
    }

    /// Allocate `size` bytes of kernel heap.
    ///
    /// Small requests come from the slab, larger ones from the region
    /// allocator; the returned pointer is 16-byte aligned and reachable
    /// through the direct map.
    ///
    /// # Errors
    ///
    /// [`MmError::OutOfMemory`] when the heap cannot grow.
    pub fn kmalloc(&mut self, size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
        let total = size.checked_add(HEADER_SIZE).ok_or(MmError::OutOfMemory)?;
        let block = if total <= SLAB_MAX {
            self.slab.allocate(&mut self.buddy, total, HEADER_SIZE)
        } else {
            self.region.allocate(&mut self.buddy, total, HEADER_SIZE)
        }
        .ok_or(MmError::OutOfMemory)?;

        // Safety: block spans `total` writable bytes.
        unsafe {
            block.cast::<AllocHeader>().write(AllocHeader {
                size: size as u64,
                magic: KMALLOC_MAGIC,
                kind: kind.as_raw(),
            });
            Ok(NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)))
        }
    }

    /// Allocate zeroed memory for `count` objects of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`MmError::OutOfMemory`] on overflow or exhaustion.
    pub fn kcalloc(
        &mut self,
        count: usize,
        size: usize,
        kind: MemoryKind,
    ) -> Result<NonNull<u8>, MmError> {
        let bytes = count.checked_mul(size).ok_or(MmError::OutOfMemory)?;
        let ptr = self.kmalloc(bytes, kind)?;
        // Safety: the allocation spans `bytes` writable bytes.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Ok(ptr)
    }

    /// Resize a `kmalloc` allocation, preserving the common prefix.
    /// The original stays valid when the new allocation fails.
    ///
    /// # Errors
    ///
    /// [`MmError::BadPointer`] when `ptr` lacks a `kmalloc` header,
    /// [`MmError::OutOfMemory`] when the new size cannot be served.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`kmalloc`](Self::kmalloc) on this manager and
    /// must not be used after a successful call.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn krealloc(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, MmError> {
        // Safety: per contract a header precedes the payload.
        let header = unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<AllocHeader>().read() };
        if header.magic != KMALLOC_MAGIC {
            return Err(MmError::BadPointer);
        }
        let old_size = header.size as usize;
        let new = self.kmalloc(new_size, MemoryKind::from_raw(header.kind))?;
        // Safety: both allocations are live and at least `min` bytes long.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.kfree(ptr)?;
        }
        Ok(new)
    }

    /// Return a `kmalloc` allocation.
    ///
    /// # Errors
    ///
    /// [`MmError::BadPointer`] when `ptr` lacks a `kmalloc` header.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`kmalloc`](Self::kmalloc) on this manager and
    /// must not be used afterwards.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn kfree(&mut self, ptr: NonNull<u8>) -> Result<(), MmError> {
        let header_ptr = unsafe { ptr.as_ptr().sub(HEADER_SIZE) };
        // Safety: per contract a header precedes the payload.
        let header = unsafe { header_ptr.cast::<AllocHeader>().read() };
        if header.magic != KMALLOC_MAGIC {
            return Err(MmError::BadPointer);
        }
        let total = header.size as usize + HEADER_SIZE;
        // Safety: header_ptr is the start of the original block.
        let block = unsafe { NonNull::new_unchecked(header_ptr) };
        if total <= SLAB_MAX {
            // Safety: the block came from the slab with this size and align.
            unsafe { self.slab.free(block, total, HEADER_SIZE) };
        } else {
            // Safety: likewise for the region allocator.
            unsafe { self.region.free(block, total, HEADER_SIZE) };
        }
        Ok(())
    }

    /// Serve an arbitrary [`core::alloc::Layout`], headerless.
    ///
    /// This is the `GlobalAlloc` path: the layout comes back on dealloc, so
    /// no header is needed and the routing is recomputed from it.
    pub fn alloc_raw(&mut self, layout: core::alloc::Layout) -> Option<NonNull<u8>> {
        let size = layout.size().max(1);
        let align = layout.align();
        if size.max(align) <= SLAB_MAX {
            self.slab.allocate(&mut self.buddy, size, align)
        } else {
            self.region.allocate(&mut self.buddy, size, align)
        }
    }

    /// Counterpart of [`alloc_raw`](Self::alloc_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_raw` with the same `layout`.
    pub unsafe fn free_raw(&mut self, ptr: NonNull<u8>, layout: core::alloc::Layout) {
        let size = layout.size().max(1);
        let align = layout.align();
        if size.max(align) <= SLAB_MAX {
            // Safety: contract forwarded from the caller.
            unsafe { self.slab.free(ptr, size, align) };
        } else {
            // Safety: contract forwarded from the caller.
            unsafe { self.region.free(ptr, size, align) };
        }
    }

    /// Build the kernel's own page tables: alias the boot-stage kernel-half
    /// mappings and lay a 2 MiB-page direct map over `[0, max_phys)` at
    /// [`HHDM_BASE`]. Returns the new root; the caller activates it.
    ///
    /// # Errors
    ///
    /// [`MmError::OutOfMemory`] when table frames run out,
    /// [`VmemError::AlreadyMapped`] when the boot tables already populate
    /// the direct-map window.
    pub fn setup_paging(
        &mut self,
        bootstrap_root: PhysAddr,
        max_phys: u64,
    ) -> Result<PhysAddr, MmError> {
        let mapper = self.mapper;
        let mut space = AddressSpace::new(&mut self.buddy, mapper)?;
        let root = space.root_page();

        let hhdm_end = HHDM_BASE + align_up(max_phys, PageSize::Size1G.bytes());
        let hhdm_slots = VirtAddr::new(HHDM_BASE).pml4_index()
            ..=VirtAddr::new(hhdm_end - 1).pml4_index();
        {
            // Safety: both roots are live table frames.
            let boot = unsafe { &*mapper.phys_to_mut::<PageTable>(bootstrap_root) };
            let table = unsafe { &mut *mapper.phys_to_mut::<PageTable>(root) };
            for index in TABLE_ENTRY_COUNT / 2..TABLE_ENTRY_COUNT {
                let entry = boot.entry(index);
                if entry.present() && !hhdm_slots.contains(&index) {
                    table.set_entry(index, entry);
                }
            }
        }

        let flags = PageEntryBits::new()
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true);
        let step = PageSize::Size2M.bytes();
        let mut phys = 0;
        while phys < align_up(max_phys, step) {
            space.map_one(
                &mut self.buddy,
                VirtAddr::new(HHDM_BASE + phys),
                PhysAddr::new(phys),
                PageSize::Size2M,
                flags,
            )?;
            phys += step;
        }

        log::info!("kernel page tables at {root} direct-mapping {max_phys:#x} bytes");
        self.kernel_root = Some(root);
        Ok(root)
    }

    /// The root built by [`setup_paging`](Self::setup_paging), if any.
    #[must_use]
    pub const fn kernel_root(&self) -> Option<PhysAddr> {
        self.kernel_root
    }

    /// Fork the address space rooted at `root` for a new task.
    ///
    /// See [`AddressSpace::copy_for_fork`] for the sharing semantics. The
    /// caller must reload CR3 before the parent task runs again.
    ///
    /// # Errors
    ///
    /// Propagates [`VmemError`] from the fork walk.
    pub fn copy_pml4_table(&mut self, root: PhysAddr) -> Result<PhysAddr, MmError> {
        let mapper = self.mapper;
        let mut space = AddressSpace::from_root(root, mapper);
        let child = space.copy_for_fork(&mut self.buddy, &self.frame_table)?;
        Ok(child.root_page())
    }

    /// Tear down the address space rooted at `root`, returning every frame
    /// it exclusively owned. Returns the number of frames freed.
    ///
    /// `root` must not be the active address space.
    pub fn release_pml4_table(&mut self, root: PhysAddr) -> usize {
        let mapper = self.mapper;
        let mut reaper = FrameReaper::new(mapper);
        AddressSpace::from_root(root, mapper).release(&self.frame_table, &mut reaper);
        reaper.reap(&mut self.buddy)
    }

    /// Resolve a page fault at `addr` in the space rooted at `root`.
    ///
    /// Only the copy-on-write pattern (a denied write to a present page) is
    /// handled; everything else is returned as an error for the fault
    /// handler to escalate. Returns the frame now mapped at `addr`.
    ///
    /// # Errors
    ///
    /// [`VmemError::NotMapped`] for faults on non-present pages,
    /// [`VmemError::NotSupportedOperation`] for violations that are not
    /// copy-on-write, [`MmError::OutOfMemory`] when the copy cannot be made.
    pub fn handle_page_fault(
        &mut self,
        root: PhysAddr,
        addr: VirtAddr,
        code: PageFaultCode,
    ) -> Result<PhysAddr, MmError> {
        if !code.is_cow_candidate() {
            log::error!("unhandled page fault at {addr}: {}", code.explain());
            return Err(if code.present() {
                VmemError::NotSupportedOperation.into()
            } else {
                VmemError::NotMapped.into()
            });
        }
        let mapper = self.mapper;
        let mut space = AddressSpace::from_root(root, mapper);
        let frame = space.resolve_cow_fault(&mut self.buddy, &self.frame_table, addr)?;
        log::trace!("copy-on-write fault at {addr} resolved to {frame}");
        Ok(frame)
    }

    /// Allocate `size` bytes of virtually contiguous, physically scattered
    /// memory in the window above [`VMALLOC_BASE`].
    ///
    /// Backing frames are zeroed single frames; each allocation is followed
    /// by an unmapped guard page. [`MemoryKind::Shared`] marks the mappings
    /// with the shared page bit.
    ///
    /// # Errors
    ///
    /// [`MmError::PagingNotInitialized`] before
    /// [`setup_paging`](Self::setup_paging), [`MmError::OutOfMemory`] when
    /// frames run out (already mapped pages are rolled back).
    #[allow(clippy::cast_possible_truncation)]
    pub fn vmalloc(&mut self, size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
        let root = self.kernel_root.ok_or(MmError::PagingNotInitialized)?;
        let total = size.checked_add(HEADER_SIZE).ok_or(MmError::OutOfMemory)?;
        let pages = frames_for(total as u64);
        let base = VirtAddr::new(self.vmalloc_next);
        self.vmalloc_next += (pages as u64 + 1) * PAGE_SIZE;

        let mapper = self.mapper;
        let mut space = AddressSpace::from_root(root, mapper);
        let flags = PageEntryBits::new()
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true)
            .with_shared(matches!(kind, MemoryKind::Shared));

        let mut first_frame = None;
        for index in 0..pages {
            let Some(frame) = self.buddy.allocate(1) else {
                self.vmalloc_unwind(&mut space, base, index);
                return Err(MmError::OutOfMemory);
            };
            // Safety: the frame was just allocated for this mapping.
            unsafe { core::ptr::write_bytes(mapper.phys_to_mut::<u8>(frame), 0, PAGE_SIZE as usize) };
            if let Err(err) =
                space.map_one(&mut self.buddy, base.add(index as u64 * PAGE_SIZE), frame, PageSize::Size4K, flags)
            {
                self.buddy.free(frame, 1);
                self.vmalloc_unwind(&mut space, base, index);
                return Err(err.into());
            }
            first_frame.get_or_insert(frame);
        }
        let first = first_frame.ok_or(MmError::OutOfMemory)?;

        // The header goes through the physical side: the window may not be
        // reachable virtually yet (and is not in host tests).
        // Safety: first is the live backing frame of the first page.
        unsafe {
            mapper.phys_to_mut::<AllocHeader>(first).write(AllocHeader {
                size: size as u64,
                magic: VMALLOC_MAGIC,
                kind: kind.as_raw(),
            });
        }
        // Safety: the window base is never null.
        Ok(unsafe { NonNull::new_unchecked((base.as_u64() + HEADER_SIZE as u64) as *mut u8) })
    }

    /// Allocate zeroed `vmalloc` memory for `count` objects of `size` bytes.
    ///
    /// # Errors
    ///
    /// As [`vmalloc`](Self::vmalloc), plus [`MmError::OutOfMemory`] on
    /// overflow.
    pub fn vcalloc(
        &mut self,
        count: usize,
        size: usize,
        kind: MemoryKind,
    ) -> Result<NonNull<u8>, MmError> {
        let bytes = count.checked_mul(size).ok_or(MmError::OutOfMemory)?;
        // Backing frames are zeroed on allocation already.
        self.vmalloc(bytes, kind)
    }

    /// Resize a `vmalloc` allocation, preserving the common prefix.
    ///
    /// # Errors
    ///
    /// [`MmError::BadPointer`] when `ptr` lacks a `vmalloc` header, plus
    /// the [`vmalloc`](Self::vmalloc) errors.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`vmalloc`](Self::vmalloc) on this manager and
    /// must not be used after a successful call.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn vrealloc(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, MmError> {
        let (old_base, header) = self.vmalloc_header(ptr)?;
        let old_size = header.size as usize;
        let kind = MemoryKind::from_raw(header.kind);

        let new = self.vmalloc(new_size, kind)?;
        let new_base = VirtAddr::new(new.as_ptr() as u64 - HEADER_SIZE as u64);
        self.copy_window(old_base, new_base, old_size.min(new_size))?;
        // Safety: contract forwarded from the caller.
        unsafe { self.vfree(ptr)? };
        Ok(new)
    }

    /// Return a `vmalloc` allocation, unmapping its window and releasing
    /// the backing frames. Returns the number of frames freed.
    ///
    /// # Errors
    ///
    /// [`MmError::BadPointer`] when `ptr` lacks a `vmalloc` header.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`vmalloc`](Self::vmalloc) on this manager and
    /// must not be used afterwards.
    pub unsafe fn vfree(&mut self, ptr: NonNull<u8>) -> Result<usize, MmError> {
        let (base, header) = self.vmalloc_header(ptr)?;
        let pages = frames_for(header.size + HEADER_SIZE as u64);

        let mapper = self.mapper;
        let root = self.kernel_root.ok_or(MmError::PagingNotInitialized)?;
        let mut space = AddressSpace::from_root(root, mapper);
        let mut reaper = FrameReaper::new(mapper);
        for index in 0..pages {
            if let Err(err) = space.unmap_one(
                base.add(index as u64 * PAGE_SIZE),
                &self.frame_table,
                &mut reaper,
            ) {
                // Frames unmapped before the failure still go back.
                reaper.reap(&mut self.buddy);
                return Err(err.into());
            }
        }
        Ok(reaper.reap(&mut self.buddy))
    }

    /// Locate and validate the header of the `vmalloc` allocation at `ptr`.
    fn vmalloc_header(&self, ptr: NonNull<u8>) -> Result<(VirtAddr, AllocHeader), MmError> {
        let root = self.kernel_root.ok_or(MmError::PagingNotInitialized)?;
        let base = VirtAddr::new(ptr.as_ptr() as u64 - HEADER_SIZE as u64);
        let space = AddressSpace::from_root(root, self.mapper);
        let (first, _) = space.query(base).ok_or(MmError::BadPointer)?;
        // Safety: first is the mapped backing frame of the first page.
        let header = unsafe { self.mapper.phys_to_mut::<AllocHeader>(first).read() };
        if header.magic != VMALLOC_MAGIC {
            return Err(MmError::BadPointer);
        }
        Ok((base, header))
    }

    /// Copy `len` payload bytes between two `vmalloc` windows through their
    /// backing frames, chunked at page boundaries.
    #[allow(clippy::cast_possible_truncation)]
    fn copy_window(&self, src: VirtAddr, dst: VirtAddr, len: usize) -> Result<(), MmError> {
        let root = self.kernel_root.ok_or(MmError::PagingNotInitialized)?;
        let space = AddressSpace::from_root(root, self.mapper);
        let mut offset = 0u64;
        while (offset as usize) < len {
            let pos = HEADER_SIZE as u64 + offset;
            // Both windows share the same page phase, so one chunk bound works.
            let chunk = (PAGE_SIZE - pos % PAGE_SIZE).min(len as u64 - offset);
            let (src_phys, _) = space.query(src.add(pos)).ok_or(MmError::BadPointer)?;
            let (dst_phys, _) = space.query(dst.add(pos)).ok_or(MmError::BadPointer)?;
            // Safety: both frames are live and the chunk stays inside each.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.mapper.phys_to_mut::<u8>(src_phys),
                    self.mapper.phys_to_mut::<u8>(dst_phys),
                    chunk as usize,
                );
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Roll back a partially built `vmalloc` mapping of `pages` pages.
    fn vmalloc_unwind(&mut self, space: &mut AddressSpace<'m, M>, base: VirtAddr, pages: usize) {
        let mut reaper = FrameReaper::new(self.mapper);
        for index in 0..pages {
            if space
                .unmap_one(base.add(index as u64 * PAGE_SIZE), &self.frame_table, &mut reaper)
                .is_err()
            {
                break;
            }
        }
        reaper.reap(&mut self.buddy);
    }

    /// True when `frame` is not shared with any other address space.
    #[must_use]
    pub fn frame_is_exclusive(&self, frame: PhysAddr) -> bool {
        matches!(self.frame_table.refcount(frame), RefCount::One)
    }
}
