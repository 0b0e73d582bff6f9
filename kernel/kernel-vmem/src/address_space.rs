//! Address space management on top of the four-level table walk.

use crate::{
    arch, FrameAlloc, FrameReaper, FrameRefs, PageEntryBits, PageTable, PhysAddr, PhysMapper,
    RefCount, RefError, RefKind, VirtAddr, TABLE_ENTRY_COUNT,
};
use kernel_info::memory::PAGE_SIZE;

/// First PML4 slot of the kernel half. Entries from here up are aliased
/// between all address spaces rather than cloned.
const KERNEL_HALF_START: usize = 256;

/// Mappable page sizes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageSize {
    /// A 4 KiB page, mapped at level 1.
    Size4K,
    /// A 2 MiB page, mapped at level 2 with the PS bit.
    Size2M,
    /// A 1 GiB page, mapped at level 3 with the PS bit.
    Size1G,
}

impl PageSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }
}

/// Errors from address space manipulation.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum VmemError {
    /// The frame allocator ran dry mid-operation.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The target virtual address already has a mapping.
    #[error("virtual address is already mapped")]
    AlreadyMapped,
    /// No mapping exists at the target virtual address.
    #[error("virtual address is not mapped")]
    NotMapped,
    /// The mapping exists but the operation does not apply to it, for
    /// example forking over a huge user page or resolving a fault on a page
    /// that is not copy-on-write.
    #[error("operation not supported for this mapping")]
    NotSupportedOperation,
    /// Reference bookkeeping rejected the operation.
    #[error(transparent)]
    Ref(#[from] RefError),
}

/// A four-level x86-64 address space rooted at one PML4 frame.
///
/// All table accesses go through the [`PhysMapper`], so the same code edits
/// the live kernel tables (through the direct map) and synthetic tables in
/// host tests. The struct does not own the frames it points at; teardown is
/// explicit via [`AddressSpace::release`].
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create an empty address space with a freshly allocated, zeroed root.
    ///
    /// # Errors
    ///
    /// [`VmemError::OutOfMemory`] when no frame is available for the root.
    pub fn new(alloc: &mut impl FrameAlloc, mapper: &'m M) -> Result<Self, VmemError> {
        let root = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        let space = Self { root, mapper };
        space.zero_table(root);
        Ok(space)
    }

    /// Adopt an existing root table, e.g. the one built during early boot.
    pub const fn from_root(root: PhysAddr, mapper: &'m M) -> Self {
        Self { root, mapper }
    }

    /// The address space currently loaded in CR3.
    #[must_use]
    pub fn from_current(mapper: &'m M) -> Self {
        Self {
            root: arch::read_cr3(),
            mapper,
        }
    }

    /// Physical address of the root table.
    #[must_use]
    pub const fn root_page(&self) -> PhysAddr {
        self.root
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    ///
    /// See [`arch::write_cr3`]; the kernel half must map the running kernel.
    pub unsafe fn activate(&self) {
        // Safety: forwarded to the caller.
        unsafe { arch::write_cr3(self.root) };
    }

    /// Map `virt` to `phys` as one page of `size`.
    ///
    /// Intermediate tables are created on demand. `flags` supplies the
    /// permission bits; `present`, the frame address and the PS bit are set
    /// here. Both addresses must be aligned to `size`.
    ///
    /// # Errors
    ///
    /// [`VmemError::AlreadyMapped`] when a mapping (or a huge page covering
    /// the range) exists, [`VmemError::OutOfMemory`] when a table frame
    /// cannot be allocated.
    pub fn map_one(
        &mut self,
        alloc: &mut impl FrameAlloc,
        virt: VirtAddr,
        phys: PhysAddr,
        size: PageSize,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        debug_assert!(virt.as_u64() % size.bytes() == 0);
        debug_assert!(phys.is_aligned(size.bytes()));

        let leaf = flags
            .with_present(true)
            .with_page_size(!matches!(size, PageSize::Size4K))
            .with_address(phys);

        let l3 = self.ensure_table(alloc, self.root, virt.pml4_index())?;
        if matches!(size, PageSize::Size1G) {
            return self.set_leaf(l3, virt.pdpt_index(), leaf);
        }
        let l2 = self.ensure_table(alloc, l3, virt.pdpt_index())?;
        if matches!(size, PageSize::Size2M) {
            return self.set_leaf(l2, virt.pd_index(), leaf);
        }
        let l1 = self.ensure_table(alloc, l2, virt.pd_index())?;
        self.set_leaf(l1, virt.pt_index(), leaf)
    }

    /// Remove the 4 KiB mapping at `virt`.
    ///
    /// The frame is pushed onto `reaper` only when this address space held
    /// the last reference; shared frames merely lose one reference.
    /// Intermediate tables stay in place. Returns the unmapped frame.
    ///
    /// # Errors
    ///
    /// [`VmemError::NotMapped`] when nothing is mapped at `virt`,
    /// [`VmemError::NotSupportedOperation`] when `virt` lies inside a huge
    /// page.
    pub fn unmap_one(
        &mut self,
        virt: VirtAddr,
        refs: &impl FrameRefs,
        reaper: &mut FrameReaper<'_, M>,
    ) -> Result<PhysAddr, VmemError> {
        let l1 = self.walk_to_pt(virt)?;
        let entry = self.table(l1).entry(virt.pt_index());
        if !entry.present() {
            return Err(VmemError::NotMapped);
        }
        let frame = entry.address();
        self.table_mut(l1).set_entry(virt.pt_index(), PageEntryBits::new());
        arch::flush_page(virt);
        if refs.remove_ref(frame).is_none() {
            reaper.push(frame);
        }
        Ok(frame)
    }

    /// Translate `virt`, handling 4 KiB, 2 MiB and 1 GiB leaves.
    ///
    /// Returns the physical address of the exact byte plus the leaf entry.
    #[must_use]
    pub fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, PageEntryBits)> {
        let l4e = self.table(self.root).entry(virt.pml4_index());
        if !l4e.present() {
            return None;
        }
        let l3e = self.table(l4e.address()).entry(virt.pdpt_index());
        if !l3e.present() {
            return None;
        }
        if l3e.page_size() {
            let offset = virt.as_u64() & (PageSize::Size1G.bytes() - 1);
            return Some((l3e.address().add(offset), l3e));
        }
        let l2e = self.table(l3e.address()).entry(virt.pd_index());
        if !l2e.present() {
            return None;
        }
        if l2e.page_size() {
            let offset = virt.as_u64() & (PageSize::Size2M.bytes() - 1);
            return Some((l2e.address().add(offset), l2e));
        }
        let l1e = self.table(l2e.address()).entry(virt.pt_index());
        if !l1e.present() {
            return None;
        }
        Some((l1e.address().add(virt.page_offset()), l1e))
    }

    /// Clone this address space for a forked task.
    ///
    /// The kernel half of the root (slots 256..512) is aliased into the
    /// child so both spaces see the same kernel tables. User-half tables are
    /// duplicated. User leaf pages marked [`PageEntryBits::shared`] keep
    /// their permissions and gain a [`RefKind::Shared`] reference; all other
    /// leaves are downgraded to read-only copy-on-write in parent and child
    /// and gain a [`RefKind::Cow`] reference.
    ///
    /// The parent's TLB holds stale writable entries afterwards; the caller
    /// must reload CR3 before the parent runs again.
    ///
    /// # Errors
    ///
    /// [`VmemError::NotSupportedOperation`] when the user half contains a
    /// huge page, [`VmemError::OutOfMemory`] when table frames run out, and
    /// any [`RefError`] from the bookkeeping. On error the partially built
    /// child is torn down again: its table frames go back to `alloc`, the
    /// references taken so far are dropped, and parent pages downgraded by
    /// this call get their write permission back.
    pub fn copy_for_fork(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
    ) -> Result<Self, VmemError> {
        let child_root = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        self.zero_table(child_root);

        for index in KERNEL_HALF_START..TABLE_ENTRY_COUNT {
            let entry = self.table(self.root).entry(index);
            self.table_mut(child_root).set_entry(index, entry);
        }

        for index in 0..KERNEL_HALF_START {
            let entry = self.table(self.root).entry(index);
            if !entry.present() {
                continue;
            }
            match self.clone_subtree(alloc, refs, 3, entry.address()) {
                Ok(child_table) => {
                    self.table_mut(child_root)
                        .set_entry(index, entry.with_address(child_table));
                }
                Err(err) => {
                    self.unwind_fork(alloc, refs, child_root, index);
                    return Err(err);
                }
            }
        }

        log::trace!("forked address space {} into {child_root}", self.root);
        Ok(Self {
            root: child_root,
            mapper: self.mapper,
        })
    }

    /// Resolve a write fault on a copy-on-write page at `virt`.
    ///
    /// The last owner gets the frame back writable in place; otherwise the
    /// frame is copied into a fresh one and this space drops its reference.
    /// Returns the frame now privately mapped at `virt`.
    ///
    /// # Errors
    ///
    /// [`VmemError::NotMapped`] when `virt` has no 4 KiB mapping,
    /// [`VmemError::NotSupportedOperation`] when the page is not marked
    /// copy-on-write (a genuine protection violation) or is directly shared,
    /// [`VmemError::OutOfMemory`] when no frame is available for the copy.
    #[allow(clippy::cast_possible_truncation)]
    pub fn resolve_cow_fault(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
        virt: VirtAddr,
    ) -> Result<PhysAddr, VmemError> {
        let l1 = self.walk_to_pt(virt)?;
        let entry = self.table(l1).entry(virt.pt_index());
        if !entry.present() {
            return Err(VmemError::NotMapped);
        }
        if !entry.cow() {
            return Err(VmemError::NotSupportedOperation);
        }
        let frame = entry.address();

        match refs.refcount(frame) {
            RefCount::One => {
                // Every other sharer has already copied away; reclaim in place.
                self.table_mut(l1).set_entry(
                    virt.pt_index(),
                    entry.with_writable(true).with_cow(false),
                );
                arch::flush_page(virt);
                Ok(frame)
            }
            RefCount::Cow(_) => {
                let copy = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
                // Safety: `frame` is a live mapped frame, `copy` was just
                // allocated and is unaliased; both are PAGE_SIZE bytes.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.mapper.phys_to_mut::<u8>(frame),
                        self.mapper.phys_to_mut::<u8>(copy),
                        PAGE_SIZE as usize,
                    );
                }
                self.table_mut(l1).set_entry(
                    virt.pt_index(),
                    entry
                        .with_address(copy)
                        .with_writable(true)
                        .with_cow(false),
                );
                arch::flush_page(virt);
                if refs.remove_ref(frame).is_none() {
                    alloc.free_4k(frame);
                }
                Ok(copy)
            }
            RefCount::Shared(_) => Err(VmemError::NotSupportedOperation),
        }
    }

    /// Tear down the user half and the root, consuming the address space.
    ///
    /// Leaf frames are pushed onto `reaper` when this space held the last
    /// reference; table frames and the root always are. The kernel half is
    /// aliased, not owned, and is left untouched. The caller drains the
    /// reaper once no walk references the frames anymore.
    pub fn release(self, refs: &impl FrameRefs, reaper: &mut FrameReaper<'_, M>) {
        for index in 0..KERNEL_HALF_START {
            let entry = self.table(self.root).entry(index);
            if entry.present() {
                self.release_subtree(refs, reaper, 3, entry.address());
            }
        }
        reaper.push(self.root);
    }

    fn clone_subtree(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
        level: u8,
        src: PhysAddr,
    ) -> Result<PhysAddr, VmemError> {
        let dst = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        self.zero_table(dst);

        for index in 0..TABLE_ENTRY_COUNT {
            let entry = self.table(src).entry(index);
            if !entry.present() {
                continue;
            }
            if let Err(err) = self.clone_entry(alloc, refs, level, src, dst, index) {
                self.unwind_clone(alloc, refs, level, src, dst, index);
                return Err(err);
            }
        }
        Ok(dst)
    }

    fn clone_entry(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
        level: u8,
        src: PhysAddr,
        dst: PhysAddr,
        index: usize,
    ) -> Result<(), VmemError> {
        let entry = self.table(src).entry(index);
        if level > 1 {
            if entry.page_size() {
                return Err(VmemError::NotSupportedOperation);
            }
            let child = self.clone_subtree(alloc, refs, level - 1, entry.address())?;
            self.table_mut(dst).set_entry(index, entry.with_address(child));
        } else if entry.shared() {
            refs.add_ref(entry.address(), RefKind::Shared)?;
            self.table_mut(dst).set_entry(index, entry);
        } else {
            let downgraded = entry.with_writable(false).with_cow(true);
            refs.add_ref(entry.address(), RefKind::Cow)?;
            self.table_mut(src).set_entry(index, downgraded);
            self.table_mut(dst).set_entry(index, downgraded);
        }
        Ok(())
    }

    /// Undo the first `upto` cloned entries of `dst`, then free it.
    ///
    /// Inverse of [`clone_entry`](Self::clone_entry): every leaf reference
    /// taken during the clone is dropped again, and when that leaves the
    /// parent as the sole owner of a downgraded page, the parent entry gets
    /// its write permission back. The child tables were never installed in a
    /// live root, so they go straight back to `alloc`.
    fn unwind_clone(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
        level: u8,
        src: PhysAddr,
        dst: PhysAddr,
        upto: usize,
    ) {
        for index in 0..upto {
            let entry = self.table(dst).entry(index);
            if !entry.present() {
                continue;
            }
            if level > 1 {
                let src_child = self.table(src).entry(index).address();
                self.unwind_clone(
                    alloc,
                    refs,
                    level - 1,
                    src_child,
                    entry.address(),
                    TABLE_ENTRY_COUNT,
                );
            } else if matches!(refs.remove_ref(entry.address()), Some(RefCount::One))
                && entry.cow()
            {
                // Same reclaim as a copy-on-write fault by the last owner.
                self.table_mut(src)
                    .set_entry(index, entry.with_writable(true).with_cow(false));
            }
        }
        alloc.free_4k(dst);
    }

    /// Drop a partially built child root after a failed fork. Only the user
    /// slots below `upto` hold cloned subtrees; the kernel half is aliased,
    /// not owned.
    fn unwind_fork(
        &mut self,
        alloc: &mut impl FrameAlloc,
        refs: &impl FrameRefs,
        child_root: PhysAddr,
        upto: usize,
    ) {
        for index in 0..upto {
            let entry = self.table(child_root).entry(index);
            if !entry.present() {
                continue;
            }
            let src = self.table(self.root).entry(index).address();
            self.unwind_clone(alloc, refs, 3, src, entry.address(), TABLE_ENTRY_COUNT);
        }
        alloc.free_4k(child_root);
    }

    fn release_subtree(
        &self,
        refs: &impl FrameRefs,
        reaper: &mut FrameReaper<'_, M>,
        level: u8,
        table: PhysAddr,
    ) {
        for index in 0..TABLE_ENTRY_COUNT {
            let entry = self.table(table).entry(index);
            if !entry.present() {
                continue;
            }
            if level > 1 {
                debug_assert!(!entry.page_size());
                self.release_subtree(refs, reaper, level - 1, entry.address());
            } else if refs.remove_ref(entry.address()).is_none() {
                reaper.push(entry.address());
            }
        }
        reaper.push(table);
    }

    /// Walk to the level 1 table covering `virt`, without creating tables.
    fn walk_to_pt(&self, virt: VirtAddr) -> Result<PhysAddr, VmemError> {
        let mut table = self.root;
        for index in [virt.pml4_index(), virt.pdpt_index(), virt.pd_index()] {
            let entry = self.table(table).entry(index);
            if !entry.present() {
                return Err(VmemError::NotMapped);
            }
            if entry.page_size() {
                return Err(VmemError::NotSupportedOperation);
            }
            table = entry.address();
        }
        Ok(table)
    }

    fn ensure_table(
        &mut self,
        alloc: &mut impl FrameAlloc,
        table: PhysAddr,
        index: usize,
    ) -> Result<PhysAddr, VmemError> {
        let entry = self.table(table).entry(index);
        if entry.present() {
            if entry.page_size() {
                return Err(VmemError::AlreadyMapped);
            }
            return Ok(entry.address());
        }
        let frame = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        self.zero_table(frame);
        self.table_mut(table)
            .set_entry(index, PageEntryBits::intermediate(frame));
        Ok(frame)
    }

    fn set_leaf(
        &mut self,
        table: PhysAddr,
        index: usize,
        entry: PageEntryBits,
    ) -> Result<(), VmemError> {
        if self.table(table).entry(index).present() {
            return Err(VmemError::AlreadyMapped);
        }
        self.table_mut(table).set_entry(index, entry);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn zero_table(&self, frame: PhysAddr) {
        // Safety: the frame was just allocated for exclusive use as a table.
        unsafe {
            core::ptr::write_bytes(self.mapper.phys_to_mut::<u8>(frame), 0, PAGE_SIZE as usize);
        }
    }

    fn table(&self, phys: PhysAddr) -> &PageTable {
        // Safety: phys points at a live table frame per the walk invariants.
        unsafe { &*self.mapper.phys_to_mut::<PageTable>(phys) }
    }

    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, phys: PhysAddr) -> &mut PageTable {
        // Safety: single-core, lock-held access; no two live references to
        // the same table frame coexist within one operation.
        unsafe { &mut *self.mapper.phys_to_mut::<PageTable>(phys) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    /// Identity mapper: a "physical" address in these tests is a host pointer.
    struct TestPhys;

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<T>(&self, phys: PhysAddr) -> *mut T {
            phys.as_u64() as *mut T
        }
    }

    /// Hands out heap frames; remembers everything for leak assertions and
    /// can be rationed to provoke out-of-memory paths.
    #[derive(Default)]
    struct BumpAlloc {
        live: Vec<*mut Frame>,
        freed: Vec<PhysAddr>,
        budget: Option<usize>,
    }

    impl BumpAlloc {
        /// Net frames handed out and not yet returned.
        fn outstanding(&self) -> usize {
            self.live.len() - self.freed.len()
        }
    }

    impl Drop for BumpAlloc {
        fn drop(&mut self) {
            for &frame in &self.live {
                drop(unsafe { Box::from_raw(frame) });
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
            assert_eq!(count, 1, "table walks only take single frames");
            if let Some(budget) = &mut self.budget {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
            }
            let frame = Box::into_raw(Box::new(Frame([0xAA; 4096])));
            self.live.push(frame);
            Some(PhysAddr::new(frame as u64))
        }

        fn free_frames(&mut self, base: PhysAddr, count: usize) {
            assert_eq!(count, 1);
            self.freed.push(base);
        }
    }

    /// Hash map stand-in for the frame table.
    #[derive(Default)]
    struct TestRefs(RefCell<HashMap<u64, (RefKind, usize)>>);

    impl FrameRefs for TestRefs {
        fn add_ref(&self, frame: PhysAddr, kind: RefKind) -> Result<usize, RefError> {
            let mut map = self.0.borrow_mut();
            match map.get_mut(&frame.as_u64()) {
                None => {
                    map.insert(frame.as_u64(), (kind, 2));
                    Ok(2)
                }
                Some((existing, count)) if *existing == kind => {
                    *count += 1;
                    Ok(*count)
                }
                Some((RefKind::Cow, _)) => Err(RefError::CowToShared),
                Some((RefKind::Shared, _)) => Err(RefError::SharedToCow),
            }
        }

        fn remove_ref(&self, frame: PhysAddr) -> Option<RefCount> {
            let mut map = self.0.borrow_mut();
            match map.get_mut(&frame.as_u64()) {
                None => None,
                Some((kind, count)) => {
                    if *count == 2 {
                        map.remove(&frame.as_u64());
                        Some(RefCount::One)
                    } else {
                        *count -= 1;
                        Some(match kind {
                            RefKind::Cow => RefCount::Cow(*count),
                            RefKind::Shared => RefCount::Shared(*count),
                        })
                    }
                }
            }
        }

        fn refcount(&self, frame: PhysAddr) -> RefCount {
            match self.0.borrow().get(&frame.as_u64()) {
                None => RefCount::One,
                Some((RefKind::Cow, count)) => RefCount::Cow(*count),
                Some((RefKind::Shared, count)) => RefCount::Shared(*count),
            }
        }
    }

    fn rw_flags() -> PageEntryBits {
        PageEntryBits::new().with_writable(true).with_user_accessible(true)
    }

    fn user_page(l4: usize) -> VirtAddr {
        VirtAddr::from_table_indices(l4, 1, 2, 3)
    }

    #[test]
    fn map_then_query() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        let virt = user_page(5);
        space
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags())
            .unwrap();

        let (resolved, entry) = space.query(virt.add(0x123)).unwrap();
        assert_eq!(resolved, frame.add(0x123));
        assert!(entry.writable());
        assert!(space.query(user_page(6)).is_none());
    }

    #[test]
    fn map_rejects_double_mapping() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        let virt = user_page(0);
        space
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags())
            .unwrap();
        assert_eq!(
            space.map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags()),
            Err(VmemError::AlreadyMapped)
        );
    }

    #[test]
    fn query_resolves_huge_page_offsets() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        // 2 MiB leaf; the backing "frame" address only has to be aligned.
        let big = PhysAddr::new(0x4000_0000);
        let virt = VirtAddr::from_table_indices(260, 2, 4, 0);
        space
            .map_one(&mut alloc, virt, big, PageSize::Size2M, rw_flags())
            .unwrap();

        let probe = virt.add(0x1_2345);
        let (resolved, entry) = space.query(probe).unwrap();
        assert_eq!(resolved, big.add(0x1_2345));
        assert!(entry.page_size());
    }

    #[test]
    fn unmap_reaps_exclusive_frame() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut reaper = FrameReaper::new(&phys);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        let virt = user_page(1);
        space
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags())
            .unwrap();

        let unmapped = space.unmap_one(virt, &refs, &mut reaper).unwrap();
        assert_eq!(unmapped, frame);
        assert_eq!(reaper.len(), 1);
        assert!(reaper.contains(frame));
        assert!(space.query(virt).is_none());
        assert_eq!(
            space.unmap_one(virt, &refs, &mut reaper),
            Err(VmemError::NotMapped)
        );

        assert_eq!(reaper.reap(&mut alloc), 1);
        assert_eq!(alloc.freed, vec![frame]);
    }

    #[test]
    fn fork_downgrades_leaves_and_aliases_kernel_half() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        // One writable user page and one kernel-half page.
        let user_frame = alloc.alloc_4k().unwrap();
        let uvirt = user_page(7);
        parent
            .map_one(&mut alloc, uvirt, user_frame, PageSize::Size4K, rw_flags())
            .unwrap();
        let kernel_frame = alloc.alloc_4k().unwrap();
        let kvirt = VirtAddr::from_table_indices(300, 0, 0, 0);
        parent
            .map_one(&mut alloc, kvirt, kernel_frame, PageSize::Size4K, rw_flags())
            .unwrap();

        let child = parent.copy_for_fork(&mut alloc, &refs).unwrap();

        // Both sides now read-only copy-on-write with two references.
        for space in [&parent, &child] {
            let (resolved, entry) = space.query(uvirt).unwrap();
            assert_eq!(resolved, user_frame);
            assert!(!entry.writable());
            assert!(entry.cow());
        }
        assert_eq!(refs.refcount(user_frame), RefCount::Cow(2));

        // Kernel half is aliased: identical L4 entry, same tables below.
        let (kchild, kentry) = child.query(kvirt).unwrap();
        assert_eq!(kchild, kernel_frame);
        assert!(kentry.writable());
        let proot = phys_table(&phys, parent.root_page());
        let croot = phys_table(&phys, child.root_page());
        assert_eq!(proot.entry(300), croot.entry(300));
    }

    #[test]
    fn fork_keeps_shared_pages_writable() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        let virt = user_page(2);
        let flags = rw_flags().with_shared(true);
        parent
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, flags)
            .unwrap();

        let child = parent.copy_for_fork(&mut alloc, &refs).unwrap();

        for space in [&parent, &child] {
            let (_, entry) = space.query(virt).unwrap();
            assert!(entry.writable());
            assert!(entry.shared());
            assert!(!entry.cow());
        }
        assert_eq!(refs.refcount(frame), RefCount::Shared(2));
    }

    #[test]
    fn fork_rejects_huge_user_pages() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        parent
            .map_one(
                &mut alloc,
                VirtAddr::from_table_indices(3, 0, 1, 0),
                PhysAddr::new(0x20_0000),
                PageSize::Size2M,
                rw_flags(),
            )
            .unwrap();

        let before = alloc.outstanding();
        assert_eq!(
            parent.copy_for_fork(&mut alloc, &refs).err(),
            Some(VmemError::NotSupportedOperation)
        );
        // Every table frame taken for the attempt came back.
        assert_eq!(alloc.outstanding(), before);
    }

    #[test]
    fn failed_fork_restores_the_parent() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        // A plain writable page in a low slot, then a huge page in a higher
        // one: the fork downgrades the first before it trips over the second.
        let frame = alloc.alloc_4k().unwrap();
        parent
            .map_one(&mut alloc, user_page(1), frame, PageSize::Size4K, rw_flags())
            .unwrap();
        parent
            .map_one(
                &mut alloc,
                VirtAddr::from_table_indices(3, 0, 1, 0),
                PhysAddr::new(0x20_0000),
                PageSize::Size2M,
                rw_flags(),
            )
            .unwrap();

        let before = alloc.outstanding();
        assert_eq!(
            parent.copy_for_fork(&mut alloc, &refs).err(),
            Some(VmemError::NotSupportedOperation)
        );

        // The downgraded page is writable again with no lingering reference.
        let (resolved, entry) = parent.query(user_page(1)).unwrap();
        assert_eq!(resolved, frame);
        assert!(entry.writable());
        assert!(!entry.cow());
        assert_eq!(refs.refcount(frame), RefCount::One);
        assert_eq!(alloc.outstanding(), before);
    }

    #[test]
    fn fork_out_of_frames_fails_cleanly() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        let a = alloc.alloc_4k().unwrap();
        parent
            .map_one(&mut alloc, user_page(1), a, PageSize::Size4K, rw_flags())
            .unwrap();
        let b = alloc.alloc_4k().unwrap();
        parent
            .map_one(&mut alloc, user_page(2), b, PageSize::Size4K, rw_flags())
            .unwrap();

        // Enough for the child root and the first subtree, then nothing:
        // the fork runs dry halfway through and must back out fully.
        let before = alloc.outstanding();
        alloc.budget = Some(4);
        assert_eq!(
            parent.copy_for_fork(&mut alloc, &refs).err(),
            Some(VmemError::OutOfMemory)
        );

        for (virt, frame) in [(user_page(1), a), (user_page(2), b)] {
            let (resolved, entry) = parent.query(virt).unwrap();
            assert_eq!(resolved, frame);
            assert!(entry.writable());
            assert!(!entry.cow());
            assert_eq!(refs.refcount(frame), RefCount::One);
        }
        assert_eq!(alloc.outstanding(), before);
    }

    #[test]
    fn cow_fault_copies_then_last_owner_reclaims_in_place() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        // Stamp the frame so the copy is observable.
        unsafe { *phys.phys_to_mut::<u8>(frame.add(42)) = 0x5A };
        let virt = user_page(4);
        parent
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags())
            .unwrap();
        let mut child = parent.copy_for_fork(&mut alloc, &refs).unwrap();

        // Child writes first: gets a private copy with the same contents.
        let copy = child.resolve_cow_fault(&mut alloc, &refs, virt).unwrap();
        assert_ne!(copy, frame);
        assert_eq!(unsafe { *phys.phys_to_mut::<u8>(copy.add(42)) }, 0x5A);
        let (_, entry) = child.query(virt).unwrap();
        assert!(entry.writable());
        assert!(!entry.cow());

        // Parent is now the last owner: reclaims the original in place.
        assert_eq!(refs.refcount(frame), RefCount::One);
        let reclaimed = parent.resolve_cow_fault(&mut alloc, &refs, virt).unwrap();
        assert_eq!(reclaimed, frame);
        let (_, entry) = parent.query(virt).unwrap();
        assert!(entry.writable());
        assert!(!entry.cow());
    }

    #[test]
    fn cow_fault_rejects_plain_and_shared_pages() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let frame = alloc.alloc_4k().unwrap();
        let virt = user_page(8);
        space
            .map_one(&mut alloc, virt, frame, PageSize::Size4K, rw_flags())
            .unwrap();

        // Writable non-COW page: a write fault here is a real violation.
        assert_eq!(
            space.resolve_cow_fault(&mut alloc, &refs, virt),
            Err(VmemError::NotSupportedOperation)
        );
        assert_eq!(
            space.resolve_cow_fault(&mut alloc, &refs, user_page(9)),
            Err(VmemError::NotMapped)
        );
    }

    #[test]
    fn release_reaps_user_half_only() {
        let phys = TestPhys;
        let mut alloc = BumpAlloc::default();
        let refs = TestRefs::default();
        let mut reaper = FrameReaper::new(&phys);
        let mut parent = AddressSpace::new(&mut alloc, &phys).unwrap();

        let user_frame = alloc.alloc_4k().unwrap();
        let uvirt = user_page(0);
        parent
            .map_one(&mut alloc, uvirt, user_frame, PageSize::Size4K, rw_flags())
            .unwrap();
        let kernel_frame = alloc.alloc_4k().unwrap();
        parent
            .map_one(
                &mut alloc,
                VirtAddr::from_table_indices(300, 0, 0, 0),
                kernel_frame,
                PageSize::Size4K,
                rw_flags(),
            )
            .unwrap();

        let child = parent.copy_for_fork(&mut alloc, &refs).unwrap();
        let child_root = child.root_page();
        child.release(&refs, &mut reaper);

        // The COW leaf survives in the parent, so it is not reaped; the
        // child's three user tables and its root are.
        assert!(!reaper.contains(user_frame));
        assert!(!reaper.contains(kernel_frame));
        assert!(reaper.contains(child_root));
        assert_eq!(reaper.len(), 4);
        assert_eq!(refs.refcount(user_frame), RefCount::One);

        // Releasing the parent now reaps the leaf too.
        parent.release(&refs, &mut reaper);
        assert!(reaper.contains(user_frame));
    }

    fn phys_table(phys: &TestPhys, addr: PhysAddr) -> &PageTable {
        unsafe { &*phys.phys_to_mut::<PageTable>(addr) }
    }
}
