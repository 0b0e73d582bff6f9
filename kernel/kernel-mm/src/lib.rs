//! # Memory Management
//!
//! The kernel's memory core behind one lock: physical frames, the kernel
//! heap and the kernel page tables.
//!
//! [`init_memory_manager`] consumes the boot-stage [`SystemInfo`], builds
//! the [`MemoryManager`] and parks it in a global spin lock. From then on
//! the free functions in this crate ([`kmalloc`], [`vmalloc`],
//! [`page_alloc`], [`copy_pml4_table`], ...) are the kernel-wide interface,
//! and the registered `#[global_allocator]` routes `alloc` through the same
//! manager so collection types work everywhere in the kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod hhdm;
mod manager;
mod page_fault;

pub use hhdm::HhdmMapper;
pub use manager::{MemoryKind, MemoryManager, MmError};
pub use page_fault::PageFaultCode;

use core::ptr::NonNull;
use kernel_debugcon::DebugconLogger;
use kernel_info::boot::{RawMemoryRange, SystemInfo};
use kernel_info::memory::HHDM_BASE;
use kernel_memmap::MemoryMap;
use kernel_sync::SpinLock;
use kernel_vmem::{arch, PhysAddr, VirtAddr};

static HHDM: HhdmMapper = HhdmMapper;

/// The one memory manager of the kernel. `None` until
/// [`init_memory_manager`] runs.
static MEMORY_MANAGER: SpinLock<Option<MemoryManager<'static, HhdmMapper>>> =
    SpinLock::new(None);

/// Bring up the memory manager from the boot handoff.
///
/// Installs the debug console logger (unless one is already registered),
/// decodes the firmware memory map and hands every usable frame to the
/// allocator. Call exactly once, with the boot-stage direct map active.
///
/// # Errors
///
/// Propagates [`MmError`] when the frame table cannot be built.
///
/// # Safety
///
/// `info` must be the record handed over by the boot stage, with its memory
/// map still intact at the physical address it names.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn init_memory_manager(info: &SystemInfo) -> Result<(), MmError> {
    // A second logger registration just means someone beat us to it.
    let _ = DebugconLogger::new(log::LevelFilter::Trace).init();

    // Safety: the boot stage wrote `memory_map_len` packed records there and
    // the direct map makes them readable.
    let raw = unsafe {
        core::slice::from_raw_parts(
            (HHDM_BASE + info.memory_map_ptr) as *const RawMemoryRange,
            info.memory_map_len as usize,
        )
    };
    let mut map = MemoryMap::from_raw(raw);
    map.tidy_up();
    log::info!(
        "firmware memory map: {} ranges after cleanup",
        map.entries().len()
    );

    let mut mm = MemoryManager::new(&HHDM);
    mm.init(&map)?;
    *MEMORY_MANAGER.lock_critical() = Some(mm);
    Ok(())
}

/// Run `f` against the global manager under its lock.
///
/// # Errors
///
/// [`MmError::NotInitialized`] before [`init_memory_manager`].
pub fn with_memory_manager<R>(
    f: impl FnOnce(&mut MemoryManager<'static, HhdmMapper>) -> Result<R, MmError>,
) -> Result<R, MmError> {
    let mut guard = MEMORY_MANAGER.lock_critical();
    let mm = guard.as_mut().ok_or(MmError::NotInitialized)?;
    f(mm)
}

/// Allocate `count` physically contiguous frames.
///
/// # Errors
///
/// See [`MemoryManager::page_alloc`].
pub fn page_alloc(count: usize) -> Result<PhysAddr, MmError> {
    with_memory_manager(|mm| mm.page_alloc(count))
}

/// Return frames from [`page_alloc`].
pub fn page_free(base: PhysAddr, count: usize) {
    let _ = with_memory_manager(|mm| {
        mm.page_free(base, count);
        Ok(())
    });
}

/// Allocate kernel heap memory. See [`MemoryManager::kmalloc`].
///
/// # Errors
///
/// [`MmError::OutOfMemory`] when the heap cannot grow.
pub fn kmalloc(size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
    with_memory_manager(|mm| mm.kmalloc(size, kind))
}

/// Allocate zeroed kernel heap memory. See [`MemoryManager::kcalloc`].
///
/// # Errors
///
/// [`MmError::OutOfMemory`] on overflow or exhaustion.
pub fn kcalloc(count: usize, size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
    with_memory_manager(|mm| mm.kcalloc(count, size, kind))
}

/// Resize a [`kmalloc`] allocation. See [`MemoryManager::krealloc`].
///
/// # Errors
///
/// See [`MemoryManager::krealloc`].
///
/// # Safety
///
/// `ptr` must come from [`kmalloc`] and must not be used after success.
pub unsafe fn krealloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MmError> {
    // Safety: forwarded to the caller.
    with_memory_manager(|mm| unsafe { mm.krealloc(ptr, new_size) })
}

/// Return a [`kmalloc`] allocation.
///
/// # Errors
///
/// See [`MemoryManager::kfree`].
///
/// # Safety
///
/// `ptr` must come from [`kmalloc`] and must not be used afterwards.
pub unsafe fn kfree(ptr: NonNull<u8>) -> Result<(), MmError> {
    // Safety: forwarded to the caller.
    with_memory_manager(|mm| unsafe { mm.kfree(ptr) })
}

/// Allocate virtually contiguous memory. See [`MemoryManager::vmalloc`].
///
/// # Errors
///
/// See [`MemoryManager::vmalloc`].
pub fn vmalloc(size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
    with_memory_manager(|mm| mm.vmalloc(size, kind))
}

/// Allocate zeroed virtually contiguous memory.
///
/// # Errors
///
/// See [`MemoryManager::vcalloc`].
pub fn vcalloc(count: usize, size: usize, kind: MemoryKind) -> Result<NonNull<u8>, MmError> {
    with_memory_manager(|mm| mm.vcalloc(count, size, kind))
}

/// Resize a [`vmalloc`] allocation. See [`MemoryManager::vrealloc`].
///
/// # Errors
///
/// See [`MemoryManager::vrealloc`].
///
/// # Safety
///
/// `ptr` must come from [`vmalloc`] and must not be used after success.
pub unsafe fn vrealloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MmError> {
    // Safety: forwarded to the caller.
    with_memory_manager(|mm| unsafe { mm.vrealloc(ptr, new_size) })
}

/// Return a [`vmalloc`] allocation.
///
/// # Errors
///
/// See [`MemoryManager::vfree`].
///
/// # Safety
///
/// `ptr` must come from [`vmalloc`] and must not be used afterwards.
pub unsafe fn vfree(ptr: NonNull<u8>) -> Result<usize, MmError> {
    // Safety: forwarded to the caller.
    with_memory_manager(|mm| unsafe { mm.vfree(ptr) })
}

/// Build the kernel page tables. See [`MemoryManager::setup_paging`].
///
/// # Errors
///
/// See [`MemoryManager::setup_paging`].
pub fn setup_paging(bootstrap_root: PhysAddr, max_phys: u64) -> Result<PhysAddr, MmError> {
    with_memory_manager(|mm| mm.setup_paging(bootstrap_root, max_phys))
}

/// Fork the address space rooted at `root`.
/// See [`MemoryManager::copy_pml4_table`].
///
/// # Errors
///
/// See [`MemoryManager::copy_pml4_table`].
pub fn copy_pml4_table(root: PhysAddr) -> Result<PhysAddr, MmError> {
    with_memory_manager(|mm| mm.copy_pml4_table(root))
}

/// Tear down the address space rooted at `root` and return the number of
/// frames recovered. See [`MemoryManager::release_pml4_table`].
///
/// # Errors
///
/// [`MmError::NotInitialized`] before [`init_memory_manager`].
pub fn release_pml4_table(root: PhysAddr) -> Result<usize, MmError> {
    with_memory_manager(|mm| Ok(mm.release_pml4_table(root)))
}

/// Resolve a page fault. See [`MemoryManager::handle_page_fault`].
///
/// # Errors
///
/// See [`MemoryManager::handle_page_fault`].
pub fn handle_page_fault(
    root: PhysAddr,
    addr: VirtAddr,
    code: PageFaultCode,
) -> Result<PhysAddr, MmError> {
    with_memory_manager(|mm| mm.handle_page_fault(root, addr, code))
}

/// The root table currently loaded in CR3.
#[must_use]
pub fn current_table() -> PhysAddr {
    arch::read_cr3()
}

/// Load the root table at `root` into CR3.
///
/// # Safety
///
/// `root` must be a valid PML4 that maps the currently executing code and
/// stack, and must stay alive while active.
pub unsafe fn switch_to_table(root: PhysAddr) {
    // Safety: forwarded to the caller.
    unsafe { arch::write_cr3(root) };
}

/// The faulting address of the most recent page fault, from CR2.
#[must_use]
pub fn fault_address() -> VirtAddr {
    arch::read_cr2()
}

#[cfg(not(any(test, doctest)))]
mod global_alloc {
    use super::MEMORY_MANAGER;
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::NonNull;

    /// Routes Rust's `alloc` machinery through the memory manager.
    struct KernelAllocator;

    // Safety: allocations are served by the slab/region allocators under the
    // global lock; pointers stay valid until deallocated with the same
    // layout.
    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let mut guard = MEMORY_MANAGER.lock_critical();
            guard
                .as_mut()
                .and_then(|mm| mm.alloc_raw(layout))
                .map_or(core::ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let Some(ptr) = NonNull::new(ptr) else {
                return;
            };
            let mut guard = MEMORY_MANAGER.lock_critical();
            if let Some(mm) = guard.as_mut() {
                // Safety: `ptr` came from `alloc` with this layout.
                unsafe { mm.free_raw(ptr, layout) };
            }
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}
