//! # Memory Layout

/// Size of one physical page frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`, for shifting between byte addresses and frame numbers.
pub const PAGE_SHIFT: u32 = 12;

/// Maximum number of firmware memory map records the kernel will ingest.
pub const MAX_MEMORY_RANGES: usize = 64;

/// Physical memory below this address is reserved for the kernel image and
/// boot-stage structures; the frame allocator never hands it out.
pub const FREE_PAGE_BEGIN: u64 = 0x20_0000; // 2 MiB

/// End of userspace VA range after which kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// Higher Half Direct Map (HHDM) base. The kernel reaches physical address
/// `pa` at virtual address [`HHDM_BASE`] `+ pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Base of the window that `vmalloc` maps page-by-page. Virtually
/// contiguous allocations live here, each followed by an unmapped guard
/// page.
pub const VMALLOC_BASE: u64 = 0xffff_e000_0000_0000;

/// Where the kernel executes (VMA), matching the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

const _: () = {
    assert!(FREE_PAGE_BEGIN.is_multiple_of(PAGE_SIZE));
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(VMALLOC_BASE > HHDM_BASE);
    assert!(KERNEL_BASE > VMALLOC_BASE);
};
