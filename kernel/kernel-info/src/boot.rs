//! # Boot Handoff
//!
//! The boot stage collects the firmware memory map and descriptor-table
//! metadata while it still can, then hands the kernel a single
//! [`SystemInfo`] record and never returns. Everything here is `#[repr(C)]`
//! with fixed-size integers because it crosses the loader/kernel ABI
//! boundary.

/// Kernel entry function pointer, as the boot stage calls it.
pub type KernelEntryFn = extern "C" fn(*const SystemInfo) -> !;

/// Information the kernel needs right after the boot stage is done.
///
/// Consumed exactly once by `kernel_mm::init_memory_manager`; the pointers
/// reference boot-stage memory and must be read before that memory is
/// recycled.
#[repr(C)]
#[derive(Clone)]
pub struct SystemInfo {
    /// Physical address of the first [`RawMemoryRange`] record.
    pub memory_map_ptr: u64,

    /// Number of valid records at `memory_map_ptr`.
    pub memory_map_len: u64,

    /// Physical address of the boot-stage descriptor-table metadata
    /// (GDT/IDT pointers). Opaque to the memory core.
    pub descriptor_tables_ptr: u64,
}

/// One firmware-reported physical memory range, in the exact on-wire layout.
///
/// Fixed-size packed records: 8-byte base, 8-byte length, 4-byte type,
/// 4-byte extended attributes (ACPI 3.0). The type values follow the E820
/// convention; see `kernel_memmap::RegionKind` for the decoded form.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RawMemoryRange {
    /// Physical base address of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub size: u64,
    /// E820 region type (1 = usable, 2 = reserved, ...).
    pub kind: u32,
    /// ACPI 3.0 extended attributes; bit 0 means "entry is valid".
    pub extended_attributes: u32,
}

const _: () = {
    assert!(size_of::<RawMemoryRange>() == 24);
};
