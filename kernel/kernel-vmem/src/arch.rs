//! Privileged paging instructions.
//!
//! On a hosted build (unit tests) these compile to no-ops so the table
//! walking code can run in an ordinary process; the walks themselves never
//! depend on the TLB being coherent.

use crate::{PhysAddr, VirtAddr};

/// Invalidate the TLB entry covering `virt` on this core.
#[inline]
pub fn flush_page(virt: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // Safety: invlpg has no memory or register side effects.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

/// The physical address of the active root page table (CR3).
#[inline]
#[must_use]
pub fn read_cr3() -> PhysAddr {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let value: u64;
        // Safety: reading CR3 has no side effects at CPL 0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new(value & 0x000F_FFFF_FFFF_F000)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    PhysAddr::new(0)
}

/// Load `root` into CR3, switching address spaces and flushing the
/// non-global TLB.
///
/// # Safety
///
/// `root` must point at a valid PML4 whose kernel half maps the currently
/// executing code, stack and data, or the next instruction fetch faults
/// unrecoverably.
#[inline]
pub unsafe fn write_cr3(root: PhysAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // Safety: contract forwarded to the caller.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = root;
}

/// The faulting address of the most recent page fault (CR2).
#[inline]
#[must_use]
pub fn read_cr2() -> VirtAddr {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let value: u64;
        // Safety: reading CR2 has no side effects at CPL 0.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        VirtAddr::new(value)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    VirtAddr::new(0)
}
