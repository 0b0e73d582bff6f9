//! The higher-half direct map view of physical memory.

use kernel_info::memory::HHDM_BASE;
use kernel_vmem::{PhysAddr, PhysMapper};

/// Reaches physical memory through the direct map at [`HHDM_BASE`].
///
/// Valid only once paging maps the window, which the boot stage guarantees
/// before the memory manager is initialized.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmMapper;

impl PhysMapper for HhdmMapper {
    unsafe fn phys_to_mut<T>(&self, phys: PhysAddr) -> *mut T {
        (HHDM_BASE + phys.as_u64()) as *mut T
    }
}
