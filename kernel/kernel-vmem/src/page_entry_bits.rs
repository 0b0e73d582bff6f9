//! The x86-64 page table entry, one layout for all four levels.

use crate::PhysAddr;
use bitfield_struct::bitfield;

/// One 64-bit page table entry.
///
/// The hardware-defined bits follow the Intel SDM. Two of the OS-available
/// bits carry kernel state: [`cow`](Self::cow) marks a leaf frame that must
/// be copied on the next write, [`shared`](Self::shared) marks a leaf frame
/// deliberately shared across forked address spaces.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageEntryBits {
    /// The entry references a frame or a lower-level table.
    pub present: bool,
    /// Writes are permitted through this entry.
    pub writable: bool,
    /// Accessible from CPL 3.
    pub user_accessible: bool,
    /// Write-through caching.
    pub write_through: bool,
    /// Caching disabled.
    pub cache_disable: bool,
    /// Set by the CPU on access.
    pub accessed: bool,
    /// Set by the CPU on write (leaf entries only).
    pub dirty: bool,
    /// Leaf at this level: 1 GiB page in a PDPT entry, 2 MiB in a PD entry.
    pub page_size: bool,
    /// Not flushed from the TLB on CR3 reload.
    pub global: bool,
    /// OS bit 9: frame is copy-on-write shared.
    pub cow: bool,
    /// OS bit 10: frame is intentionally shared across forks.
    pub shared: bool,
    #[bits(1)]
    __avl: u8,
    /// Physical frame number (address bits 12..52).
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    __avl2: u16,
    /// Instruction fetches through this entry fault (requires EFER.NXE).
    pub no_execute: bool,
}

impl PageEntryBits {
    /// The physical address this entry points at.
    #[must_use]
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }

    /// Replace the referenced physical address. `addr` must be 4 KiB aligned.
    #[must_use]
    pub const fn with_address(self, addr: PhysAddr) -> Self {
        self.with_frame(addr.as_u64() >> 12)
    }

    /// A present, writable, non-leaf entry pointing at `table`, as used for
    /// intermediate levels. `user_accessible` is set so that user mappings
    /// below are reachable; the leaf entry still gates actual access.
    #[must_use]
    pub const fn intermediate(table: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_accessible(true)
            .with_address(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_hardware() {
        let e = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_page_size(true)
            .with_cow(true)
            .with_shared(true)
            .with_no_execute(true)
            .with_address(PhysAddr::new(0x1234_5000));
        let raw: u64 = e.into();
        assert_eq!(raw & 0b1, 1);
        assert_eq!(raw & 0b10, 0b10);
        assert_eq!(raw & (1 << 7), 1 << 7);
        assert_eq!(raw & (1 << 9), 1 << 9);
        assert_eq!(raw & (1 << 10), 1 << 10);
        assert_eq!(raw & (1 << 63), 1 << 63);
        assert_eq!(raw & 0x000F_FFFF_FFFF_F000, 0x1234_5000);
        assert_eq!(e.address(), PhysAddr::new(0x1234_5000));
    }
}
