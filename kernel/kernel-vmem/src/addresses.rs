//! Typed physical and virtual addresses.
//!
//! Newtypes over `u64` so that a physical frame address can never be handed
//! to something expecting a virtual one. Virtual addresses carry the
//! four-level table index extractors used by the walkers.

use core::fmt;

/// A physical memory address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Offset by `bytes`, wrapping on overflow only in release builds.
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A canonical virtual memory address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Index into the level 4 table (PML4), bits 39..48.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1FF) as usize
    }

    /// Index into the level 3 table (PDPT), bits 30..39.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1FF) as usize
    }

    /// Index into the level 2 table (PD), bits 21..30.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1FF) as usize
    }

    /// Index into the level 1 table (PT), bits 12..21.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1FF) as usize
    }

    /// Byte offset within a 4 KiB page.
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & 0xFFF
    }

    /// Rebuild a canonical address from its four table indices.
    ///
    /// Bit 47 is sign-extended through bits 48..64 as the hardware requires.
    #[must_use]
    pub const fn from_table_indices(l4: usize, l3: usize, l2: usize, l1: usize) -> Self {
        let raw = ((l4 as u64 & 0x1FF) << 39)
            | ((l3 as u64 & 0x1FF) << 30)
            | ((l2 as u64 & 0x1FF) << 21)
            | ((l1 as u64 & 0x1FF) << 12);
        if raw & (1 << 47) == 0 {
            Self(raw)
        } else {
            Self(raw | 0xFFFF_0000_0000_0000)
        }
    }

    /// Whether this address belongs to the kernel half of the address space
    /// (PML4 indices 256..512).
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.pml4_index() >= 256
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_index_extraction() {
        // 0xffff_8880_0000_0000: PML4 273, all lower indices zero.
        let v = VirtAddr::new(0xFFFF_8880_0000_0000);
        assert_eq!(v.pml4_index(), 273);
        assert_eq!(v.pdpt_index(), 0);
        assert_eq!(v.pd_index(), 0);
        assert_eq!(v.pt_index(), 0);
        assert!(v.is_kernel_half());

        let v = VirtAddr::new(0x0000_7F3A_5B4C_6DEF);
        assert_eq!(v.page_offset(), 0xDEF);
        assert!(!v.is_kernel_half());
        let rebuilt =
            VirtAddr::from_table_indices(v.pml4_index(), v.pdpt_index(), v.pd_index(), v.pt_index());
        assert_eq!(rebuilt.as_u64(), v.as_u64() & !0xFFF);
    }

    #[test]
    fn from_indices_sign_extends() {
        let v = VirtAddr::from_table_indices(256, 0, 0, 0);
        assert_eq!(v.as_u64(), 0xFFFF_8000_0000_0000);
        let v = VirtAddr::from_table_indices(511, 511, 511, 511);
        assert_eq!(v.as_u64(), 0xFFFF_FFFF_FFFF_F000);
    }
}
