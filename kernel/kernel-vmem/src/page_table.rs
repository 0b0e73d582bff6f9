//! A 4 KiB page table of 512 entries, shared by all four levels.

use crate::PageEntryBits;

/// Entries per table; fixed by the hardware.
pub const TABLE_ENTRY_COUNT: usize = 512;

/// One page table. Lives in exactly one physical frame.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; TABLE_ENTRY_COUNT],
}

impl PageTable {
    /// A table with every entry non-present.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); TABLE_ENTRY_COUNT],
        }
    }

    /// The entry at `index`. Indices come from the masked extractors on
    /// [`crate::VirtAddr`] and are always in range.
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    pub const fn set_entry(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    pub fn iter(&self) -> impl Iterator<Item = PageEntryBits> + '_ {
        self.entries.iter().copied()
    }

    /// Reset every entry to non-present.
    pub fn clear(&mut self) {
        self.entries = [PageEntryBits::new(); TABLE_ENTRY_COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_exactly_one_frame() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
