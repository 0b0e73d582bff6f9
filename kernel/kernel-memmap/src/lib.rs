//! # Firmware Memory Map
//!
//! Ingests the raw firmware memory ranges captured at boot
//! ([`kernel_info::boot::RawMemoryRange`]) into a fixed-capacity, sorted
//! [`MemoryMap`], and offers the handful of manipulations the frame allocator
//! relies on: lookup with a [`MatchMode`], entry split, merge of adjacent
//! same-kind entries, and [`MemoryMap::tidy_up`] which normalizes the map
//! into the canonical form trusted at allocator init time.
//!
//! The map is populated once during boot handoff and consulted read-mostly
//! afterwards; it is never freed. All operations are fallible rather than
//! panicking — at boot time the caller treats failure as fatal, there being
//! nothing to fall back to.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_info::boot::RawMemoryRange;
use kernel_info::memory::MAX_MEMORY_RANGES;

/// Decoded firmware region type (E820 numbering on the wire).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// RAM the kernel may allocate from.
    Usable,
    /// Firmware-reserved; never touched.
    Reserved,
    /// ACPI tables; reclaimable once parsed (treated as reserved here).
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Known-bad RAM.
    Bad,
    /// Unrecognized type value, preserved verbatim.
    Unknown(u32),
}

impl RegionKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Usable => 1,
            Self::Reserved => 2,
            Self::AcpiReclaimable => 3,
            Self::AcpiNvs => 4,
            Self::Bad => 5,
            Self::Unknown(other) => other,
        }
    }
}

/// How [`MemoryMap::find_entry`] compares an entry against the probe range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MatchMode {
    /// The entry fully contains the probe range.
    Contain,
    /// The entry lies fully within the probe range.
    Within,
    /// The entry and the probe range intersect at all.
    Overlap,
}

/// One normalized memory map entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes; never zero for a live entry.
    pub size: u64,
    /// Region type.
    pub kind: RegionKind,
    /// ACPI 3.0 extended attributes, carried through unmodified.
    pub extended_attributes: u32,
}

impl MemoryMapEntry {
    const EMPTY: Self = Self {
        base: 0,
        size: 0,
        kind: RegionKind::Reserved,
        extended_attributes: 0,
    };

    /// Exclusive end address of the entry.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    const fn matches(&self, base: u64, size: u64, mode: MatchMode) -> bool {
        let probe_end = base + size;
        match mode {
            MatchMode::Contain => self.base <= base && probe_end <= self.end(),
            MatchMode::Within => base <= self.base && self.end() <= probe_end,
            MatchMode::Overlap => self.base < probe_end && base < self.end(),
        }
    }
}

/// Errors from memory map manipulation.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    /// The fixed entry array is full.
    #[error("memory map capacity exhausted")]
    CapacityExhausted,
    /// The target entry does not exist or the operation does not apply to it.
    #[error("invalid memory map range")]
    InvalidRange,
}

/// The kernel's view of physical memory, sorted ascending by base address.
pub struct MemoryMap {
    entries: [MemoryMapEntry; MAX_MEMORY_RANGES],
    len: usize,
}

impl MemoryMap {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [MemoryMapEntry::EMPTY; MAX_MEMORY_RANGES],
            len: 0,
        }
    }

    /// Ingest the firmware records: discard zero-length, overflowing, and
    /// attribute-invalidated entries, then sort ascending by base.
    ///
    /// Records beyond [`MAX_MEMORY_RANGES`] are dropped with a warning; a
    /// firmware map that large means something else is wrong.
    #[must_use]
    pub fn from_raw(raw: &[RawMemoryRange]) -> Self {
        let mut map = Self::empty();
        for record in raw {
            let (base, size) = (record.base, record.size);
            if size == 0 || base.checked_add(size).is_none() {
                continue;
            }
            // ACPI 3.0: a present attribute dword with bit 0 clear marks the
            // record as to-be-ignored.
            let attrs = record.extended_attributes;
            if attrs != 0 && attrs & 1 == 0 {
                continue;
            }
            let entry = MemoryMapEntry {
                base,
                size,
                kind: RegionKind::from_raw(record.kind),
                extended_attributes: attrs,
            };
            if map.insert_sorted(entry).is_err() {
                log::warn!("memory map overflow; dropping range {base:#x}+{size:#x}");
            }
        }
        map
    }

    /// The live entries, ascending by base address.
    #[must_use]
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.len]
    }

    /// Find the first entry matching the probe range under `mode`, optionally
    /// restricted to one [`RegionKind`]. Returns the entry index.
    #[must_use]
    pub fn find_entry(
        &self,
        base: u64,
        size: u64,
        mode: MatchMode,
        kind: Option<RegionKind>,
    ) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| kind.is_none_or(|k| e.kind == k) && e.matches(base, size, mode))
    }

    /// Split entry `index` at byte offset `split_len`, producing a second
    /// entry of the same kind covering the tail. Total coverage is preserved.
    ///
    /// Returns the index of the new tail entry.
    ///
    /// # Errors
    /// [`MemoryMapError::InvalidRange`] if `index` is out of bounds or
    /// `split_len` does not fall strictly inside the entry;
    /// [`MemoryMapError::CapacityExhausted`] if the map is full.
    pub fn split_entry(&mut self, index: usize, split_len: u64) -> Result<usize, MemoryMapError> {
        if index >= self.len {
            return Err(MemoryMapError::InvalidRange);
        }
        let entry = self.entries[index];
        if split_len == 0 || split_len >= entry.size {
            return Err(MemoryMapError::InvalidRange);
        }
        if self.len == MAX_MEMORY_RANGES {
            return Err(MemoryMapError::CapacityExhausted);
        }

        let tail = MemoryMapEntry {
            base: entry.base + split_len,
            size: entry.size - split_len,
            ..entry
        };
        self.entries[index].size = split_len;
        // Shift the suffix up by one and place the tail right after its head.
        self.entries.copy_within(index + 1..self.len, index + 2);
        self.entries[index + 1] = tail;
        self.len += 1;
        Ok(index + 1)
    }

    /// Merge entry `index` with its successor when they are contiguous and of
    /// identical kind.
    ///
    /// # Errors
    /// [`MemoryMapError::InvalidRange`] if there is no successor or the pair
    /// is not mergeable.
    pub fn combine_next_entry(&mut self, index: usize) -> Result<(), MemoryMapError> {
        if index + 1 >= self.len {
            return Err(MemoryMapError::InvalidRange);
        }
        let (head, next) = (self.entries[index], self.entries[index + 1]);
        if head.kind != next.kind || head.end() != next.base {
            return Err(MemoryMapError::InvalidRange);
        }
        self.entries[index].size = head.size + next.size;
        self.remove(index + 1);
        Ok(())
    }

    /// Normalize the map: repeatedly merge adjacent same-kind entries that
    /// touch or overlap, until no further merge applies.
    ///
    /// Afterwards no two `Usable` entries overlap and every remaining
    /// boundary is a genuine change of region kind — the canonical form the
    /// frame allocator trusts at init.
    pub fn tidy_up(&mut self) {
        let mut i = 0;
        while i + 1 < self.len {
            let (head, next) = (self.entries[i], self.entries[i + 1]);
            if head.kind == next.kind && next.base <= head.end() {
                self.entries[i].size = next.end().max(head.end()) - head.base;
                self.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Iterate the `(base, size)` pairs of all `Usable` entries.
    pub fn usable_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries()
            .iter()
            .filter(|e| e.kind == RegionKind::Usable)
            .map(|e| (e.base, e.size))
    }

    fn insert_sorted(&mut self, entry: MemoryMapEntry) -> Result<(), MemoryMapError> {
        if self.len == MAX_MEMORY_RANGES {
            return Err(MemoryMapError::CapacityExhausted);
        }
        let pos = self.entries()
            .iter()
            .position(|e| e.base > entry.base)
            .unwrap_or(self.len);
        self.entries.copy_within(pos..self.len, pos + 1);
        self.entries[pos] = entry;
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.entries.copy_within(index + 1..self.len, index);
        self.len -= 1;
        self.entries[self.len] = MemoryMapEntry::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(base: u64, size: u64, kind: u32) -> RawMemoryRange {
        RawMemoryRange {
            base,
            size,
            kind,
            extended_attributes: 1,
        }
    }

    fn two_range_map() -> MemoryMap {
        // The classic low-memory + extended-memory pair.
        MemoryMap::from_raw(&[raw(0x10_0000, 0x100_0000, 1), raw(0, 0x9FC00, 1)])
    }

    #[test]
    fn from_raw_sorts_and_discards() {
        let map = MemoryMap::from_raw(&[
            raw(0x10_0000, 0x100_0000, 1),
            raw(0x5000, 0, 1),                  // zero length
            raw(u64::MAX - 0x100, 0x1000, 2),   // base + size overflows
            RawMemoryRange {
                base: 0x9_0000,
                size: 0x1000,
                kind: 1,
                extended_attributes: 2,         // bit 0 clear: ignore
            },
            raw(0, 0x9FC00, 1),
        ]);
        let entries = map.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].base, 0);
        assert_eq!(entries[1].base, 0x10_0000);
    }

    #[test]
    fn find_entry_match_modes() {
        let map = two_range_map();
        // Contained inside the extended range.
        assert_eq!(
            map.find_entry(0x20_0000, 0x1000, MatchMode::Contain, None),
            Some(1)
        );
        // The low range lies within a big probe window.
        assert_eq!(
            map.find_entry(0, 0x10_0000, MatchMode::Within, Some(RegionKind::Usable)),
            Some(0)
        );
        // Straddling probe overlaps the extended range only.
        assert_eq!(
            map.find_entry(0xFF_0000, 0x2_0000, MatchMode::Overlap, None),
            Some(1)
        );
        // Kind filter rejects.
        assert_eq!(
            map.find_entry(0, 0x1000, MatchMode::Contain, Some(RegionKind::Bad)),
            None
        );
    }

    #[test]
    fn split_then_combine_round_trips() {
        let mut map = two_range_map();
        let before = *map.entries().last().unwrap();

        let tail = map.split_entry(1, 0x40_0000).unwrap();
        assert_eq!(tail, 2);
        assert_eq!(map.entries().len(), 3);
        assert_eq!(map.entries()[1].size, 0x40_0000);
        assert_eq!(map.entries()[2].base, 0x50_0000);
        // Coverage is preserved across the split.
        assert_eq!(
            map.entries()[1].size + map.entries()[2].size,
            before.size
        );

        map.combine_next_entry(1).unwrap();
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.entries()[1], before);
    }

    #[test]
    fn combine_rejects_gap_and_kind_mismatch() {
        let mut map = two_range_map();
        // Gap between entry 0 (ends 0x9FC00) and entry 1 (starts 0x100000).
        assert_eq!(
            map.combine_next_entry(0),
            Err(MemoryMapError::InvalidRange)
        );

        let mut mixed = MemoryMap::from_raw(&[raw(0, 0x1000, 1), raw(0x1000, 0x1000, 2)]);
        assert_eq!(
            mixed.combine_next_entry(0),
            Err(MemoryMapError::InvalidRange)
        );
    }

    #[test]
    fn tidy_up_reaches_fixpoint() {
        let mut map = MemoryMap::from_raw(&[
            raw(0x0000, 0x1000, 1),
            raw(0x1000, 0x1000, 1),
            raw(0x2000, 0x1000, 1),
            raw(0x4000, 0x1000, 1), // gap before this one
        ]);
        map.tidy_up();
        let entries = map.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].base, entries[0].size), (0, 0x3000));
        assert_eq!((entries[1].base, entries[1].size), (0x4000, 0x1000));
    }

    #[test]
    fn tidy_up_resolves_usable_overlap() {
        let mut map = MemoryMap::from_raw(&[raw(0, 0x3000, 1), raw(0x2000, 0x4000, 1)]);
        map.tidy_up();
        let entries = map.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].base, entries[0].size), (0, 0x6000));
    }

    #[test]
    fn split_rejects_degenerate_offsets() {
        let mut map = two_range_map();
        assert_eq!(map.split_entry(1, 0), Err(MemoryMapError::InvalidRange));
        assert_eq!(
            map.split_entry(1, 0x100_0000),
            Err(MemoryMapError::InvalidRange)
        );
        assert_eq!(map.split_entry(9, 0x1000), Err(MemoryMapError::InvalidRange));
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let mut map = MemoryMap::empty();
        for i in 0..MAX_MEMORY_RANGES as u64 {
            map.insert_sorted(MemoryMapEntry {
                base: i * 0x2000,
                size: 0x1000,
                kind: RegionKind::Usable,
                extended_attributes: 0,
            })
            .unwrap();
        }
        assert_eq!(map.split_entry(0, 0x800), Err(MemoryMapError::CapacityExhausted));
    }

    #[test]
    fn usable_ranges_skips_reserved() {
        let map = MemoryMap::from_raw(&[
            raw(0, 0x9FC00, 1),
            raw(0xF_0000, 0x1_0000, 2),
            raw(0x10_0000, 0x100_0000, 1),
        ]);
        let ranges: Vec<_> = map.usable_ranges().collect();
        assert_eq!(ranges, vec![(0, 0x9FC00), (0x10_0000, 0x100_0000)]);
    }
}
