// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Guest effective address as seen by the RSX (32-bit).
pub type GuestAddr = u32;

/// Page size (4 KiB).
pub const PAGE_SIZE: u32 = 0x1000;

/// Page size as usize for buffer math.
pub const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Base of the RSX local memory window. Everything below is main memory.
pub const LOCAL_MEM_BASE: GuestAddr = 0xC000_0000;

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(value: u32, alignment: u32) -> u32 {
    value & !(alignment - 1)
}

/// Start of the page containing `addr`.
#[inline]
pub const fn page_start(addr: GuestAddr) -> GuestAddr {
    addr & !PAGE_MASK
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}

// ── Memory location ────────────────────────────────────────────────────────

/// Which memory pool a guest address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryLocation {
    /// XDR main memory, shared with the CPU.
    Main = 0,
    /// GDDR local memory owned by the RSX.
    Local = 1,
}

impl MemoryLocation {
    pub const COUNT: usize = 2;

    /// Classify a guest address into its memory pool.
    #[inline]
    pub const fn classify(addr: GuestAddr) -> Self {
        if addr >= LOCAL_MEM_BASE {
            Self::Local
        } else {
            Self::Main
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Local => write!(f, "local"),
        }
    }
}

// ── Address range ──────────────────────────────────────────────────────────

/// A half-open guest byte range `[start, start + length)`.
///
/// Lengths are kept as `u32` but all end arithmetic is done in `u64`, so a
/// range touching the top of the address space does not wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AddressRange {
    pub start: GuestAddr,
    pub length: u32,
}

impl AddressRange {
    #[inline]
    pub const fn start_length(start: GuestAddr, length: u32) -> Self {
        Self { start, length }
    }

    /// Build a range from two inclusive endpoints.
    #[inline]
    pub const fn start_end(start: GuestAddr, last: GuestAddr) -> Self {
        Self {
            start,
            length: last - start + 1,
        }
    }

    /// Exclusive end address.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    /// Last byte covered by the range. Only meaningful for non-empty ranges.
    #[inline]
    pub const fn last(&self) -> GuestAddr {
        (self.end() - 1) as GuestAddr
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub const fn contains(&self, addr: GuestAddr) -> bool {
        (addr as u64) >= self.start as u64 && (addr as u64) < self.end()
    }

    /// True if both ranges are non-empty and share at least one byte.
    #[inline]
    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && (self.start as u64) < other.end()
            && (other.start as u64) < self.end()
    }

    /// Smallest range covering both inputs.
    pub fn union(&self, other: &AddressRange) -> AddressRange {
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        AddressRange {
            start,
            length: (end - start as u64) as u32,
        }
    }

    /// Memory pool of the first byte.
    #[inline]
    pub const fn location(&self) -> MemoryLocation {
        MemoryLocation::classify(self.start)
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[0x{:08X}..0x{:08X})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x1000, PAGE_SIZE), 0x1000);
        assert_eq!(align_down(0x1FFF, PAGE_SIZE), 0x1000);
        assert_eq!(page_start(0x1234_5678), 0x1234_5000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3004));
    }

    #[test]
    fn test_classify_location() {
        assert_eq!(MemoryLocation::classify(0), MemoryLocation::Main);
        assert_eq!(MemoryLocation::classify(0xBFFF_FFFF), MemoryLocation::Main);
        assert_eq!(MemoryLocation::classify(LOCAL_MEM_BASE), MemoryLocation::Local);
        assert_eq!(MemoryLocation::classify(0xC010_0000), MemoryLocation::Local);
    }

    #[test]
    fn test_range_overlap() {
        let a = AddressRange::start_length(0x1000, 0x100);
        let b = AddressRange::start_length(0x10FF, 0x10);
        let c = AddressRange::start_length(0x1100, 0x10);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&AddressRange::start_length(0x1000, 0)));
    }

    #[test]
    fn test_range_union() {
        let a = AddressRange::start_length(0x1000, 0x100);
        let b = AddressRange::start_length(0x1080, 0x100);
        assert_eq!(a.union(&b), AddressRange::start_length(0x1000, 0x180));
        assert_eq!(b.union(&a), AddressRange::start_length(0x1000, 0x180));
    }

    #[test]
    fn test_range_top_of_address_space() {
        let r = AddressRange::start_length(0xFFFF_FF00, 0x100);
        assert_eq!(r.end(), 0x1_0000_0000);
        assert_eq!(r.last(), 0xFFFF_FFFF);
        assert!(r.contains(0xFFFF_FFFF));
        assert_eq!(AddressRange::start_end(0x10, 0x1F).length, 0x10);
    }
}
