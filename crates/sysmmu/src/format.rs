//! Fixed geometry of the two-level table format.
//!
//! The translation unit walks a two-level table:
//! - Level 1: one 32-bit entry per 1 MiB of IO virtual address space, either a section
//!   mapping or a pointer to a level-2 table. 4096 entries cover a 32-bit space, 65536 cover
//!   a 36-bit space.
//! - Level 2: 256 entries per 1 MiB, each a 4 KiB small page or one of the 16 slots of a
//!   64 KiB large page.
//!
//! Address layout:
//! - Bits 0-11: page offset (4 KiB)
//! - Bits 12-19: level 2 index
//! - Bits 20-31 (or 20-35): level 1 index

use crate::Iova;

/// Maximum number of bits in a physical address reachable through a table entry.
pub const MAX_PHYSICAL_BITS: u32 = 36;

/// Order of a small page.
pub const SPAGE_ORDER: u32 = 12;
/// Order of a large page.
pub const LPAGE_ORDER: u32 = 16;
/// Order of a section.
pub const SECT_ORDER: u32 = 20;

/// Small page size in bytes (4 KiB).
pub const SPAGE_SIZE: usize = 1 << SPAGE_ORDER;
/// Large page size in bytes (64 KiB).
pub const LPAGE_SIZE: usize = 1 << LPAGE_ORDER;
/// Section size in bytes (1 MiB).
pub const SECT_SIZE: usize = 1 << SECT_ORDER;

/// Number of level-2 slots covered by one large page.
pub const SPAGES_PER_LPAGE: usize = LPAGE_SIZE / SPAGE_SIZE;

/// Number of entries in a level-2 table.
pub const NUM_LV2ENTRIES: usize = SECT_SIZE / SPAGE_SIZE;

/// Size of a single table entry in bytes.
pub const ENTRY_SIZE: usize = core::mem::size_of::<u32>();

/// Size of a level-2 table in bytes.
pub const LV2TABLE_SIZE: usize = NUM_LV2ENTRIES * ENTRY_SIZE;

/// Bitmap of the page sizes the table format supports.
pub const PGSIZE_BITMAP: usize = SECT_SIZE | LPAGE_SIZE | SPAGE_SIZE;

/// The two virtual address widths a domain's level-1 table can be sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VaWidth {
    /// 32-bit IO virtual addresses (4096 level-1 entries).
    #[default]
    Bits32,
    /// 36-bit IO virtual addresses (65536 level-1 entries).
    Bits36,
}

impl VaWidth {
    /// Returns the number of address bits.
    pub const fn bits(self) -> u32 {
        match self {
            VaWidth::Bits32 => 32,
            VaWidth::Bits36 => 36,
        }
    }

    /// Returns the number of level-1 entries needed to cover the address space.
    pub const fn lv1_entries(self) -> usize {
        1 << (self.bits() - SECT_ORDER)
    }

    /// Returns the size of the level-1 table in bytes.
    pub const fn lv1_table_size(self) -> usize {
        self.lv1_entries() * ENTRY_SIZE
    }

    /// Returns the first IO virtual address past the end of the address space.
    pub const fn limit(self) -> u64 {
        1 << self.bits()
    }
}

/// The granularities a single table entry (or run of entries) can map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageSize {
    /// A single 4 KiB level-2 entry.
    Small,
    /// A 64 KiB run of 16 level-2 entries.
    Large,
    /// A 1 MiB level-1 entry.
    Section,
}

impl PageSize {
    /// Returns the granularity matching `size` exactly.
    pub const fn from_bytes(size: usize) -> Option<Self> {
        match size {
            SPAGE_SIZE => Some(PageSize::Small),
            LPAGE_SIZE => Some(PageSize::Large),
            SECT_SIZE => Some(PageSize::Section),
            _ => None,
        }
    }

    /// Returns the size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::Small => SPAGE_SIZE,
            PageSize::Large => LPAGE_SIZE,
            PageSize::Section => SECT_SIZE,
        }
    }

    /// Returns the granularities from largest to smallest.
    pub const fn descending() -> [PageSize; 3] {
        [PageSize::Section, PageSize::Large, PageSize::Small]
    }
}

/// Returns the level-1 index for a given IO virtual address.
#[inline]
pub const fn lv1_index(iova: Iova) -> usize {
    (iova.as_u64() >> SECT_ORDER) as usize
}

/// Returns the level-2 index for a given IO virtual address.
#[inline]
pub const fn lv2_index(iova: Iova) -> usize {
    ((iova.as_u64() >> SPAGE_ORDER) as usize) & (NUM_LV2ENTRIES - 1)
}
