//! Table entries and their hardware encoding.
//!
//! Table logic works on the tagged [`Lv1Entry`] and [`Lv2Entry`] variants; only this module
//! knows how they are packed into the 32-bit words the translation unit walks.
//!
//! Every entry has the form `(phys >> 4) | type | attributes`:
//! - Level 1, bits 0-1: `0` unmapped, `1` level-2 table pointer, `2` 1 MiB section.
//!   Bit 6 marks a section shareable.
//! - Level 2, bits 0-1: `0` unmapped, `1` 64 KiB large page, `2` 4 KiB small page.
//!   Bit 4 marks a page shareable.
//!
//! The type value `3` is reserved at both levels and decodes as unmapped.

use crate::PhysicalAddress;
use crate::format::{LPAGE_SIZE, LV2TABLE_SIZE, SECT_SIZE, SPAGE_SIZE};

/// Shift applied to physical addresses before they are stored in an entry.
const PG_ENT_SHIFT: u32 = 4;

const FLPD_FLAG_MASK: u32 = 0x3;
const SLPD_FLAG: u32 = 0x1;
const SECT_FLAG: u32 = 0x2;

const SLPD_ENT_FLAG_MASK: u32 = 0x3;
const LPAGE_FLAG: u32 = 0x1;
const SPAGE_FLAG: u32 = 0x2;

const FLPD_SHAREABLE_FLAG: u32 = 1 << 6;
const SLPD_SHAREABLE_FLAG: u32 = 1 << 4;

const SECT_ENT_MASK: u32 = !((SECT_SIZE >> PG_ENT_SHIFT) as u32 - 1);
const LV2TABLE_ENT_MASK: u32 = !((LV2TABLE_SIZE >> PG_ENT_SHIFT) as u32 - 1);
const LPAGE_ENT_MASK: u32 = !((LPAGE_SIZE >> PG_ENT_SHIFT) as u32 - 1);
const SPAGE_ENT_MASK: u32 = !((SPAGE_SIZE >> PG_ENT_SHIFT) as u32 - 1);

#[inline]
const fn make_pte(phys: PhysicalAddress, mask: u32, kind: u32, attr: u32) -> u32 {
    ((phys.as_u64() >> PG_ENT_SHIFT) as u32 & mask) | kind | attr
}

#[inline]
const fn pte_phys(raw: u32, mask: u32) -> PhysicalAddress {
    PhysicalAddress::new(((raw & mask) as u64) << PG_ENT_SHIFT)
}

/// A first-level table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lv1Entry {
    /// Nothing is mapped in this megabyte.
    #[default]
    Unmapped,
    /// The whole megabyte maps to a contiguous physical section.
    Section {
        phys: PhysicalAddress,
        shareable: bool,
    },
    /// The megabyte is described by a level-2 table.
    Subtable { table: PhysicalAddress },
}

impl Lv1Entry {
    /// Packs this entry into its hardware representation.
    pub const fn encode(self) -> u32 {
        match self {
            Lv1Entry::Unmapped => 0,
            Lv1Entry::Section { phys, shareable } => {
                let attr = if shareable { FLPD_SHAREABLE_FLAG } else { 0 };
                make_pte(phys, SECT_ENT_MASK, SECT_FLAG, attr)
            }
            Lv1Entry::Subtable { table } => make_pte(table, LV2TABLE_ENT_MASK, SLPD_FLAG, 0),
        }
    }

    /// Unpacks a hardware entry.
    pub const fn decode(raw: u32) -> Self {
        match raw & FLPD_FLAG_MASK {
            SECT_FLAG => Lv1Entry::Section {
                phys: pte_phys(raw, SECT_ENT_MASK),
                shareable: raw & FLPD_SHAREABLE_FLAG != 0,
            },
            SLPD_FLAG => Lv1Entry::Subtable {
                table: pte_phys(raw, LV2TABLE_ENT_MASK),
            },
            _ => Lv1Entry::Unmapped,
        }
    }
}

/// A second-level table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lv2Entry {
    /// Nothing is mapped in this 4 KiB slot.
    #[default]
    Unmapped,
    /// The slot maps a single 4 KiB page.
    SmallPage {
        phys: PhysicalAddress,
        shareable: bool,
    },
    /// The slot is one of the 16 slots of a 64 KiB page starting at `phys`.
    LargePage {
        phys: PhysicalAddress,
        shareable: bool,
    },
}

impl Lv2Entry {
    /// Packs this entry into its hardware representation.
    pub const fn encode(self) -> u32 {
        match self {
            Lv2Entry::Unmapped => 0,
            Lv2Entry::SmallPage { phys, shareable } => {
                let attr = if shareable { SLPD_SHAREABLE_FLAG } else { 0 };
                make_pte(phys, SPAGE_ENT_MASK, SPAGE_FLAG, attr)
            }
            Lv2Entry::LargePage { phys, shareable } => {
                let attr = if shareable { SLPD_SHAREABLE_FLAG } else { 0 };
                make_pte(phys, LPAGE_ENT_MASK, LPAGE_FLAG, attr)
            }
        }
    }

    /// Unpacks a hardware entry.
    pub const fn decode(raw: u32) -> Self {
        let shareable = raw & SLPD_SHAREABLE_FLAG != 0;
        match raw & SLPD_ENT_FLAG_MASK {
            SPAGE_FLAG => Lv2Entry::SmallPage {
                phys: pte_phys(raw, SPAGE_ENT_MASK),
                shareable,
            },
            LPAGE_FLAG => Lv2Entry::LargePage {
                phys: pte_phys(raw, LPAGE_ENT_MASK),
                shareable,
            },
            _ => Lv2Entry::Unmapped,
        }
    }

    /// Returns whether this slot is free.
    pub const fn is_unmapped(self) -> bool {
        matches!(self, Lv2Entry::Unmapped)
    }
}
