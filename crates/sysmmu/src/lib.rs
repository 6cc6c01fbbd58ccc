#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # System MMU v9 translation core
//!
//! Address translation for bus-attached devices behind System MMU v9 translation units.
//! The crate provides:
//!
//! - A concurrent two-level page table in the hardware's native format.
//! - Domains (isolated IO address spaces) with map, unmap and lookup.
//! - Reference-counted attach and detach of devices whose translation units may be shared.
//! - Batched translation-cache invalidation, replicated into every enabled VM context.
//! - Software emulation of table memory and registers for testing in non-kernel environments.

extern crate alloc;

mod address;
mod attach;
mod domain;
mod driver;
mod entry;
mod error;
mod flags;
mod format;
mod gather;
mod latch;
mod memory;
pub mod registers;
mod table;
mod unit;

pub use address::{Iova, PhysicalAddress};
pub use attach::DeviceLink;
pub use domain::{Aperture, DMA_BIT_MASK_32, DmaCookie, Domain, DomainKind};
pub use driver::{Capability, Sysmmu};
pub use entry::{Lv1Entry, Lv2Entry};
pub use error::{Result, SysmmuError};
pub use flags::Prot;
pub use format::{
    LPAGE_SIZE, LV2TABLE_SIZE, NUM_LV2ENTRIES, PGSIZE_BITMAP, PageSize, SECT_SIZE, SPAGE_SIZE,
    SPAGES_PER_LPAGE, VaWidth, lv1_index, lv2_index,
};
pub use gather::IotlbGather;
pub use latch::WideVaLatch;
pub use memory::{SyncForDevice, TableMemory};
pub use table::{PageTable, Subtable};
pub use unit::{
    DEFAULT_STREAM_NONE, DEFAULT_VMID_MASK, HardwareInfo, StreamConfig, StreamProps,
    TranslationUnit, UnitConfig,
};

#[cfg(any(test, feature = "software-emulation"))]
pub use memory::{EMULATED_BASE, EmulatedMemory};
