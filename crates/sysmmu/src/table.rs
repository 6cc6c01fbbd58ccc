//! The two-level page table walked by the translation unit.
//!
//! [`PageTable`] owns the level-1 root, every resident level-2 table and the per-slot
//! live-entry counters. Structural level-1 edits (installing a section or a level-2 table)
//! happen under the table lock; level-2 entries for disjoint pages are written without it,
//! and the counters are plain atomics.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::entry::{Lv1Entry, Lv2Entry};
use crate::error::{Result, SysmmuError};
use crate::format::{
    ENTRY_SIZE, LPAGE_SIZE, LV2TABLE_SIZE, NUM_LV2ENTRIES, PageSize, SECT_SIZE, SPAGE_SIZE,
    SPAGES_PER_LPAGE, VaWidth, lv1_index, lv2_index,
};
use crate::gather::IotlbGather;
use crate::memory::TableMemory;
use crate::{Iova, PhysicalAddress};

/// A resident level-2 table, as returned by [`PageTable::ensure_subtable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subtable {
    lv1: usize,
    table: PhysicalAddress,
}

impl Subtable {
    /// Returns the physical address of the level-2 table.
    pub const fn address(&self) -> PhysicalAddress {
        self.table
    }
}

/// A hardware-walked two-level page table.
pub struct PageTable {
    memory: Arc<TableMemory>,
    root: PhysicalAddress,
    va_width: VaWidth,
    /// Live level-2 entries per level-1 slot.
    counters: Box<[AtomicU32]>,
    lock: spin::Mutex<()>,
}

impl PageTable {
    /// Allocates an empty table covering `va_width` bits of IO virtual address space.
    pub fn new(memory: Arc<TableMemory>, va_width: VaWidth) -> Result<Self> {
        let root = memory.allocate(va_width.lv1_table_size())?;

        let entries = va_width.lv1_entries();
        let mut counters = Vec::new();
        if counters.try_reserve_exact(entries).is_err() {
            log::error!("failed to allocate {} live-entry counters", entries);
            // SAFETY: Allocated above and never handed out.
            unsafe { memory.deallocate(root, va_width.lv1_table_size()) };
            return Err(SysmmuError::OutOfMemory);
        }
        counters.extend((0..entries).map(|_| AtomicU32::new(0)));

        memory.sync_for_device(root, va_width.lv1_table_size());

        Ok(Self {
            memory,
            root,
            va_width,
            counters: counters.into_boxed_slice(),
            lock: spin::Mutex::new(()),
        })
    }

    /// Returns the physical address of the level-1 table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Returns the address width this table was sized for.
    pub fn va_width(&self) -> VaWidth {
        self.va_width
    }

    /// Returns the memory provider backing this table.
    pub fn memory(&self) -> &Arc<TableMemory> {
        &self.memory
    }

    /// Returns the live level-2 entry count of the slot covering `iova`.
    pub fn live_entries(&self, iova: Iova) -> u32 {
        self.counters
            .get(lv1_index(iova))
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    /// Returns the decoded level-1 entry covering `iova`.
    pub fn lv1_entry(&self, iova: Iova) -> Option<Lv1Entry> {
        let index = lv1_index(iova);
        self.lv1().get(index).map(|slot| Lv1Entry::decode(slot.load(Ordering::Acquire)))
    }

    fn lv1(&self) -> &[AtomicU32] {
        // SAFETY: The root is live for the lifetime of the table.
        unsafe { self.memory.entries(self.root, self.va_width.lv1_entries()) }
    }

    fn lv2(&self, table: PhysicalAddress) -> &[AtomicU32] {
        // SAFETY: Level-2 tables referenced from the root stay live until they are replaced
        // by a section or the table is dropped.
        unsafe { self.memory.entries(table, NUM_LV2ENTRIES) }
    }

    fn slot_index(&self, iova: Iova) -> Result<usize> {
        let index = lv1_index(iova);
        if index >= self.va_width.lv1_entries() {
            log::error!(
                "{} is outside of the {}-bit address space",
                iova,
                self.va_width.bits()
            );
            return Err(SysmmuError::InvalidArgument);
        }
        Ok(index)
    }

    fn lv1_phys(&self, index: usize) -> PhysicalAddress {
        self.root + (index * ENTRY_SIZE) as u64
    }

    /// Maps the 1 MiB section at `iova` to `phys`.
    ///
    /// An empty level-2 table occupying the slot is released; `sync` is called with a gather
    /// covering the whole section so that stale walks through the old table are invalidated
    /// before the table memory is reused.
    pub fn install_section<F>(
        &self,
        iova: Iova,
        phys: PhysicalAddress,
        shareable: bool,
        sync: F,
    ) -> Result<()>
    where
        F: FnOnce(&IotlbGather),
    {
        if !iova.is_aligned(SECT_SIZE) || !phys.is_aligned(SECT_SIZE) {
            return Err(SysmmuError::InvalidArgument);
        }
        let index = self.slot_index(iova)?;
        let slot = &self.lv1()[index];

        let replaced = {
            let _guard = self.lock.lock();
            let replaced = match Lv1Entry::decode(slot.load(Ordering::Acquire)) {
                Lv1Entry::Section { .. } => {
                    log::warn!("trying to map 1MiB@{} on a valid section", iova);
                    return Err(SysmmuError::AddressInUse);
                }
                Lv1Entry::Subtable { table } => {
                    if self.counters[index].load(Ordering::Acquire) != 0 {
                        log::warn!("trying to map 1MiB@{} on a live level-2 table", iova);
                        return Err(SysmmuError::AddressInUse);
                    }
                    Some(table)
                }
                Lv1Entry::Unmapped => None,
            };

            slot.store(Lv1Entry::Section { phys, shareable }.encode(), Ordering::Release);
            self.memory.sync_for_device(self.lv1_phys(index), ENTRY_SIZE);
            replaced
        };

        if let Some(table) = replaced {
            sync(&IotlbGather::with_range(iova, SECT_SIZE));
            self.counters[index].store(0, Ordering::Release);
            // SAFETY: The slot no longer references the table and the walker's cached view
            // of it was just invalidated.
            unsafe { self.memory.deallocate(table, LV2TABLE_SIZE) };
        }

        Ok(())
    }

    /// Returns the level-2 table covering `iova`, allocating it if the slot is unmapped.
    ///
    /// Concurrent callers racing on the same slot all get the table that was installed
    /// first; the others release their allocation.
    pub fn ensure_subtable(&self, iova: Iova) -> Result<Subtable> {
        let index = self.slot_index(iova)?;
        let slot = &self.lv1()[index];

        match Lv1Entry::decode(slot.load(Ordering::Acquire)) {
            Lv1Entry::Subtable { table } => return Ok(Subtable { lv1: index, table }),
            Lv1Entry::Section { .. } => {
                log::warn!("trying to map on {} mapped with a 1MiB section", iova);
                return Err(SysmmuError::AddressInUse);
            }
            Lv1Entry::Unmapped => {}
        }

        let fresh = self.memory.allocate(LV2TABLE_SIZE)?;

        let _guard = self.lock.lock();
        match Lv1Entry::decode(slot.load(Ordering::Acquire)) {
            Lv1Entry::Unmapped => {
                self.counters[index].store(0, Ordering::Release);
                self.memory.sync_for_device(fresh, LV2TABLE_SIZE);
                slot.store(Lv1Entry::Subtable { table: fresh }.encode(), Ordering::Release);
                self.memory.sync_for_device(self.lv1_phys(index), ENTRY_SIZE);
                Ok(Subtable {
                    lv1: index,
                    table: fresh,
                })
            }
            other => {
                // SAFETY: The fresh table was never published.
                unsafe { self.memory.deallocate(fresh, LV2TABLE_SIZE) };
                match other {
                    Lv1Entry::Subtable { table } => Ok(Subtable { lv1: index, table }),
                    _ => Err(SysmmuError::AddressInUse),
                }
            }
        }
    }

    /// Writes a small or large page mapping into a resident level-2 table.
    pub fn install_page(
        &self,
        subtable: &Subtable,
        iova: Iova,
        phys: PhysicalAddress,
        size: PageSize,
        shareable: bool,
    ) -> Result<()> {
        if lv1_index(iova) != subtable.lv1 {
            return Err(SysmmuError::InvalidArgument);
        }
        let entries = self.lv2(subtable.table);
        let first = lv2_index(iova);
        let counter = &self.counters[subtable.lv1];

        match size {
            PageSize::Small => {
                if !iova.is_aligned(SPAGE_SIZE) || !phys.is_aligned(SPAGE_SIZE) {
                    return Err(SysmmuError::InvalidArgument);
                }
                let entry = Lv2Entry::SmallPage { phys, shareable }.encode();
                if entries[first]
                    .compare_exchange(0, entry, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    log::warn!("trying to map 4KiB@{} on a valid entry", iova);
                    return Err(SysmmuError::AddressInUse);
                }
                self.memory
                    .sync_for_device(subtable.table + (first * ENTRY_SIZE) as u64, ENTRY_SIZE);
                counter.fetch_add(1, Ordering::AcqRel);
            }
            PageSize::Large => {
                if !iova.is_aligned(LPAGE_SIZE) || !phys.is_aligned(LPAGE_SIZE) {
                    return Err(SysmmuError::InvalidArgument);
                }
                let entry = Lv2Entry::LargePage { phys, shareable }.encode();
                let run = &entries[first..first + SPAGES_PER_LPAGE];
                for (written, slot) in run.iter().enumerate() {
                    if slot
                        .compare_exchange(0, entry, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        for stale in &run[..written] {
                            stale.store(0, Ordering::Release);
                        }
                        log::warn!("trying to map 64KiB@{} on a valid entry", iova);
                        return Err(SysmmuError::AddressInUse);
                    }
                }
                self.memory.sync_for_device(
                    subtable.table + (first * ENTRY_SIZE) as u64,
                    SPAGES_PER_LPAGE * ENTRY_SIZE,
                );
                counter.fetch_add(SPAGES_PER_LPAGE as u32, Ordering::AcqRel);
            }
            PageSize::Section => return Err(SysmmuError::InvalidArgument),
        }

        Ok(())
    }

    /// Removes whatever is mapped at `iova`, returning the IO virtual range the removal covers.
    ///
    /// A section or large page is cleared as a whole, so the range starts at its base rather
    /// than at `iova`. Never invalidates; the caller owes an invalidation of the returned range.
    pub fn remove(&self, iova: Iova, size: usize) -> Result<Range<Iova>> {
        let index = self.slot_index(iova)?;
        let slot = &self.lv1()[index];

        let table = match Lv1Entry::decode(slot.load(Ordering::Acquire)) {
            Lv1Entry::Section { .. } => {
                if size < SECT_SIZE {
                    log::error!(
                        "failed: size({:#x}) @ {} is smaller than page size {:#x}",
                        size,
                        iova,
                        SECT_SIZE
                    );
                    return Err(SysmmuError::GranularityMismatch);
                }
                slot.store(0, Ordering::Release);
                self.memory.sync_for_device(self.lv1_phys(index), ENTRY_SIZE);
                return Ok(span(iova.align_down(SECT_SIZE), SECT_SIZE));
            }
            Lv1Entry::Unmapped => return Ok(span(iova, size.min(SECT_SIZE))),
            Lv1Entry::Subtable { table } => table,
        };

        let entries = self.lv2(table);
        let at = lv2_index(iova);
        match Lv2Entry::decode(entries[at].load(Ordering::Acquire)) {
            Lv2Entry::Unmapped => Ok(span(iova, SPAGE_SIZE)),
            Lv2Entry::SmallPage { .. } => {
                entries[at].store(0, Ordering::Release);
                self.memory
                    .sync_for_device(table + (at * ENTRY_SIZE) as u64, ENTRY_SIZE);
                self.counters[index].fetch_sub(1, Ordering::AcqRel);
                Ok(span(iova.align_down(SPAGE_SIZE), SPAGE_SIZE))
            }
            Lv2Entry::LargePage { .. } => {
                if size < LPAGE_SIZE {
                    log::error!(
                        "failed: size({:#x}) @ {} is smaller than page size {:#x}",
                        size,
                        iova,
                        LPAGE_SIZE
                    );
                    return Err(SysmmuError::GranularityMismatch);
                }
                let first = at & !(SPAGES_PER_LPAGE - 1);
                for entry in &entries[first..first + SPAGES_PER_LPAGE] {
                    entry.store(0, Ordering::Release);
                }
                self.memory.sync_for_device(
                    table + (first * ENTRY_SIZE) as u64,
                    SPAGES_PER_LPAGE * ENTRY_SIZE,
                );
                self.counters[index].fetch_sub(SPAGES_PER_LPAGE as u32, Ordering::AcqRel);
                Ok(span(iova.align_down(LPAGE_SIZE), LPAGE_SIZE))
            }
        }
    }

    /// Looks up the physical address `iova` translates to.
    ///
    /// Lock-free. Callers must not race a lookup with a section replacing the level-2
    /// table the lookup walks through.
    pub fn translate(&self, iova: Iova) -> Option<PhysicalAddress> {
        let phys = match self.lv1_entry(iova)? {
            Lv1Entry::Unmapped => return None,
            Lv1Entry::Section { phys, .. } => phys + iova.offset_in(SECT_SIZE),
            Lv1Entry::Subtable { table } => {
                let raw = self.lv2(table)[lv2_index(iova)].load(Ordering::Acquire);
                match Lv2Entry::decode(raw) {
                    Lv2Entry::Unmapped => return None,
                    Lv2Entry::SmallPage { phys, .. } => phys + iova.offset_in(SPAGE_SIZE),
                    Lv2Entry::LargePage { phys, .. } => phys + iova.offset_in(LPAGE_SIZE),
                }
            }
        };
        Some(phys)
    }
}

fn span(start: Iova, size: usize) -> Range<Iova> {
    start..start + size as u64
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for slot in self.lv1() {
            if let Lv1Entry::Subtable { table } = Lv1Entry::decode(slot.load(Ordering::Acquire)) {
                // SAFETY: The table is being torn down; nothing references its level-2 tables.
                unsafe { self.memory.deallocate(table, LV2TABLE_SIZE) };
            }
        }
        // SAFETY: As above, for the root.
        unsafe {
            self.memory
                .deallocate(self.root, self.va_width.lv1_table_size())
        };
    }
}
