//! Isolated IO address spaces.
//!
//! A [`Domain`] owns one page table and remembers which translation units currently walk it,
//! so that table edits can be followed by invalidations on exactly those units.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Result, SysmmuError};
use crate::flags::Prot;
use crate::format::{PageSize, SPAGE_SIZE, VaWidth};
use crate::gather::IotlbGather;
use crate::latch::WideVaLatch;
use crate::memory::TableMemory;
use crate::table::PageTable;
use crate::unit::{TranslationUnit, UnitRef};
use crate::{Iova, PhysicalAddress};

/// Highest address reachable through a 32-bit DMA mask.
pub const DMA_BIT_MASK_32: u64 = 0xFFFF_FFFF;

/// The kinds of domain the IOMMU core may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// Mappings are managed directly by the owner.
    Unmanaged,
    /// Mappings are managed by the DMA API, which needs a cookie.
    Dma,
    /// Pass-through.
    Identity,
}

impl DomainKind {
    const RAW_UNMANAGED: u32 = 1;
    const RAW_DMA: u32 = 3;
    const RAW_IDENTITY: u32 = 4;

    /// Returns the IOMMU core's code for this kind.
    pub const fn to_raw(self) -> u32 {
        match self {
            DomainKind::Unmanaged => Self::RAW_UNMANAGED,
            DomainKind::Dma => Self::RAW_DMA,
            DomainKind::Identity => Self::RAW_IDENTITY,
        }
    }
}

impl TryFrom<u32> for DomainKind {
    type Error = SysmmuError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            Self::RAW_UNMANAGED => Ok(DomainKind::Unmanaged),
            Self::RAW_DMA => Ok(DomainKind::Dma),
            Self::RAW_IDENTITY => Ok(DomainKind::Identity),
            _ => {
                log::error!("invalid domain type {}", raw);
                Err(SysmmuError::InvalidArgument)
            }
        }
    }
}

/// Marks a domain whose addresses are handed out by the DMA API.
///
/// Opaque: the DMA API keeps its allocator state on its own side and only needs to know
/// that a cookie was reserved for the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaCookie {
    _private: (),
}

impl DmaCookie {
    fn new() -> Self {
        Self { _private: () }
    }
}

/// A snapshot of a domain's DMA aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aperture {
    pub start: u64,
    pub end: u64,
    /// Whether DMA allocations are restricted to `[start, end)`.
    pub forced: bool,
}

/// Aperture storage. Bounds are published before the forced flag; readers check the flag
/// first.
#[derive(Default)]
struct Geometry {
    start: AtomicU64,
    end: AtomicU64,
    forced: AtomicBool,
    writer: spin::Mutex<()>,
}

/// An isolated IO virtual address space.
pub struct Domain {
    kind: DomainKind,
    table: PageTable,
    units: spin::Mutex<Vec<UnitRef>>,
    geometry: Geometry,
    dma_cookie: Option<DmaCookie>,
}

impl Domain {
    /// Creates a domain, taking the address width from `latch`.
    pub fn new(kind: DomainKind, latch: &WideVaLatch, memory: Arc<TableMemory>) -> Result<Self> {
        Self::with_va_width(kind, latch.take(), memory)
    }

    /// Creates a domain with an explicit address width.
    pub fn with_va_width(
        kind: DomainKind,
        va_width: VaWidth,
        memory: Arc<TableMemory>,
    ) -> Result<Self> {
        let table = PageTable::new(memory, va_width)?;
        let dma_cookie = match kind {
            DomainKind::Dma => Some(DmaCookie::new()),
            _ => None,
        };

        log::debug!(
            "allocated {:?} domain with {}-bit page table at {}",
            kind,
            va_width.bits(),
            table.root()
        );

        Ok(Self {
            kind,
            table,
            units: spin::Mutex::new(Vec::new()),
            geometry: Geometry::default(),
            dma_cookie,
        })
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn va_width(&self) -> VaWidth {
        self.table.va_width()
    }

    pub fn dma_cookie(&self) -> Option<&DmaCookie> {
        self.dma_cookie.as_ref()
    }

    /// Returns the physical address of the level-1 table units are programmed with.
    pub fn page_table_base(&self) -> PhysicalAddress {
        self.table.root()
    }

    /// Returns the underlying page table.
    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    /// Maps one page of `size` bytes (4 KiB, 64 KiB or 1 MiB) at `iova` to `phys`.
    pub fn map(&self, iova: Iova, phys: PhysicalAddress, size: usize, prot: Prot) -> Result<()> {
        let shareable = prot.is_shareable();
        let result = match PageSize::from_bytes(size) {
            Some(PageSize::Section) => {
                self.table
                    .install_section(iova, phys, shareable, |gather| self.iotlb_sync(gather))
            }
            Some(page) => self
                .table
                .ensure_subtable(iova)
                .and_then(|sub| self.table.install_page(&sub, iova, phys, page, shareable)),
            None => Err(SysmmuError::InvalidArgument),
        };

        if let Err(err) = result {
            log::error!("failed to map {:#x} @ {}, ret: {}", size, iova, err);
        }
        result
    }

    /// Unmaps the page at `iova`, folding the removed range into `gather`.
    ///
    /// Returns the number of bytes the removal covers, which is the size of whatever was
    /// found at `iova` rather than `size`. A section or large page is removed whole, and
    /// `gather` receives its full range even when `iova` points into the middle of it.
    /// Cached translations stay valid until `gather` is synced.
    pub fn unmap(&self, iova: Iova, size: usize, gather: &mut IotlbGather) -> Result<usize> {
        let removed = self.table.remove(iova, size)?;
        let bytes = (removed.end.as_u64() - removed.start.as_u64()) as usize;
        gather.add_range(removed.start, bytes);
        Ok(bytes)
    }

    fn largest_fit(iova: u64, phys: u64, remaining: usize) -> Option<PageSize> {
        PageSize::descending().into_iter().find(|page| {
            let bytes = page.bytes();
            let mask = bytes as u64 - 1;
            bytes <= remaining && iova & mask == 0 && phys & mask == 0
        })
    }

    /// Maps `[iova, iova + size)` to `[phys, phys + size)` using the largest pages the
    /// alignment allows.
    ///
    /// On failure everything mapped by this call is unmapped again and invalidated.
    pub fn map_range(
        &self,
        iova: Iova,
        phys: PhysicalAddress,
        size: usize,
        prot: Prot,
    ) -> Result<()> {
        if !iova.is_aligned(SPAGE_SIZE) || !phys.is_aligned(SPAGE_SIZE) || size % SPAGE_SIZE != 0
        {
            log::error!(
                "unaligned mapping {:#x} bytes of {} @ {}",
                size,
                phys,
                iova
            );
            return Err(SysmmuError::InvalidArgument);
        }
        if iova.checked_add(size as u64).is_none() {
            return Err(SysmmuError::InvalidArgument);
        }

        let mut mapped = 0usize;
        while mapped < size {
            let cur_iova = iova + mapped as u64;
            let cur_phys = phys.as_u64() + mapped as u64;
            let page = Self::largest_fit(cur_iova.as_u64(), cur_phys, size - mapped)
                .unwrap_or(PageSize::Small);

            let result = PhysicalAddress::try_new(cur_phys)
                .ok_or(SysmmuError::InvalidArgument)
                .and_then(|cur_phys| self.map(cur_iova, cur_phys, page.bytes(), prot));

            if let Err(err) = result {
                let mut gather = IotlbGather::new();
                if mapped > 0 {
                    // Removes only what this call mapped.
                    if let Err(unwind) = self.unmap_range(iova, mapped, &mut gather) {
                        log::warn!(
                            "failed to unwind {:#x} bytes @ {}, ret: {}",
                            mapped,
                            iova,
                            unwind
                        );
                    }
                }
                self.iotlb_sync(&gather);
                return Err(err);
            }
            mapped += page.bytes();
        }

        Ok(())
    }

    /// Unmaps `[iova, iova + size)`, folding every removal into `gather`.
    ///
    /// Stops at the first failure; whatever was removed before it is still in `gather`.
    pub fn unmap_range(&self, iova: Iova, size: usize, gather: &mut IotlbGather) -> Result<usize> {
        if !iova.is_aligned(SPAGE_SIZE) || size % SPAGE_SIZE != 0 {
            return Err(SysmmuError::InvalidArgument);
        }

        let mut unmapped = 0usize;
        while unmapped < size {
            let cur = iova + unmapped as u64;
            let page = Self::largest_fit(cur.as_u64(), 0, size - unmapped)
                .unwrap_or(PageSize::Small);
            unmapped += self.unmap(cur, page.bytes(), gather)?;
        }
        Ok(unmapped)
    }

    /// Looks up the physical address `iova` translates to.
    pub fn iova_to_phys(&self, iova: Iova) -> Option<PhysicalAddress> {
        self.table.translate(iova)
    }

    pub(crate) fn link_unit(&self, unit: UnitRef) {
        self.units.lock().push(unit);
    }

    pub(crate) fn unlink_unit(&self, unit: &TranslationUnit) {
        self.units
            .lock()
            .retain(|linked| !core::ptr::eq(linked.as_ptr(), unit));
    }

    /// Returns the units currently walking this domain's page table.
    pub fn attached_units(&self) -> Vec<Arc<TranslationUnit>> {
        self.units.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Invalidates every cached translation on every attached, powered unit.
    pub fn flush_iotlb_all(&self) {
        let base = self.page_table_base();
        for unit in self.attached_units() {
            unit.flush_all_for(base);
        }
    }

    /// Invalidates the range collected in `gather` on every attached, powered unit.
    pub fn iotlb_sync(&self, gather: &IotlbGather) {
        let Some(range) = gather.range() else {
            return;
        };
        let base = self.page_table_base();
        for unit in self.attached_units() {
            unit.flush_range_for(base, &range);
        }
    }

    /// Restricts DMA allocations in this domain to `[start, start + size)`.
    ///
    /// The end is clamped to the 32-bit DMA mask. Once an aperture is forced, later windows
    /// can only narrow it.
    pub fn set_address_geometry(&self, start: u64, size: usize) -> Result<()> {
        let end = start
            .checked_add(size as u64)
            .filter(|_| size != 0)
            .ok_or(SysmmuError::InvalidArgument)?
            .min(DMA_BIT_MASK_32);
        if start >= end {
            log::error!("requested range [{:#x} @ {:#x}] is empty", size, start);
            return Err(SysmmuError::InvalidArgument);
        }

        let geometry = &self.geometry;
        let _writer = geometry.writer.lock();

        if geometry.forced.load(Ordering::Acquire) {
            let cur_start = geometry.start.load(Ordering::Relaxed);
            let cur_end = geometry.end.load(Ordering::Relaxed);
            let new_start = start.max(cur_start);
            let new_end = end.min(cur_end);

            if new_start >= new_end {
                log::error!("current range is [{:#x}..{:#x}]", cur_start, cur_end);
                log::error!("requested range [{:#x} @ {:#x}] is not allowed", size, start);
                return Err(SysmmuError::RangeError);
            }

            geometry.start.store(new_start, Ordering::Relaxed);
            geometry.end.store(new_end, Ordering::Relaxed);
        } else {
            geometry.start.store(start, Ordering::Relaxed);
            geometry.end.store(end, Ordering::Relaxed);
            geometry.forced.store(true, Ordering::Release);
        }

        log::info!(
            "changed DMA range [{:#x}..{:#x}] successfully",
            geometry.start.load(Ordering::Relaxed),
            geometry.end.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Returns the current aperture.
    pub fn geometry(&self) -> Aperture {
        let forced = self.geometry.forced.load(Ordering::Acquire);
        Aperture {
            start: self.geometry.start.load(Ordering::Relaxed),
            end: self.geometry.end.load(Ordering::Relaxed),
            forced,
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        let attached = self.attached_units();
        if !attached.is_empty() {
            log::error!(
                "freeing domain at {} with {} unit(s) still attached",
                self.page_table_base(),
                attached.len()
            );
        }
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("kind", &self.kind)
            .field("va_width", &self.va_width())
            .field("page_table", &self.page_table_base())
            .field("geometry", &self.geometry())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Lv1Entry;
    use crate::format::{LPAGE_SIZE, SECT_SIZE};
    use crate::registers::*;
    use crate::unit::{UnitConfig, tests::fake_registers, tests::probe};

    fn memory() -> Arc<TableMemory> {
        Arc::new(TableMemory::emulated(2 * 1024 * 1024))
    }

    fn new_domain(kind: DomainKind) -> Domain {
        Domain::with_va_width(kind, VaWidth::Bits32, memory()).unwrap()
    }

    const RW: Prot = Prot::READ.union(Prot::WRITE);

    #[test]
    fn raw_kinds() {
        assert_eq!(DomainKind::try_from(1), Ok(DomainKind::Unmanaged));
        assert_eq!(DomainKind::try_from(3), Ok(DomainKind::Dma));
        assert_eq!(DomainKind::try_from(4), Ok(DomainKind::Identity));
        assert_eq!(DomainKind::try_from(2), Err(SysmmuError::InvalidArgument));
        assert_eq!(DomainKind::Dma.to_raw(), 3);
    }

    #[test]
    fn dma_cookie_only_for_dma_domains() {
        assert!(new_domain(DomainKind::Dma).dma_cookie().is_some());
        assert!(new_domain(DomainKind::Unmanaged).dma_cookie().is_none());
        assert!(new_domain(DomainKind::Identity).dma_cookie().is_none());
    }

    #[test]
    fn width_comes_from_latch() {
        let latch = WideVaLatch::new();
        latch.report(VaWidth::Bits36);
        let mem = Arc::new(TableMemory::emulated(1024 * 1024));
        let wide = Domain::new(DomainKind::Unmanaged, &latch, mem.clone()).unwrap();
        let narrow = Domain::new(DomainKind::Unmanaged, &latch, mem).unwrap();
        assert_eq!(wide.va_width(), VaWidth::Bits36);
        assert_eq!(narrow.va_width(), VaWidth::Bits32);
    }

    #[test]
    fn small_page_scenario() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0x1000), PhysicalAddress::new(0x80000), SPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            domain.iova_to_phys(Iova::new(0x1000)),
            Some(PhysicalAddress::new(0x80000))
        );
        assert_eq!(
            domain.iova_to_phys(Iova::new(0x1001)),
            Some(PhysicalAddress::new(0x80001))
        );
    }

    #[test]
    fn section_scenario() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0), PhysicalAddress::new(0x4000_0000), SECT_SIZE, RW)
            .unwrap();

        let mut gather = IotlbGather::new();
        assert_eq!(
            domain.unmap(Iova::new(0), SPAGE_SIZE, &mut gather),
            Err(SysmmuError::GranularityMismatch)
        );
        assert!(gather.is_empty());

        assert_eq!(domain.unmap(Iova::new(0), SECT_SIZE, &mut gather), Ok(SECT_SIZE));
        assert_eq!(gather.range(), Some(Iova::new(0)..Iova::new(0x10_0000)));
        assert_eq!(domain.iova_to_phys(Iova::new(0)), None);
    }

    #[test]
    fn unsupported_size_is_rejected() {
        let domain = new_domain(DomainKind::Unmanaged);
        assert_eq!(
            domain.map(Iova::new(0), PhysicalAddress::new(0), 0x2000, RW),
            Err(SysmmuError::InvalidArgument)
        );
    }

    #[test]
    fn cache_flag_selects_shareable() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0), PhysicalAddress::new(0), SECT_SIZE, RW | Prot::CACHE)
            .unwrap();
        domain
            .map(
                Iova::new(0x10_0000),
                PhysicalAddress::new(0x10_0000),
                SECT_SIZE,
                RW | Prot::CACHE | Prot::PRIV,
            )
            .unwrap();

        let table = domain.page_table();
        assert!(matches!(
            table.lv1_entry(Iova::new(0)),
            Some(Lv1Entry::Section { shareable: true, .. })
        ));
        assert!(matches!(
            table.lv1_entry(Iova::new(0x10_0000)),
            Some(Lv1Entry::Section { shareable: false, .. })
        ));
    }

    #[test]
    fn map_range_uses_largest_pages() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map_range(
                Iova::new(0),
                PhysicalAddress::new(0x4000_0000),
                SECT_SIZE + LPAGE_SIZE + SPAGE_SIZE,
                RW,
            )
            .unwrap();

        let table = domain.page_table();
        assert!(matches!(
            table.lv1_entry(Iova::new(0)),
            Some(Lv1Entry::Section { .. })
        ));
        assert!(matches!(
            table.lv1_entry(Iova::new(0x10_0000)),
            Some(Lv1Entry::Subtable { .. })
        ));
        assert_eq!(table.live_entries(Iova::new(0x10_0000)), 17);
        assert_eq!(
            domain.iova_to_phys(Iova::new(0x11_0FFF)),
            Some(PhysicalAddress::new(0x4011_0FFF))
        );
        assert_eq!(domain.iova_to_phys(Iova::new(0x11_1000)), None);

        let mut gather = IotlbGather::new();
        assert_eq!(
            domain.unmap_range(Iova::new(0), SECT_SIZE + LPAGE_SIZE + SPAGE_SIZE, &mut gather),
            Ok(SECT_SIZE + LPAGE_SIZE + SPAGE_SIZE)
        );
        assert_eq!(table.live_entries(Iova::new(0x10_0000)), 0);
        for iova in [0, 0x8_0000, 0x10_0000, 0x10_F000, 0x11_0000] {
            assert_eq!(domain.iova_to_phys(Iova::new(iova)), None);
        }
    }

    #[test]
    fn map_range_with_misaligned_phys_falls_back_to_small_pages() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map_range(Iova::new(0), PhysicalAddress::new(0x1000), LPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(domain.page_table().live_entries(Iova::new(0)), 16);
        assert!(matches!(
            domain.page_table().lv1_entry(Iova::new(0)),
            Some(Lv1Entry::Subtable { .. })
        ));
    }

    #[test]
    fn map_range_unwinds_on_failure() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0x1_5000), PhysicalAddress::new(0x9000), SPAGE_SIZE, RW)
            .unwrap();

        assert_eq!(
            domain.map_range(Iova::new(0), PhysicalAddress::new(0x20_0000), 2 * LPAGE_SIZE, RW),
            Err(SysmmuError::AddressInUse)
        );

        assert_eq!(domain.iova_to_phys(Iova::new(0)), None);
        assert_eq!(
            domain.iova_to_phys(Iova::new(0x1_5000)),
            Some(PhysicalAddress::new(0x9000))
        );
        assert_eq!(domain.page_table().live_entries(Iova::new(0)), 1);
    }

    #[test]
    fn map_then_unmap_restores_empty_table() {
        let domain = new_domain(DomainKind::Unmanaged);
        let mut gather = IotlbGather::new();
        domain
            .map(Iova::new(0x3_0000), PhysicalAddress::new(0x50_0000), LPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            domain.unmap(Iova::new(0x3_0000), LPAGE_SIZE, &mut gather),
            Ok(LPAGE_SIZE)
        );
        for page in 0..16u64 {
            let iova = Iova::new(0x3_0000 + page * 0x1000);
            assert_eq!(domain.iova_to_phys(iova), None);
        }
        let table = domain.page_table();
        assert!(matches!(
            table.lv1_entry(Iova::new(0x3_0000)),
            Some(Lv1Entry::Subtable { .. })
        ));
        assert_eq!(table.live_entries(Iova::new(0x3_0000)), 0);
    }

    #[test]
    fn disjoint_ranges_are_independent() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0x1000), PhysicalAddress::new(0xA000), SPAGE_SIZE, RW)
            .unwrap();
        domain
            .map(Iova::new(0x2000), PhysicalAddress::new(0xB000), SPAGE_SIZE, RW)
            .unwrap();

        let mut gather = IotlbGather::new();
        domain.unmap(Iova::new(0x1000), SPAGE_SIZE, &mut gather).unwrap();
        assert_eq!(domain.iova_to_phys(Iova::new(0x1000)), None);
        assert_eq!(
            domain.iova_to_phys(Iova::new(0x2000)),
            Some(PhysicalAddress::new(0xB000))
        );
    }

    #[test]
    fn geometry_is_forced_then_narrowed() {
        let domain = new_domain(DomainKind::Dma);
        assert!(!domain.geometry().forced);

        domain.set_address_geometry(0x1000_0000, 0x2000_0000).unwrap();
        assert_eq!(
            domain.geometry(),
            Aperture {
                start: 0x1000_0000,
                end: 0x3000_0000,
                forced: true
            }
        );

        domain.set_address_geometry(0x2000_0000, 0x4000_0000).unwrap();
        assert_eq!(domain.geometry().start, 0x2000_0000);
        assert_eq!(domain.geometry().end, 0x3000_0000);

        assert_eq!(
            domain.set_address_geometry(0x4000_0000, 0x1000),
            Err(SysmmuError::RangeError)
        );
        assert_eq!(domain.geometry().start, 0x2000_0000);
        assert_eq!(domain.geometry().end, 0x3000_0000);
    }

    #[test]
    fn geometry_end_is_clamped_to_dma_mask() {
        let domain = new_domain(DomainKind::Dma);
        domain.set_address_geometry(0x8000_0000, 0x1_0000_0000).unwrap();
        assert_eq!(domain.geometry().end, DMA_BIT_MASK_32);

        let other = new_domain(DomainKind::Dma);
        assert_eq!(
            other.set_address_geometry(0, 0),
            Err(SysmmuError::InvalidArgument)
        );
        assert!(!other.geometry().forced);
    }

    #[test]
    fn sync_without_units_is_a_noop() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain.flush_iotlb_all();
        domain.iotlb_sync(&IotlbGather::with_range(Iova::new(0), SPAGE_SIZE));
        assert!(domain.attached_units().is_empty());
    }

    #[test]
    fn sync_reaches_powered_attached_units() {
        let domain = new_domain(DomainKind::Unmanaged);
        let regs = fake_registers(1, false);
        let unit = probe(&regs, &UnitConfig::new("sysmmu"));

        unit.attach_table(&domain).unwrap();
        domain.iotlb_sync(&IotlbGather::with_range(Iova::new(0x2000), SPAGE_SIZE));
        assert!(regs.writes().is_empty());

        unit.power_on();
        regs.clear_writes();
        domain.iotlb_sync(&IotlbGather::with_range(Iova::new(0x2000), SPAGE_SIZE));
        domain.flush_iotlb_all();
        assert_eq!(
            regs.writes(),
            vec![
                (REG_MMU_RANGE_INV_START_VPN_VM, 0x200),
                (REG_MMU_RANGE_INV_END_VPN_AND_TRIG_VM, 0x201),
                (REG_MMU_ALL_INV_VM, 1),
            ]
        );

        unit.detach_table(&domain);
        assert!(domain.attached_units().is_empty());
    }

    #[test]
    fn section_over_empty_subtable_invalidates_synchronously() {
        let domain = new_domain(DomainKind::Unmanaged);
        let regs = fake_registers(1, false);
        let unit = probe(&regs, &UnitConfig::new("sysmmu"));
        unit.power_on();
        unit.attach_table(&domain).unwrap();

        let mut gather = IotlbGather::new();
        domain
            .map(Iova::new(0x20_1000), PhysicalAddress::new(0x9000), SPAGE_SIZE, RW)
            .unwrap();
        domain.unmap(Iova::new(0x20_1000), SPAGE_SIZE, &mut gather).unwrap();

        regs.clear_writes();
        domain
            .map(Iova::new(0x20_0000), PhysicalAddress::new(0x60_0000), SECT_SIZE, RW)
            .unwrap();
        assert_eq!(
            regs.writes(),
            vec![
                (REG_MMU_RANGE_INV_START_VPN_VM, 0x2_0000),
                (REG_MMU_RANGE_INV_END_VPN_AND_TRIG_VM, 0x2_FF01),
            ]
        );

        unit.detach_table(&domain);
    }

    #[test]
    fn misaligned_unmap_gathers_the_whole_page() {
        let domain = new_domain(DomainKind::Unmanaged);
        domain
            .map(Iova::new(0), PhysicalAddress::new(0x60_0000), SECT_SIZE, RW)
            .unwrap();
        let mut gather = IotlbGather::new();
        assert_eq!(
            domain.unmap(Iova::new(0x8_0000), SECT_SIZE, &mut gather),
            Ok(SECT_SIZE)
        );
        assert_eq!(gather.range(), Some(Iova::new(0)..Iova::new(0x10_0000)));

        domain
            .map(Iova::new(0x20_0000), PhysicalAddress::new(0x30_0000), LPAGE_SIZE, RW)
            .unwrap();
        let mut gather = IotlbGather::new();
        assert_eq!(
            domain.unmap(Iova::new(0x20_4000), LPAGE_SIZE, &mut gather),
            Ok(LPAGE_SIZE)
        );
        assert_eq!(
            gather.range(),
            Some(Iova::new(0x20_0000)..Iova::new(0x21_0000))
        );
        assert_eq!(domain.iova_to_phys(Iova::new(0x20_0000)), None);
    }

    #[test]
    fn sync_skips_unpowered_units() {
        let domain = new_domain(DomainKind::Unmanaged);
        let on_regs = fake_registers(1, false);
        let off_regs = fake_registers(1, false);
        let on = probe(&on_regs, &UnitConfig::new("sysmmu_on"));
        let off = probe(&off_regs, &UnitConfig::new("sysmmu_off"));
        on.power_on();

        on.attach_table(&domain).unwrap();
        off.attach_table(&domain).unwrap();
        assert_eq!(domain.attached_units().len(), 2);

        on_regs.clear_writes();
        off_regs.clear_writes();
        domain.iotlb_sync(&IotlbGather::with_range(Iova::new(0x5000), 2 * SPAGE_SIZE));
        domain.flush_iotlb_all();

        assert_eq!(
            on_regs.writes(),
            vec![
                (REG_MMU_RANGE_INV_START_VPN_VM, 0x500),
                (REG_MMU_RANGE_INV_END_VPN_AND_TRIG_VM, 0x601),
                (REG_MMU_ALL_INV_VM, 1),
            ]
        );
        assert!(off_regs.writes().is_empty());

        off.power_on();
        on_regs.clear_writes();
        off_regs.clear_writes();
        domain.flush_iotlb_all();
        assert_eq!(on_regs.writes(), vec![(REG_MMU_ALL_INV_VM, 1)]);
        assert_eq!(off_regs.writes(), vec![(REG_MMU_ALL_INV_VM, 1)]);

        on.detach_table(&domain);
        off.detach_table(&domain);
        assert!(domain.attached_units().is_empty());
    }

    #[test]
    fn drop_releases_tables() {
        let memory = memory();
        {
            let domain =
                Domain::with_va_width(DomainKind::Dma, VaWidth::Bits32, memory.clone()).unwrap();
            domain
                .map_range(Iova::new(0xF_0000), PhysicalAddress::new(0), 0x20_0000, RW)
                .unwrap();
            assert!(memory.emulation().live_blocks() > 1);
        }
        assert_eq!(memory.emulation().live_blocks(), 0);
    }
}
