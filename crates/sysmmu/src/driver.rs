//! The driver-level entry points the IOMMU core calls into.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::attach::DeviceLink;
use crate::domain::{Domain, DomainKind};
use crate::error::Result;
use crate::latch::WideVaLatch;
use crate::memory::TableMemory;
use crate::registers::RegisterAccess;
use crate::unit::{TranslationUnit, UnitConfig};

/// Optional features the IOMMU core may query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Translated DMA snoops CPU caches.
    CacheCoherency,
    /// Interrupt remapping.
    InterruptRemap,
    /// Execute-never on DMA mappings.
    NoExec,
}

/// Driver-wide state shared by every unit and domain.
pub struct Sysmmu {
    memory: Arc<TableMemory>,
    wide_va: WideVaLatch,
    units: spin::Mutex<Vec<Arc<TranslationUnit>>>,
}

impl Sysmmu {
    /// Creates the driver state with `memory` backing every page table.
    pub fn new(memory: TableMemory) -> Self {
        Self {
            memory: Arc::new(memory),
            wide_va: WideVaLatch::new(),
            units: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn memory(&self) -> &Arc<TableMemory> {
        &self.memory
    }

    /// Returns whether the units support `cap`. Only cache coherency is offered.
    pub const fn capable(&self, cap: Capability) -> bool {
        matches!(cap, Capability::CacheCoherency)
    }

    /// Discovers a translation unit and registers it with the driver.
    pub fn probe(
        &self,
        regs: Box<dyn RegisterAccess>,
        config: &UnitConfig,
    ) -> Result<Arc<TranslationUnit>> {
        let unit = TranslationUnit::probe(regs, config)?;
        self.units.lock().push(unit.clone());
        Ok(unit)
    }

    /// Returns every unit probed so far.
    pub fn units(&self) -> Vec<Arc<TranslationUnit>> {
        self.units.lock().clone()
    }

    /// Finds a probed unit by name.
    pub fn find_unit(&self, name: &str) -> Option<Arc<TranslationUnit>> {
        self.units
            .lock()
            .iter()
            .find(|unit| unit.name() == name)
            .cloned()
    }

    /// Puts `device` behind `unit`.
    pub fn link_device(&self, device: &mut DeviceLink, unit: Arc<TranslationUnit>) {
        device.link(unit, &self.wide_va);
    }

    /// Allocates a domain of the IOMMU core's `raw_kind`.
    ///
    /// The domain gets the 36-bit format if a wide unit was linked since the last domain was
    /// allocated.
    pub fn domain_alloc(&self, raw_kind: u32) -> Result<Domain> {
        let kind = DomainKind::try_from(raw_kind)?;
        Domain::new(kind, &self.wide_va, self.memory.clone())
    }

    pub fn attach_device(&self, domain: &Domain, device: &DeviceLink) -> Result<()> {
        domain.attach_device(device)
    }

    pub fn detach_device(&self, domain: &Domain, device: &DeviceLink) {
        domain.detach_device(device)
    }
}
