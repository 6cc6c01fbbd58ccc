//! Binding devices, and through them translation units, to domains.
//!
//! A device sits behind one or more translation units. Attaching it to a domain binds every
//! one of those units to the domain's page table; units shared between devices are
//! reference-counted so the hardware is only programmed on the first attach and only
//! disabled on the last detach.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::domain::Domain;
use crate::error::{Result, SysmmuError};
use crate::latch::WideVaLatch;
use crate::unit::TranslationUnit;

/// The translation units a device sits behind, plus its optional DMA window.
#[derive(Debug, Clone)]
pub struct DeviceLink {
    name: String,
    units: Vec<Arc<TranslationUnit>>,
    dma_window: Option<(u64, usize)>,
}

impl DeviceLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: Vec::new(),
            dma_window: None,
        }
    }

    /// Restricts the device's DMA to `[start, start + size)` once it is attached.
    pub fn with_dma_window(mut self, start: u64, size: usize) -> Self {
        self.dma_window = Some((start, size));
        self
    }

    /// Puts the device behind `unit`, reporting the unit's address width to `latch`.
    pub fn link(&mut self, unit: Arc<TranslationUnit>, latch: &WideVaLatch) {
        latch.report(unit.va_width());
        self.units.push(unit);
        log::info!(
            "{} has sysmmu {} (total count:{})",
            self.name,
            self.units[self.units.len() - 1].name(),
            self.units.len()
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &[Arc<TranslationUnit>] {
        &self.units
    }

    pub fn dma_window(&self) -> Option<(u64, usize)> {
        self.dma_window
    }
}

impl Domain {
    /// Binds every unit of `device` to this domain and applies the device's DMA window.
    ///
    /// Either every unit ends up attached or none of the references taken by this call
    /// survive.
    pub fn attach_device(&self, device: &DeviceLink) -> Result<()> {
        if device.units.is_empty() {
            log::error!("{} has no IOMMU", device.name);
            return Err(SysmmuError::InvalidArgument);
        }

        for (attached, unit) in device.units.iter().enumerate() {
            if let Err(err) = unit.attach_table(self) {
                self.release_units(&device.units[..attached]);
                return Err(err);
            }
        }

        if let Some((start, size)) = device.dma_window {
            if let Err(err) = self.set_address_geometry(start, size) {
                log::error!("{}: failed to apply DMA window", device.name);
                self.release_units(&device.units);
                return Err(err);
            }
        }

        log::info!(
            "{} attached with pgtable {}",
            device.name,
            self.page_table_base()
        );
        Ok(())
    }

    /// Drops the references `device` holds on this domain's units.
    pub fn detach_device(&self, device: &DeviceLink) {
        self.release_units(&device.units);
        log::info!(
            "{} detached from pgtable {}",
            device.name,
            self.page_table_base()
        );
    }

    fn release_units(&self, units: &[Arc<TranslationUnit>]) {
        for unit in units {
            unit.detach_table(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VaWidth;
    use crate::domain::DomainKind;
    use crate::memory::TableMemory;
    use crate::registers::*;
    use crate::unit::{UnitConfig, tests::fake_registers, tests::probe};

    struct Fixture {
        memory: Arc<TableMemory>,
        latch: WideVaLatch,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                memory: Arc::new(TableMemory::emulated(1024 * 1024)),
                latch: WideVaLatch::new(),
            }
        }

        fn domain(&self) -> Domain {
            Domain::with_va_width(DomainKind::Unmanaged, VaWidth::Bits32, self.memory.clone())
                .unwrap()
        }

        fn device(&self, name: &str, units: &[&Arc<TranslationUnit>]) -> DeviceLink {
            let mut device = DeviceLink::new(name);
            for unit in units {
                device.link((*unit).clone(), &self.latch);
            }
            device
        }
    }

    fn powered_unit(name: &str) -> (Arc<RecordingRegisters>, Arc<TranslationUnit>) {
        let regs = fake_registers(1, false);
        let unit = probe(&regs, &UnitConfig::new(name));
        unit.power_on();
        (regs, unit)
    }

    #[test]
    fn attach_detach_scenario() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        let (regs, u1) = powered_unit("u1");
        let device = fixture.device("dev", &[&u1]);

        domain.attach_device(&device).unwrap();
        assert_eq!(u1.attached_count(), 1);
        assert_eq!(u1.bound_table(), Some(domain.page_table_base()));
        let base = (domain.page_table_base().as_u64() >> 12) as u32;
        assert_eq!(regs.writes_to(REG_MMU_CTRL_VM), vec![MMU_CTRL_ENABLE]);
        assert_eq!(regs.writes_to(REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM), vec![base]);
        assert_eq!(regs.writes_to(REG_MMU_ALL_INV_VM), vec![1]);

        regs.clear_writes();
        domain.attach_device(&device).unwrap();
        assert_eq!(u1.attached_count(), 2);
        assert!(regs.writes().is_empty());
        assert_eq!(domain.attached_units().len(), 1);

        domain.detach_device(&device);
        assert_eq!(u1.attached_count(), 1);
        assert!(regs.writes().is_empty());
        assert_eq!(u1.bound_table(), Some(domain.page_table_base()));

        domain.detach_device(&device);
        assert_eq!(u1.attached_count(), 0);
        assert_eq!(
            regs.writes(),
            vec![(REG_MMU_CTRL_VM, MMU_CTRL_DISABLE), (REG_MMU_ALL_INV_VM, 1)]
        );
        assert_eq!(u1.bound_table(), None);
        assert!(domain.attached_units().is_empty());
    }

    #[test]
    fn conflicting_attach_rolls_back_earlier_units() {
        let fixture = Fixture::new();
        let first = fixture.domain();
        let second = fixture.domain();
        let (_, u1) = powered_unit("u1");
        let (_, u2) = powered_unit("u2");

        let owner = fixture.device("owner", &[&u2]);
        first.attach_device(&owner).unwrap();

        let device = fixture.device("dev", &[&u1, &u2]);
        assert_eq!(
            second.attach_device(&device),
            Err(SysmmuError::AlreadyAttached)
        );

        assert_eq!(u1.attached_count(), 0);
        assert_eq!(u1.bound_table(), None);
        assert_eq!(u2.attached_count(), 1);
        assert_eq!(u2.bound_table(), Some(first.page_table_base()));
        assert!(second.attached_units().is_empty());

        first.detach_device(&owner);
    }

    #[test]
    fn rejected_dma_window_rolls_back_all_units() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        let (_, u1) = powered_unit("u1");
        let (_, u2) = powered_unit("u2");

        let first = fixture.device("first", &[&u1]).with_dma_window(0x1000_0000, 0x1000_0000);
        domain.attach_device(&first).unwrap();

        let second = fixture
            .device("second", &[&u1, &u2])
            .with_dma_window(0x8000_0000, 0x1000_0000);
        assert_eq!(domain.attach_device(&second), Err(SysmmuError::RangeError));

        assert_eq!(u1.attached_count(), 1);
        assert_eq!(u2.attached_count(), 0);
        assert_eq!(domain.attached_units().len(), 1);
        assert_eq!(domain.geometry().start, 0x1000_0000);
        assert_eq!(domain.geometry().end, 0x2000_0000);

        domain.detach_device(&first);
    }

    #[test]
    fn unpowered_attach_defers_programming() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        let regs = fake_registers(1, false);
        let unit = probe(&regs, &UnitConfig::new("u1"));
        let device = fixture.device("dev", &[&unit]);

        domain.attach_device(&device).unwrap();
        assert!(regs.writes().is_empty());

        unit.power_on();
        assert_eq!(regs.writes_to(REG_MMU_CTRL_VM), vec![MMU_CTRL_ENABLE]);

        regs.clear_writes();
        unit.power_off();
        assert_eq!(
            regs.writes(),
            vec![(REG_MMU_CTRL_VM, MMU_CTRL_DISABLE), (REG_MMU_ALL_INV_VM, 1)]
        );
        assert_eq!(unit.attached_count(), 1);
        assert_eq!(domain.attached_units().len(), 1);

        regs.clear_writes();
        domain.detach_device(&device);
        assert!(regs.writes().is_empty());
        assert_eq!(unit.bound_table(), None);
    }

    #[test]
    fn every_vm_context_is_programmed() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        let regs = fake_registers(4, false);
        let config = UnitConfig {
            vmid_mask: Some(0b1010),
            ..UnitConfig::new("u1")
        };
        let unit = probe(&regs, &config);
        unit.power_on();
        let device = fixture.device("dev", &[&unit]);

        domain.attach_device(&device).unwrap();
        let base = (domain.page_table_base().as_u64() >> 12) as u32;
        assert_eq!(
            regs.writes_to(vm_register(REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM, 1)),
            vec![base]
        );
        assert_eq!(
            regs.writes_to(vm_register(REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM, 3)),
            vec![base]
        );
        assert!(regs.writes_to(REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM).is_empty());

        domain.detach_device(&device);
    }

    #[test]
    fn detach_from_another_domain_is_ignored() {
        let fixture = Fixture::new();
        let owner = fixture.domain();
        let other = fixture.domain();
        let (regs, unit) = powered_unit("u1");
        let device = fixture.device("dev", &[&unit]);

        owner.attach_device(&device).unwrap();
        regs.clear_writes();
        other.detach_device(&device);
        assert!(regs.writes().is_empty());
        assert_eq!(unit.attached_count(), 1);
        assert_eq!(unit.bound_table(), Some(owner.page_table_base()));

        owner.attach_device(&device).unwrap();
        assert_eq!(unit.attached_count(), 2);
        assert_eq!(owner.attached_units().len(), 1);

        owner.detach_device(&device);
        owner.detach_device(&device);
        assert_eq!(unit.attached_count(), 0);
        assert!(owner.attached_units().is_empty());
    }

    #[test]
    fn device_without_units_is_rejected() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        assert_eq!(
            domain.attach_device(&DeviceLink::new("orphan")),
            Err(SysmmuError::InvalidArgument)
        );
    }

    #[test]
    fn linking_reports_wide_units() {
        let fixture = Fixture::new();
        let regs = fake_registers(1, true);
        let wide = probe(&regs, &UnitConfig::new("wide"));
        let device = fixture.device("dev", &[&wide]);
        assert_eq!(device.units().len(), 1);
        assert!(fixture.latch.is_pending());
    }

    #[test]
    fn concurrent_attach_of_a_shared_unit() {
        let fixture = Fixture::new();
        let domain = fixture.domain();
        let (regs, unit) = powered_unit("shared");
        let devices: Vec<DeviceLink> = (0..8)
            .map(|i| fixture.device(&alloc::format!("dev{}", i), &[&unit]))
            .collect();

        std::thread::scope(|s| {
            for device in &devices {
                let domain = &domain;
                s.spawn(move || domain.attach_device(device).unwrap());
            }
        });

        assert_eq!(unit.attached_count(), 8);
        assert_eq!(domain.attached_units().len(), 1);
        assert_eq!(regs.writes_to(REG_MMU_CTRL_VM), vec![MMU_CTRL_ENABLE]);

        for device in &devices {
            domain.detach_device(device);
        }
        assert_eq!(unit.attached_count(), 0);
    }
}
