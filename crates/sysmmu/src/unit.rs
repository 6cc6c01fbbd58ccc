//! Translation unit instances.
//!
//! A [`TranslationUnit`] is one hardware instance discovered at probe time. It outlives every
//! domain and may be shared by several devices; the attached count decides when the bound
//! page table is programmed into or removed from the hardware.

use alloc::{
    boxed::Box,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ops::Range;

use crate::domain::Domain;
use crate::error::{Result, SysmmuError};
use crate::format::{SPAGE_SIZE, VaWidth};
use crate::registers::{
    self, CFG_QOS_OVRRIDE, MAX_VIDS, MMU_CTRL_DISABLE, MMU_CTRL_ENABLE, MmuVersion,
    PMMU_MAX_NUM, RegisterAccess,
};
use crate::{Iova, PhysicalAddress};

/// VM contexts used when the configuration does not name any.
pub const DEFAULT_VMID_MASK: u32 = 0x1;

/// Default stream configuration installed when a PMMU has none configured.
pub const DEFAULT_STREAM_NONE: u32 = !0;

/// One stream routing entry, installed verbatim whenever the unit is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamConfig {
    pub index: u32,
    pub cfg: u32,
    pub match_cfg: u32,
    pub match_id_value: u32,
    pub match_id_mask: u32,
}

/// Stream routing of a single PMMU.
#[derive(Debug, Clone, Default)]
pub struct StreamProps {
    pub default_cfg: Option<u32>,
    pub entries: Vec<StreamConfig>,
}

/// Discovery-time configuration of a unit, as parsed by the platform layer.
#[derive(Debug, Clone, Default)]
pub struct UnitConfig {
    pub name: String,
    /// VM contexts to replicate every command into.
    pub vmid_mask: Option<u32>,
    /// Overrides the PMMU count reported by the hardware.
    pub num_pmmu: Option<u32>,
    pub qos: Option<u32>,
    /// Stream routing, indexed by PMMU.
    pub streams: Vec<StreamProps>,
}

impl UnitConfig {
    /// Creates an empty configuration for a unit called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Capabilities read from the hardware at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub version: MmuVersion,
    pub max_vm: u32,
    pub num_pmmu: u32,
    pub va_width: VaWidth,
}

#[derive(Debug, Default)]
struct UnitState {
    attached_count: u32,
    pgtable: Option<PhysicalAddress>,
    powered: bool,
}

/// A translation unit instance.
pub struct TranslationUnit {
    name: String,
    regs: Box<dyn RegisterAccess>,
    info: HardwareInfo,
    vmid_mask: u32,
    num_pmmu: u32,
    qos: Option<u32>,
    streams: Vec<StreamProps>,
    state: spin::Mutex<UnitState>,
}

impl TranslationUnit {
    /// Discovers a unit behind `regs` and applies its configuration.
    ///
    /// The unit starts powered off and detached.
    pub fn probe(regs: Box<dyn RegisterAccess>, config: &UnitConfig) -> Result<Arc<Self>> {
        let name = config.name.clone();

        let version = MmuVersion::from_register(regs.read(registers::REG_MMU_VERSION));
        let max_vm = registers::mmu_num_context(regs.read(registers::REG_MMU_NUM_CONTEXT))
            .min(MAX_VIDS);
        let hw_pmmu = registers::mmu_swalker_info_num_pmmu(
            regs.read(registers::REG_MMU_SWALKER_INFO),
        )
        .min(PMMU_MAX_NUM);
        let va_width = Self::read_va_width(regs.as_ref(), hw_pmmu);

        let qos = match config.qos {
            Some(qos) if qos > 15 => {
                log::error!("{}: invalid QoS value {}, use default", name, qos);
                None
            }
            qos => qos,
        };

        let vm_bits = (1u32 << max_vm) - 1;
        let vmid_mask = match config.vmid_mask {
            Some(mask) if mask & vm_bits != 0 => mask,
            Some(mask) => {
                log::warn!(
                    "{}: vmid mask {:#x} selects no VM context (max {}), use default",
                    name,
                    mask,
                    max_vm
                );
                DEFAULT_VMID_MASK
            }
            None => DEFAULT_VMID_MASK,
        };

        let num_pmmu = match config.num_pmmu {
            Some(count) if count == 0 || count > PMMU_MAX_NUM => {
                log::error!("{}: invalid number of pmmu {}", name, count);
                return Err(SysmmuError::InvalidArgument);
            }
            Some(count) => count,
            None => hw_pmmu,
        };

        let mut streams = Vec::new();
        for pmmu in 0..num_pmmu {
            let props = config.streams.get(pmmu as usize).cloned().unwrap_or_default();
            streams.push(Self::validate_streams(&name, regs.as_ref(), pmmu, props));
        }

        let info = HardwareInfo {
            version,
            max_vm,
            num_pmmu: hw_pmmu,
            va_width,
        };

        log::info!("{}: initialized IOMMU. Ver {}", name, version);

        Ok(Arc::new(Self {
            name,
            regs,
            info,
            vmid_mask,
            num_pmmu,
            qos,
            streams,
            state: spin::Mutex::new(UnitState::default()),
        }))
    }

    fn read_va_width(regs: &dyn RegisterAccess, num_pmmu: u32) -> VaWidth {
        for pmmu in 0..num_pmmu {
            regs.write(
                registers::REG_MMU_PMMU_INDICATOR,
                registers::set_pmmu_indicator(pmmu),
            );
            if registers::mmu_pmmu_info_va_width_36(regs.read(registers::REG_MMU_PMMU_INFO)) {
                return VaWidth::Bits36;
            }
        }
        VaWidth::Bits32
    }

    fn validate_streams(
        name: &str,
        regs: &dyn RegisterAccess,
        pmmu: u32,
        mut props: StreamProps,
    ) -> StreamProps {
        if props.entries.is_empty() {
            return props;
        }

        regs.write(
            registers::REG_MMU_PMMU_INDICATOR,
            registers::set_pmmu_indicator(pmmu),
        );
        let num_stream =
            registers::mmu_pmmu_info_num_stream_table(regs.read(registers::REG_MMU_PMMU_INFO));

        props.entries.retain(|entry| {
            if entry.index >= num_stream {
                log::error!(
                    "{}: invalid index {} is ignored. (max:{})",
                    name,
                    entry.index,
                    num_stream
                );
                return false;
            }
            true
        });
        props
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &HardwareInfo {
        &self.info
    }

    pub fn va_width(&self) -> VaWidth {
        self.info.va_width
    }

    /// Returns the VM contexts every command is replicated into.
    pub fn vmid_mask(&self) -> u32 {
        self.vmid_mask
    }

    pub fn attached_count(&self) -> u32 {
        self.state.lock().attached_count
    }

    /// Returns the page table currently bound to this unit.
    pub fn bound_table(&self) -> Option<PhysicalAddress> {
        self.state.lock().pgtable
    }

    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    fn write(&self, offset: usize, value: u32) {
        #[cfg(feature = "detailed-logging")]
        log::trace!("{}: [{:#06x}] <- {:#010x}", self.name, offset, value);
        self.regs.write(offset, value);
    }

    fn enabled_vms(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.info.max_vm).filter(move |vm| self.vmid_mask & (1 << vm) != 0)
    }

    fn write_all_vm(&self, reg: usize, value: u32) {
        for vm in self.enabled_vms() {
            self.write(registers::vm_register(reg, vm), value);
        }
    }

    fn hw_invalidate_all(&self) {
        self.write_all_vm(registers::REG_MMU_ALL_INV_VM, 0x1);
    }

    fn hw_invalidate_range(&self, range: &Range<Iova>) {
        let start = range.start.align_down(SPAGE_SIZE).as_u64() >> 4;
        let end = Iova::new(range.end.as_u64() - 1).align_down(SPAGE_SIZE).as_u64() >> 4;
        self.write_all_vm(registers::REG_MMU_RANGE_INV_START_VPN_VM, start as u32);
        self.write_all_vm(
            registers::REG_MMU_RANGE_INV_END_VPN_AND_TRIG_VM,
            end as u32 | 0x1,
        );
    }

    fn hw_disable(&self) {
        self.write_all_vm(registers::REG_MMU_CTRL_VM, MMU_CTRL_DISABLE);
        self.hw_invalidate_all();
    }

    fn hw_set_streams(&self, pmmu: u32, props: &StreamProps) {
        self.write(
            registers::REG_MMU_PMMU_INDICATOR,
            registers::set_pmmu_indicator(pmmu),
        );
        let default_cfg = props.default_cfg.unwrap_or(DEFAULT_STREAM_NONE);
        self.write(
            registers::reg_stream_cfg(0),
            registers::mmu_stream_cfg_mask(default_cfg),
        );

        for entry in &props.entries {
            self.write(
                registers::reg_stream_cfg(entry.index),
                registers::mmu_stream_cfg_mask(entry.cfg),
            );
            self.write(
                registers::reg_stream_match_cfg(entry.index),
                registers::mmu_stream_match_cfg_mask(entry.match_cfg),
            );
            self.write(
                registers::reg_stream_match_sid_value(entry.index),
                entry.match_id_value,
            );
            self.write(
                registers::reg_stream_match_sid_mask(entry.index),
                entry.match_id_mask,
            );
        }
    }

    fn hw_init_config(&self) {
        for vm in self.enabled_vms() {
            let reg = registers::vm_register(registers::REG_MMU_CONTEXT0_CFG_ATTRIBUTE_VM, vm);
            let mut cfg = self.regs.read(reg);
            if let Some(qos) = self.qos {
                cfg &= !registers::cfg_qos(0xF);
                cfg |= CFG_QOS_OVRRIDE | registers::cfg_qos(qos);
            }
            self.write(reg, cfg);
        }

        for (pmmu, props) in (0..self.num_pmmu).zip(&self.streams) {
            self.hw_set_streams(pmmu, props);
        }
    }

    fn hw_enable(&self, pgtable: PhysicalAddress) {
        self.write_all_vm(registers::REG_MMU_CTRL_VM, MMU_CTRL_ENABLE);
        self.write_all_vm(
            registers::REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM,
            (pgtable.as_u64() / SPAGE_SIZE as u64) as u32,
        );
        self.hw_init_config();
        self.hw_invalidate_all();
    }

    /// Records that the unit's power domain came up.
    ///
    /// An attached unit gets its page table programmed again.
    pub fn power_on(&self) {
        let mut state = self.state.lock();
        state.powered = true;
        if state.attached_count > 0 {
            if let Some(pgtable) = state.pgtable {
                self.hw_enable(pgtable);
            }
        }
    }

    /// Records that the unit's power domain is going down.
    ///
    /// Translation is disabled but the unit stays attached.
    pub fn power_off(&self) {
        let mut state = self.state.lock();
        state.powered = false;
        if state.attached_count > 0 {
            self.hw_disable();
        }
    }

    /// Binds `domain`'s page table to this unit, or takes another reference on it.
    pub(crate) fn attach_table(self: &Arc<Self>, domain: &Domain) -> Result<()> {
        let pgtable = domain.page_table_base();
        let mut state = self.state.lock();

        if state.attached_count == 0 {
            state.attached_count = 1;
            state.pgtable = Some(pgtable);
            domain.link_unit(Arc::downgrade(self));
            if state.powered {
                self.hw_enable(pgtable);
            }
            return Ok(());
        }

        if state.pgtable != Some(pgtable) {
            log::error!("{} is already attached to other domain", self.name);
            return Err(SysmmuError::AlreadyAttached);
        }

        state.attached_count += 1;
        Ok(())
    }

    /// Drops one reference on the bound table, unbinding it on the last one.
    pub(crate) fn detach_table(&self, domain: &Domain) {
        let mut state = self.state.lock();
        if state.attached_count == 0 {
            log::warn!("{}: detach without attach", self.name);
            return;
        }
        if state.pgtable != Some(domain.page_table_base()) {
            log::warn!(
                "{}: detach from pgtable {} it is not attached to",
                self.name,
                domain.page_table_base()
            );
            return;
        }

        state.attached_count -= 1;
        if state.attached_count == 0 {
            if state.powered {
                self.hw_disable();
            }
            domain.unlink_unit(self);
            state.pgtable = None;
        }
    }

    fn is_live_for(state: &UnitState, pgtable: PhysicalAddress) -> bool {
        state.attached_count > 0 && state.powered && state.pgtable == Some(pgtable)
    }

    /// Invalidates every cached translation if `pgtable` is bound and the unit is powered.
    pub(crate) fn flush_all_for(&self, pgtable: PhysicalAddress) {
        let state = self.state.lock();
        if Self::is_live_for(&state, pgtable) {
            self.hw_invalidate_all();
        }
    }

    /// Invalidates cached translations in `range` if `pgtable` is bound and the unit is
    /// powered.
    pub(crate) fn flush_range_for(&self, pgtable: PhysicalAddress, range: &Range<Iova>) {
        let state = self.state.lock();
        if Self::is_live_for(&state, pgtable) {
            self.hw_invalidate_range(range);
        }
    }
}

impl core::fmt::Debug for TranslationUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TranslationUnit")
            .field("name", &self.name)
            .field("info", &self.info)
            .field("vmid_mask", &self.vmid_mask)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Non-owning handle kept in a domain's attached-unit list.
pub(crate) type UnitRef = Weak<TranslationUnit>;
