//! Translation unit register interface.
//!
//! Every unit exposes the same 32-bit register file. Registers suffixed `_VM` are banked once
//! per virtual-machine context at a stride of [`VM_STRIDE`]; the stream table registers are
//! banked per PMMU through [`REG_MMU_PMMU_INDICATOR`].

use alloc::sync::Arc;
use core::ptr::{read_volatile, write_volatile};

pub const REG_MMU_VERSION: usize = 0x0034;
pub const REG_MMU_NUM_CONTEXT: usize = 0x0100;
pub const REG_MMU_PMMU_INDICATOR: usize = 0x2FFC;
pub const REG_MMU_PMMU_INFO: usize = 0x3000;
pub const REG_MMU_SWALKER_INFO: usize = 0x3004;

pub const REG_MMU_CTRL_VM: usize = 0x8000;
pub const REG_MMU_ALL_INV_VM: usize = 0x8010;
pub const REG_MMU_RANGE_INV_START_VPN_VM: usize = 0x8020;
pub const REG_MMU_RANGE_INV_END_VPN_AND_TRIG_VM: usize = 0x8024;
pub const REG_MMU_CONTEXT0_CFG_FLPT_BASE_VM: usize = 0x8404;
pub const REG_MMU_CONTEXT0_CFG_ATTRIBUTE_VM: usize = 0x8408;

/// Distance between the banks of a `_VM` register.
pub const VM_STRIDE: usize = 0x1000;

/// Maximum number of virtual-machine contexts per unit.
pub const MAX_VIDS: u32 = 8;

/// Maximum number of PMMUs per unit.
pub const PMMU_MAX_NUM: u32 = 8;

pub const MMU_CTRL_ENABLE: u32 = 0x5;
pub const MMU_CTRL_DISABLE: u32 = 0x0;

pub const CFG_QOS_OVRRIDE: u32 = 1 << 11;

/// Returns the QoS field of the context attribute register.
pub const fn cfg_qos(qos: u32) -> u32 {
    (qos & 0xF) << 7
}

/// Returns the bank of `reg` belonging to context `vmid`.
pub const fn vm_register(reg: usize, vmid: u32) -> usize {
    reg + vmid as usize * VM_STRIDE
}

pub const fn reg_stream_cfg(index: u32) -> usize {
    0x4000 + index as usize * 0x10
}

pub const fn reg_stream_match_cfg(index: u32) -> usize {
    0x4004 + index as usize * 0x10
}

pub const fn reg_stream_match_sid_value(index: u32) -> usize {
    0x4008 + index as usize * 0x10
}

pub const fn reg_stream_match_sid_mask(index: u32) -> usize {
    0x400C + index as usize * 0x10
}

pub const fn mmu_num_context(reg: u32) -> u32 {
    reg & 0x1F
}

pub const fn mmu_swalker_info_num_pmmu(reg: u32) -> u32 {
    reg & 0xFFFF
}

pub const fn mmu_pmmu_info_va_width_36(reg: u32) -> bool {
    reg & 0x1 != 0
}

pub const fn mmu_pmmu_info_num_stream_table(reg: u32) -> u32 {
    (reg >> 16) & 0xFFFF
}

pub const fn set_pmmu_indicator(pmmu: u32) -> u32 {
    pmmu & 0xF
}

pub const fn mmu_stream_cfg_mask(reg: u32) -> u32 {
    reg & (0xFFFF_0000 | 0x7F)
}

pub const fn mmu_stream_match_cfg_mask(reg: u32) -> u32 {
    reg & 0x300
}

/// Decoded hardware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl MmuVersion {
    /// Decodes the version register.
    pub const fn from_register(reg: u32) -> Self {
        let raw = reg >> 17;
        Self {
            major: (raw >> 11) & 0xF,
            minor: (raw >> 4) & 0x7F,
            revision: raw & 0xF,
        }
    }
}

impl core::fmt::Display for MmuVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Access to one unit's register file.
///
/// Implementations must be callable from any CPU; serialization of multi-register
/// sequences is the caller's job (the unit lock).
pub trait RegisterAccess: Send + Sync {
    /// Reads the 32-bit register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes the 32-bit register at `offset`.
    fn write(&self, offset: usize, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Arc<T> {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// A memory-mapped register file.
///
/// All reads and writes use volatile operations so the compiler never elides or merges
/// device accesses.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegisters {
    base: usize,
    size: usize,
}

impl MmioRegisters {
    /// Creates a register file at `base`.
    ///
    /// # Safety
    ///
    /// The caller must ensure `[base, base + size)` is mapped device memory belonging to a
    /// translation unit for as long as this value is used.
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read offset out of bounds");
        // SAFETY: Caller of `new` ensured the region is valid MMIO.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write offset out of bounds");
        // SAFETY: Caller of `new` ensured the region is valid MMIO.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use recording::RecordingRegisters;

#[cfg(any(test, feature = "software-emulation"))]
mod recording {
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    use super::{REG_MMU_PMMU_INDICATOR, REG_MMU_PMMU_INFO, RegisterAccess};

    #[derive(Default)]
    struct RecorderState {
        values: BTreeMap<usize, u32>,
        pmmu_info: Vec<u32>,
        indicator: u32,
        writes: Vec<(usize, u32)>,
    }

    /// A register sink for software emulation.
    ///
    /// Reads return preset values (or whatever was last written), `PMMU_INFO` is banked by
    /// the last value written to the PMMU indicator, and every write is recorded in order.
    #[derive(Default)]
    pub struct RecordingRegisters {
        state: spin::Mutex<RecorderState>,
    }

    impl RecordingRegisters {
        /// Creates a register file that reads as all zeroes.
        pub fn new() -> Self {
            Self::default()
        }

        /// Presets the value read back from `offset`.
        pub fn with_value(self, offset: usize, value: u32) -> Self {
            self.state.lock().values.insert(offset, value);
            self
        }

        /// Presets the per-PMMU values of the `PMMU_INFO` register.
        pub fn with_pmmu_info(self, info: Vec<u32>) -> Self {
            self.state.lock().pmmu_info = info;
            self
        }

        /// Returns every write so far, oldest first.
        pub fn writes(&self) -> Vec<(usize, u32)> {
            self.state.lock().writes.clone()
        }

        /// Returns the values written to `offset`, oldest first.
        pub fn writes_to(&self, offset: usize) -> Vec<u32> {
            self.state
                .lock()
                .writes
                .iter()
                .filter(|(off, _)| *off == offset)
                .map(|(_, value)| *value)
                .collect()
        }

        /// Forgets recorded writes, keeping register values.
        pub fn clear_writes(&self) {
            self.state.lock().writes.clear();
        }
    }

    impl RegisterAccess for RecordingRegisters {
        fn read(&self, offset: usize) -> u32 {
            let state = self.state.lock();
            if offset == REG_MMU_PMMU_INFO {
                return state
                    .pmmu_info
                    .get(state.indicator as usize)
                    .copied()
                    .unwrap_or(0);
            }
            state.values.get(&offset).copied().unwrap_or(0)
        }

        fn write(&self, offset: usize, value: u32) {
            let mut state = self.state.lock();
            if offset == REG_MMU_PMMU_INDICATOR {
                state.indicator = value;
            }
            state.values.insert(offset, value);
            state.writes.push((offset, value));
        }
    }
}
