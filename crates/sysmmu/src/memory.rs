//! Memory backing the hardware-walked tables.
//!
//! Tables live in physical memory the translation unit reads directly, so the core needs to
//! allocate blocks with a known physical address, reach them from the CPU, and push CPU
//! writes out to the device's view before relying on them.
//!
//! Two modes are supported:
//! - Hardware: tables come from the kernel heap and are reached through the direct map.
//! - Emulated: tables come from a bounded, simulated physical region (testing mode).

use core::sync::atomic::{AtomicU32, Ordering, fence};

use crate::PhysicalAddress;
use crate::error::{Result, SysmmuError};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::{boxed::Box, vec::Vec};
#[cfg(any(test, feature = "software-emulation"))]
use core::sync::atomic::AtomicUsize;

/// Hook that makes CPU writes to `[phys, phys + len)` visible to the table walker.
pub type SyncForDevice = fn(PhysicalAddress, usize);

/// Provider of table memory.
pub enum TableMemory {
    /// Heap-backed tables reached through the kernel's direct map.
    Hardware {
        direct_map_offset: usize,
        sync_for_device: SyncForDevice,
    },
    /// Tables carved out of an emulated physical region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl TableMemory {
    /// Creates a hardware table provider.
    pub const fn hardware(direct_map_offset: usize, sync_for_device: SyncForDevice) -> Self {
        Self::Hardware {
            direct_map_offset,
            sync_for_device,
        }
    }

    /// Creates an emulated provider with `size` bytes of table memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(EMULATED_BASE, size))
    }

    /// Allocates a zeroed table block of `size` bytes, aligned to its own size.
    pub fn allocate(&self, size: usize) -> Result<PhysicalAddress> {
        debug_assert!(size.is_power_of_two(), "table sizes are powers of two");
        match self {
            Self::Hardware {
                direct_map_offset, ..
            } => {
                let layout = core::alloc::Layout::from_size_align(size, size)
                    .map_err(|_| SysmmuError::InvalidArgument)?;
                // SAFETY: Table layouts are never zero-sized.
                let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
                if ptr.is_null() {
                    log::error!("failed to allocate {:#x} bytes of table memory", size);
                    return Err(SysmmuError::OutOfMemory);
                }
                let phys = (ptr as usize).wrapping_sub(*direct_map_offset) as u64;
                PhysicalAddress::try_new(phys).ok_or_else(|| {
                    // SAFETY: Allocated just above with the same layout.
                    unsafe { alloc::alloc::dealloc(ptr, layout) };
                    log::error!("table memory at {:#x} is out of walker reach", phys);
                    SysmmuError::OutOfMemory
                })
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.allocate(size),
        }
    }

    /// Returns a table block to the provider.
    ///
    /// # Safety
    ///
    /// `phys` must come from [`TableMemory::allocate`] on this provider with the same `size`,
    /// and no reference obtained through [`TableMemory::entries`] may outlive this call.
    pub unsafe fn deallocate(&self, phys: PhysicalAddress, size: usize) {
        match self {
            Self::Hardware {
                direct_map_offset, ..
            } => {
                let ptr = (phys.as_u64() as usize).wrapping_add(*direct_map_offset) as *mut u8;
                // SAFETY: Caller guarantees the block was allocated with this layout.
                unsafe {
                    let layout = core::alloc::Layout::from_size_align_unchecked(size, size);
                    alloc::alloc::dealloc(ptr, layout);
                }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.deallocate(phys, size),
        }
    }

    /// Returns the entries of the table block at `phys`.
    ///
    /// # Safety
    ///
    /// `[phys, phys + count * 4)` must lie inside a live block allocated from this provider.
    pub unsafe fn entries(&self, phys: PhysicalAddress, count: usize) -> &[AtomicU32] {
        let ptr = match self {
            Self::Hardware {
                direct_map_offset, ..
            } => (phys.as_u64() as usize).wrapping_add(*direct_map_offset) as *const AtomicU32,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys, count),
        };
        // SAFETY: Caller guarantees the range is live table memory; AtomicU32 has the same
        // layout as the u32 words the walker reads.
        unsafe { core::slice::from_raw_parts(ptr, count) }
    }

    /// Flushes CPU writes to `[phys, phys + len)` out to the table walker.
    pub fn sync_for_device(&self, phys: PhysicalAddress, len: usize) {
        fence(Ordering::Release);
        match self {
            Self::Hardware {
                sync_for_device, ..
            } => sync_for_device(phys, len),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => {
                mem.syncs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Physical base of the emulated region, chosen to look like DRAM.
#[cfg(any(test, feature = "software-emulation"))]
pub const EMULATED_BASE: u64 = 0x8000_0000;

/// Emulated table memory for software simulation.
///
/// A simulated physical region with a bump allocator in front and a free list of returned
/// blocks behind it. Blocks are only ever reused for requests of exactly the same size,
/// which keeps them naturally aligned.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMemory {
    base: u64,
    /// The underlying memory, as the 32-bit words the walker reads.
    words: Box<[AtomicU32]>,
    /// Next bump allocation offset in bytes.
    next_alloc: AtomicUsize,
    free: spin::Mutex<Vec<(usize, usize)>>,
    live: AtomicUsize,
    syncs: AtomicUsize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    /// Creates a new emulated region of `size` bytes starting at physical address `base`.
    pub fn new(base: u64, size: usize) -> Self {
        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();
        Self {
            base,
            words,
            next_alloc: AtomicUsize::new(0),
            free: spin::Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    fn allocate(&self, size: usize) -> Result<PhysicalAddress> {
        let reused = {
            let mut free = self.free.lock();
            let index = free.iter().position(|&(_, len)| len == size);
            index.map(|i| free.swap_remove(i).0)
        };

        let offset = match reused {
            Some(offset) => {
                for word in &self.words[offset / 4..(offset + size) / 4] {
                    word.store(0, Ordering::Relaxed);
                }
                offset
            }
            None => self.bump(size)?,
        };

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(PhysicalAddress::new(self.base + offset as u64))
    }

    fn bump(&self, size: usize) -> Result<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + size - 1) & !(size - 1);
            let end = aligned + size;

            if end > self.words.len() * 4 {
                return Err(SysmmuError::OutOfMemory);
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(aligned);
            }
        }
    }

    fn deallocate(&self, phys: PhysicalAddress, size: usize) {
        let offset = (phys.as_u64() - self.base) as usize;
        self.free.lock().push((offset, size));
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    fn translate(&self, phys: PhysicalAddress, count: usize) -> *const AtomicU32 {
        let offset = phys
            .as_u64()
            .checked_sub(self.base)
            .expect("physical address below emulated memory") as usize;
        assert!(
            offset / 4 + count <= self.words.len(),
            "physical address out of bounds"
        );
        self.words[offset / 4..].as_ptr()
    }

    /// Returns the number of blocks currently allocated.
    pub fn live_blocks(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Returns how many flushes have been issued against this region.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Returns the size of the emulated region in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * 4
    }
}

#[cfg(test)]
impl TableMemory {
    pub(crate) fn emulation(&self) -> &EmulatedMemory {
        match self {
            Self::Emulated(mem) => mem,
            Self::Hardware { .. } => panic!("not an emulated table memory"),
        }
    }
}
