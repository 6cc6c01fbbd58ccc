//! Hand-off of the wide virtual address format from discovery to domain creation.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::VaWidth;

/// Single-slot mailbox carrying one pending request for a 36-bit address space.
///
/// Linking a device to a unit that supports the 36-bit format posts a request; the next
/// domain allocation takes it. Requests do not queue: a report arriving while one is
/// already pending is dropped, so if two wide units are linked before any domain exists
/// only the first domain created afterwards gets the wide format.
#[derive(Debug, Default)]
pub struct WideVaLatch {
    pending: AtomicBool,
}

impl WideVaLatch {
    /// Creates an empty latch.
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Reports the address width of a freshly linked unit.
    ///
    /// Returns `true` if this report filled the slot.
    pub fn report(&self, width: VaWidth) -> bool {
        if width != VaWidth::Bits36 {
            return false;
        }
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Empties the slot, returning the width the next domain should use.
    pub fn take(&self) -> VaWidth {
        if self.pending.swap(false, Ordering::AcqRel) {
            VaWidth::Bits36
        } else {
            VaWidth::Bits32
        }
    }

    /// Returns whether a wide request is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
