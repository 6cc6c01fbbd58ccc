//! Deferred translation-cache invalidation.

use core::ops::Range;

use crate::Iova;

/// Accumulates the IO virtual ranges whose cached translations went stale.
///
/// Unmapping never invalidates on its own; each removed range is folded into a gather and
/// the owner flushes them all at once by passing the gather to
/// [`Domain::iotlb_sync`](crate::Domain::iotlb_sync). Ranges are coalesced into their
/// covering span, so a sync may invalidate addresses that were never unmapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotlbGather {
    start: u64,
    end: u64,
}

impl IotlbGather {
    /// Creates an empty gather.
    pub const fn new() -> Self {
        Self {
            start: u64::MAX,
            end: 0,
        }
    }

    /// Creates a gather covering `[iova, iova + size)`.
    pub fn with_range(iova: Iova, size: usize) -> Self {
        let mut gather = Self::new();
        gather.add_range(iova, size);
        gather
    }

    /// Folds `[iova, iova + size)` into the pending span.
    pub fn add_range(&mut self, iova: Iova, size: usize) {
        if size == 0 {
            return;
        }
        let end = iova.as_u64().saturating_add(size as u64);
        self.start = self.start.min(iova.as_u64());
        self.end = self.end.max(end);
    }

    /// Returns whether nothing is pending.
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns the pending span, end exclusive.
    pub fn range(&self) -> Option<Range<Iova>> {
        if self.is_empty() {
            None
        } else {
            Some(Iova::new(self.start)..Iova::new(self.end))
        }
    }

    /// Forgets the pending span, typically after a sync.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for IotlbGather {
    fn default() -> Self {
        Self::new()
    }
}
