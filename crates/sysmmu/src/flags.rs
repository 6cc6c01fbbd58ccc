//! Mapping protection flags.

/// Protection flags requested by the caller of a map operation.
///
/// The bit values follow the DMA API protection word so they can be passed through from
/// the IOMMU core unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prot(u32);

impl Prot {
    /// Device may read.
    pub const READ: Prot = Prot(1 << 0);

    /// Device may write.
    pub const WRITE: Prot = Prot(1 << 1);

    /// Access is IO coherent.
    pub const CACHE: Prot = Prot(1 << 2);

    /// Device may not fetch instructions.
    pub const NOEXEC: Prot = Prot(1 << 3);

    /// Mapping targets device memory.
    pub const MMIO: Prot = Prot(1 << 4);

    /// Privileged access only.
    pub const PRIV: Prot = Prot(1 << 5);

    /// Creates empty flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw protection word.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw protection word.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns whether all flags in `other` are set.
    pub const fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with `other` added.
    pub const fn union(self, other: Prot) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns these flags with `other` removed.
    pub const fn difference(self, other: Prot) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns whether the resulting table entry should carry the shareable attribute.
    ///
    /// Privileged mappings never use IO coherency, so `PRIV` suppresses `CACHE`.
    pub const fn is_shareable(self) -> bool {
        let effective = if self.contains(Prot::PRIV) {
            self.difference(Prot::CACHE)
        } else {
            self
        };
        effective.contains(Prot::CACHE)
    }
}

impl core::ops::BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        self.union(rhs)
    }
}
