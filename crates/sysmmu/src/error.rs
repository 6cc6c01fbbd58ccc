//! Error type shared by every operation of the translation core.

use core::fmt;

/// Errors that can occur while editing page tables or programming translation units.
///
/// All errors are reported synchronously and are never retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysmmuError {
    /// A domain kind, address, size or geometry request is malformed.
    InvalidArgument,
    /// A page table, counter array or other bookkeeping allocation failed.
    OutOfMemory,
    /// The target address is already covered by a conflicting mapping.
    AddressInUse,
    /// An unmap request is smaller than the granularity that is actually installed.
    GranularityMismatch,
    /// The translation unit is already bound to a different page table.
    AlreadyAttached,
    /// The requested DMA window does not intersect the fixed aperture.
    RangeError,
}

impl fmt::Display for SysmmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SysmmuError::InvalidArgument => "invalid argument",
            SysmmuError::OutOfMemory => "out of memory",
            SysmmuError::AddressInUse => "address already in use",
            SysmmuError::GranularityMismatch => "size is smaller than the mapped page",
            SysmmuError::AlreadyAttached => "attached to another page table",
            SysmmuError::RangeError => "range outside of the fixed aperture",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for SysmmuError {}

/// Result type for translation core operations.
pub type Result<T> = core::result::Result<T, SysmmuError>;
