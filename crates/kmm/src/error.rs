//! Errors reported by the allocators.

use core::fmt;

use crate::arch::MapError;

/// Why an allocation or release could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No block is available at any order up to the maximum.
    OutOfMemory,
    /// An address is not aligned to the granularity of the operation.
    Misaligned,
    /// The requested order is larger than the allocator's maximum order.
    InvalidOrder,
    /// The address does not name the start of a live allocation.
    InvalidAddress,
    /// The architecture mapper rejected a translation.
    MappingFailure(MapError),
}

impl From<MapError> for AllocError {
    fn from(error: MapError) -> Self {
        AllocError::MappingFailure(error)
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("out of memory"),
            AllocError::Misaligned => f.write_str("misaligned address"),
            AllocError::InvalidOrder => f.write_str("order out of range"),
            AllocError::InvalidAddress => f.write_str("address is not a live allocation"),
            AllocError::MappingFailure(error) => write!(f, "mapping failed: {}", error),
        }
    }
}
