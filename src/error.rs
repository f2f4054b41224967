//! Error types for the object-cache allocator.

use core::fmt;

/// Recoverable errors that can be returned from a fallible cache operation.
///
/// Invariant violations (a destroyed cache with outstanding slabs, a free of
/// an address the hash index has never seen, an alignment greater than the
/// page size at creation) are not part of this type: they indicate a bug in
/// the caller or a corrupted allocator and are reported with [`panic!`]
/// instead, per the allocator's fatal-by-default error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The backing arena could not satisfy a slab growth request.
    OutOfMemory,
    /// The object's constructor returned a nonzero status. The object has
    /// already been returned to the slab layer; no destructor runs.
    ConstructorFailure,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::OutOfMemory => write!(f, "out of memory"),
            CacheError::ConstructorFailure => write!(f, "constructor failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CacheError {}

/// Result type for fallible cache operations.
pub type Result<T> = core::result::Result<T, CacheError>;
