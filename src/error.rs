//! Recoverable allocator errors.
use thiserror::Error;

/// The error type returned by the fallible operations of [`Tlsf`].
///
/// Neither variant leaves the allocator in a different state than before the
/// call. Heap corruption is not represented here; it aborts the operation
/// with a panic (see [`Tlsf::deallocate`]).
///
/// [`Tlsf`]: crate::Tlsf
/// [`Tlsf::deallocate`]: crate::Tlsf::deallocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The request can never be satisfied, whatever the pool's state is.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] InvalidArgument),
    /// No free block is large enough right now. Freeing memory or adding a
    /// pool may make a retry succeed.
    #[error("out of memory: no free block can hold {size} bytes")]
    OutOfMemory {
        /// The adjusted request size (including any alignment slack).
        size: usize,
    },
}

/// Why an argument was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidArgument {
    #[error("zero-sized request")]
    ZeroSize,
    #[error("{size} bytes exceeds the largest size class ({max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("alignment {0} is not a power of two")]
    Alignment(usize),
    #[error("pool of {len} bytes is smaller than the minimum of {min} bytes")]
    PoolTooSmall { len: usize, min: usize },
}
