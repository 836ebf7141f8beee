//! In-place memory block headers.
use core::{mem, ptr::NonNull};

use super::GRANULARITY;

/// The header of a memory block. It's `GRANULARITY` bytes long and
/// immediately followed by the payload.
// The alignment matches `GRANULARITY` so that `size_of::<BlockHdr>()` is
// exactly one granule.
#[repr(C)]
#[cfg_attr(target_pointer_width = "16", repr(align(4)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
pub(super) struct BlockHdr {
    /// The size of the payload, excluding this header.
    ///
    ///  - `bit[0]` ([`SIZE_FREE`]) indicates whether the block is a free
    ///    memory block or not.
    ///
    ///  - `bit[1]` ([`SIZE_LAST`]) indicates whether the block is the
    ///    tail sentinel of a pool or not.
    ///
    ///  - `bit[GRANULARITY_LOG2..]` ([`SIZE_SIZE_MASK`]) represents the size.
    ///
    pub size: usize,
    /// The physically preceding block. `None` only for a pool's head
    /// sentinel.
    pub prev_phys_block: Option<NonNull<BlockHdr>>,
}

/// The bit of [`BlockHdr::size`] indicating whether the block is a free memory
/// block or not.
pub(super) const SIZE_FREE: usize = 1;
/// The bit of [`BlockHdr::size`] indicating whether the block is the tail
/// sentinel of a pool or not.
pub(super) const SIZE_LAST: usize = 2;
/// The bits of [`BlockHdr::size`] indicating the block's payload size.
pub(super) const SIZE_SIZE_MASK: usize = !(GRANULARITY - 1);

/// The size of [`BlockHdr`], i.e., the per-block overhead.
pub(super) const BLOCK_HDR_SIZE: usize = mem::size_of::<BlockHdr>();

/// The minimum payload size. A free block keeps its free list links there.
pub(super) const BLOCK_SIZE_MIN: usize = mem::size_of::<FreeBlockHdr>() - BLOCK_HDR_SIZE;

const _: () = assert!(BLOCK_HDR_SIZE == GRANULARITY);
const _: () = assert!(BLOCK_SIZE_MIN == GRANULARITY);

impl BlockHdr {
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size & SIZE_SIZE_MASK
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        (self.size & SIZE_FREE) != 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        (self.size & SIZE_LAST) != 0
    }

    /// Get the next block.
    ///
    /// # Safety
    ///
    /// `self.size` must be telling the truth.
    #[inline]
    pub unsafe fn next_phys_block(&self) -> Option<NonNull<BlockHdr>> {
        if self.is_last() {
            None
        } else {
            // Safety: Since `self.size` is not lying, the next block should
            //         exist at a non-null location.
            Some(
                NonNull::new_unchecked(
                    (self as *const _ as *mut u8).add(BLOCK_HDR_SIZE + self.payload_size()),
                )
                .cast(),
            )
        }
    }

    /// Get the payload of the specified block.
    #[inline]
    pub fn payload(block: NonNull<BlockHdr>) -> NonNull<u8> {
        // Safety: A block header is never placed at the end of the address
        //         space because it's always followed by a tail sentinel.
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HDR_SIZE)) }
    }

    /// Get the header of the block whose payload starts at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr - BLOCK_HDR_SIZE` must not wrap around.
    #[inline]
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        NonNull::new_unchecked(ptr.as_ptr().sub(BLOCK_HDR_SIZE)).cast()
    }
}

/// The header of a free memory block.
#[repr(C)]
#[derive(Debug)]
pub(super) struct FreeBlockHdr {
    pub common: BlockHdr,
    pub next_free: Option<NonNull<FreeBlockHdr>>,
    pub prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The header of a pool's head sentinel, a permanently used block whose
/// payload links the pools managed by a `Tlsf` together.
#[repr(C)]
#[derive(Debug)]
pub(super) struct PoolHdr {
    pub common: BlockHdr,
    pub next_pool: Option<NonNull<PoolHdr>>,
    /// The length of the pool in bytes, including every sentinel.
    pub len: usize,
}

/// The payload size of a head sentinel.
pub(super) const POOL_HDR_PAYLOAD_SIZE: usize = mem::size_of::<PoolHdr>() - BLOCK_HDR_SIZE;

const _: () = assert!(POOL_HDR_PAYLOAD_SIZE % GRANULARITY == 0);
