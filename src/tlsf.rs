//! The TLSF allocator core
use core::{
    hint::unreachable_unchecked,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
};

use crate::{
    int::BinInteger,
    utils::{align_down, align_up},
    Error, InvalidArgument,
};

mod bitmap;
mod block;
mod map;
mod walk;

use self::{
    bitmap::BitmapIndex,
    block::{
        BlockHdr, FreeBlockHdr, PoolHdr, BLOCK_HDR_SIZE, BLOCK_SIZE_MIN, POOL_HDR_PAYLOAD_SIZE,
        SIZE_FREE, SIZE_LAST, SIZE_SIZE_MASK,
    },
    map::MapParams,
};
pub use self::walk::{BlockInfo, Blocks};

#[doc = svgbobdoc::transform!(
/// The TLSF header (top-level) data structure.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                       FLLEN = 8
///                               ,-----+-----+-----+-----+-----+-----+-----+-----,
///              fl_bitmap: FLBitmap = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+-----+-----+
///                      min size | 2¹⁴ | 2¹³ | 2¹² | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  0  |
///                               '-----+-----+-----+--+--+-----+-----+-----+-----'
///                                                    |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                                     |
///                                                    v                      SLLEN = 8
///                                  ,-----+-----+-----+-----+-----+-----+-----+-----,
///        "sl_bitmap[4]: SLBitmap"= |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///              min size 2¹¹(1+n/8) |  7  |  6  |  5  |  4  |  3  |  2  |  1  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///                       first_free |     |     |  O  |     |     |     |     |     |
///                                  '-----+-----+--|--+-----+-----+-----+-----+-----'
///                                                 |
///                                                 |  size = 3328..3584
///                                                 |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                                   |
///                                                 |
///             ,-----------------------------------'
///             | ,---+---+-------,    ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |    +---+---'       |
///               |               |    |               |    |               |
///               |               |    |               |    |               |
///               '---------------'    '---------------'    '---------------'
///                  3328 bytes           3456 bytes           3328 bytes
/// ```
/// </center>
///
/// (The minimum sizes shown are for `SLLEN = 8` on a 64-bit target.)
///
/// # Properties
///
/// The allocation granularity ([`GRANULARITY`]) is `size_of::<usize>() * 2`
/// bytes. It is the size of a block header, the minimum payload size, and the
/// alignment of every returned pointer.
///
/// Sizes below `GRANULARITY * SLLEN` are all stored in the first first-level
/// class, one list per `GRANULARITY` bytes. Above that, each power-of-two
/// range is divided into `SLLEN` lists.
///
/// The maximum block size is [`Self::MAX_BLOCK_SIZE`]; the maximum request
/// size is [`Self::MAX_ALLOC_SIZE`].
///
/// # Pools
///
/// Each memory pool handed to the allocator is capped by two sentinel blocks:
/// a head sentinel, which links the pools together, and a tail sentinel,
/// which terminates the physical block chain. Both are permanently used, so
/// coalescing never has to check for a pool boundary. See [`POOL_OVERHEAD`].
///
/// # Thread Safety
///
/// `Tlsf` has no internal synchronization. All mutating operations take
/// `&mut self`; sharing one instance between threads requires an external
/// lock, or one instance per thread.
)]
#[derive(Debug)]
pub struct Tlsf<'pool, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> {
    bitmap: BitmapIndex<FLBitmap, SLBitmap, FLLEN>,
    first_free: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
    first_pool: Option<NonNull<PoolHdr>>,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf` and
//         have no interior mutability, so these are safe.
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Send
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Sync
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

/// `Tlsf` with `SLLEN = 32` and a maximum block size of 4 GiB (on 64-bit
/// targets) or 2 GiB (on 32-bit targets).
pub type DefaultTlsf<'pool> = Tlsf<'pool, u32, u32, 24, 32>;

/// The allocation granularity.
///
/// It is `size_of::<usize>() * 2` bytes: the size of a block header and the
/// minimum payload size.
pub const GRANULARITY: usize = core::mem::size_of::<usize>() * 2;

const GRANULARITY_LOG2: u32 = GRANULARITY.trailing_zeros();

const USIZE_BITS: u32 = usize::BITS;

/// The number of bytes each allocation consumes in addition to its payload.
pub const BLOCK_OVERHEAD: usize = BLOCK_HDR_SIZE;

/// The number of bytes of each pool used by the allocator itself: the head
/// sentinel, the header of the initial free block, and the tail sentinel.
pub const POOL_OVERHEAD: usize = BLOCK_HDR_SIZE + POOL_HDR_PAYLOAD_SIZE + BLOCK_HDR_SIZE * 2;

/// The minimum length of a (`GRANULARITY`-aligned) pool.
pub const MIN_POOL_SIZE: usize = POOL_OVERHEAD + BLOCK_SIZE_MIN;

/// The minimum size of the free block split off in front of an over-aligned
/// allocation.
const GAP_MIN: usize = BLOCK_HDR_SIZE + BLOCK_SIZE_MIN;

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize> Default
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    fn default() -> Self {
        Self::INIT
    }
}

impl<'pool, FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize>
    Tlsf<'pool, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    /// An allocator without any pools.
    pub const INIT: Self = Self {
        bitmap: BitmapIndex::INIT,
        first_free: [[None; SLLEN]; FLLEN],
        first_pool: None,
        _phantom: {
            let () = Self::VALID;
            PhantomData
        },
    };

    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        if FLLEN == 0 {
            panic!("`FLLEN` must not be zero");
        }
        if SLLEN == 0 {
            panic!("`SLLEN` must not be zero");
        }
        if !SLLEN.is_power_of_two() {
            panic!("`SLLEN` is not power of two");
        }
        if (FLBitmap::BITS as u128) < FLLEN as u128 {
            panic!("`FLBitmap` should contain at least `FLLEN` bits");
        }
        if (SLBitmap::BITS as u128) < SLLEN as u128 {
            panic!("`SLBitmap` should contain at least `SLLEN` bits");
        }
        if FLLEN as u128 - 1 + SLLEN.trailing_zeros() as u128 + GRANULARITY_LOG2 as u128
            >= USIZE_BITS as u128
        {
            panic!("`FLLEN` is too large for `usize`");
        }
        if FLLEN == 1 && SLLEN == 1 {
            panic!("`FLLEN = 1, SLLEN = 1` leaves no room for any block");
        }
    };

    /// `SLLEN.log2()`
    const SLI: u32 = SLLEN.trailing_zeros();

    const MAP: MapParams = MapParams {
        sli: Self::SLI,
        fllen: FLLEN,
    };

    /// The maximum payload size of a single block. A pool larger than
    /// `MAX_BLOCK_SIZE + POOL_OVERHEAD` is divided into multiple pools.
    pub const MAX_BLOCK_SIZE: usize = Self::MAP.max_block_size();

    /// The maximum size accepted by [`Self::allocate`]. Any larger request
    /// fails with [`InvalidArgument::TooLarge`].
    pub const MAX_ALLOC_SIZE: usize = Self::MAP.max_alloc_size();

    /// Create an allocator managing the specified memory pool.
    ///
    /// # Errors
    ///
    /// [`InvalidArgument::PoolTooSmall`] if `pool` cannot hold the sentinel
    /// blocks and a minimum-sized free block after being aligned to
    /// [`GRANULARITY`].
    ///
    /// # Examples
    ///
    /// ```
    /// use segfit::DefaultTlsf;
    /// use std::mem::MaybeUninit;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// let mut tlsf = DefaultTlsf::new(&mut pool).unwrap();
    /// let ptr = tlsf.allocate(100).unwrap();
    /// unsafe { tlsf.deallocate(ptr.as_ptr()) };
    /// ```
    pub fn new(pool: &'pool mut [MaybeUninit<u8>]) -> Result<Self, Error> {
        let mut tlsf = Self::INIT;
        tlsf.add_pool(pool)?;
        Ok(tlsf)
    }

    /// Add a memory pool specified by a slice.
    ///
    /// Returns the number of bytes made available for allocation (the
    /// payload size of the new free block or blocks).
    ///
    /// The pool must outlive `self`:
    ///
    /// ```rust,compile_fail
    /// use segfit::DefaultTlsf;
    /// use std::mem::MaybeUninit;
    /// let mut tlsf = DefaultTlsf::INIT;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// tlsf.add_pool(&mut pool).unwrap();
    /// drop(pool); // dropping the memory block first is not allowed
    /// drop(tlsf);
    /// ```
    ///
    /// # Time Complexity
    ///
    /// See [`Self::add_pool_ptr`].
    ///
    /// # Errors
    ///
    /// [`InvalidArgument::PoolTooSmall`], in which case `self` is unchanged.
    #[inline]
    pub fn add_pool(&mut self, pool: &'pool mut [MaybeUninit<u8>]) -> Result<usize, Error> {
        // Safety: `pool` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe { self.add_pool_ptr(NonNull::new_unchecked(pool as *mut [_] as *mut [u8])) }
    }

    /// Add a memory pool specified by a slice pointer.
    ///
    /// The start of the pool is rounded up and its end is rounded down to
    /// [`GRANULARITY`] bytes.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(pool.len())`) because
    /// it might need to divide the pool to meet the maximum block size
    /// requirement ([`Self::MAX_BLOCK_SIZE`]).
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `self`.
    pub unsafe fn add_pool_ptr(&mut self, pool: NonNull<[u8]>) -> Result<usize, Error> {
        let len = pool.len();

        // Round up the starting address
        let unaligned_start = pool.as_ptr() as *mut u8 as usize;
        let mut start = align_up(unaligned_start, GRANULARITY);

        // Calculate the usable length
        let mut size = if let Some(x) = len
            .checked_sub(start.wrapping_sub(unaligned_start))
            .filter(|&x| x >= MIN_POOL_SIZE)
        {
            // Round down
            align_down(x, GRANULARITY)
        } else {
            log::trace!("rejecting pool {:p}: {} bytes", pool, len);
            return Err(InvalidArgument::PoolTooSmall {
                len,
                min: MIN_POOL_SIZE,
            }
            .into());
        };

        let max_pool_len = Self::MAX_BLOCK_SIZE + POOL_OVERHEAD;
        let mut available = 0;

        while size >= MIN_POOL_SIZE {
            let pool_len = size.min(max_pool_len);
            debug_assert_eq!(pool_len % GRANULARITY, 0);

            // Safety: `start` is not zero.
            available += self.insert_pool(NonNull::new_unchecked(start as *mut u8), pool_len);

            start = start.wrapping_add(pool_len);
            size -= pool_len;
        }

        if size > 0 {
            log::trace!("{} bytes at the end of {:p} left unused", size, pool);
        }
        log::debug!(
            "added pool {:p} ({} bytes): {} bytes available",
            pool,
            len,
            available
        );

        Ok(available)
    }

    /// Initialize `start..start + len` as a pool consisting of a head sentinel,
    /// a free block, and a tail sentinel. Returns the free block's size.
    ///
    /// # Safety
    ///
    /// The memory block must be owned by `self` from now on and aligned to
    /// `GRANULARITY`. `len` must be a multiple of `GRANULARITY` in range
    /// `MIN_POOL_SIZE..=MAX_BLOCK_SIZE + POOL_OVERHEAD`.
    unsafe fn insert_pool(&mut self, start: NonNull<u8>, len: usize) -> usize {
        let head = start.cast::<PoolHdr>();
        head.as_ptr().write(PoolHdr {
            common: BlockHdr {
                size: POOL_HDR_PAYLOAD_SIZE,
                prev_phys_block: None,
            },
            next_pool: self.first_pool,
            len,
        });

        let size = len - POOL_OVERHEAD;
        let block: NonNull<BlockHdr> =
            NonNull::new_unchecked(start.as_ptr().add(BLOCK_HDR_SIZE + POOL_HDR_PAYLOAD_SIZE))
                .cast();
        block.as_ptr().write(BlockHdr {
            size: size | SIZE_FREE,
            prev_phys_block: Some(head.cast()),
        });

        let tail: NonNull<BlockHdr> =
            NonNull::new_unchecked(start.as_ptr().add(len - BLOCK_HDR_SIZE)).cast();
        tail.as_ptr().write(BlockHdr {
            size: SIZE_LAST,
            prev_phys_block: Some(block),
        });
        debug_assert_eq!(block.as_ref().next_phys_block(), Some(tail));

        self.link_free_block(block.cast(), size);
        self.first_pool = Some(head);

        size
    }

    /// Validate a request size and convert it to a block payload size.
    #[inline]
    fn adjust_request_size(size: usize) -> Result<usize, Error> {
        if size == 0 {
            return Err(InvalidArgument::ZeroSize.into());
        }
        if size > Self::MAX_ALLOC_SIZE {
            return Err(InvalidArgument::TooLarge {
                size,
                max: Self::MAX_ALLOC_SIZE,
            }
            .into());
        }

        // `MAX_ALLOC_SIZE` is a multiple of `GRANULARITY`, so this neither
        // overflows nor exceeds `MAX_ALLOC_SIZE`
        Ok(align_up(size, GRANULARITY).max(BLOCK_SIZE_MIN))
    }

    /// Insert the specified free block to the corresponding free block list.
    ///
    /// Updates `FreeBlockHdr::{prev_free, next_free}`.
    ///
    /// # Safety
    ///
    ///  - `*block.as_ptr()` must be owned by `self`. (It does not have to be
    ///    initialized, however.)
    ///  - `size` must have a corresponding free list, which does not currently
    ///    contain `block`.
    ///
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let (fl, sl) = Self::MAP
            .map_floor(size)
            .unwrap_or_else(|| unreachable_unchecked());
        let first_free = &mut self.first_free[fl][sl];
        let next_free = mem::replace(first_free, Some(block));

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = Some(block);
        }

        block.as_mut().next_free = next_free;
        block.as_mut().prev_free = None;

        self.bitmap.set(fl, sl);
    }

    /// Remove the specified free block from the corresponding free block list.
    ///
    /// # Safety
    ///
    ///  - `size` must represent the specified free block's size.
    ///  - The free block must be currently included in a free block list.
    ///
    unsafe fn unlink_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let next_free = block.as_mut().next_free;
        let prev_free = block.as_mut().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            let (fl, sl) = Self::MAP
                .map_floor(size)
                .unwrap_or_else(|| unreachable_unchecked());
            let first_free = &mut self.first_free[fl][sl];

            debug_assert_eq!(*first_free, Some(block));
            *first_free = next_free;

            if next_free.is_none() {
                // The free list is now empty - update the bitmap
                self.bitmap.clear(fl, sl);
            }
        }
    }

    /// Remove the first block of the free block list `(fl, sl)`.
    ///
    /// # Safety
    ///
    /// The list must be non-empty.
    unsafe fn pop_free_block(&mut self, fl: usize, sl: usize) -> NonNull<FreeBlockHdr> {
        let first_free = &mut self.first_free[fl][sl];
        let block = first_free.unwrap_or_else(|| unreachable_unchecked());
        debug_assert!(block.as_ref().common.is_free());
        debug_assert_eq!(block.as_ref().prev_free, None);

        let next_free = block.as_ref().next_free;
        *first_free = next_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = None;
        } else {
            // The free list is now empty - update the bitmap
            self.bitmap.clear(fl, sl);
        }

        block
    }

    /// Search for a non-empty free block list for allocation.
    #[inline]
    fn search_suitable_free_block_list_for_allocation(
        &self,
        min_size: usize,
    ) -> Option<(usize, usize)> {
        let (fl, sl) = Self::MAP.map_ceil(min_size)?;
        self.bitmap.find_suitable(fl, sl, SLLEN)
    }

    /// Take a free block whose payload is at least `size` bytes long out of
    /// the free lists. The returned block still has `SIZE_FREE`.
    #[inline]
    fn take_free_block(&mut self, size: usize) -> Result<NonNull<BlockHdr>, Error> {
        let Some((fl, sl)) = self.search_suitable_free_block_list_for_allocation(size) else {
            log::trace!("no free block can hold {} bytes", size);
            return Err(Error::OutOfMemory { size });
        };

        // Safety: `find_suitable` only returns non-empty lists
        let block = unsafe { self.pop_free_block(fl, sl) };

        // Safety: The block is owned by `self`
        debug_assert!(unsafe { block.as_ref() }.common.payload_size() >= size);

        Ok(block.cast())
    }

    /// Split `block`'s payload at `keep` bytes. The second part becomes a new
    /// block, which is returned without any flags and without being linked to
    /// a free list. `block` keeps its `SIZE_FREE` flag.
    ///
    /// # Safety
    ///
    ///  - `block` must be a valid non-sentinel block owned by `self`.
    ///  - `keep` must be a multiple of `GRANULARITY`.
    ///  - `block`'s payload must be at least `keep + BLOCK_HDR_SIZE +
    ///    BLOCK_SIZE_MIN` bytes long.
    unsafe fn split_block(mut block: NonNull<BlockHdr>, keep: usize) -> NonNull<BlockHdr> {
        let size_and_flags = block.as_ref().size;
        debug_assert!((size_and_flags & SIZE_LAST) == 0);
        debug_assert!((size_and_flags & SIZE_SIZE_MASK) >= keep + BLOCK_HDR_SIZE + BLOCK_SIZE_MIN);

        let remaining = (size_and_flags & SIZE_SIZE_MASK) - keep - BLOCK_HDR_SIZE;
        let mut next_phys_block = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());

        let new_block: NonNull<BlockHdr> =
            NonNull::new_unchecked(BlockHdr::payload(block).as_ptr().add(keep)).cast();
        new_block.as_ptr().write(BlockHdr {
            size: remaining,
            prev_phys_block: Some(block),
        });
        next_phys_block.as_mut().prev_phys_block = Some(new_block);

        block.as_mut().size = keep | (size_and_flags & SIZE_FREE);

        new_block
    }

    /// Turn a block split off by [`Self::split_block`] into a free block,
    /// merging it with the next block if that one is free as well.
    ///
    /// # Safety
    ///
    /// The previous block must be a used block.
    unsafe fn link_remainder(&mut self, mut block: NonNull<BlockHdr>) {
        let mut size = block.as_ref().payload_size();
        let next_phys_block = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());

        if next_phys_block.as_ref().is_free() {
            let next_phys_block_size = next_phys_block.as_ref().payload_size();
            self.unlink_free_block(next_phys_block.cast(), next_phys_block_size);
            size += BLOCK_HDR_SIZE + next_phys_block_size;

            let mut next_next_phys_block = next_phys_block
                .as_ref()
                .next_phys_block()
                .unwrap_or_else(|| unreachable_unchecked());
            next_next_phys_block.as_mut().prev_phys_block = Some(block);
        }

        block.as_mut().size = size | SIZE_FREE;
        self.link_free_block(block.cast(), size);
    }

    /// Return the part of `block`'s payload beyond `size` bytes to the free
    /// lists if it's large enough to form a block.
    ///
    /// # Safety
    ///
    /// `block` must be a valid non-sentinel block owned by `self` and not
    /// included in any free list. `size` must be a multiple of `GRANULARITY`.
    #[inline]
    unsafe fn trim_block(&mut self, block: NonNull<BlockHdr>, size: usize) {
        if block.as_ref().payload_size() >= size + BLOCK_HDR_SIZE + BLOCK_SIZE_MIN {
            let remainder = Self::split_block(block, size);
            self.link_remainder(remainder);
        }
    }

    /// Turn a block taken by [`Self::take_free_block`] into a used block of
    /// at least `size` bytes and get its payload.
    #[inline]
    unsafe fn prepare_used_block(
        &mut self,
        mut block: NonNull<BlockHdr>,
        size: usize,
    ) -> NonNull<u8> {
        self.trim_block(block, size);
        block.as_mut().size &= !SIZE_FREE;
        BlockHdr::payload(block)
    }

    /// Attempt to allocate a block of memory.
    ///
    /// Returns the starting address of the allocated memory block, which is
    /// aligned to [`GRANULARITY`] bytes and at least `size` bytes long.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Errors
    ///
    ///  - [`InvalidArgument::ZeroSize`] if `size` is zero.
    ///  - [`InvalidArgument::TooLarge`] if `size` exceeds
    ///    [`Self::MAX_ALLOC_SIZE`].
    ///  - [`Error::OutOfMemory`] if no free block is large enough.
    ///
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let size = Self::adjust_request_size(size)?;
        let block = self.take_free_block(size)?;

        // Safety: `block` was just taken out of a free list
        Ok(unsafe { self.prepare_used_block(block, size) })
    }

    /// Attempt to allocate a block of memory whose starting address is a
    /// multiple of `align`.
    ///
    /// For `align <= GRANULARITY`, this is equivalent to [`Self::allocate`].
    /// Otherwise, up to `align + 2 * GRANULARITY` extra bytes are needed to
    /// find a suitable block; the unused leading part of the block is returned
    /// to the free lists.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Errors
    ///
    /// Those of [`Self::allocate`], plus [`InvalidArgument::Alignment`] if
    /// `align` is not a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        if !align.is_power_of_two() {
            return Err(InvalidArgument::Alignment(align).into());
        }
        if align <= GRANULARITY {
            return self.allocate(size);
        }

        let size = Self::adjust_request_size(size)?;

        // Reserve room for a leading free block of at least `GAP_MIN` bytes
        let search_size = size.saturating_add(align).saturating_add(GAP_MIN);
        if search_size > Self::MAX_ALLOC_SIZE {
            return Err(InvalidArgument::TooLarge {
                size: search_size,
                max: Self::MAX_ALLOC_SIZE,
            }
            .into());
        }

        let mut block = self.take_free_block(search_size)?;

        unsafe {
            // Decide the starting address of the payload
            let unaligned_ptr = BlockHdr::payload(block).as_ptr() as usize;
            let mut ptr = align_up(unaligned_ptr, align);
            let mut gap = ptr - unaligned_ptr;

            // The leading part must be large enough to form a free block
            if gap != 0 && gap < GAP_MIN {
                let offset = (GAP_MIN - gap).max(align);
                ptr = align_up(ptr + offset, align);
                gap = ptr - unaligned_ptr;
            }

            if gap != 0 {
                // Split off the leading part and return it to the free lists.
                // Its physical predecessor is a used block (no two adjacent
                // free blocks), so there's nothing to merge with.
                let leading = block;
                block = Self::split_block(leading, gap - BLOCK_HDR_SIZE);
                self.link_free_block(leading.cast(), gap - BLOCK_HDR_SIZE);
            }

            debug_assert_eq!(BlockHdr::payload(block).as_ptr() as usize, ptr);
            debug_assert!(block.as_ref().payload_size() >= size);

            Ok(self.prepare_used_block(block, size))
        }
    }

    /// Find the `BlockHdr` for an allocation (any `NonNull<u8>` returned by
    /// our allocation functions), checking the boundary tags around it.
    ///
    /// # Safety
    ///
    /// `ptr - GRANULARITY` must be readable and, if it's a block header, so
    /// must be the headers it points to.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is found not to be a live allocation.
    unsafe fn used_block_hdr_for_allocation(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        if ptr.as_ptr() as usize % GRANULARITY != 0 {
            corrupted(ptr, "misaligned pointer");
        }

        let block = BlockHdr::from_payload(ptr);
        let hdr = block.as_ref();

        if hdr.is_free() {
            corrupted(ptr, "block is already free");
        }
        if hdr.is_last() {
            corrupted(ptr, "block is a tail sentinel");
        }

        let Some(prev_phys_block) = hdr.prev_phys_block else {
            corrupted(ptr, "block is a head sentinel");
        };
        if prev_phys_block.as_ref().next_phys_block() != Some(block) {
            corrupted(ptr, "previous block's size disagrees with `prev_phys_block`");
        }

        let next_phys_block = hdr
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());
        if next_phys_block.as_ref().prev_phys_block != Some(block) {
            corrupted(ptr, "next block's `prev_phys_block` doesn't point to this block");
        }

        block
    }

    /// Get the usable size of an allocation, which is at least as large as
    /// requested.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is detected not to be a live allocation.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Self::used_block_hdr_for_allocation(ptr)
            .as_ref()
            .payload_size()
    }

    /// Deallocate a previously allocated memory block. Does nothing if `ptr`
    /// is null.
    ///
    /// The block is merged with its physically adjacent blocks if they are
    /// free.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or denote a memory block previously allocated via
    /// `self`.
    ///
    /// # Panics
    ///
    /// Heap corruption is not recoverable: this method panics if it detects
    /// that `ptr` is not a live allocation (e.g., a double free) or that the
    /// boundary tags around it are inconsistent. The detection is best-effort;
    /// an arbitrary pointer is still undefined behavior.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let mut block = Self::used_block_hdr_for_allocation(ptr);
        let mut size = block.as_ref().payload_size();

        // This variable tracks whose `prev_phys_block` we should update.
        let mut new_next_phys_block = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());

        // Merge with the next block if it's a free block. A tail sentinel is
        // never free.
        if new_next_phys_block.as_ref().is_free() {
            let next_phys_block = new_next_phys_block;
            let next_phys_block_size = next_phys_block.as_ref().payload_size();

            // Unlink `next_phys_block`. Its header becomes a part of the
            // payload.
            self.unlink_free_block(next_phys_block.cast(), next_phys_block_size);
            size += BLOCK_HDR_SIZE + next_phys_block_size;

            new_next_phys_block = next_phys_block
                .as_ref()
                .next_phys_block()
                .unwrap_or_else(|| unreachable_unchecked());
        }

        // Merge with the previous block if it's a free block. A head sentinel
        // is never free.
        let prev_phys_block = block
            .as_ref()
            .prev_phys_block
            .unwrap_or_else(|| unreachable_unchecked());
        if prev_phys_block.as_ref().is_free() {
            let prev_phys_block_size = prev_phys_block.as_ref().payload_size();

            // Unlink `prev_phys_block`.
            self.unlink_free_block(prev_phys_block.cast(), prev_phys_block_size);
            size += BLOCK_HDR_SIZE + prev_phys_block_size;

            // Move `block` to where `prev_phys_block` is located. By doing
            // this, `block` will implicitly inherit `prev_phys_block.
            // as_ref().prev_phys_block`.
            block = prev_phys_block;
        }

        // Write the new free block's size and flags.
        block.as_mut().size = size | SIZE_FREE;

        // Link `new_next_phys_block.prev_phys_block` to `block`
        debug_assert_eq!(
            Some(new_next_phys_block),
            block.as_ref().next_phys_block()
        );
        new_next_phys_block.as_mut().prev_phys_block = Some(block);

        // Link this free block to the corresponding free list
        self.link_free_block(block.cast(), size);
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Returns the new starting address of the memory block on success. If
    /// `ptr` is null, this is equivalent to [`Self::allocate`].
    ///
    /// The block is resized in place if possible: shrinking always is, and
    /// growing is if the next block is free and large enough. Otherwise, a new
    /// block is allocated, the contents are copied, and the old block is
    /// deallocated; the new block is only guaranteed to be aligned to
    /// [`GRANULARITY`] bytes.
    ///
    /// # Time Complexity
    ///
    /// Unlike other methods, this method will complete in linear time
    /// (`O(old_size)`) when the block has to be moved.
    ///
    /// # Errors
    ///
    /// Those of [`Self::allocate`]. On failure, the original block is left
    /// intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or denote a memory block previously allocated via
    /// `self`.
    ///
    /// # Panics
    ///
    /// See [`Self::deallocate`].
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, Error> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };

        let new_size = Self::adjust_request_size(new_size)?;
        let mut block = Self::used_block_hdr_for_allocation(ptr);
        let old_size = block.as_ref().payload_size();

        if new_size <= old_size {
            // Shrink the block, creating a new free block at the end
            self.trim_block(block, new_size);
            return Ok(ptr);
        }

        // Grow into the next free block if it can fit
        let next_phys_block = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());
        let next_phys_block_size = next_phys_block.as_ref().payload_size();

        if next_phys_block.as_ref().is_free()
            && old_size + BLOCK_HDR_SIZE + next_phys_block_size >= new_size
        {
            self.unlink_free_block(next_phys_block.cast(), next_phys_block_size);

            let mut next_next_phys_block = next_phys_block
                .as_ref()
                .next_phys_block()
                .unwrap_or_else(|| unreachable_unchecked());
            next_next_phys_block.as_mut().prev_phys_block = Some(block);
            block.as_mut().size = old_size + BLOCK_HDR_SIZE + next_phys_block_size;

            // Give back whatever we didn't need
            self.trim_block(block, new_size);
            return Ok(ptr);
        }

        // Allocate a whole new memory block. This is done before releasing
        // the old one so that a failure leaves it intact.
        let new_ptr = self.allocate(new_size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        self.deallocate(ptr.as_ptr());

        Ok(new_ptr)
    }

    /// Get an iterator over every block (except sentinels) of every pool in
    /// physical order.
    #[inline]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.first_pool)
    }
}

#[cold]
#[inline(never)]
fn corrupted(ptr: NonNull<u8>, what: &str) -> ! {
    log::error!("heap corruption detected at {:p}: {}", ptr, what);
    panic!("heap corruption detected at {:p}: {}", ptr, what);
}

#[cfg(test)]
mod tests;
