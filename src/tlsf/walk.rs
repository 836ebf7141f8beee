//! Traversal of the physical block chains and heap consistency checks.
use core::{iter::FusedIterator, marker::PhantomData, ptr::NonNull};

use super::{
    block::{BlockHdr, PoolHdr, BLOCK_HDR_SIZE, BLOCK_SIZE_MIN, POOL_HDR_PAYLOAD_SIZE},
    Tlsf, GRANULARITY,
};
use crate::int::BinInteger;

/// A block reported by [`Blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The starting address of the payload. For a used block, this is the
    /// pointer returned by the allocation method.
    pub ptr: NonNull<u8>,
    /// The payload size.
    pub size: usize,
    pub is_free: bool,
}

/// An iterator over the blocks of every pool managed by a [`Tlsf`], created
/// by [`Tlsf::blocks`].
///
/// Pools are visited from the most recently added one. Sentinel blocks are
/// not reported.
#[derive(Debug)]
pub struct Blocks<'a> {
    pool: Option<NonNull<PoolHdr>>,
    /// The next block to examine in `pool`.
    block: Option<NonNull<BlockHdr>>,
    _phantom: PhantomData<&'a ()>,
}

impl Blocks<'_> {
    pub(super) fn new(first_pool: Option<NonNull<PoolHdr>>) -> Self {
        Self {
            pool: first_pool,
            block: first_pool.and_then(|pool| {
                // Safety: The pool is owned by the `Tlsf` borrowed by `self`
                unsafe { pool.cast::<BlockHdr>().as_ref().next_phys_block() }
            }),
            _phantom: PhantomData,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pool = self.pool?;

            // Safety: Every block reachable from a pool is owned by the
            //         borrowed `Tlsf`, which can't be mutated while `self`
            //         exists.
            unsafe {
                if let Some(block) = self.block {
                    let hdr = block.as_ref();
                    if !hdr.is_last() {
                        self.block = hdr.next_phys_block();
                        return Some(BlockInfo {
                            ptr: BlockHdr::payload(block),
                            size: hdr.payload_size(),
                            is_free: hdr.is_free(),
                        });
                    }
                }

                // Reached the tail sentinel; move on to the next pool
                self.pool = pool.as_ref().next_pool;
                self.block = self
                    .pool
                    .and_then(|pool| pool.cast::<BlockHdr>().as_ref().next_phys_block());
            }
        }
    }
}

impl FusedIterator for Blocks<'_> {}

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize>
    Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    /// Walk every pool and every free list, and panic if any of the allocator's
    /// invariants is violated.
    ///
    /// This takes time proportional to the number of blocks. It's meant for
    /// testing.
    #[doc(hidden)]
    pub fn check_integrity(&self) {
        let mut num_free_blocks = 0;

        // Physical block chains
        let mut pool = self.first_pool;
        while let Some(pool_hdr) = pool {
            unsafe {
                let head = pool_hdr.cast::<BlockHdr>();
                let start = head.as_ptr() as usize;
                let len = pool_hdr.as_ref().len;

                assert_eq!(start % GRANULARITY, 0, "{:p}: misaligned pool", head);
                assert_eq!(head.as_ref().prev_phys_block, None);
                assert_eq!(head.as_ref().payload_size(), POOL_HDR_PAYLOAD_SIZE);
                assert!(!head.as_ref().is_free(), "{:p}: free head sentinel", head);
                assert!(!head.as_ref().is_last());

                let mut prev = head;
                let mut prev_is_free = false;
                let mut block = head.as_ref().next_phys_block().unwrap();

                while !block.as_ref().is_last() {
                    let hdr = block.as_ref();
                    assert!(
                        (block.as_ptr() as usize) < start + len,
                        "{:p}: block runs past the end of the pool",
                        block
                    );
                    assert_eq!(hdr.prev_phys_block, Some(prev), "{:p}", block);
                    assert!(hdr.payload_size() >= BLOCK_SIZE_MIN, "{:p}", block);

                    if hdr.is_free() {
                        assert!(!prev_is_free, "{:p}: adjacent free blocks", block);
                        num_free_blocks += 1;
                    }

                    prev_is_free = hdr.is_free();
                    prev = block;
                    block = hdr.next_phys_block().unwrap();
                }

                // The tail sentinel
                assert_eq!(block.as_ref().prev_phys_block, Some(prev), "{:p}", block);
                assert!(!block.as_ref().is_free(), "{:p}: free tail sentinel", block);
                assert_eq!(block.as_ref().payload_size(), 0);
                assert_eq!(block.as_ptr() as usize + BLOCK_HDR_SIZE, start + len);

                pool = pool_hdr.as_ref().next_pool;
            }
        }

        // Free lists and the bitmap index
        let mut num_listed_blocks = 0;
        for fl in 0..FLLEN {
            for sl in 0..SLLEN {
                let first_free = self.first_free[fl][sl];
                assert_eq!(
                    self.bitmap.is_set(fl, sl),
                    first_free.is_some(),
                    "bitmap bit ({}, {}) disagrees with the free list",
                    fl,
                    sl
                );

                let mut prev_free = None;
                let mut free = first_free;
                while let Some(block) = free {
                    unsafe {
                        let hdr = block.as_ref();
                        assert!(hdr.common.is_free(), "{:p}: listed but not free", block);
                        assert_eq!(hdr.prev_free, prev_free, "{:p}", block);
                        assert_eq!(
                            Self::MAP.map_floor(hdr.common.payload_size()),
                            Some((fl, sl)),
                            "{:p}: listed in a wrong free list",
                            block
                        );

                        num_listed_blocks += 1;
                        prev_free = free;
                        free = hdr.next_free;
                    }
                }
            }

            assert_eq!(self.bitmap.is_fl_set(fl), !self.bitmap.sl_is_empty(fl));
        }

        assert_eq!(
            num_listed_blocks, num_free_blocks,
            "every free block must be in exactly one free list"
        );
    }
}
