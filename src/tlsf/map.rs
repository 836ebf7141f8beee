//! Size class mapper. The core implementation of `Tlsf::map_floor`, etc.
use super::{GRANULARITY, GRANULARITY_LOG2, USIZE_BITS};

#[derive(Debug, Copy, Clone)]
pub(super) struct MapParams {
    /// `SLLEN.log2()`
    pub sli: u32,
    pub fllen: usize,
}

impl MapParams {
    #[inline]
    const fn sllen(&self) -> usize {
        1 << self.sli
    }

    /// Sizes below this value share the first-level list 0, which is divided
    /// linearly into one second-level list per `GRANULARITY` bytes.
    #[inline]
    pub const fn small_block_size(&self) -> usize {
        GRANULARITY << self.sli
    }

    /// `log2` of the exclusive upper bound of block sizes that have a list.
    #[inline]
    pub const fn size_limit_log2(&self) -> u32 {
        self.fllen as u32 - 1 + self.sli + GRANULARITY_LOG2
    }

    /// The largest block size that has a corresponding free list.
    ///
    /// The caller must ensure `size_limit_log2() < USIZE_BITS`.
    pub const fn max_block_size(&self) -> usize {
        (1 << self.size_limit_log2()) - GRANULARITY
    }

    /// The largest size `s` for which `map_ceil(s)` succeeds, i.e., the lower
    /// bound of the topmost list.
    ///
    /// The caller must ensure `size_limit_log2() < USIZE_BITS`.
    pub const fn max_alloc_size(&self) -> usize {
        if self.fllen == 1 {
            self.small_block_size() - GRANULARITY
        } else {
            // The topmost first-level class covers
            // `[2^top_log2, 2^(top_log2 + 1))`
            let top_log2 = self.size_limit_log2() - 1;
            ((self.sllen() << 1) - 1) << (top_log2 - self.sli)
        }
    }

    /// Find the free block list to store a free block of the specified size.
    #[inline]
    pub fn map_floor(&self, size: usize) -> Option<(usize, usize)> {
        let (fl, sl) = if size < self.small_block_size() {
            (0, size >> GRANULARITY_LOG2)
        } else {
            let log2 = USIZE_BITS - 1 - size.leading_zeros();
            let sl = size >> (log2 - self.sli);

            // The most significant one of `size` should be at `sl[SLI]`
            debug_assert!((sl >> self.sli) == 1);

            (
                (log2 - (self.sli + GRANULARITY_LOG2) + 1) as usize,
                sl & (self.sllen() - 1),
            )
        };

        // `fl` must be in a valid range
        if fl >= self.fllen {
            return None;
        }

        Some((fl, sl))
    }

    /// Find the first free block list whose every item is at least as large
    /// as the specified size.
    #[inline]
    pub fn map_ceil(&self, size: usize) -> Option<(usize, usize)> {
        debug_assert!(size >= GRANULARITY);
        debug_assert!(size % GRANULARITY == 0);

        let size = if size < self.small_block_size() {
            // Every list in the linear range holds exactly one size
            size
        } else {
            // round up to the next second-level boundary (this is specific
            // to `map_ceil`)
            let log2 = USIZE_BITS - 1 - size.leading_zeros();
            size.checked_add((1 << (log2 - self.sli)) - 1)?
        };

        self.map_floor(size)
    }

    /// The smallest block size stored in the list `(fl, sl)`.
    #[cfg(test)]
    pub fn list_min_size(&self, fl: usize, sl: usize) -> usize {
        debug_assert!(fl < self.fllen);
        debug_assert!(sl < self.sllen());
        if fl == 0 {
            sl << GRANULARITY_LOG2
        } else {
            let log2 = fl as u32 - 1 + self.sli + GRANULARITY_LOG2;
            (self.sllen() + sl) << (log2 - self.sli)
        }
    }
}
