//! The two-level bitmap index over the free lists.
use crate::int::BinInteger;

/// Tracks which free lists are non-empty.
///
/// `sl_bitmap[fl]` has bit `sl` set iff the list `(fl, sl)` is non-empty, and
/// `fl_bitmap` has bit `fl` set iff `sl_bitmap[fl]` is non-zero.
#[derive(Debug)]
pub(super) struct BitmapIndex<FLBitmap, SLBitmap, const FLLEN: usize> {
    fl_bitmap: FLBitmap,
    sl_bitmap: [SLBitmap; FLLEN],
}

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize>
    BitmapIndex<FLBitmap, SLBitmap, FLLEN>
{
    pub const INIT: Self = Self {
        fl_bitmap: FLBitmap::ZERO,
        sl_bitmap: [SLBitmap::ZERO; FLLEN],
    };

    #[inline]
    pub fn set(&mut self, fl: usize, sl: usize) {
        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    #[inline]
    pub fn clear(&mut self, fl: usize, sl: usize) {
        self.sl_bitmap[fl].clear_bit(sl as u32);
        if self.sl_bitmap[fl] == SLBitmap::ZERO {
            self.fl_bitmap.clear_bit(fl as u32);
        }
    }

    #[inline]
    pub fn is_set(&self, fl: usize, sl: usize) -> bool {
        self.sl_bitmap[fl].get_bit(sl as u32)
    }

    #[inline]
    pub fn is_fl_set(&self, fl: usize) -> bool {
        self.fl_bitmap.get_bit(fl as u32)
    }

    #[inline]
    pub fn sl_is_empty(&self, fl: usize) -> bool {
        self.sl_bitmap[fl] == SLBitmap::ZERO
    }

    /// Find the lowest `(fl', sl') >= (fl, sl)` whose list is non-empty.
    #[inline]
    pub fn find_suitable(&self, fl: usize, sl: usize, sllen: usize) -> Option<(usize, usize)> {
        // Search in range `(fl, sl..SLLEN)`
        let sl = self.sl_bitmap[fl].bit_scan_forward(sl as u32) as usize;
        if sl < sllen {
            debug_assert!(self.is_set(fl, sl));
            return Some((fl, sl));
        }

        // Search in range `(fl + 1.., ..)`
        let fl = self.fl_bitmap.bit_scan_forward(fl as u32 + 1) as usize;
        if fl < FLLEN {
            debug_assert!(self.is_fl_set(fl));

            let sl = self.sl_bitmap[fl].trailing_zeros() as usize;
            debug_assert!(sl < sllen, "`fl_bitmap` and `sl_bitmap` disagree");

            Some((fl, sl))
        } else {
            None
        }
    }
}
