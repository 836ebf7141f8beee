//! Provides [`BinInteger`], the bitmap word type of the size class index.
use core::{fmt, ops};

/// An unsigned integer type usable as a bitmap word.
///
/// Every operation compiles down to a handful of instructions (the bit scans
/// use the target's count-trailing-zeros instruction), so none of them
/// depends on the number of bits set.
pub trait BinInteger:
    Copy
    + Eq
    + fmt::Debug
    + ops::BitAnd<Output = Self>
    + ops::BitOr<Output = Self>
    + ops::Not<Output = Self>
    + private::Sealed
    + 'static
{
    const ZERO: Self;
    const BITS: u32;

    fn trailing_zeros(&self) -> u32;

    /// Get the position of the first set bit at or above `start`.
    /// Returns [`Self::BITS`] if there is no such bit.
    fn bit_scan_forward(&self, start: u32) -> u32;

    fn get_bit(&self, i: u32) -> bool;

    fn set_bit(&mut self, i: u32);

    fn clear_bit(&mut self, i: u32);
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_binary_integer {
    ($type:ty) => {
        impl private::Sealed for $type {}

        impl BinInteger for $type {
            const ZERO: Self = 0;
            const BITS: u32 = core::mem::size_of::<$type>() as u32 * 8;

            #[inline]
            fn trailing_zeros(&self) -> u32 {
                (*self).trailing_zeros()
            }

            #[inline]
            fn bit_scan_forward(&self, start: u32) -> u32 {
                if start >= Self::BITS {
                    Self::BITS
                } else {
                    (*self & !((1 << start) - 1)).trailing_zeros()
                }
            }

            #[inline]
            fn get_bit(&self, i: u32) -> bool {
                debug_assert!(i < Self::BITS);
                (*self & (1 << i)) != 0
            }

            #[inline]
            fn set_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self |= 1 << i;
            }

            #[inline]
            fn clear_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self &= !(1 << i);
            }
        }
    };
}

impl_binary_integer!(u8);
impl_binary_integer!(u16);
impl_binary_integer!(u32);
impl_binary_integer!(u64);
impl_binary_integer!(u128);
impl_binary_integer!(usize);
