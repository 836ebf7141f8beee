/// Round `x` up to the next multiple of `align`.
///
/// `align` must be a power of two. Wraps around on overflow.
#[inline]
pub const fn align_up(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    x.wrapping_add(align - 1) & !(align - 1)
}

/// Round `x` down to the previous multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}
