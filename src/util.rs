use crate::VA;

/// Static cast the given 64-bit unsigned integer to a 64-bit signed integer.
/// This is probably only useful when some other code provides you a u64
///  that is meant to be an i64 (aka. uncommon).
///
/// In C: `*(int64_t *)&i`
///
/// # Examples
///
/// ```
/// use fnstarts::util::*;
/// assert_eq!(u64_i64(0), 0);
/// assert_eq!(u64_i64(0x10), 0x10);
/// assert_eq!(u64_i64(0xFFFF_FFFF_FFFF_FFFF), -1);
/// assert_eq!(u64_i64(0xFFFF_FFFF_FFFF_FFF0), -0x10);
/// ```
pub fn u64_i64(i: u64) -> i64 {
    // Rust guarantees this sort of casting to work
    // (that the signed number representation is 2s complement).
    i as i64
}

/// Static cast the given 64-bit signed integer to a 64-bit unsigned integer.
///
/// In C: `*(uint64_t *)&i`
///
/// # Examples
///
/// ```
/// use fnstarts::util::*;
/// assert_eq!(i64_u64(0x10), 0x10);
/// assert_eq!(i64_u64(-1), 0xFFFF_FFFF_FFFF_FFFF);
/// ```
pub fn i64_u64(i: i64) -> u64 {
    i as u64
}

/// Add a signed displacement to a virtual address, wrapping at the 64-bit
/// boundary like the hardware does. Overflow only occurs on malformed
/// inputs, and the wrapped value is as good an answer as any.
///
/// # Examples
///
/// ```
/// use fnstarts::util::*;
/// assert_eq!(va_add_signed(0x1000, 0x10), 0x1010);
/// assert_eq!(va_add_signed(0x1000, -0x10), 0xFF0);
/// ```
pub fn va_add_signed(va: VA, disp: i64) -> VA {
    va.wrapping_add(disp as u64)
}

/// Round the given value up to the next multiple of the given base.
///
/// # Panics
///
///   - Base `b` must be at least `2`.
///
/// # Examples
///
/// ```
/// use fnstarts::util::*;
/// assert_eq!(align(0, 8), 0);
/// assert_eq!(align(1, 8), 8);
/// assert_eq!(align(8, 8), 8);
/// ```
pub fn align(i: u64, b: u64) -> u64 {
    if b < 2 {
        panic!("base `b` must be at least: 2");
    }
    let rem = i % b;
    if rem == 0 {
        i
    } else {
        i + (b - rem)
    }
}
