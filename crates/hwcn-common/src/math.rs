//! Integer helpers for tile and buffer sizing.

/// Ceiling division. Returns 0 when `divisor` is 0.
#[inline]
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    if divisor == 0 { 0 } else { value.div_ceil(divisor) }
}

/// Round `value` up to the next multiple of `multiple`.
#[inline]
pub fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    let remainder = value % multiple;
    if remainder == 0 { value } else { value + multiple - remainder }
}

/// Round `value` down to a multiple of `multiple`.
#[inline]
pub fn round_down(value: usize, multiple: usize) -> usize {
    if multiple == 0 { value } else { (value / multiple) * multiple }
}
