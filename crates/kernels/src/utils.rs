//! Integer helpers used by the closed-form sizing formulas.

/// Ceiling division. `b` must be non-zero.
#[inline]
pub fn div_up(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Round `a` up to the next multiple of `b`.
#[inline]
pub fn rnd_up(a: u64, b: u64) -> u64 {
    div_up(a, b) * b
}

/// Smallest power of two that is `>= a`; `0` and `1` both map to `1`.
#[inline]
pub fn rnd_up_pow2(a: u64) -> u64 {
    a.max(1).next_power_of_two()
}

/// Largest power of two that is `<= a`, or `0` when `a == 0`.
#[inline]
pub fn rnd_dn_pow2(a: u64) -> u64 {
    if a == 0 {
        0
    } else {
        1 << (63 - a.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(div_up(10, 4), 3);
        assert_eq!(rnd_up(10, 4), 12);
        assert_eq!(rnd_up(16, 16), 16);
        assert_eq!(rnd_up_pow2(0), 1);
        assert_eq!(rnd_up_pow2(5), 8);
        assert_eq!(rnd_dn_pow2(6), 4);
        assert_eq!(rnd_dn_pow2(8), 8);
        assert_eq!(rnd_dn_pow2(0), 0);
    }
}
