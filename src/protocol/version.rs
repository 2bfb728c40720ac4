//! Wrap-aware version counters
//!
//! `a` is newer than `b` iff `(a - b) mod 2^32` lies in `(0, 2^31)`.

const HALF_RANGE: u32 = 1 << 31;

/// True when `a` is strictly newer than `b`
pub fn is_newer(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < HALF_RANGE
}

/// Version following `v`, wrapping at `u32::MAX`
pub fn next_version(v: u32) -> u32 {
    v.wrapping_add(1)
}

/// Number of increments from `old` to `new`, if `new` is not older
pub fn distance(new: u32, old: u32) -> Option<u32> {
    if new == old || is_newer(new, old) {
        Some(new.wrapping_sub(old))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_cases() {
        assert!(is_newer(1, 0xFFFF_FFFF));
        assert!(is_newer(0x7FFF_FFFF, 0));
        // A jump of 2^31 or more reads as going backwards
        assert!(!is_newer(0, 0x8000_0000));
        assert!(!is_newer(0x8000_0001, 0));
        assert!(!is_newer(5, 5));
        assert!(!is_newer(0, 0));
    }

    #[test]
    fn test_half_range_boundary() {
        // Exactly half way is treated as older
        assert!(!is_newer(0x8000_0000, 0));
        assert!(is_newer(0, 0x8000_0000 + 1));
        assert!(!is_newer(0, 1));
    }

    #[test]
    fn test_next_version_wraps() {
        assert_eq!(next_version(0), 1);
        assert_eq!(next_version(u32::MAX), 0);
        assert!(is_newer(next_version(u32::MAX), u32::MAX));
    }

    #[test]
    fn test_distance() {
        assert_eq!(distance(3, 1), Some(2));
        assert_eq!(distance(1, 1), Some(0));
        assert_eq!(distance(2, 0xFFFF_FFFF), Some(3));
        assert_eq!(distance(1, 3), None);
    }
}
