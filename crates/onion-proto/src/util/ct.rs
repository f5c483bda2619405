//! Constant-time utilities.

use subtle::{Choice, ConstantTimeEq};

/// Return true if every byte of `x` is zero.
///
/// Works in constant time, so that checking the `recognized` field of
/// a relay cell does not leak how close to zero it was.
pub(crate) fn is_zero(x: &[u8]) -> bool {
    let mut all_zero = Choice::from(1);
    for b in x {
        all_zero &= b.ct_eq(&0);
    }
    all_zero.into()
}

/// Return true if two slices are equal.  Performs its operation in
/// constant time, but returns a bool instead of a subtle::Choice.
pub(crate) fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    let choice = a.ct_eq(b);
    choice.unwrap_u8() == 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[]));
        assert!(is_zero(&[0, 0, 0]));
        assert!(!is_zero(&[0, 1, 0]));
        assert!(!is_zero(&[255]));
    }

    #[test]
    fn test_bytes_eq() {
        let a = b"123";
        assert!(bytes_eq(&a[..2], &b"123"[..2]));
        assert!(bytes_eq(a, b"123"));
        assert!(!bytes_eq(a, b"1234"));
        assert!(!bytes_eq(a, b"124"));
        assert!(bytes_eq(&a[..0], b""));
    }
}
