//! Numeric helpers shared across the builder.
//!
//! All helpers are defined for positive inputs only; violating a contract is
//! a builder bug, not a user error, so they assert rather than return errors.

/// `n` kibibytes.
#[inline]
#[must_use]
pub const fn kb(n: u64) -> u64 {
    n * 1024
}

/// `n` mebibytes.
#[inline]
#[must_use]
pub const fn mb(n: u64) -> u64 {
    n * 1024 * 1024
}

/// Index of the most significant set bit. `x` must be non-zero.
#[inline]
#[must_use]
pub fn msb(x: u64) -> u64 {
    assert!(x > 0);
    63 - u64::from(x.leading_zeros())
}

/// Index of the least significant set bit. `x` must be non-zero.
#[inline]
#[must_use]
pub fn lsb(x: u64) -> u64 {
    assert!(x > 0);
    u64::from(x.trailing_zeros())
}

/// Round `n` up to the next multiple of `x`.
#[inline]
#[must_use]
pub fn round_up(n: u64, x: u64) -> u64 {
    assert!(x > 0);
    match n % x {
        0 => n,
        m => n + x - m,
    }
}

/// Round `n` down to a multiple of `x`.
#[inline]
#[must_use]
pub fn round_down(n: u64, x: u64) -> u64 {
    assert!(x > 0);
    n - n % x
}

/// Zero the lower `bits` bits of `n`.
#[inline]
#[must_use]
pub fn mask_bits(n: u64, bits: u64) -> u64 {
    (n >> bits) << bits
}

/// Whether `n` is a power of two. `n` must be non-zero.
#[inline]
#[must_use]
pub fn is_power_of_two(n: u64) -> bool {
    assert!(n > 0);
    n & (n - 1) == 0
}

/// Parse an integer literal the way the system description format defines
/// them: optional `0x`/`0o`/`0b` prefix, otherwise decimal, with single
/// underscores permitted between digits.
///
/// Returns `None` for anything else — the caller owns the error message.
#[must_use]
pub fn parse_int(s: &str) -> Option<u64> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    // Underscores are only valid between two alphanumeric characters.
    for (idx, &b) in bytes.iter().enumerate() {
        if b == b'_' {
            let prev_ok = idx > 0 && bytes[idx - 1].is_ascii_alphanumeric();
            let next_ok = idx + 1 < bytes.len() && bytes[idx + 1].is_ascii_alphanumeric();
            if !prev_ok || !next_ok {
                return None;
            }
        }
    }
    let cleaned: String = s.chars().filter(|&c| c != '_').collect();
    let (digits, radix) = match cleaned.as_bytes() {
        [b'0', b'x' | b'X', rest @ ..] if !rest.is_empty() => (&cleaned[2..], 16),
        [b'0', b'o' | b'O', rest @ ..] if !rest.is_empty() => (&cleaned[2..], 8),
        [b'0', b'b' | b'B', rest @ ..] if !rest.is_empty() => (&cleaned[2..], 2),
        _ => (cleaned.as_str(), 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

/// Render `size` with a power-of-two unit suffix.
///
/// 'strict' means the size must be an exact multiple of the chosen unit;
/// anything else is a builder bug (object sizes are powers of two).
#[must_use]
pub fn human_size_strict(size: u64) -> String {
    for (bits, label) in [
        (60, "EiB"),
        (50, "PiB"),
        (40, "TiB"),
        (30, "GiB"),
        (20, "MiB"),
        (10, "KiB"),
        (0, "bytes"),
    ] {
        let base = 1u64 << bits;
        if size > base {
            let count = size / base;
            assert!(
                size % base == 0,
                "size 0x{size:x} is not a multiple of a standard power-of-two"
            );
            return format!("{} {label}", group_thousands(count));
        }
    }
    format!("{size} bytes")
}

/// Format `n` with `,` thousands separators.
#[must_use]
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_indices() {
        assert_eq!(msb(1), 0);
        assert_eq!(msb(0x8000_0000_0000_0000), 63);
        assert_eq!(msb(0x1800), 12);
        assert_eq!(lsb(1), 0);
        assert_eq!(lsb(0x1800), 11);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(0, 0x1000), 0);
        assert_eq!(round_up(1, 0x1000), 0x1000);
        assert_eq!(round_up(0x1000, 0x1000), 0x1000);
        assert_eq!(round_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(mask_bits(0x12345, 12), 0x12000);
    }

    #[test]
    fn power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(0x2000));
        assert!(!is_power_of_two(0x3000));
    }

    #[test]
    fn parse_int_literals() {
        assert_eq!(parse_int("1234"), Some(1234));
        assert_eq!(parse_int("0x1000"), Some(0x1000));
        assert_eq!(parse_int("0x200_000"), Some(0x200_000));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0o17"), Some(15));
        assert_eq!(parse_int("1_000_000"), Some(1_000_000));
    }

    #[test]
    fn parse_int_rejections() {
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("0x200_000sd"), None);
        assert_eq!(parse_int("12ab"), None);
        assert_eq!(parse_int("_12"), None);
        assert_eq!(parse_int("12_"), None);
        assert_eq!(parse_int("0x"), None);
        assert_eq!(parse_int("-4"), None);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size_strict(0x1000), "4 KiB");
        assert_eq!(human_size_strict(0x200_000), "2 MiB");
        assert_eq!(human_size_strict(1 << 30), "1,024 MiB");
        assert_eq!(human_size_strict(512), "512 bytes");
        assert_eq!(human_size_strict(1024), "1,024 bytes");
    }
}
