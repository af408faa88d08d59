//! Byte-size string parsing and formatting.
//!
//! Sizes use binary suffixes `K`, `M`, `G`, `T` (×1024ⁿ), case-insensitive,
//! with an optional trailing `B` or `IB` (`64G` == `64GB` == `64GiB`).
//! A bare number is a byte count.

/// Parses a size string into bytes. Returns `None` on malformed input
/// or multiplication overflow.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return None;
    }
    let value: u64 = s[..digits_end].parse().ok()?;

    let suffix = s[digits_end..].trim().to_ascii_uppercase();
    let unit = match suffix.as_str() {
        "" | "B" => return Some(value),
        other => {
            let (letter, rest) = other.split_at(1);
            if !matches!(rest, "" | "B" | "IB") {
                return None;
            }
            letter.chars().next()?
        }
    };

    let shift = match unit {
        'K' => 10,
        'M' => 20,
        'G' => 30,
        'T' => 40,
        _ => return None,
    };
    value.checked_shl(shift).filter(|v| v >> shift == value)
}

/// Formats a byte count using the largest suffix that divides it exactly,
/// so that `parse_size(format_size(n)) == Some(n)`.
pub fn format_size(bytes: u64) -> String {
    for (shift, unit) in [(40, 'T'), (30, 'G'), (20, 'M'), (10, 'K')] {
        if bytes != 0 && bytes & ((1u64 << shift) - 1) == 0 {
            return format!("{}{unit}", bytes >> shift);
        }
    }
    format!("{bytes}B")
}
