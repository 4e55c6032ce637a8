//! Textual magnitudes shared by the launcher and the grader.
//!
//! Durations follow Go's `time.Duration` grammar (`"1.503s"`, `"2m3.5s"`),
//! byte sizes a 1024-based unit grammar (`"4MB"`, `"12.4mb"`). Both sides
//! of the `run` queue must agree on these strings, so formatting and
//! parsing live together here.

use std::time::Duration;
use thiserror::Error;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;
pub const TB: u64 = 1 << 40;
pub const PB: u64 = 1 << 50;
pub const EB: u64 = 1 << 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("negative duration {0:?}")]
    NegativeDuration(String),
    #[error("invalid byte size {0:?}")]
    InvalidSize(String),
    #[error("magnitude overflows {0:?}")]
    Overflow(String),
}

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn duration_unit(unit: &str) -> Option<u64> {
    let nanos = match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SEC,
        "m" => 60 * NANOS_PER_SEC,
        "h" => 3_600 * NANOS_PER_SEC,
        _ => return None,
    };
    Some(nanos)
}

/// Digits past this many are ignored when scaling a fraction.
const MAX_FRACTION_DIGITS: usize = 18;

/// `0.<digits> * scale`, truncated, in integer arithmetic.
fn scaled_fraction(digits: &str, scale: u128) -> u128 {
    let digits = &digits[..digits.len().min(MAX_FRACTION_DIGITS)];
    if digits.is_empty() {
        return 0;
    }
    let numerator: u128 = digits.parse().unwrap_or(0);
    numerator * scale / 10u128.pow(digits.len() as u32)
}

/// Parses a Go-style duration string such as `"1.5s"` or `"1h2m"`.
pub fn parse_duration(input: &str) -> Result<Duration, UnitError> {
    let invalid = || UnitError::InvalidDuration(input.to_string());

    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_frac) = match after_int.strip_prefix('.') {
            Some(tail) => {
                let frac_len = tail.bytes().take_while(u8::is_ascii_digit).count();
                tail.split_at(frac_len)
            }
            None => ("", after_int),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_len = after_frac
            .char_indices()
            .find(|(_, c)| *c == '.' || c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(after_frac.len());
        if unit_len == 0 {
            return Err(UnitError::MissingUnit(input.to_string()));
        }
        let (unit, tail) = after_frac.split_at(unit_len);
        let scale = duration_unit(unit).ok_or_else(|| UnitError::UnknownUnit {
            unit: unit.to_string(),
            input: input.to_string(),
        })?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse::<u128>()
                .map_err(|_| UnitError::Overflow(input.to_string()))?
        };
        let mut component = whole
            .checked_mul(scale as u128)
            .ok_or_else(|| UnitError::Overflow(input.to_string()))?;
        component += scaled_fraction(frac_part, scale as u128);

        total = total
            .checked_add(component)
            .filter(|t| *t <= i64::MAX as u128)
            .ok_or_else(|| UnitError::Overflow(input.to_string()))?;
        rest = tail;
    }

    if negative && total > 0 {
        return Err(UnitError::NegativeDuration(input.to_string()));
    }

    let secs = (total / NANOS_PER_SEC as u128) as u64;
    let nanos = (total % NANOS_PER_SEC as u128) as u32;
    Ok(Duration::new(secs, nanos))
}

/// Writes the fractional digits of `v / 10^prec`, trailing zeros dropped.
/// Returns the fraction text (with its leading dot, or empty) and the
/// integer part.
fn split_fraction(mut v: u64, prec: u32) -> (String, u64) {
    let mut digits = Vec::with_capacity(prec as usize);
    let mut significant = false;
    for _ in 0..prec {
        let digit = (v % 10) as u8;
        significant = significant || digit != 0;
        if significant {
            digits.push(b'0' + digit);
        }
        v /= 10;
    }
    if digits.is_empty() {
        return (String::new(), v);
    }
    digits.reverse();
    (format!(".{}", String::from_utf8_lossy(&digits)), v)
}

/// Formats a duration the way Go's `Duration.String` does.
pub fn format_duration(duration: Duration) -> String {
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

    if nanos < NANOS_PER_SEC {
        return match nanos {
            0 => "0s".to_string(),
            n if n < 1_000 => format!("{}ns", n),
            n if n < 1_000_000 => {
                let (frac, int) = split_fraction(n, 3);
                format!("{}{}µs", int, frac)
            }
            n => {
                let (frac, int) = split_fraction(n, 6);
                format!("{}{}ms", int, frac)
            }
        };
    }

    let (frac, secs) = split_fraction(nanos, 9);
    let minutes = secs / 60;
    let hours = minutes / 60;
    match (hours, minutes) {
        (0, 0) => format!("{}{}s", secs, frac),
        (0, m) => format!("{}m{}{}s", m, secs % 60, frac),
        (h, m) => format!("{}h{}m{}{}s", h, m % 60, secs % 60, frac),
    }
}

fn size_unit(unit: &str) -> Option<u64> {
    let multiplier = match unit {
        "" | "b" | "byte" | "bytes" => 1,
        "k" | "kb" | "kilo" | "kilobyte" | "kilobytes" => KB,
        "m" | "mb" | "mega" | "megabyte" | "megabytes" => MB,
        "g" | "gb" | "giga" | "gigabyte" | "gigabytes" => GB,
        "t" | "tb" | "tera" | "terabyte" | "terabytes" => TB,
        "p" | "pb" | "peta" | "petabyte" | "petabytes" => PB,
        "e" | "eb" | "exa" | "exabyte" | "exabytes" => EB,
        _ => return None,
    };
    Some(multiplier)
}

/// Parses a byte size such as `"4MB"`, `"512"` or `"12.4mb"` into bytes.
pub fn parse_bytes(input: &str) -> Result<u64, UnitError> {
    let invalid = || UnitError::InvalidSize(input.to_string());
    let trimmed = input.trim();

    let number_len = trimmed
        .bytes()
        .take_while(|b| b.is_ascii_digit() || *b == b'.')
        .count();
    let (number, unit) = trimmed.split_at(number_len);
    if !number.bytes().any(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let multiplier = size_unit(&unit.trim().to_lowercase()).ok_or_else(|| UnitError::UnknownUnit {
        unit: unit.trim().to_string(),
        input: input.to_string(),
    })?;

    let (int_part, frac_part) = match number.split_once('.') {
        Some((int_part, frac_part)) => {
            if frac_part.contains('.') {
                return Err(invalid());
            }
            (int_part, frac_part)
        }
        None => (number, ""),
    };

    let whole: u64 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| UnitError::Overflow(input.to_string()))?
    };
    let mut bytes = whole
        .checked_mul(multiplier)
        .ok_or_else(|| UnitError::Overflow(input.to_string()))?;
    let fraction = u64::try_from(scaled_fraction(frac_part, multiplier as u128))
        .map_err(|_| UnitError::Overflow(input.to_string()))?;
    bytes = bytes
        .checked_add(fraction)
        .ok_or_else(|| UnitError::Overflow(input.to_string()))?;
    Ok(bytes)
}

/// Formats bytes with the largest unit that divides them exactly.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0B".to_string();
    }
    for (unit, name) in [(EB, "EB"), (PB, "PB"), (TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")] {
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, name);
        }
    }
    format!("{}B", bytes)
}

/// Peak memory as reported by `time -f %M` (kilobytes) in canonical form.
pub fn format_kilobytes(kilobytes: u64) -> String {
    format_bytes(kilobytes.saturating_mul(KB))
}
