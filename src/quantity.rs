//! Storage quantity arithmetic.
//!
//! The cluster API hands quantities around as opaque strings, so ordering and
//! equality between a claim's current capacity and a recommendation need a
//! local parser. Only non-negative values with IEC binary suffixes are
//! meaningful for storage requests.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, ScalerError};

/// Binary suffixes ordered by exponent; `1 << (10 * n)` bytes each.
const IEC_SUFFIXES: [&str; 8] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi", "Yi"];

/// A parsed storage amount. Comparison is by byte count; the original
/// textual representation is preserved for writing back into specs.
#[derive(Debug, Clone)]
pub struct StorageQuantity {
    bytes: u128,
    repr: String,
}

impl StorageQuantity {
    /// Parses a non-negative integer or decimal with an optional IEC suffix,
    /// e.g. `"512"`, `"50Gi"`, `"1.5Ti"`.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(raw.len());
        let (number, suffix) = raw.split_at(split);
        if number.is_empty() {
            return Err(invalid(input));
        }

        let scale: u128 = if suffix.is_empty() {
            1
        } else {
            IEC_SUFFIXES
                .iter()
                .position(|known| *known == suffix)
                .map(|idx| 1u128 << (10 * (idx as u32 + 1)))
                .ok_or_else(|| invalid(input))?
        };

        let bytes = if let Ok(whole) = number.parse::<u128>() {
            whole.checked_mul(scale).ok_or_else(|| invalid(input))?
        } else {
            let fractional: f64 = number.parse().map_err(|_| invalid(input))?;
            (fractional * scale as f64).round() as u128
        };

        Ok(Self {
            bytes,
            repr: raw.to_string(),
        })
    }

    pub fn as_bytes(&self) -> u128 {
        self.bytes
    }
}

fn invalid(input: &str) -> ScalerError {
    ScalerError::Validation {
        message: format!("{input:?} is not a valid storage quantity"),
    }
}

impl fmt::Display for StorageQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl PartialEq for StorageQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for StorageQuantity {}

impl PartialOrd for StorageQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

/// True when `resize_to` asks for more capacity than the claim has now.
pub fn is_greater(original: &StorageQuantity, resize_to: &StorageQuantity) -> bool {
    resize_to.bytes > original.bytes
}

/// True when the recommendation matches the current capacity exactly.
pub fn is_equal(original: &StorageQuantity, resize_to: &StorageQuantity) -> bool {
    resize_to.bytes == original.bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(StorageQuantity::parse("512").unwrap().as_bytes(), 512);
    }

    #[test]
    fn test_parse_iec_suffixes() {
        assert_eq!(StorageQuantity::parse("1Ki").unwrap().as_bytes(), 1024);
        assert_eq!(
            StorageQuantity::parse("5Gi").unwrap().as_bytes(),
            5 * 1024 * 1024 * 1024
        );
        assert_eq!(
            StorageQuantity::parse("1Ti").unwrap().as_bytes(),
            1u128 << 40
        );
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(
            StorageQuantity::parse("1.5Gi").unwrap().as_bytes(),
            1_610_612_736
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "Gi", "abc", "5Xi", "-5Gi", "5 Gi"] {
            assert!(
                StorageQuantity::parse(input).is_err(),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn test_display_keeps_repr() {
        assert_eq!(StorageQuantity::parse("50Gi").unwrap().to_string(), "50Gi");
    }

    #[test]
    fn test_is_greater() {
        let cases = [
            ("5Gi", "2Gi", false),
            ("2Gi", "3Gi", true),
            ("2Gi", "2Gi", false),
        ];
        for (original, resize_to, expected) in cases {
            let original = StorageQuantity::parse(original).unwrap();
            let resize_to = StorageQuantity::parse(resize_to).unwrap();
            assert_eq!(
                is_greater(&original, &resize_to),
                expected,
                "is_greater({original}, {resize_to})"
            );
        }
    }

    #[test]
    fn test_is_equal_across_units() {
        let one_ti = StorageQuantity::parse("1Ti").unwrap();
        let in_gi = StorageQuantity::parse("1024Gi").unwrap();
        assert!(is_equal(&one_ti, &in_gi));
        assert_eq!(one_ti, in_gi);
    }

    #[test]
    fn test_ordering_across_units() {
        let smaller = StorageQuantity::parse("1023Gi").unwrap();
        let larger = StorageQuantity::parse("1Ti").unwrap();
        assert!(smaller < larger);
    }
}
