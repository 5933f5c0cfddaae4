//! Human readable data sizes.
//!
//! Sizes are plain byte counts (`u64`). Strings like `"10 GiB"`, `"512MiB"`
//! or `"1 kB"` are parsed with [`parse`]; [`format`] produces the canonical
//! spelling using the largest binary unit that divides the value exactly.

use crate::error::SizeError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

pub const KB: u64 = 1000;
pub const MB: u64 = 1000 * KB;
pub const GB: u64 = 1000 * MB;
pub const TB: u64 = 1000 * GB;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

const UNITS: &[(&str, u64)] = &[
    ("kB", KB),
    ("KiB", KIB),
    ("MB", MB),
    ("MiB", MIB),
    ("GB", GB),
    ("GiB", GIB),
    ("TB", TB),
    ("TiB", TIB),
];

// Largest first; used by `format`.
const BINARY_UNITS: &[(&str, u64)] = &[("TiB", TIB), ("GiB", GIB), ("MiB", MIB), ("KiB", KIB)];

/// Parse a size string into bytes.
///
/// Accepts a decimal integer followed by an optional unit, with or without a
/// single separating space. Unit names are case sensitive.
pub fn parse(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, rest) = trimmed.split_at(digits_end);
    if number.is_empty() {
        return Err(SizeError::Invalid(input.to_string()));
    }
    let unit = rest.strip_prefix(' ').unwrap_or(rest);

    let value: u64 = number
        .parse()
        .map_err(|_| SizeError::Overflow(input.to_string()))?;

    if unit.is_empty() {
        return Ok(value);
    }

    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, m)| *m)
        .ok_or_else(|| SizeError::UnknownUnit(input.to_string()))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| SizeError::Overflow(input.to_string()))
}

/// Canonical string for a byte count.
pub fn format(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (name, unit) in BINARY_UNITS {
        if bytes % unit == 0 {
            return format!("{} {}", bytes / unit, name);
        }
    }
    bytes.to_string()
}

/// A byte count that deserializes from either an integer or a size string.
///
/// Always serializes as an integer so that emitted documents stay
/// unambiguous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct Size(pub u64);

impl Size {
    pub const ZERO: Size = Size(0);

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Size) -> Option<Size> {
        self.0.checked_add(rhs.0).map(Size)
    }
}

impl From<u64> for Size {
    fn from(value: u64) -> Self {
        Size(value)
    }
}

impl From<Size> for u64 {
    fn from(value: Size) -> Self {
        value.0
    }
}

impl Add for Size {
    type Output = Size;

    /// Saturates at `u64::MAX`; use [`Size::checked_add`] to detect overflow.
    fn add(self, rhs: Size) -> Size {
        Size(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Size {
    fn add_assign(&mut self, rhs: Size) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(self.0))
    }
}

impl FromStr for Size {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s).map(Size)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

struct SizeVisitor;

impl Visitor<'_> for SizeVisitor {
    type Value = Size;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative integer or a size string such as \"10 GiB\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Size, E> {
        Ok(Size(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Size, E> {
        u64::try_from(v)
            .map(Size)
            .map_err(|_| E::custom(format!("size must not be negative: {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Size, E> {
        if v < 0.0 || v.fract() != 0.0 || v > u64::MAX as f64 {
            return Err(E::custom(format!("size must be a whole number of bytes: {v}")));
        }
        Ok(Size(v as u64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Size, E> {
        parse(v).map(Size).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse("123").unwrap(), 123);
        assert_eq!(parse("  42  ").unwrap(), 42);
    }

    #[test]
    fn parses_all_units() {
        let cases = [
            ("123 kB", 123 * KB),
            ("123 KiB", 123 * KIB),
            ("123 MB", 123 * MB),
            ("123 MiB", 123 * MIB),
            ("123 GB", 123 * GB),
            ("123 GiB", 123 * GIB),
            ("123 TB", 123 * TB),
            ("123 TiB", 123 * TIB),
            ("123GiB", 123 * GIB),
            ("   5 MiB ", 5 * MIB),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn rejects_unknown_units() {
        for input in ["123 KB", "123 mb", "1 PB", "1 PiB", "12 GiBs"] {
            let err = parse(input).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("unknown data size units in string: {input}")
            );
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("GiB").is_err());
        assert!(parse("-1 GiB").is_err());
        assert!(parse("99999999999999999999").is_err());
        assert!(parse("20000000 TiB").is_err());
    }

    #[test]
    fn formats_with_largest_exact_unit() {
        assert_eq!(format(0), "0");
        assert_eq!(format(512), "512");
        assert_eq!(format(2 * KIB), "2 KiB");
        assert_eq!(format(1536 * KIB), "1536 KiB");
        assert_eq!(format(10 * GIB), "10 GiB");
        assert_eq!(format(3 * TIB), "3 TiB");
        assert_eq!(format(GIB + MIB), "1025 MiB");
    }

    #[test]
    fn size_deserializes_from_int_and_string() {
        let from_int: Size = serde_json::from_str("1024").unwrap();
        let from_str: Size = serde_json::from_str("\"1 KiB\"").unwrap();
        assert_eq!(from_int, from_str);
        assert!(serde_json::from_str::<Size>("\"1 PB\"").is_err());
        assert!(serde_json::from_str::<Size>("-5").is_err());
    }

    #[test]
    fn size_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Size(10 * GIB)).unwrap(), "10737418240");
        assert_eq!(Size(10 * GIB).to_string(), "10 GiB");
    }

    #[test]
    fn addition_saturates() {
        let mut size = Size(u64::MAX - 1);
        size += Size(10);
        assert_eq!(size, Size(u64::MAX));
        assert_eq!(Size(1) + Size(2), Size(3));
        assert_eq!(Size(u64::MAX).checked_add(Size(1)), None);
        assert_eq!(Size(GIB).checked_add(Size(GIB)), Some(Size(2 * GIB)));
    }

    fn unit_strategy() -> impl Strategy<Value = (&'static str, u64)> {
        prop_oneof![
            Just(("kB", KB)),
            Just(("KiB", KIB)),
            Just(("MB", MB)),
            Just(("MiB", MIB)),
            Just(("GB", GB)),
            Just(("GiB", GIB)),
        ]
    }

    proptest! {
        #[test]
        fn formatted_sizes_parse_back(bytes in any::<u64>()) {
            prop_assert_eq!(parse(&format(bytes)).unwrap(), bytes);
        }

        #[test]
        fn unit_multiplies(value in 0u64..1_000_000, (unit, factor) in unit_strategy()) {
            let spaced = parse(&format!("{value} {unit}")).unwrap();
            let tight = parse(&format!("{value}{unit}")).unwrap();
            prop_assert_eq!(spaced, value * factor);
            prop_assert_eq!(tight, spaced);
        }

        #[test]
        fn unknown_units_are_rejected(value in 0u64..1000, unit in "[a-z]{1,3}") {
            let input = format!("{value} {unit}");
            prop_assert!(parse(&input).is_err());
        }
    }
}
