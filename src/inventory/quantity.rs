use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while interpreting a resource quantity string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("quantity {0:?} out of range")]
    OutOfRange(String),
}

/// A Kubernetes-style resource quantity such as `500m`, `32Mi` or `2`.
///
/// The raw text is kept as-is and only interpreted on demand, so an
/// unparseable capacity on one node never fails a whole snapshot load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Quantity(String);

/// Suffix multiplier expressed as a rational `num / den` to keep
/// integer inputs exact.
struct Scale {
    num: i128,
    den: i128,
}

const BINARY_SUFFIXES: &[(&str, i128)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

fn decimal_suffix(c: char) -> Option<Scale> {
    let (num, den) = match c {
        'n' => (1, 1_000_000_000),
        'u' => (1, 1_000_000),
        'm' => (1, 1_000),
        'k' => (1_000, 1),
        'M' => (1_000_000, 1),
        'G' => (1_000_000_000, 1),
        'T' => (1_000_000_000_000, 1),
        'P' => (1_000_000_000_000_000, 1),
        'E' => (1_000_000_000_000_000_000, 1),
        _ => return None,
    };
    Some(Scale { num, den })
}

impl Quantity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the quantity in thousandths of its base unit, rounded up.
    ///
    /// `500m` CPU is 500, `1` CPU is 1000, `1Ki` bytes is 1_024_000.
    pub fn milli_value(&self) -> Result<i64, QuantityError> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (number, scale) = split_suffix(raw);
        if number.is_empty() {
            return Err(QuantityError::Invalid(raw.to_string()));
        }

        let milli = if let Ok(int) = number.parse::<i128>() {
            let numerator = int
                .checked_mul(scale.num)
                .and_then(|v| v.checked_mul(1_000))
                .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;
            ceil_div(numerator, scale.den)
        } else {
            let value: f64 = number
                .parse()
                .map_err(|_| QuantityError::Invalid(raw.to_string()))?;
            if !value.is_finite() {
                return Err(QuantityError::Invalid(raw.to_string()));
            }
            let scaled = (value * scale.num as f64 * 1_000.0 / scale.den as f64).ceil();
            if scaled.abs() > i64::MAX as f64 {
                return Err(QuantityError::OutOfRange(raw.to_string()));
            }
            scaled as i128
        };

        i64::try_from(milli).map_err(|_| QuantityError::OutOfRange(raw.to_string()))
    }

    /// Returns the quantity in whole base units, rounded up.
    pub fn value(&self) -> Result<i64, QuantityError> {
        let milli = self.milli_value()?;
        Ok(ceil_div(i128::from(milli), 1_000) as i64)
    }
}

fn split_suffix(raw: &str) -> (&str, Scale) {
    for (suffix, mult) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, Scale { num: *mult, den: 1 });
        }
    }

    // A trailing 'E' is the exa suffix; an exponent always ends in a digit.
    if let Some(last) = raw.chars().last() {
        if let Some(scale) = decimal_suffix(last) {
            return (&raw[..raw.len() - last.len_utf8()], scale);
        }
    }

    (raw, Scale { num: 1, den: 1 })
}

fn ceil_div(n: i128, d: i128) -> i128 {
    let q = n / d;
    if n % d != 0 && (n > 0) == (d > 0) {
        q + 1
    } else {
        q
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Snapshots written by hand sometimes carry bare numbers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Int(i) => Self(i.to_string()),
            Raw::Float(f) => Self(f.to_string()),
        })
    }
}
