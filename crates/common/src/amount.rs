//! Fixed-point decimal amount used for stock counts and account money.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A decimal amount with two fractional digits.
///
/// Stored as hundredths to avoid floating point issues (e.g. `1050` is
/// `10.50`). Stock quantities are whole amounts; money may carry cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount {
    hundredths: i64,
}

impl Amount {
    /// Largest whole-unit value that fits.
    pub const MAX_UNITS: i64 = i64::MAX / 100;

    /// Creates an amount from whole units.
    ///
    /// Saturates at the representable range; use [`try_from_units`](Self::try_from_units)
    /// for untrusted input.
    pub fn from_units(units: i64) -> Self {
        Self {
            hundredths: units.saturating_mul(100),
        }
    }

    /// Creates an amount from whole units, returning `None` on overflow.
    pub fn try_from_units(units: i64) -> Option<Self> {
        units.checked_mul(100).map(Self::from_hundredths)
    }

    /// Creates an amount from hundredths (cents).
    pub fn from_hundredths(hundredths: i64) -> Self {
        Self { hundredths }
    }

    /// Returns zero.
    pub fn zero() -> Self {
        Self { hundredths: 0 }
    }

    /// Returns the amount in hundredths.
    pub fn hundredths(&self) -> i64 {
        self.hundredths
    }

    /// Returns the amount as whole units if it has no fractional part.
    pub fn whole_units(&self) -> Option<i64> {
        (self.hundredths % 100 == 0).then_some(self.hundredths / 100)
    }

    /// Returns true if the amount is greater than zero.
    pub fn is_positive(&self) -> bool {
        self.hundredths > 0
    }

    /// Returns true if the amount is below zero.
    pub fn is_negative(&self) -> bool {
        self.hundredths < 0
    }

    /// Adds two amounts, returning `None` on overflow.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.hundredths.checked_add(other.hundredths).map(Self::from_hundredths)
    }

    /// Subtracts two amounts, returning `None` on overflow.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.hundredths.checked_sub(other.hundredths).map(Self::from_hundredths)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.hundredths < 0 { "-" } else { "" };
        let abs = self.hundredths.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Error returned when parsing an [`Amount`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{input}': {reason}")]
pub struct ParseAmountError {
    pub input: String,
    pub reason: &'static str,
}

impl std::str::FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| ParseAmountError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("expected digits before the decimal point"));
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("expected digits after the decimal point"));
        }
        if fraction.len() > 2 {
            return Err(fail("at most two fractional digits are supported"));
        }

        let whole: i64 = whole.parse().map_err(|_| fail("amount is too large"))?;
        let fraction: i64 = format!("{fraction:0<2}")
            .parse()
            .map_err(|_| fail("expected digits after the decimal point"))?;

        let hundredths = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(fraction))
            .ok_or_else(|| fail("amount is too large"))?;

        Ok(Self::from_hundredths(if negative {
            -hundredths
        } else {
            hundredths
        }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match AmountRepr::deserialize(deserializer)? {
            AmountRepr::Integer(units) => units
                .checked_mul(100)
                .map(Amount::from_hundredths)
                .ok_or_else(|| serde::de::Error::custom("amount is too large")),
            AmountRepr::Float(value) => value
                .to_string()
                .parse()
                .map_err(serde::de::Error::custom),
            AmountRepr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
