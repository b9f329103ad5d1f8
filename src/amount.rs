//! Fixed-point amounts
//!
//! Amounts are kept in base units (1e-8 of a major unit), the same way the chain
//! reports them, so fee rounding to 8 decimals is exact integer math.

use crate::EscrowError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Base units per major unit (satoshis / litoshis per coin)
pub const BASE_UNITS_PER_COIN: u64 = 100_000_000;

const DECIMALS: usize = 8;

/// An amount of a currency in base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    /// Zero
    pub const ZERO: Amount = Amount(0);

    /// Create an amount from base units
    pub const fn from_base_units(units: u64) -> Self {
        Self(units)
    }

    /// Amount in base units
    pub const fn base_units(&self) -> u64 {
        self.0
    }

    /// Apply a fee expressed in parts per million, rounding half up to the nearest base unit
    pub fn with_fee_ppm(&self, fee_ppm: u64) -> Amount {
        let fee = (self.0 as u128 * fee_ppm as u128 + 500_000) / 1_000_000;
        Amount(self.0.saturating_add(fee as u64))
    }

    /// Subtract, clamping at zero
    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Add, clamping at u64::MAX
    pub fn saturating_add(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }
}

impl FromStr for Amount {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || EscrowError::Validation(format!("Invalid amount: '{}'", s));

        if s.is_empty() {
            return Err(invalid());
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > DECIMALS {
            return Err(EscrowError::Validation(format!(
                "Invalid amount: '{}' has more than {} decimal places",
                s, DECIMALS
            )));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_units: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac, width = DECIMALS)
                .parse()
                .map_err(|_| invalid())?
        };

        whole
            .checked_mul(BASE_UNITS_PER_COIN)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Amount {
    /// Formats in major units without trailing zeros (`0.00102`, `1`)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / BASE_UNITS_PER_COIN;
        let frac = self.0 % BASE_UNITS_PER_COIN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:0width$}", frac, width = DECIMALS);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(amt("1").base_units(), 100_000_000);
        assert_eq!(amt("0.0003").base_units(), 30_000);
        assert_eq!(amt(".5").base_units(), 50_000_000);
        assert_eq!(amt("0.00000001").base_units(), 1);
        assert_eq!(amt("0.00102").to_string(), "0.00102");
        assert_eq!(amt("2.50").to_string(), "2.5");
        assert_eq!(amt("3").to_string(), "3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", ".", "-1", "1e5", "0.000000001", "abc", "1.2.3", "18446744073709551615"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_fee_rounds_to_eight_decimals() {
        // 2% service fee
        assert_eq!(amt("1.0").with_fee_ppm(20_000), amt("1.02"));
        assert_eq!(amt("0.0003").with_fee_ppm(20_000), amt("0.000306"));
        assert_eq!(amt("0.001").with_fee_ppm(20_000), amt("0.00102"));
        // 0.00000025 * 1.02 = 0.000000255 -> rounds half up
        assert_eq!(amt("0.00000025").with_fee_ppm(20_000).base_units(), 26);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&amt("0.1")).unwrap();
        assert_eq!(json, "\"0.1\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amt("0.1"));
    }
}
