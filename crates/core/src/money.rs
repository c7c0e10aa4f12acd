//! Integer micro-USD money type
//!
//! All accounting runs on whole micro-dollars (1 USD = 1_000_000 µUSD).
//! The wire form is a decimal string so peers without 64-bit integers can
//! carry large values losslessly; parse→serialize must round-trip byte for
//! byte.

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Malformed micro-USD amount: {0:?}")]
    Malformed(String),

    #[error("Micro-USD arithmetic overflow")]
    Overflow,

    #[error("Negative amount not permitted here: {0}")]
    Negative(i64),
}

/// An amount of money in integer micro-USD.
///
/// Signed: ledger deltas go both directions. Operations that must not
/// go negative (budgets, reservations) enforce that at their own edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MicroUsd(i64);

impl MicroUsd {
    pub const ZERO: MicroUsd = MicroUsd(0);

    pub const fn new(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: MicroUsd) -> Result<MicroUsd, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(MicroUsd)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, other: MicroUsd) -> Result<MicroUsd, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(MicroUsd)
            .ok_or(MoneyError::Overflow)
    }

    /// Require a non-negative amount (reservation and budget edges).
    pub fn require_non_negative(self) -> Result<MicroUsd, MoneyError> {
        if self.0 < 0 {
            Err(MoneyError::Negative(self.0))
        } else {
            Ok(self)
        }
    }

    /// Human-facing USD rendering, exact to six decimal places.
    pub fn as_usd(self) -> Decimal {
        Decimal::new(self.0, 6)
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MicroUsd {
    type Err = MoneyError;

    /// Strict parse: only the canonical decimal rendering of an i64 is
    /// accepted, so serialize(parse(s)) == s holds for every accepted s.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .parse()
            .map_err(|_| MoneyError::Malformed(s.to_string()))?;
        if value.to_string() != s {
            return Err(MoneyError::Malformed(s.to_string()));
        }
        Ok(MicroUsd(value))
    }
}

impl Serialize for MicroUsd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MicroUsd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
