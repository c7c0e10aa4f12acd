//! Ledger account key grammar
//!
//! Keys are flat strings: `user:<id>:available`, `user:<id>:held`,
//! `system:revenue`, `system:refunds`. No hierarchy is ever traversed.

use crate::ids::{AccountId, IdError};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A posting target in the double-entry ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccountKey {
    /// Spendable balance of a user account.
    UserAvailable(AccountId),
    /// Funds reserved against in-flight requests.
    UserHeld(AccountId),
    /// System book that absorbs settled revenue.
    SystemRevenue,
    /// System book for administrative reversals.
    SystemRefunds,
}

impl AccountKey {
    pub fn available(account: &AccountId) -> Self {
        Self::UserAvailable(account.clone())
    }

    pub fn held(account: &AccountId) -> Self {
        Self::UserHeld(account.clone())
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserAvailable(id) => write!(f, "user:{}:available", id),
            Self::UserHeld(id) => write!(f, "user:{}:held", id),
            Self::SystemRevenue => f.write_str("system:revenue"),
            Self::SystemRefunds => f.write_str("system:refunds"),
        }
    }
}

impl FromStr for AccountKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system:revenue" => return Ok(Self::SystemRevenue),
            "system:refunds" => return Ok(Self::SystemRefunds),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("user:") {
            if let Some(id) = rest.strip_suffix(":available") {
                return Ok(Self::UserAvailable(AccountId::new(id)?));
            }
            if let Some(id) = rest.strip_suffix(":held") {
                return Ok(Self::UserHeld(AccountId::new(id)?));
            }
        }
        Err(IdError::Empty("account key"))
    }
}

impl Serialize for AccountKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccountKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let user = AccountId::new("u1").unwrap();
        for key in [
            AccountKey::available(&user),
            AccountKey::held(&user),
            AccountKey::SystemRevenue,
            AccountKey::SystemRefunds,
        ] {
            let text = key.to_string();
            let back: AccountKey = text.parse().unwrap();
            assert_eq!(back, key);
            assert_eq!(back.to_string(), text);
        }
    }

    #[test]
    fn test_malformed_keys_rejected() {
        for raw in ["user:u1", "user::available", "system:profit", "held:u1"] {
            assert!(raw.parse::<AccountKey>().is_err(), "accepted {:?}", raw);
        }
    }
}
