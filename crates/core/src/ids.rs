//! Identifier newtypes
//!
//! Long-lived entity ids are ULIDs: 26-character Crockford base32,
//! lexicographically sortable by creation time. The ledger rejects
//! anything that does not parse.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid billing entry id (expected 26-char ULID): {0:?}")]
    InvalidBillingEntryId(String),

    #[error("Empty identifier for {0}")]
    Empty(&'static str),
}

/// Primary key of a billing entry / reservation. Time-sortable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingEntryId(Ulid);

impl BillingEntryId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for BillingEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BillingEntryId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Ulid::from_string accepts exactly the 26-char base32 form.
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| IdError::InvalidBillingEntryId(s.to_string()))
    }
}

impl Serialize for BillingEntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BillingEntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
                let raw = raw.into();
                if raw.is_empty() {
                    return Err(IdError::Empty($label));
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Account charged by the ledger (a tenant user or a system book).
    AccountId,
    "account id"
);

string_id!(
    /// Authorization-granular bundle of provider+model.
    PoolId,
    "pool id"
);

string_id!(
    /// Caller-supplied request grouping key. Collisions are allowed.
    CorrelationId,
    "correlation id"
);

string_id!(
    /// Per-request trace key, used to scope tool-result memoization.
    TraceId,
    "trace id"
);

impl CorrelationId {
    /// Fresh random correlation id for callers that did not supply one.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl TraceId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
