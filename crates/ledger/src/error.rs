use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger entry postings do not sum to zero for denom {denom}: imbalance {imbalance}")]
    Imbalanced { denom: String, imbalance: i64 },

    #[error("Ledger entry has no postings")]
    EmptyPostings,

    #[error("WAL envelope at offset {offset} is corrupt: stored crc {stored:#010x}, computed {computed:#010x}")]
    WalCorrupt {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// Stable string code for structured logs and API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Imbalanced { .. } | Self::EmptyPostings => "LEDGER_IMBALANCED",
            Self::WalCorrupt { .. } => "WAL_CORRUPT",
            Self::Database(_) => "LEDGER_STORE_UNAVAILABLE",
            Self::Serialization(_) | Self::Other(_) => "LEDGER_INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
