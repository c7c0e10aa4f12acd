//! Write-ahead log
//!
//! Append-only sequence of state-change envelopes, one per billing or
//! ledger transition. Each envelope carries a CRC32 over the canonical
//! serialization of its payload; replay at startup verifies every
//! checksum before any state is rebuilt.

use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use meridian_core::canonical;
use meridian_core::{BillingEntryId, CorrelationId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;

pub const WAL_SCHEMA_VERSION: u16 = 1;

const TABLE_WAL: &str = "wal";

/// One durable state-change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEnvelope {
    pub schema_version: u16,
    pub event_type: String,
    pub billing_entry_id: BillingEntryId,
    pub correlation_id: CorrelationId,
    pub payload: serde_json::Value,
    pub checksum: u32,
    pub timestamp: DateTime<Utc>,
    /// Assigned at append time; 0 until then.
    #[serde(default)]
    pub offset: u64,
}

impl WalEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        billing_entry_id: BillingEntryId,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let checksum = checksum_of(&payload)?;
        Ok(Self {
            schema_version: WAL_SCHEMA_VERSION,
            event_type: event_type.into(),
            billing_entry_id,
            correlation_id,
            payload,
            checksum,
            timestamp: Utc::now(),
            offset: 0,
        })
    }

    /// Recompute the checksum and compare against the stored one.
    pub fn verify(&self) -> Result<()> {
        let computed = checksum_of(&self.payload)?;
        if computed != self.checksum {
            return Err(LedgerError::WalCorrupt {
                offset: self.offset,
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

fn checksum_of(payload: &serde_json::Value) -> Result<u32> {
    let bytes = canonical::to_canonical_bytes(payload)?;
    Ok(crc32fast::hash(&bytes))
}

/// Durable append-only WAL over the document store.
pub struct WriteAheadLog {
    db: Surreal<Any>,
    next_offset: AtomicU64,
}

impl WriteAheadLog {
    /// Open the WAL, resuming the offset counter from what is on disk.
    pub async fn open(db: Surreal<Any>) -> Result<Self> {
        let existing: Vec<WalEnvelope> = db.select(TABLE_WAL).await?;
        let next = existing.iter().map(|e| e.offset + 1).max().unwrap_or(0);
        Ok(Self {
            db,
            next_offset: AtomicU64::new(next),
        })
    }

    /// Append one envelope and return its offset.
    pub async fn append(&self, mut envelope: WalEnvelope) -> Result<u64> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        envelope.offset = offset;
        let _: Option<WalEnvelope> = self
            .db
            .create((TABLE_WAL, record_id(offset)))
            .content(envelope)
            .await?;
        Ok(offset)
    }

    /// All envelopes in append order, every checksum verified.
    pub async fn replay(&self) -> Result<Vec<WalEnvelope>> {
        let mut entries: Vec<WalEnvelope> = self.db.select(TABLE_WAL).await?;
        entries.sort_by_key(|e| e.offset);
        for entry in &entries {
            entry.verify()?;
        }
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize> {
        let entries: Vec<WalEnvelope> = self.db.select(TABLE_WAL).await?;
        Ok(entries.len())
    }
}

/// Zero-padded so record ids sort in append order.
fn record_id(offset: u64) -> String {
    format!("{:020}", offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_is_canonical() {
        let a = WalEnvelope::new(
            "reserve",
            BillingEntryId::generate(),
            CorrelationId::random(),
            json!({"b": 1, "a": 2}),
        )
        .unwrap();
        let b = WalEnvelope::new(
            "reserve",
            a.billing_entry_id.clone(),
            a.correlation_id.clone(),
            json!({"a": 2, "b": 1}),
        )
        .unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert!(a.verify().is_ok());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut envelope = WalEnvelope::new(
            "commit",
            BillingEntryId::generate(),
            CorrelationId::random(),
            json!({"actual_cost": "2500"}),
        )
        .unwrap();
        envelope.payload = json!({"actual_cost": "9999"});
        assert!(matches!(
            envelope.verify(),
            Err(LedgerError::WalCorrupt { .. })
        ));
    }
}
