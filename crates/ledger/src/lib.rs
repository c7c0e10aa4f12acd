//! Meridian Ledger - Double-entry accounting truth
//!
//! An append-only log of balanced postings. Balances are never stored;
//! they are always derived by folding the log, so the entry sequence is
//! the single source of financial truth.

pub mod error;
pub mod postings;
pub mod types;
pub mod wal;

use crate::error::{LedgerError, Result};
use crate::types::{LedgerEntry, Posting};
use crate::wal::{WalEnvelope, WriteAheadLog};
use meridian_core::{AccountKey, MicroUsd};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, warn};

const TABLE_ENTRIES: &str = "ledger_entries";

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entry accepted at this WAL offset.
    Appended(u64),
    /// Identical entry already in the log; nothing changed.
    Duplicate,
}

/// The double-entry ledger.
///
/// Single writer, many readers: appends are serialized through an async
/// mutex, reads fold an in-memory snapshot of the log.
pub struct Ledger {
    db: Surreal<Any>,
    wal: Arc<WriteAheadLog>,
    log: RwLock<Vec<LedgerEntry>>,
    seen: RwLock<HashSet<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Ledger {
    /// Open the ledger, rebuilding the in-memory log from the journal.
    ///
    /// WAL replay runs first so a crash between WAL append and journal
    /// write is healed before any balance is derived.
    pub async fn open(db: Surreal<Any>) -> Result<Self> {
        let wal = Arc::new(WriteAheadLog::open(db.clone()).await?);
        // Verify every WAL checksum up front; corrupt history is fatal.
        let _ = wal.replay().await?;

        let mut entries: Vec<LedgerEntry> = db.select(TABLE_ENTRIES).await?;
        entries.sort_by_key(|e| e.wal_offset);
        let seen = entries.iter().map(|e| e.dedup_key()).collect();
        debug!(entries = entries.len(), "Ledger journal loaded");

        Ok(Self {
            db,
            wal,
            log: RwLock::new(entries),
            seen: RwLock::new(seen),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn wal(&self) -> Arc<WriteAheadLog> {
        Arc::clone(&self.wal)
    }

    /// Append a balanced entry.
    ///
    /// Validation order: postings present, zero-sum per denomination,
    /// idempotency. The WAL record lands before the in-memory log
    /// mutates and before the journal write.
    pub async fn append_entry(&self, mut entry: LedgerEntry) -> Result<AppendOutcome> {
        validate_postings(&entry.postings)?;

        let _guard = self.write_lock.lock().await;

        let key = entry.dedup_key();
        if self.seen.read().contains(&key) {
            debug!(entry = %key, "Duplicate ledger entry replayed, no-op");
            return Ok(AppendOutcome::Duplicate);
        }

        let envelope = WalEnvelope::new(
            entry.event_type.as_str(),
            entry.billing_entry_id.clone(),
            entry.correlation_id.clone(),
            serde_json::to_value(&entry)?,
        )?;
        let offset = self.wal.append(envelope).await?;
        entry.wal_offset = offset;

        {
            let mut log = self.log.write();
            self.seen.write().insert(key.clone());
            log.push(entry.clone());
        }

        // Journal after the in-memory commit; replay from WAL covers a
        // crash in between.
        let created: std::result::Result<Option<LedgerEntry>, surrealdb::Error> = self
            .db
            .create((TABLE_ENTRIES, key.as_str()))
            .content(entry)
            .await;
        if let Err(e) = created {
            warn!(entry = %key, error = %e, "Ledger journal write failed after WAL append");
            return Err(e.into());
        }

        Ok(AppendOutcome::Appended(offset))
    }

    /// Fold the log left-to-right for one account.
    pub fn derive_balance(&self, account: &AccountKey) -> MicroUsd {
        let log = self.log.read();
        let mut total = 0i64;
        for entry in log.iter() {
            for posting in &entry.postings {
                if &posting.account == account {
                    total += posting.delta.get();
                }
            }
        }
        MicroUsd::new(total)
    }

    /// Full balance map in one pass over the log.
    pub fn derive_all_balances(&self) -> HashMap<AccountKey, MicroUsd> {
        let log = self.log.read();
        let mut balances: HashMap<AccountKey, i64> = HashMap::new();
        for entry in log.iter() {
            for posting in &entry.postings {
                *balances.entry(posting.account.clone()).or_default() += posting.delta.get();
            }
        }
        balances
            .into_iter()
            .map(|(k, v)| (k, MicroUsd::new(v)))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.log.read().len()
    }

    /// Snapshot of the log in append order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.log.read().clone()
    }
}

fn validate_postings(postings: &[Posting]) -> Result<()> {
    if postings.is_empty() {
        return Err(LedgerError::EmptyPostings);
    }
    let mut sums: HashMap<&str, i64> = HashMap::new();
    for posting in postings {
        *sums.entry(posting.denom.as_str()).or_default() += posting.delta.get();
    }
    for (denom, sum) in sums {
        if sum != 0 {
            return Err(LedgerError::Imbalanced {
                denom: denom.to_string(),
                imbalance: sum,
            });
        }
    }
    Ok(())
}

pub use error::LedgerError as Error;
pub use types::{EventType, Rounding, DENOM_MICRO_USD};
