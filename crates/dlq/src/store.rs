//! Durable claim-locked retry store
//!
//! Four keyspaces per reservation: payload, schedule member, claim lock,
//! terminal audit record. Every multi-key mutation is a single SurrealQL
//! transaction so a crash can never leave the keyspaces disagreeing.

use crate::error::{DlqError, Result};
use crate::types::{
    ClaimLock, DlqConfig, DlqEntry, PersistenceStatus, ScheduleMember, TerminalRecord,
};
use chrono::{DateTime, Utc};
use meridian_core::BillingEntryId;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

const TABLE_ENTRY: &str = "dlq_entry";
const TABLE_SCHEDULE: &str = "dlq_schedule";
const TABLE_LOCK: &str = "dlq_lock";
const TABLE_TERMINAL: &str = "dlq_terminal";

pub struct DlqStore {
    db: Surreal<Any>,
    config: DlqConfig,
    /// Connection URL, kept for the durability probe.
    store_url: String,
}

impl DlqStore {
    pub fn new(db: Surreal<Any>, store_url: impl Into<String>, config: DlqConfig) -> Self {
        Self {
            db,
            config,
            store_url: store_url.into(),
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Insert a new entry, or refresh an existing one and bump its
    /// attempt count. Payload and schedule member move together.
    pub async fn upsert(
        &self,
        reservation_id: &BillingEntryId,
        reason: &str,
        response_status: Option<u16>,
        payload: serde_json::Value,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<DlqEntry> {
        let rid = reservation_id.to_string();
        let existing: Option<DlqEntry> = self.db.select((TABLE_ENTRY, rid.as_str())).await?;

        let now = Utc::now();
        let entry = match existing {
            Some(mut entry) => {
                entry.attempt_count += 1;
                entry.next_attempt_at = next_attempt_at;
                entry.reason = reason.to_string();
                entry.response_status = response_status;
                entry
            }
            None => DlqEntry {
                reservation_id: reservation_id.clone(),
                attempt_count: 1,
                next_attempt_at,
                reason: reason.to_string(),
                response_status,
                created_at: now,
                payload,
                expires_at: now + self.config.entry_ttl(),
            },
        };

        let member = ScheduleMember {
            reservation_id: reservation_id.clone(),
            score_ms: next_attempt_at.timestamp_millis(),
        };

        self.db
            .query(
                "BEGIN TRANSACTION;
                 UPSERT type::thing($entry_tb, $rid) CONTENT $entry;
                 UPSERT type::thing($sched_tb, $rid) CONTENT $member;
                 COMMIT TRANSACTION;",
            )
            .bind(("entry_tb", TABLE_ENTRY))
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("rid", rid))
            .bind(("entry", entry.clone()))
            .bind(("member", member))
            .await?;

        debug!(reservation = %reservation_id, attempts = entry.attempt_count, "DLQ entry upserted");
        Ok(entry)
    }

    pub async fn get(&self, reservation_id: &BillingEntryId) -> Result<Option<DlqEntry>> {
        let rid = reservation_id.to_string();
        let entry: Option<DlqEntry> = self.db.select((TABLE_ENTRY, rid.as_str())).await?;
        Ok(entry.filter(|e| e.expires_at > Utc::now()))
    }

    /// Remove payload, schedule member, and lock in one step.
    pub async fn delete(&self, reservation_id: &BillingEntryId) -> Result<()> {
        let rid = reservation_id.to_string();
        self.db
            .query(
                "BEGIN TRANSACTION;
                 DELETE type::thing($entry_tb, $rid);
                 DELETE type::thing($sched_tb, $rid);
                 DELETE type::thing($lock_tb, $rid);
                 COMMIT TRANSACTION;",
            )
            .bind(("entry_tb", TABLE_ENTRY))
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("lock_tb", TABLE_LOCK))
            .bind(("rid", rid))
            .await?;
        Ok(())
    }

    /// Bump the attempt counter and reschedule. Caller holds the claim
    /// lock, which is what serializes this read-modify-write.
    pub async fn increment_attempt(
        &self,
        reservation_id: &BillingEntryId,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<DlqEntry> {
        let rid = reservation_id.to_string();
        let mut entry: DlqEntry = self
            .db
            .select((TABLE_ENTRY, rid.as_str()))
            .await?
            .ok_or_else(|| DlqError::NotFound(rid.clone()))?;

        entry.attempt_count += 1;
        entry.next_attempt_at = next_attempt_at;

        let member = ScheduleMember {
            reservation_id: reservation_id.clone(),
            score_ms: next_attempt_at.timestamp_millis(),
        };

        self.db
            .query(
                "BEGIN TRANSACTION;
                 UPSERT type::thing($entry_tb, $rid) CONTENT $entry;
                 UPSERT type::thing($sched_tb, $rid) CONTENT $member;
                 COMMIT TRANSACTION;",
            )
            .bind(("entry_tb", TABLE_ENTRY))
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("rid", rid))
            .bind(("entry", entry.clone()))
            .bind(("member", member))
            .await?;

        Ok(entry)
    }

    /// Move the payload to the 7-day terminal keyspace and clear every
    /// active key.
    pub async fn terminal_drop(&self, reservation_id: &BillingEntryId) -> Result<()> {
        let rid = reservation_id.to_string();
        let entry: DlqEntry = self
            .db
            .select((TABLE_ENTRY, rid.as_str()))
            .await?
            .ok_or_else(|| DlqError::NotFound(rid.clone()))?;

        let now = Utc::now();
        let record = TerminalRecord {
            entry,
            dropped_at: now,
            expires_at: now + self.config.terminal_retention,
        };

        self.db
            .query(
                "BEGIN TRANSACTION;
                 UPSERT type::thing($term_tb, $rid) CONTENT $record;
                 DELETE type::thing($entry_tb, $rid);
                 DELETE type::thing($sched_tb, $rid);
                 DELETE type::thing($lock_tb, $rid);
                 COMMIT TRANSACTION;",
            )
            .bind(("term_tb", TABLE_TERMINAL))
            .bind(("entry_tb", TABLE_ENTRY))
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("lock_tb", TABLE_LOCK))
            .bind(("rid", rid))
            .bind(("record", record))
            .await?;

        info!(reservation = %reservation_id, "DLQ entry terminally dropped");
        Ok(())
    }

    /// Reservations due at or before `now`, oldest first.
    ///
    /// A schedule member whose payload is gone (TTL expired) is an
    /// orphan; it is removed on the same call and never returned.
    pub async fn get_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BillingEntryId>> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM type::table($sched_tb)
                 WHERE score_ms <= $now_ms
                 ORDER BY score_ms ASC
                 LIMIT $limit",
            )
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("now_ms", now.timestamp_millis()))
            .bind(("limit", limit as i64))
            .await?;
        let members: Vec<ScheduleMember> = response.take(0)?;

        let mut ready = Vec::with_capacity(members.len());
        for member in members {
            match self.get(&member.reservation_id).await? {
                Some(_) => ready.push(member.reservation_id),
                None => {
                    warn!(
                        reservation = %member.reservation_id,
                        "Orphaned DLQ schedule member (payload expired), repairing"
                    );
                    self.remove_schedule_member(&member.reservation_id).await?;
                }
            }
        }
        Ok(ready)
    }

    async fn remove_schedule_member(&self, reservation_id: &BillingEntryId) -> Result<()> {
        let rid = reservation_id.to_string();
        self.db
            .query(
                "BEGIN TRANSACTION;
                 DELETE type::thing($sched_tb, $rid);
                 DELETE type::thing($entry_tb, $rid);
                 COMMIT TRANSACTION;",
            )
            .bind(("sched_tb", TABLE_SCHEDULE))
            .bind(("entry_tb", TABLE_ENTRY))
            .bind(("rid", rid))
            .await?;
        Ok(())
    }

    /// Take the claim lock for one reservation. Create-if-absent
    /// semantics: false means another worker holds a live claim.
    pub async fn claim_for_replay(
        &self,
        reservation_id: &BillingEntryId,
        holder: &str,
    ) -> Result<bool> {
        let rid = reservation_id.to_string();
        let now = Utc::now();
        let lock = ClaimLock {
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + self.config.lock_ttl,
        };

        let attempt = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 DELETE type::thing($lock_tb, $rid) WHERE expires_at < $now;
                 CREATE type::thing($lock_tb, $rid) CONTENT $lock;
                 COMMIT TRANSACTION;",
            )
            .bind(("lock_tb", TABLE_LOCK))
            .bind(("rid", rid))
            .bind(("now", now))
            .bind(("lock", lock))
            .await;

        match attempt {
            Ok(mut response) => match response.take::<Vec<ClaimLock>>(1) {
                Ok(_) => Ok(true),
                // CREATE collided with a live lock inside the transaction.
                Err(_) => Ok(false),
            },
            Err(_) => Ok(false),
        }
    }

    pub async fn release_claim(&self, reservation_id: &BillingEntryId) -> Result<()> {
        let rid = reservation_id.to_string();
        let _: Option<ClaimLock> = self.db.delete((TABLE_LOCK, rid.as_str())).await?;
        Ok(())
    }

    /// Terminal audit records still inside their retention window.
    pub async fn terminal_records(&self) -> Result<Vec<TerminalRecord>> {
        let records: Vec<TerminalRecord> = self.db.select(TABLE_TERMINAL).await?;
        let now = Utc::now();
        Ok(records.into_iter().filter(|r| r.expires_at > now).collect())
    }

    /// Startup durability probe. Never an error: managed stores may
    /// refuse introspection, and that is an answer too.
    pub async fn persistence_check(&self) -> PersistenceStatus {
        if self.store_url.starts_with("mem://") {
            return PersistenceStatus::NotEnabled;
        }
        match self.db.query("INFO FOR DB").await {
            Ok(_) => PersistenceStatus::Verified,
            Err(e) => {
                warn!(error = %e, "Durability introspection refused by store");
                PersistenceStatus::CheckRestricted
            }
        }
    }
}
