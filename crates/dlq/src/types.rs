use chrono::{DateTime, Duration, Utc};
use meridian_core::BillingEntryId;
use serde::{Deserialize, Serialize};

/// A settlement attempt parked for durable retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub reservation_id: BillingEntryId,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    /// Human-readable failure reason from the last attempt.
    pub reason: String,
    /// HTTP status of the last settlement response, if one arrived.
    pub response_status: Option<u16>,
    pub created_at: DateTime<Utc>,
    /// The settlement request body to replay.
    pub payload: serde_json::Value,
    /// Entries past this point are garbage; readers treat them as absent.
    pub expires_at: DateTime<Utc>,
}

/// Schedule index member: when a reservation is next due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleMember {
    pub reservation_id: BillingEntryId,
    pub score_ms: i64,
}

/// Claim lock held by one replay worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLock {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Audit record for a terminally dropped entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub entry: DlqEntry,
    pub dropped_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of the startup durability probe. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceStatus {
    /// Backing store confirms append-only durability.
    Verified,
    /// Store is volatile (in-memory engine).
    NotEnabled,
    /// Store refused the introspection call; common on managed hosts.
    CheckRestricted,
}

/// Tuning knobs for the retry store.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub lock_ttl: Duration,
    pub terminal_retention: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval: Duration::minutes(10),
            lock_ttl: Duration::seconds(60),
            terminal_retention: Duration::days(7),
        }
    }
}

impl DlqConfig {
    /// Payload TTL: the whole retry window plus an hour of slack.
    pub fn entry_ttl(&self) -> Duration {
        self.retry_interval * self.max_retries as i32 + Duration::hours(1)
    }
}
