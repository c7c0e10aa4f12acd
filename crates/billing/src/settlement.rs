//! External settlement
//!
//! At-least-once delivery of actual costs to the remote billing
//! service: a signed HTTP client, and a replay worker that drains the
//! DLQ with claim locks, exponential backoff, and terminal drop.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ProtocolError, Result};
use crate::machine::BillingMachine;
use crate::state::BillingState;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use meridian_core::config::Environment;
use meridian_core::{canonical, AccountId, BillingEntryId, MicroUsd};
use meridian_dlq::DlqStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Contract version this gateway speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 2;

const SETTLEMENT_DOWNSTREAM: &str = "settlement";
const TOKEN_TTL_SECS: i64 = 300;

/// Body posted to the external billing service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementRequest {
    pub reservation_id: BillingEntryId,
    /// Decimal string on the wire.
    pub actual_cost_micro: MicroUsd,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_anchor: Option<String>,
    /// Groups branch records of one ensemble run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble_id: Option<String>,
}

/// Why one settlement attempt did not succeed.
#[derive(Debug, Clone)]
pub struct SettlementFailure {
    pub reason: String,
    pub response_status: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct ContractVersion {
    protocol_version: u32,
}

/// Seam between the replay worker and the wire.
#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn settle(
        &self,
        request: &SettlementRequest,
    ) -> std::result::Result<(), SettlementFailure>;
}

/// Signed HTTP client for the external billing service.
pub struct HttpSettlementClient {
    http: reqwest::Client,
    base_url: String,
    issuer: String,
    audience: String,
    signing_key: Option<EncodingKey>,
    environment: Environment,
}

impl HttpSettlementClient {
    pub fn new(
        base_url: impl Into<String>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        signing_key_pem: Option<&str>,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        let signing_key = signing_key_pem
            .map(|pem| EncodingKey::from_ec_pem(pem.as_bytes()))
            .transpose()?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            issuer: issuer.into(),
            audience: audience.into(),
            signing_key,
            environment,
        })
    }

    /// Fetch the remote contract version and compare. Incompatibility
    /// is fatal in production, a warning in development.
    pub async fn handshake(&self) -> Result<()> {
        let url = format!("{}/contract/version", self.base_url);
        let response = self.http.get(&url).send().await.map_err(|e| {
            ProtocolError::Unreachable(format!("{}: {}", url, e))
        })?;
        let remote: ContractVersion = response
            .json()
            .await
            .map_err(|e| ProtocolError::Unreachable(format!("malformed version body: {}", e)))?;

        if remote.protocol_version != SUPPORTED_PROTOCOL_VERSION {
            let incompatible = ProtocolError::Incompatible {
                local: SUPPORTED_PROTOCOL_VERSION,
                remote: remote.protocol_version,
            };
            match self.environment {
                Environment::Production => return Err(incompatible.into()),
                Environment::Development => {
                    warn!(
                        local = SUPPORTED_PROTOCOL_VERSION,
                        remote = remote.protocol_version,
                        "Settlement protocol mismatch, continuing in development"
                    );
                }
            }
        }
        Ok(())
    }

    /// Short-lived ES256 token over `{sub, iss, aud, iat, exp}`.
    fn token(&self, reservation_id: &BillingEntryId) -> anyhow::Result<Option<String>> {
        let Some(key) = &self.signing_key else {
            // Development without a key: send unsigned, remote side
            // decides whether to accept.
            return Ok(None);
        };
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: reservation_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, key)?;
        Ok(Some(token))
    }
}

#[async_trait]
impl SettlementApi for HttpSettlementClient {
    async fn settle(
        &self,
        request: &SettlementRequest,
    ) -> std::result::Result<(), SettlementFailure> {
        let body = canonical::to_canonical_bytes(request).map_err(|e| SettlementFailure {
            reason: format!("serialize: {}", e),
            response_status: None,
        })?;

        let mut builder = self
            .http
            .post(format!("{}/settlements", self.base_url))
            .header("Content-Type", "application/json")
            .body(body);

        match self.token(&request.reservation_id) {
            Ok(Some(token)) => {
                builder = builder.header("Authorization", format!("Bearer {}", token));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(SettlementFailure {
                    reason: format!("token signing: {}", e),
                    response_status: None,
                });
            }
        }

        let response = builder.send().await.map_err(|e| SettlementFailure {
            reason: format!("network: {}", e),
            response_status: None,
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = response.text().await.unwrap_or_default();
            Err(SettlementFailure {
                reason: format!("http {}: {}", status.as_u16(), detail),
                response_status: Some(status.as_u16()),
            })
        }
    }
}

/// Stats from one drain pass, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub claimed: usize,
    pub acked: usize,
    pub retried: usize,
    pub dropped: usize,
    pub skipped: usize,
}

/// Replays parked settlements out of the DLQ.
pub struct ReplayWorker {
    machine: Arc<BillingMachine>,
    dlq: Arc<DlqStore>,
    api: Arc<dyn SettlementApi>,
    breaker: Arc<CircuitBreaker>,
    worker_id: String,
    batch_size: usize,
}

impl ReplayWorker {
    pub fn new(
        machine: Arc<BillingMachine>,
        dlq: Arc<DlqStore>,
        api: Arc<dyn SettlementApi>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            machine,
            dlq,
            api,
            breaker,
            worker_id: format!("replay-{}", uuid::Uuid::new_v4()),
            batch_size: 32,
        }
    }

    /// First settlement attempt for a freshly committed entry.
    ///
    /// Success acks the entry immediately; any failure parks it in the
    /// DLQ and never reaches the caller's critical path. Returns whether
    /// the remote acknowledged.
    pub async fn settle_entry(&self, request: &SettlementRequest) -> Result<bool> {
        if !self.breaker.allow_request(SETTLEMENT_DOWNSTREAM) {
            let failure = SettlementFailure {
                reason: "settlement circuit open".to_string(),
                response_status: None,
            };
            self.machine
                .record_finalize_attempt(&request.reservation_id)
                .await?;
            self.enqueue_failure(request, &failure).await?;
            return Ok(false);
        }

        self.machine
            .record_finalize_attempt(&request.reservation_id)
            .await?;
        match self.api.settle(request).await {
            Ok(()) => {
                self.breaker.record_success(SETTLEMENT_DOWNSTREAM);
                self.machine
                    .mark_finalize_acked(&request.reservation_id)
                    .await?;
                Ok(true)
            }
            Err(failure) => {
                self.breaker.record_failure(SETTLEMENT_DOWNSTREAM);
                warn!(
                    reservation = %request.reservation_id,
                    reason = %failure.reason,
                    "Initial settlement failed, parking in DLQ"
                );
                self.enqueue_failure(request, &failure).await?;
                Ok(false)
            }
        }
    }

    /// Park a failed settlement for durable retry.
    pub async fn enqueue_failure(
        &self,
        request: &SettlementRequest,
        failure: &SettlementFailure,
    ) -> Result<()> {
        let payload = serde_json::to_value(request)?;
        let next = next_attempt_at(Utc::now(), 1, self.dlq.config().retry_interval);
        self.dlq
            .upsert(
                &request.reservation_id,
                &failure.reason,
                failure.response_status,
                payload,
                next,
            )
            .await?;
        Ok(())
    }

    /// One drain pass over everything currently due.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let ready = self.dlq.get_ready(now, self.batch_size).await?;

        for rid in ready {
            if !self.dlq.claim_for_replay(&rid, &self.worker_id).await? {
                stats.skipped += 1;
                continue;
            }
            stats.claimed += 1;
            let result = self.replay_one(&rid, now, &mut stats).await;
            self.dlq.release_claim(&rid).await?;
            if let Err(e) = result {
                error!(reservation = %rid, error = %e, "Replay pass failed");
            }
        }
        Ok(stats)
    }

    async fn replay_one(
        &self,
        rid: &BillingEntryId,
        now: DateTime<Utc>,
        stats: &mut ReplayStats,
    ) -> Result<()> {
        let Some(dlq_entry) = self.dlq.get(rid).await? else {
            stats.skipped += 1;
            return Ok(());
        };

        // Entries whose billing state moved on (operator action, startup
        // recovery) are stale; drop them from the queue.
        let billing = self.machine.get(rid).await?;
        let still_pending = billing
            .as_ref()
            .map(|b| b.state == BillingState::FinalizePending)
            .unwrap_or(false);
        if !still_pending {
            self.dlq.delete(rid).await?;
            stats.skipped += 1;
            return Ok(());
        }

        if !self.breaker.allow_request(SETTLEMENT_DOWNSTREAM) {
            stats.skipped += 1;
            return Ok(());
        }

        let request: SettlementRequest = serde_json::from_value(dlq_entry.payload.clone())?;
        self.machine.record_finalize_attempt(rid).await?;

        match self.api.settle(&request).await {
            Ok(()) => {
                self.breaker.record_success(SETTLEMENT_DOWNSTREAM);
                self.machine.mark_finalize_acked(rid).await?;
                self.dlq.delete(rid).await?;
                stats.acked += 1;
                info!(reservation = %rid, "Settlement acknowledged on replay");
            }
            Err(failure) => {
                self.breaker.record_failure(SETTLEMENT_DOWNSTREAM);
                let attempts = dlq_entry.attempt_count + 1;
                if attempts >= self.dlq.config().max_retries {
                    self.machine.mark_finalize_failed(rid).await?;
                    self.dlq.terminal_drop(rid).await?;
                    stats.dropped += 1;
                    warn!(
                        reservation = %rid,
                        attempts = attempts,
                        reason = %failure.reason,
                        "Settlement retries exhausted, entry terminal"
                    );
                } else {
                    let next =
                        next_attempt_at(now, attempts, self.dlq.config().retry_interval);
                    self.dlq.increment_attempt(rid, next).await?;
                    stats.retried += 1;
                }
            }
        }
        Ok(())
    }

    /// Long-running drain loop; exits when the token fires.
    pub async fn run(&self, cancel: CancellationToken, poll_interval: Duration) {
        info!(worker = %self.worker_id, "Settlement replay worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %self.worker_id, "Replay worker stopping");
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Replay pass errored");
                    }
                }
            }
        }
    }
}

/// Exponential backoff with ±20% jitter.
fn next_attempt_at(now: DateTime<Utc>, attempts: u32, base: ChronoDuration) -> DateTime<Utc> {
    let exponent = attempts.saturating_sub(1).min(6);
    let base_ms = base.num_milliseconds().max(1) * (1 << exponent);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let delay_ms = (base_ms as f64 * jitter) as i64;
    now + ChronoDuration::milliseconds(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_attempts() {
        let now = Utc::now();
        let base = ChronoDuration::minutes(10);
        let first = next_attempt_at(now, 1, base) - now;
        let fourth = next_attempt_at(now, 4, base) - now;
        assert!(fourth > first * 4);
        // Jitter stays inside the ±20% envelope.
        assert!(first >= ChronoDuration::minutes(8));
        assert!(first <= ChronoDuration::minutes(12));
    }

    #[test]
    fn test_settlement_request_wire_shape() {
        let request = SettlementRequest {
            reservation_id: BillingEntryId::generate(),
            actual_cost_micro: MicroUsd::new(2_500),
            account_id: Some(AccountId::new("u1").unwrap()),
            identity_anchor: None,
            ensemble_id: None,
        };
        let wire = canonical::to_canonical_string(&request).unwrap();
        // Amounts travel as decimal strings; absent options are omitted.
        assert!(wire.contains("\"actual_cost_micro\":\"2500\""));
        assert!(!wire.contains("identity_anchor"));
        let back: SettlementRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, request);
    }
}
