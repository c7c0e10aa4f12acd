//! Gateway authentication
//!
//! Two ways in: a bearer API key (hashed at rest), or the pay-per-call
//! challenge-response scheme where a 402 hands the client a signed
//! challenge to satisfy and re-present. Wallet sessions bootstrap via a
//! nonce + verify pair.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use meridian_core::canonical;
use meridian_core::MicroUsd;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const TABLE_API_KEYS: &str = "api_keys";
const NONCE_TTL_MINUTES: i64 = 5;
const CHALLENGE_TTL_MINUTES: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyRecord {
    key_hash: String,
    account_id: String,
    label: String,
    created_at: DateTime<Utc>,
    revoked: bool,
}

/// The body of a 402 response: what the caller must pay and prove.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentChallenge {
    pub nonce: String,
    /// Decimal-string micro-USD.
    pub amount: MicroUsd,
    pub recipient: String,
    pub chain_id: u64,
    pub expires_at: DateTime<Utc>,
    pub hmac: String,
}

pub struct AuthService {
    db: Surreal<Any>,
    challenge_secret: Vec<u8>,
    recipient: String,
    chain_id: u64,
    /// Outstanding wallet-session nonces.
    nonces: DashMap<String, DateTime<Utc>>,
    /// Wallet sessions established via verify.
    sessions: DashMap<String, String>,
}

impl AuthService {
    pub fn new(db: Surreal<Any>, challenge_secret: &[u8], recipient: &str, chain_id: u64) -> Self {
        Self {
            db,
            challenge_secret: challenge_secret.to_vec(),
            recipient: recipient.to_string(),
            chain_id,
            nonces: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    // -- API keys --

    /// Create a key for an account; only the hash is stored.
    pub async fn create_api_key(
        &self,
        account_id: &str,
        label: &str,
    ) -> Result<String, AuthError> {
        let raw = format!("mk_{}", uuid::Uuid::new_v4().simple());
        let record = ApiKeyRecord {
            key_hash: hash_key(&raw),
            account_id: account_id.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
            revoked: false,
        };
        let _: Option<ApiKeyRecord> = self
            .db
            .create((TABLE_API_KEYS, record.key_hash.clone()))
            .content(record)
            .await?;
        Ok(raw)
    }

    /// Resolve a bearer key to its account.
    pub async fn verify_api_key(&self, raw: &str) -> Result<String, AuthError> {
        let record: Option<ApiKeyRecord> = self
            .db
            .select((TABLE_API_KEYS, hash_key(raw)))
            .await?;
        match record {
            Some(record) if !record.revoked => Ok(record.account_id),
            Some(_) => Err(AuthError::Denied("key revoked".to_string())),
            None => Err(AuthError::Denied("unknown key".to_string())),
        }
    }

    pub async fn revoke_api_key(&self, raw: &str) -> Result<(), AuthError> {
        let hash = hash_key(raw);
        let record: Option<ApiKeyRecord> = self.db.select((TABLE_API_KEYS, hash.clone())).await?;
        if let Some(mut record) = record {
            record.revoked = true;
            let _: Option<ApiKeyRecord> =
                self.db.update((TABLE_API_KEYS, hash)).content(record).await?;
        }
        Ok(())
    }

    // -- wallet sessions --

    /// Step one: hand out a nonce to sign.
    pub fn issue_nonce(&self) -> String {
        let nonce = uuid::Uuid::new_v4().to_string();
        self.nonces
            .insert(nonce.clone(), Utc::now() + Duration::minutes(NONCE_TTL_MINUTES));
        nonce
    }

    /// Step two: the wallet presents the nonce back with its address.
    /// Signature verification is delegated to the identity service;
    /// here the nonce must exist and be fresh.
    pub fn verify_nonce(&self, nonce: &str, address: &str) -> Result<String, AuthError> {
        let Some((_, expires_at)) = self.nonces.remove(nonce) else {
            return Err(AuthError::Denied("unknown nonce".to_string()));
        };
        if expires_at < Utc::now() {
            return Err(AuthError::Denied("nonce expired".to_string()));
        }
        let session = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(session.clone(), address.to_string());
        Ok(session)
    }

    pub fn session_address(&self, session: &str) -> Option<String> {
        self.sessions.get(session).map(|a| a.clone())
    }

    // -- pay-per-call challenges --

    /// Build the challenge a 402 response carries.
    pub fn issue_challenge(&self, amount: MicroUsd) -> PaymentChallenge {
        let mut challenge = PaymentChallenge {
            nonce: uuid::Uuid::new_v4().to_string(),
            amount,
            recipient: self.recipient.clone(),
            chain_id: self.chain_id,
            expires_at: Utc::now() + Duration::minutes(CHALLENGE_TTL_MINUTES),
            hmac: String::new(),
        };
        challenge.hmac = self.challenge_mac(&challenge);
        challenge
    }

    /// A re-presented challenge must round-trip its MAC and be fresh.
    pub fn verify_challenge(&self, challenge: &PaymentChallenge) -> Result<(), AuthError> {
        let expected = self.challenge_mac(challenge);
        if expected != challenge.hmac {
            warn!("Payment challenge MAC mismatch");
            return Err(AuthError::Denied("challenge tampered".to_string()));
        }
        if challenge.expires_at < Utc::now() {
            return Err(AuthError::Denied("challenge expired".to_string()));
        }
        Ok(())
    }

    /// MAC over the canonical JSON of the challenge minus its own mac
    /// field.
    fn challenge_mac(&self, challenge: &PaymentChallenge) -> String {
        let mut unsigned = challenge.clone();
        unsigned.hmac = String::new();
        let bytes = canonical::to_canonical_bytes(&unsigned).expect("challenge serializes");
        let mut mac =
            HmacSha256::new_from_slice(&self.challenge_secret).expect("any key length works");
        mac.update(&bytes);
        hex::encode(mac.finalize().into_bytes())
    }
}

fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
