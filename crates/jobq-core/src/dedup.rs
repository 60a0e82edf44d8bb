use crate::{ErrorCode, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Derive an idempotency key from the content of a submission.
///
/// `serde_json` objects serialise with sorted keys, so two payloads that only
/// differ in field order map to the same key.
pub fn derive_idempotency_key(task_type: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Outcome stored with a completed dedup record, replayed on redelivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DedupState {
    /// A worker slot is executing the key; the claim lapses at `lease_expires_at`
    InFlight {
        owner: String,
        lease_expires_at: DateTime<Utc>,
    },
    /// Side effects for this key have been applied
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub idempotency_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: DedupState,
    pub result_summary: Option<ResultSummary>,
}

impl DedupRecord {
    pub fn in_flight(
        key: impl Into<String>,
        owner: impl Into<String>,
        lease: chrono::Duration,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        DedupRecord {
            idempotency_key: key.into(),
            first_seen_at: now,
            expires_at: now + ttl,
            state: DedupState::InFlight {
                owner: owner.into(),
                lease_expires_at: now + lease,
            },
            result_summary: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, DedupState::Completed)
    }

    /// An in-flight claim whose holder stopped renewing it
    pub fn is_stale_claim(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            DedupState::InFlight {
                lease_expires_at, ..
            } => *lease_expires_at <= now,
            DedupState::Completed => false,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        matches!(&self.state, DedupState::InFlight { owner: o, .. } if o == owner)
    }

    /// Whether a new delivery may claim this key
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) || self.is_stale_claim(now)
    }

    /// Push an in-flight claim's lease out to `now + lease`. The record's own
    /// expiry never falls before the lease.
    pub fn extend_lease(&mut self, now: DateTime<Utc>, lease: chrono::Duration) {
        if let DedupState::InFlight {
            lease_expires_at, ..
        } = &mut self.state
        {
            *lease_expires_at = now + lease;
            self.expires_at = self.expires_at.max(now + lease);
        }
    }

    /// Whether `owner` may close this record: it is unclaimed, already
    /// completed, or still held by `owner`
    pub fn may_complete(&self, owner: &str) -> bool {
        match &self.state {
            DedupState::InFlight { owner: o, .. } => o == owner,
            DedupState::Completed => true,
        }
    }
}
