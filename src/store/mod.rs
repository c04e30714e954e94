pub mod firestore;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-device usage tracking document, keyed by fingerprint (or device id).
///
/// `total_requests` only ever grows; the three window vectors hold raw
/// request timestamps and are pruned at read time by the quota check, never
/// in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub created_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub requests_this_minute: Vec<DateTime<Utc>>,
    pub requests_this_hour: Vec<DateTime<Utc>>,
    pub requests_this_day: Vec<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            total_requests: 0,
            successful_requests: 0,
            total_tokens: 0,
            last_request_at: None,
            requests_this_minute: Vec::new(),
            requests_this_hour: Vec::new(),
            requests_this_day: Vec::new(),
        }
    }
}

/// One shared upstream credential in the rotation. The real key material is
/// never stored here; it lives in the secret store under `ai-key-{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledKey {
    pub id: String,
    pub active: bool,
    pub used_today: u64,
    pub daily_quota: u64,
}

impl PooledKey {
    pub fn has_quota(&self) -> bool {
        self.used_today < self.daily_quota
    }
}

/// Usage-tracking persistence. Implementations must make `record_usage` an
/// atomic read-modify-write (or server-side increment/append) so concurrent
/// requests from the same fingerprint never lose updates.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<UsageRecord>>;

    /// Atomic conditional create: returns the existing record if one is
    /// already present, otherwise creates a zeroed record. Concurrent
    /// callers for the same fingerprint must not clobber each other.
    async fn get_or_create(&self, fingerprint: &str) -> anyhow::Result<UsageRecord>;

    /// Increments counters and appends `at` to all three sliding windows.
    async fn record_usage(
        &self,
        fingerprint: &str,
        success: bool,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Pooled-key persistence. Keys are provisioned and rotated by an external
/// operator process; this side only reads them and bumps usage counters.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Active keys ordered by ascending `used_today`.
    async fn active_keys(&self) -> anyhow::Result<Vec<PooledKey>>;

    async fn increment_usage(&self, key_id: &str) -> anyhow::Result<()>;
}
