//! Key-vendor integration tests against the in-memory stores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use gateway::errors::{AppError, QuotaReason};
use gateway::store::memory::{MemoryKeyStore, MemoryUsageStore};
use gateway::store::{PooledKey, UsageRecord, UsageStore};
use gateway::vault::memory::MemorySecretStore;
use gateway::vendor::fingerprint::fingerprint;
use gateway::vendor::quota::{DeviceState, QuotaLimits};
use gateway::vendor::KeyVendor;

const UPGRADE_URL: &str = "https://anava.ai/upgrade";

struct Harness {
    usage: MemoryUsageStore,
    keys: MemoryKeyStore,
    secrets: MemorySecretStore,
    vendor: KeyVendor,
}

fn harness(limits: QuotaLimits) -> Harness {
    let usage = MemoryUsageStore::new();
    let keys = MemoryKeyStore::new();
    let secrets = MemorySecretStore::new();
    let vendor = KeyVendor::new(
        Arc::new(usage.clone()),
        Arc::new(keys.clone()),
        Arc::new(secrets.clone()),
        limits,
        UPGRADE_URL.into(),
    );
    Harness {
        usage,
        keys,
        secrets,
        vendor,
    }
}

fn record_with_minute_events(events: Vec<DateTime<Utc>>, total: u64) -> UsageRecord {
    let mut r = UsageRecord::new(Utc::now() - Duration::hours(1));
    r.total_requests = total;
    r.requests_this_minute = events.clone();
    r.requests_this_hour = events.clone();
    r.requests_this_day = events;
    r
}

#[tokio::test]
async fn eleventh_request_in_a_minute_is_denied_then_window_clears() {
    let h = harness(QuotaLimits::default());
    let fp = fingerprint("10.0.0.5", "AxisOS/11.9", &json!({"mac": "B8A44F45D624"}));

    // 10 requests inside the current minute.
    for _ in 0..10 {
        h.vendor.authorize(&fp).await.unwrap();
        h.vendor.record(&fp, true, 10).await;
    }

    let err = h.vendor.authorize(&fp).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::QuotaExceeded {
            reason: QuotaReason::Minute,
            ..
        }
    ));

    // Same device, 61 seconds later: rewrite the record as if time passed.
    let shifted: Vec<_> = (0..10)
        .map(|_| Utc::now() - Duration::seconds(61))
        .collect();
    h.usage.insert(&fp, record_with_minute_events(shifted, 10));
    h.vendor.authorize(&fp).await.unwrap();
}

#[tokio::test]
async fn authorize_alone_never_consumes_quota() {
    let h = harness(QuotaLimits::default());
    let fp = "feedfacefeedface";

    for _ in 0..100 {
        h.vendor.authorize(fp).await.unwrap();
    }
    let status = h.vendor.status(fp).await.unwrap();
    assert_eq!(status.requests_used, 0);
}

#[tokio::test]
async fn lifetime_cap_is_terminal_regardless_of_windows() {
    let limits = QuotaLimits {
        per_device: 5,
        ..Default::default()
    };
    let h = harness(limits);
    let fp = "0123456789abcdef";

    // Counter at the cap, but every window timestamp long expired.
    let old: Vec<_> = (0..5).map(|_| Utc::now() - Duration::days(2)).collect();
    h.usage.insert(fp, record_with_minute_events(old, 5));

    let err = h.vendor.authorize(fp).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::QuotaExceeded {
            reason: QuotaReason::Lifetime,
            ..
        }
    ));

    let status = h.vendor.status(fp).await.unwrap();
    assert_eq!(status.state, DeviceState::LimitReached);
    assert_eq!(status.requests_remaining, 0);
}

#[tokio::test]
async fn selection_prefers_least_used_key_then_falls_back() {
    let h = harness(QuotaLimits::default());
    h.keys.insert(PooledKey {
        id: "k-low".into(),
        active: true,
        used_today: 3,
        daily_quota: 4,
    });
    h.keys.insert(PooledKey {
        id: "k-high".into(),
        active: true,
        used_today: 7,
        daily_quota: 1000,
    });
    h.secrets.insert("k-low", "AIza-low");
    h.secrets.insert("k-high", "AIza-high");

    let (id, secret) = h.vendor.select_key().await.unwrap();
    assert_eq!(id, "k-low");
    assert_eq!(secret, "AIza-low");

    // k-low is now at its own quota (4/4); next pick falls back to k-high.
    let (id, _) = h.vendor.select_key().await.unwrap();
    assert_eq!(id, "k-high");
}

#[tokio::test]
async fn exhausted_pool_is_no_capacity() {
    let h = harness(QuotaLimits::default());
    h.keys.insert(PooledKey {
        id: "k1".into(),
        active: true,
        used_today: 100,
        daily_quota: 100,
    });
    h.secrets.insert("k1", "AIza-k1");

    let err = h.vendor.select_key().await.unwrap_err();
    assert!(matches!(err, AppError::NoCapacity));
}

#[tokio::test]
async fn missing_secret_for_chosen_key_is_no_capacity() {
    let h = harness(QuotaLimits::default());
    h.keys.insert(PooledKey {
        id: "k1".into(),
        active: true,
        used_today: 0,
        daily_quota: 100,
    });
    // No secret seeded for k1.
    let err = h.vendor.select_key().await.unwrap_err();
    assert!(matches!(err, AppError::NoCapacity));
}

#[tokio::test]
async fn status_reflects_lifecycle() {
    let h = harness(QuotaLimits::default());
    let fp = "cafebabecafebabe";

    let status = h.vendor.status(fp).await.unwrap();
    assert_eq!(status.state, DeviceState::New);
    assert_eq!(status.requests_used, 0);
    assert_eq!(status.requests_remaining, 1000);
    assert_eq!(status.daily_limit, 500);
    assert!(status.created_at.is_none());

    h.vendor.authorize(fp).await.unwrap();
    h.vendor.record(fp, true, 120).await;

    let status = h.vendor.status(fp).await.unwrap();
    assert_eq!(status.state, DeviceState::Active);
    assert_eq!(status.requests_used, 1);
    assert_eq!(status.requests_remaining, 999);
    assert!(status.created_at.is_some());
}

// ── Fail-closed behavior ─────────────────────────────────────

#[derive(Clone)]
struct BrokenUsageStore;

#[async_trait]
impl UsageStore for BrokenUsageStore {
    async fn get(&self, _fingerprint: &str) -> anyhow::Result<Option<UsageRecord>> {
        anyhow::bail!("store offline")
    }
    async fn get_or_create(&self, _fingerprint: &str) -> anyhow::Result<UsageRecord> {
        anyhow::bail!("store offline")
    }
    async fn record_usage(
        &self,
        _fingerprint: &str,
        _success: bool,
        _tokens: u64,
        _at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("store offline")
    }
}

#[tokio::test]
async fn quota_check_fails_closed_on_store_error() {
    let keys = MemoryKeyStore::new();
    let secrets = MemorySecretStore::new();
    let vendor = KeyVendor::new(
        Arc::new(BrokenUsageStore),
        Arc::new(keys),
        Arc::new(secrets),
        QuotaLimits::default(),
        UPGRADE_URL.into(),
    );

    // Denied, not silently admitted.
    let err = vendor.authorize("deadbeefdeadbeef").await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
}
