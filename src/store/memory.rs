use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{KeyStore, PooledKey, UsageRecord, UsageStore};

/// In-memory usage store. All mutation goes through the DashMap entry API,
/// which holds the shard lock for the duration of the closure, so
/// concurrent `record_usage` calls for one fingerprint serialize instead of
/// losing updates.
#[derive(Clone, Default)]
pub struct MemoryUsageStore {
    records: Arc<DashMap<String, UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev hook: seed a record directly.
    pub fn insert(&self, fingerprint: &str, record: UsageRecord) {
        self.records.insert(fingerprint.to_string(), record);
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<UsageRecord>> {
        Ok(self.records.get(fingerprint).map(|r| r.clone()))
    }

    async fn get_or_create(&self, fingerprint: &str) -> anyhow::Result<UsageRecord> {
        let entry = self
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| UsageRecord::new(Utc::now()));
        Ok(entry.clone())
    }

    async fn record_usage(
        &self,
        fingerprint: &str,
        success: bool,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut entry = self
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| UsageRecord::new(at));
        entry.total_requests += 1;
        if success {
            entry.successful_requests += 1;
        }
        entry.total_tokens += tokens;
        entry.last_request_at = Some(at);
        entry.requests_this_minute.push(at);
        entry.requests_this_hour.push(at);
        entry.requests_this_day.push(at);
        Ok(())
    }
}

/// In-memory key pool.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    keys: Arc<DashMap<String, PooledKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: PooledKey) {
        self.keys.insert(key.id.clone(), key);
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn active_keys(&self) -> anyhow::Result<Vec<PooledKey>> {
        let mut keys: Vec<PooledKey> = self
            .keys
            .iter()
            .filter(|k| k.active)
            .map(|k| k.clone())
            .collect();
        keys.sort_by_key(|k| k.used_today);
        Ok(keys)
    }

    async fn increment_usage(&self, key_id: &str) -> anyhow::Result<()> {
        if let Some(mut key) = self.keys.get_mut(key_id) {
            key.used_today += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_stable() {
        let store = MemoryUsageStore::new();
        let first = store.get_or_create("fp1").await.unwrap();
        let second = store.get_or_create("fp1").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.total_requests, 0);
    }

    #[tokio::test]
    async fn record_usage_appends_all_windows() {
        let store = MemoryUsageStore::new();
        let now = Utc::now();
        store.record_usage("fp1", true, 42, now).await.unwrap();
        store.record_usage("fp1", false, 0, now).await.unwrap();

        let rec = store.get("fp1").await.unwrap().unwrap();
        assert_eq!(rec.total_requests, 2);
        assert_eq!(rec.successful_requests, 1);
        assert_eq!(rec.total_tokens, 42);
        assert_eq!(rec.requests_this_minute.len(), 2);
        assert_eq!(rec.requests_this_hour.len(), 2);
        assert_eq!(rec.requests_this_day.len(), 2);
        assert_eq!(rec.last_request_at, Some(now));
    }

    #[tokio::test]
    async fn concurrent_record_usage_loses_nothing() {
        let store = MemoryUsageStore::new();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.record_usage("fp1", true, 1, Utc::now()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let rec = store.get("fp1").await.unwrap().unwrap();
        assert_eq!(rec.total_requests, 50);
        assert_eq!(rec.total_tokens, 50);
    }

    #[tokio::test]
    async fn active_keys_sorted_and_filtered() {
        let store = MemoryKeyStore::new();
        store.insert(PooledKey {
            id: "a".into(),
            active: true,
            used_today: 7,
            daily_quota: 1000,
        });
        store.insert(PooledKey {
            id: "b".into(),
            active: true,
            used_today: 3,
            daily_quota: 1000,
        });
        store.insert(PooledKey {
            id: "c".into(),
            active: false,
            used_today: 0,
            daily_quota: 1000,
        });

        let keys = store.active_keys().await.unwrap();
        assert_eq!(
            keys.iter().map(|k| k.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }
}
