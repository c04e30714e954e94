use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::SecretStore;

/// In-memory secret store for tests and the `memory` backend.
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    secrets: Arc<DashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key_id: &str, secret: &str) {
        self.secrets.insert(key_id.to_string(), secret.to_string());
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn retrieve(&self, key_id: &str) -> anyhow::Result<String> {
        self.secrets
            .get(key_id)
            .map(|s| s.clone())
            .ok_or_else(|| anyhow::anyhow!("no secret for key '{}'", key_id))
    }
}
