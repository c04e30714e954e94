pub mod google;
pub mod memory;

use async_trait::async_trait;

/// Abstraction over secret storage backends. Pooled-key material lives here,
/// keyed by the pool entry's id; it is never written into the key-tracking
/// record itself.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Retrieve the secret for a pooled key id.
    async fn retrieve(&self, key_id: &str) -> anyhow::Result<String>;
}
