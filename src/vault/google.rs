use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::SecretStore;
use crate::auth::credentials::GcpCredentials;

const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com";

#[derive(Deserialize)]
struct AccessSecretResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Google Secret Manager backend. Pooled key `k1` resolves to secret
/// `ai-key-k1`, latest version.
pub struct SecretManagerStore {
    http: ClientWithMiddleware,
    credentials: Arc<GcpCredentials>,
    project_id: String,
    base_url: String,
}

impl SecretManagerStore {
    pub fn new(
        http: ClientWithMiddleware,
        credentials: Arc<GcpCredentials>,
        project_id: String,
    ) -> Self {
        Self {
            http,
            credentials,
            project_id,
            base_url: SECRET_MANAGER_BASE.to_string(),
        }
    }

    /// Point at a mock endpoint. Test use only.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn retrieve(&self, key_id: &str) -> anyhow::Result<String> {
        let bearer = self.credentials.access_token().await?;
        let url = format!(
            "{}/v1/projects/{}/secrets/ai-key-{}/versions/latest:access",
            self.base_url, self.project_id, key_id
        );

        let resp = self.http.get(&url).bearer_auth(bearer).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            // Body deliberately not logged: error payloads can echo the name.
            anyhow::bail!("secret access for key '{}' failed: {}", key_id, status);
        }

        let body: AccessSecretResponse = resp.json().await?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(body.payload.data)
            .map_err(|e| anyhow::anyhow!("secret payload for key '{}' not base64: {}", key_id, e))?;
        Ok(String::from_utf8(raw)?)
    }
}
