use serde::Deserialize;

use crate::vendor::quota::QuotaLimits;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// GCP project hosting Firestore, Secret Manager and the service accounts.
    pub gcp_project_id: String,
    /// Firebase Web API key, used by signInWithCustomToken.
    pub firebase_api_key: String,
    /// Path to the gateway's own service-account JSON key.
    pub service_account_path: Option<String>,
    /// The single pre-authorized identity whose access tokens the vending
    /// machine mints. Unset means the vend endpoint refuses every caller.
    pub vend_service_account: Option<String>,
    /// OAuth scopes granted to vended access tokens.
    pub vend_scopes: Vec<String>,
    pub limits: QuotaLimits,
    pub upgrade_url: String,
    /// `memory` (default, also used by tests) or `firestore`.
    pub store_backend: String,
    pub usage_collection: String,
    pub keys_collection: String,
    pub gemini_api_base: String,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let store_backend =
        std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
    if store_backend != "memory" && store_backend != "firestore" {
        anyhow::bail!("STORE_BACKEND must be 'memory' or 'firestore', got '{store_backend}'");
    }

    Ok(Config {
        port: std::env::var("GATEWAY_PORT")
            .unwrap_or_else(|_| "8443".into())
            .parse()
            .unwrap_or(8443),
        gcp_project_id: std::env::var("GCP_PROJECT").unwrap_or_default(),
        firebase_api_key: std::env::var("FIREBASE_API_KEY").unwrap_or_default(),
        service_account_path: std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
        vend_service_account: std::env::var("VEND_SERVICE_ACCOUNT").ok(),
        vend_scopes: std::env::var("VEND_SCOPES")
            .unwrap_or_else(|_| "https://www.googleapis.com/auth/cloud-platform".into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        limits: QuotaLimits {
            per_minute: env_u64("RATE_LIMIT_PER_MINUTE", 10),
            per_hour: env_u64("RATE_LIMIT_PER_HOUR", 100),
            per_day: env_u64("RATE_LIMIT_PER_DAY", 500),
            per_device: env_u64("RATE_LIMIT_PER_DEVICE", 1000),
        },
        upgrade_url: std::env::var("UPGRADE_URL")
            .unwrap_or_else(|_| "https://anava.ai/upgrade".into()),
        store_backend,
        usage_collection: std::env::var("USAGE_COLLECTION")
            .unwrap_or_else(|_| "ai_usage_tracking".into()),
        keys_collection: std::env::var("KEYS_COLLECTION")
            .unwrap_or_else(|_| "shared_ai_keys".into()),
        gemini_api_base: std::env::var("GEMINI_API_BASE")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
    })
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
