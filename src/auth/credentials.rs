use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Parsed service-account JSON key (the subset this gateway needs).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)?;
        Ok(key)
    }
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

/// The gateway's own GCP identity: signs JWTs with the service-account key
/// and trades them for OAuth2 access tokens via the JWT-bearer grant.
/// Tokens are cached and refreshed 60 s before expiry.
pub struct GcpCredentials {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    http: ClientWithMiddleware,
    scopes: Vec<String>,
    cached: Mutex<Option<CachedToken>>,
}

impl GcpCredentials {
    pub fn new(
        key: ServiceAccountKey,
        http: ClientWithMiddleware,
        scopes: Vec<String>,
    ) -> anyhow::Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid service-account private key: {}", e))?;
        Ok(Self {
            key,
            encoding_key,
            http,
            scopes,
            cached: Mutex::new(None),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    /// Sign arbitrary claims with the service-account key (RS256). Used for
    /// the OAuth grant and for Firebase custom tokens.
    pub fn sign_claims<T: Serialize>(&self, claims: &T) -> anyhow::Result<String> {
        let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Current OAuth2 access token for the gateway itself.
    pub async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(tok) = cached.as_ref() {
            if Utc::now() + chrono::Duration::seconds(60) < tok.expires_at {
                return Ok(tok.token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &self.key.client_email,
            scope: self.scopes.join(" "),
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = self.sign_claims(&claims)?;

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("OAuth token request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth token request failed {}: {}", status, text);
        }

        let grant: GrantResponse = resp.json().await?;
        let token = grant.access_token.clone();
        *cached = Some(CachedToken {
            token: grant.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(grant.expires_in),
        });
        Ok(token)
    }
}
