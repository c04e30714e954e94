pub mod credentials;

use std::sync::Arc;

use chrono::Utc;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::proxy::upstream::redact_error;
use credentials::GcpCredentials;

const IDENTITY_BASE: &str = "https://identitytoolkit.googleapis.com";
const IAM_BASE: &str = "https://iamcredentials.googleapis.com";

/// Audience required by Identity Toolkit for custom-token verification.
const CUSTOM_TOKEN_AUD: &str =
    "https://identitytoolkit.googleapis.com/google.identity.identitytoolkit.v1.IdentityToolkit";

/// Lifetime of vended access tokens. One hour, matching what the IAM
/// credentials API grants by default.
const VEND_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize)]
struct CustomTokenClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    uid: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    token: &'a str,
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTokenResponse {
    pub id_token: String,
    #[serde(default)]
    pub expires_in: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    users: Option<Vec<LookupUser>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest<'a> {
    scope: &'a [String],
    lifetime: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: String,
}

/// The three-hop device credential exchange: custom token (signed here),
/// Firebase ID token (Identity Toolkit), then a short-lived GCP access
/// token for the one pre-authorized service identity (IAM credentials).
///
/// The final hop is the trust boundary: it is gated on the server-side
/// identity mapping, never on anything the device asserts.
pub struct IdentityExchanger {
    credentials: Option<Arc<GcpCredentials>>,
    http: ClientWithMiddleware,
    firebase_api_key: String,
    vend_service_account: Option<String>,
    vend_scopes: Vec<String>,
    identity_base: String,
    iam_base: String,
}

impl IdentityExchanger {
    pub fn new(
        credentials: Option<Arc<GcpCredentials>>,
        http: ClientWithMiddleware,
        firebase_api_key: String,
        vend_service_account: Option<String>,
        vend_scopes: Vec<String>,
    ) -> Self {
        Self {
            credentials,
            http,
            firebase_api_key,
            vend_service_account,
            vend_scopes,
            identity_base: IDENTITY_BASE.to_string(),
            iam_base: IAM_BASE.to_string(),
        }
    }

    /// Point the exchanger at mock endpoints. Test use only.
    pub fn with_base_urls(mut self, identity_base: &str, iam_base: &str) -> Self {
        self.identity_base = identity_base.trim_end_matches('/').to_string();
        self.iam_base = iam_base.trim_end_matches('/').to_string();
        self
    }

    /// Hop 1: mint a Firebase custom token asserting `device_id`.
    /// Nothing is persisted; the token is redeemable exactly once.
    pub fn issue_custom_token(&self, device_id: &str) -> Result<String, AppError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(AppError::Validation("'device_id' missing".into()));
        }
        let creds = self.credentials.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("identity signer not initialized".into())
        })?;

        let now = Utc::now().timestamp();
        let claims = CustomTokenClaims {
            iss: creds.client_email(),
            sub: creds.client_email(),
            aud: CUSTOM_TOKEN_AUD,
            iat: now,
            exp: now + 3600,
            uid: device_id,
        };
        let token = creds.sign_claims(&claims).map_err(|e| {
            tracing::error!(device_id, "custom token signing failed: {}", e);
            AppError::ServiceUnavailable("token generation error".into())
        })?;

        tracing::info!(device_id, "issued Firebase custom token");
        Ok(token)
    }

    /// Hop 2: redeem the custom token for a Firebase ID token.
    pub async fn exchange_for_id_token(
        &self,
        custom_token: &str,
    ) -> Result<IdTokenResponse, AppError> {
        let url = format!(
            "{}/v1/accounts:signInWithCustomToken?key={}",
            self.identity_base, self.firebase_api_key
        );
        let resp = self
            .http
            .post(&url)
            .json(&SignInRequest {
                token: custom_token,
                return_secure_token: true,
            })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("signInWithCustomToken: {}", redact_error(e))))?;

        let status = resp.status();
        if status.is_client_error() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!("custom token rejected ({}): {}", status, text);
            return Err(AppError::InvalidToken(
                "custom token malformed or expired".into(),
            ));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "signInWithCustomToken {}: {}",
                status, text
            )));
        }

        resp.json()
            .await
            .map_err(|e| AppError::Upstream(format!("signInWithCustomToken decode: {}", e.without_url())))
    }

    /// Hop 3: validate the ID token server-side and mint a scoped access
    /// token for the pre-authorized service identity.
    pub async fn vend_access_token(&self, id_token: &str) -> Result<(String, i64), AppError> {
        if id_token.trim().is_empty() {
            return Err(AppError::Validation("'firebase_id_token' missing".into()));
        }

        let device_id = self.verify_id_token(id_token).await?;

        let vend_sa = self.vend_service_account.as_deref().ok_or_else(|| {
            tracing::warn!(device_id, "vend refused: no authorized service identity mapping");
            AppError::IdentityMismatch("no authorized service identity for caller".into())
        })?;
        let creds = self.credentials.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("identity signer not initialized".into())
        })?;
        let bearer = creds
            .access_token()
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("credential minting: {}", e)))?;

        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_base, vend_sa
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&GenerateAccessTokenRequest {
                scope: &self.vend_scopes,
                lifetime: format!("{}s", VEND_LIFETIME_SECS),
            })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("generateAccessToken: {}", redact_error(e))))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(device_id, "generateAccessToken failed {}: {}", status, text);
            return Err(AppError::ServiceUnavailable(
                "failed to mint access token".into(),
            ));
        }

        let minted: GenerateAccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("generateAccessToken decode: {}", e.without_url())))?;

        let expires_in = chrono::DateTime::parse_from_rfc3339(&minted.expire_time)
            .map(|t| (t.with_timezone(&Utc) - Utc::now()).num_seconds())
            .unwrap_or(VEND_LIFETIME_SECS)
            .max(1);

        tracing::info!(device_id, expires_in, "vended GCP access token");
        Ok((minted.access_token, expires_in))
    }

    /// Confirms the ID token with Identity Toolkit and returns the subject
    /// (the device id the custom token asserted).
    async fn verify_id_token(&self, id_token: &str) -> Result<String, AppError> {
        let url = format!(
            "{}/v1/accounts:lookup?key={}",
            self.identity_base, self.firebase_api_key
        );
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "idToken": id_token }))
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("accounts:lookup: {}", redact_error(e))))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(AppError::InvalidToken("ID token invalid or expired".into()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "accounts:lookup {}: {}",
                status, text
            )));
        }

        let lookup: LookupResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("accounts:lookup decode: {}", e.without_url())))?;

        let user = lookup
            .users
            .and_then(|mut u| u.pop())
            .ok_or_else(|| AppError::InvalidToken("ID token resolves to no user".into()))?;
        if user.disabled {
            return Err(AppError::IdentityMismatch("identity is disabled".into()));
        }
        Ok(user.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::upstream::UpstreamClient;

    fn exchanger_without_signer() -> IdentityExchanger {
        IdentityExchanger::new(
            None,
            UpstreamClient::new().hop_client().clone(),
            "test-key".into(),
            None,
            vec!["https://www.googleapis.com/auth/cloud-platform".into()],
        )
    }

    #[test]
    fn empty_device_id_is_validation_error() {
        let ex = exchanger_without_signer();
        assert!(matches!(
            ex.issue_custom_token(""),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ex.issue_custom_token("   "),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn missing_signer_is_service_unavailable() {
        let ex = exchanger_without_signer();
        assert!(matches!(
            ex.issue_custom_token("B8A44F45D624"),
            Err(AppError::ServiceUnavailable(_))
        ));
    }
}
