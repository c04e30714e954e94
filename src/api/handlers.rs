use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::AppError;
use crate::proxy::gemini::{self, ProxyRequest};
use crate::vendor::fingerprint::fingerprint;
use crate::vendor::quota::DeviceState;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct InitiateRequest {
    pub device_id: Option<String>,
}

#[derive(Serialize)]
pub struct InitiateResponse {
    pub firebase_custom_token: String,
}

#[derive(Deserialize)]
pub struct VendRequest {
    pub firebase_id_token: Option<String>,
}

#[derive(Serialize)]
pub struct VendResponse {
    pub gcp_access_token: String,
    pub expires_in: i64,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub device_id: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub status: DeviceState,
    pub requests_used: u64,
    pub requests_remaining: u64,
    pub daily_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /device-auth/initiate — hop 1 of the exchange chain.
pub async fn initiate_device_auth(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, AppError> {
    let device_id = payload.device_id.unwrap_or_default();
    let token = state.identity.issue_custom_token(&device_id)?;
    Ok(Json(InitiateResponse {
        firebase_custom_token: token,
    }))
}

/// POST /gcp-token/vend — hop 3: trade a Firebase ID token for a scoped
/// GCP access token.
pub async fn vend_gcp_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VendRequest>,
) -> Result<Json<VendResponse>, AppError> {
    let id_token = payload.firebase_id_token.unwrap_or_default();
    let (token, expires_in) = state.identity.vend_access_token(&id_token).await?;
    Ok(Json(VendResponse {
        gcp_access_token: token,
        expires_in,
    }))
}

/// POST /ai-proxy — anonymous demo proxying behind the key vendor.
pub async fn ai_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ProxyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let fp = request_fingerprint(&headers, peer, &request.device_info);
    tracing::info!(fingerprint = %fp, model = %request.model, "ai-proxy request");

    state.vendor.authorize(&fp).await?;
    let (key_id, api_key) = state.vendor.select_key().await?;
    tracing::debug!(fingerprint = %fp, key_id = %key_id, "pooled key selected");

    let result = gemini::generate(
        state.upstream.hop_client(),
        &state.config.gemini_api_base,
        &api_key,
        &request,
    )
    .await;

    match result {
        Ok(outcome) => {
            state.vendor.record(&fp, true, outcome.tokens_used).await;
            Ok(Json(outcome.response))
        }
        Err(e) => {
            state.vendor.record(&fp, false, 0).await;
            Err(e)
        }
    }
}

/// GET /device-status — demo quota snapshot for a device.
pub async fn device_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    // Without an explicit device_id the caller is identified the same way
    // the proxy would identify it.
    let device_id = match query.device_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => request_fingerprint(&headers, peer, &json!({})),
    };

    let status = state.vendor.status(&device_id).await?;
    Ok(Json(StatusResponse {
        device_id,
        status: status.state,
        requests_used: status.requests_used,
        requests_remaining: status.requests_remaining,
        daily_limit: status.daily_limit,
        created_at: status.created_at.map(rfc3339),
    }))
}

// ── Helpers ──────────────────────────────────────────────────

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Fingerprint inputs: first X-Forwarded-For hop (or the peer address),
/// User-Agent, and the caller-supplied device info.
fn request_fingerprint(
    headers: &HeaderMap,
    peer: SocketAddr,
    device_info: &serde_json::Value,
) -> String {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| peer.ip().to_string());

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    fingerprint(&ip, user_agent, device_info)
}
