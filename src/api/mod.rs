use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;

/// Build the public router. Non-POST on the POST routes gets 405 from
/// method routing, matching the original functions.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/device-auth/initiate", post(handlers::initiate_device_auth))
        .route("/gcp-token/vend", post(handlers::vend_gcp_token))
        .route("/ai-proxy", post(handlers::ai_proxy))
        .route("/device-status", get(handlers::device_status))
        // The demo endpoints are deliberately open to any origin; the
        // quota gate is the abuse control here.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
