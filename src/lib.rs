//! Vision Gateway — device authentication and rate-limited AI key vending.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod proxy;
pub mod store;
pub mod vault;
pub mod vendor;

use auth::IdentityExchanger;
use proxy::upstream::UpstreamClient;
use vendor::KeyVendor;

/// Shared application state passed to handlers.
pub struct AppState {
    pub identity: IdentityExchanger,
    pub vendor: KeyVendor,
    pub upstream: UpstreamClient,
    pub config: config::Config,
}
