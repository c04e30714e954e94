//! Outbound HTTP clients.
//!
//! Two clients with different resilience profiles:
//! - `hop_client`: exchange-chain hops, usage commits and the Gemini call.
//!   No automatic retries; denial/backoff is the caller's decision, and
//!   commits are not idempotent.
//! - `read_client`: internal GCP reads (OAuth grant, Firestore reads and
//!   queries, Secret Manager access). Safe to retry with backoff.

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;

pub struct UpstreamClient {
    hop: ClientWithMiddleware,
    read: ClientWithMiddleware,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let base = || {
            reqwest::Client::builder()
                .use_rustls_tls()
                .pool_max_idle_per_host(16)
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client")
        };

        let hop = ClientBuilder::new(base()).build();

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let read = ClientBuilder::new(base())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { hop, read }
    }

    pub fn hop_client(&self) -> &ClientWithMiddleware {
        &self.hop
    }

    pub fn read_client(&self) -> &ClientWithMiddleware {
        &self.read
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a send failure without the request URL. Upstream URLs carry
/// credentials in the query string, so the URL must never reach callers
/// or logs.
pub fn redact_error(err: reqwest_middleware::Error) -> String {
    match err {
        reqwest_middleware::Error::Reqwest(e) => e.without_url().to_string(),
        reqwest_middleware::Error::Middleware(e) => match e.downcast::<reqwest::Error>() {
            Ok(e) => e.without_url().to_string(),
            Err(e) => e.to_string(),
        },
    }
}
