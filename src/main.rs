use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::auth::credentials::{GcpCredentials, ServiceAccountKey};
use gateway::auth::IdentityExchanger;
use gateway::proxy::upstream::UpstreamClient;
use gateway::store::firestore::FirestoreStore;
use gateway::store::memory::{MemoryKeyStore, MemoryUsageStore};
use gateway::store::{KeyStore, UsageStore};
use gateway::vault::google::SecretManagerStore;
use gateway::vault::memory::MemorySecretStore;
use gateway::vault::SecretStore;
use gateway::vendor::KeyVendor;
use gateway::{api, cli, config, vendor, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gateway=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Fingerprint {
            ip,
            user_agent,
            device_info,
        }) => {
            let info: serde_json::Value = serde_json::from_str(&device_info)
                .map_err(|e| anyhow::anyhow!("invalid device_info JSON: {}", e))?;
            println!("{}", vendor::fingerprint::fingerprint(&ip, &user_agent, &info));
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let state = build_state(cfg)?;

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }))
        .merge(api::router())
        .with_state(state)
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("vision gateway listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_state(cfg: config::Config) -> anyhow::Result<Arc<AppState>> {
    let upstream = UpstreamClient::new();

    let credentials = match cfg.service_account_path.as_deref() {
        Some(path) => {
            let key = ServiceAccountKey::from_file(path)?;
            tracing::info!(client_email = %key.client_email, "loaded service-account key");
            Some(Arc::new(GcpCredentials::new(
                key,
                upstream.read_client().clone(),
                vec!["https://www.googleapis.com/auth/cloud-platform".into()],
            )?))
        }
        None => {
            // Identity endpoints will answer 500 until a key is configured,
            // same as the original function without an initialized SDK.
            tracing::warn!("GOOGLE_APPLICATION_CREDENTIALS not set; identity signing disabled");
            None
        }
    };

    let (usage, keys, secrets): (
        Arc<dyn UsageStore>,
        Arc<dyn KeyStore>,
        Arc<dyn SecretStore>,
    ) = match cfg.store_backend.as_str() {
        "firestore" => {
            let creds = credentials
                .clone()
                .ok_or_else(|| anyhow::anyhow!("firestore backend requires a service-account key"))?;
            if cfg.gcp_project_id.is_empty() {
                anyhow::bail!("firestore backend requires GCP_PROJECT");
            }
            let fs = Arc::new(FirestoreStore::new(
                upstream.read_client().clone(),
                upstream.hop_client().clone(),
                creds.clone(),
                cfg.gcp_project_id.clone(),
                cfg.usage_collection.clone(),
                cfg.keys_collection.clone(),
            ));
            let secrets = Arc::new(SecretManagerStore::new(
                upstream.read_client().clone(),
                creds,
                cfg.gcp_project_id.clone(),
            ));
            (fs.clone(), fs, secrets)
        }
        _ => {
            tracing::info!("using in-memory stores (demo/dev mode)");
            (
                Arc::new(MemoryUsageStore::new()),
                Arc::new(MemoryKeyStore::new()),
                Arc::new(MemorySecretStore::new()),
            )
        }
    };

    let identity = IdentityExchanger::new(
        credentials,
        upstream.hop_client().clone(),
        cfg.firebase_api_key.clone(),
        cfg.vend_service_account.clone(),
        cfg.vend_scopes.clone(),
    );

    let vendor = KeyVendor::new(usage, keys, secrets, cfg.limits, cfg.upgrade_url.clone());

    Ok(Arc::new(AppState {
        identity,
        vendor,
        upstream,
        config: cfg,
    }))
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}
