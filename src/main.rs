//! TrackProof - Tamper-Evident Trading Ledger Service
//! Mission: Make live trading records impossible to quietly rewrite
//! Every event hash-chained, every checkpoint HMAC-signed, every claim
//! re-derivable from an exported proof bundle

use anyhow::{Context, Result};
use axum::Router;
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trackproof_backend::api::{ledger_router, public_router, AppState};
use trackproof_backend::config::ServiceConfig;
use trackproof_backend::ledger::bundle::BundleGenerator;
use trackproof_backend::ledger::chain::EventLedger;
use trackproof_backend::ledger::checkpoint::{CheckpointSigner, SecretPair};
use trackproof_backend::ledger::notary::{WebhookNotary, NOTARY_REGISTRY};
use trackproof_backend::ledger::rate_limit::{MemoryAdmissionStore, RateLimiter};
use trackproof_backend::ledger::store::LedgerStore;
use trackproof_backend::ledger::verify::BundleVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    info!("🚀 TrackProof Ledger Service starting");

    let config = ServiceConfig::from_env();
    // No secret, no service. Refusing to start beats silently signing
    // checkpoints with a default key.
    let secrets = SecretPair::from_env()?;

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let store = Arc::new(LedgerStore::open(&config.db_path)?);
    let signer = Arc::new(CheckpointSigner::new(secrets.clone()));
    let limiter = RateLimiter::new(
        Arc::new(MemoryAdmissionStore::new()),
        config.rate_limit_per_minute,
    );
    let ledger = Arc::new(EventLedger::with_lock_wait(
        store.clone(),
        limiter,
        signer,
        Duration::from_millis(config.lock_wait_ms),
    ));

    if let Some(url) = &config.notary_webhook_url {
        NOTARY_REGISTRY.register(Arc::new(WebhookNotary::new(url.clone())));
        info!("🔏 Webhook notary registered at {}", url);
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let state = Arc::new(AppState {
        ledger: ledger.clone(),
        bundles: Arc::new(BundleGenerator::with_cap(
            store.clone(),
            config.max_bundle_events,
        )),
        verifier: Arc::new(BundleVerifier::with_cap(secrets, config.max_bundle_events)),
        prometheus,
    });

    // Background maintenance
    tokio::spawn(rate_window_sweeper(ledger.clone()));
    tokio::spawn(storage_maintenance(store.clone()));

    let app = Router::new()
        .nest("/api", ledger_router())
        .merge(public_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Ledger API listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Drop idle rate-limit windows so instance churn cannot grow memory.
async fn rate_window_sweeper(ledger: Arc<EventLedger>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        ledger.purge_rate_windows();
    }
}

/// Hourly SQLite housekeeping.
async fn storage_maintenance(store: Arc<LedgerStore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3_600));
    // The first tick fires immediately; skip it so startup stays quick.
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = store.optimize() {
            warn!("Storage maintenance failed: {}", e);
        }
    }
}

fn load_env() {
    let _ = dotenv();
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trackproof_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
