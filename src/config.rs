//! Service Configuration
//!
//! Everything the daemon reads from the environment, resolved once at
//! startup. Signing secrets are NOT here: they load through
//! `SecretPair::from_env` so they never travel inside a plain config
//! struct.

use std::env;

use crate::ledger::bundle::DEFAULT_MAX_BUNDLE_EVENTS;
use crate::ledger::rate_limit::DEFAULT_LIMIT_PER_MINUTE;

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_DB_PATH: &str = "data/ledger.db";
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

/// Runtime configuration for the ledger daemon.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Append admissions per instance per minute
    pub rate_limit_per_minute: usize,
    /// Hard cap on events per proof bundle
    pub max_bundle_events: usize,
    /// How long an append waits on the per-instance lock before 503
    pub lock_wait_ms: u64,
    /// Optional notarization webhook endpoint
    pub notary_webhook_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: DEFAULT_DB_PATH.to_string(),
            rate_limit_per_minute: DEFAULT_LIMIT_PER_MINUTE,
            max_bundle_events: DEFAULT_MAX_BUNDLE_EVENTS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            notary_webhook_url: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let db_path = env::var("LEDGER_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let rate_limit_per_minute = env::var("LEDGER_RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_LIMIT_PER_MINUTE);
        let max_bundle_events = env::var("LEDGER_MAX_BUNDLE_EVENTS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_MAX_BUNDLE_EVENTS);
        let lock_wait_ms = env::var("LEDGER_LOCK_WAIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_LOCK_WAIT_MS);
        let notary_webhook_url = env::var("NOTARY_WEBHOOK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            port,
            db_path,
            rate_limit_per_minute,
            max_bundle_events,
            lock_wait_ms,
            notary_webhook_url,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
