//! Pluggable third-party notarization.
//!
//! A notary attests that a checkpoint hash existed at a point in time. The
//! core only defines the interface and a name-keyed registry; concrete
//! providers are registered at process startup based on configuration, so
//! adding a provider never touches verification logic.
//!
//! The bundled [`WebhookNotary`] speaks a minimal single-endpoint contract:
//! a POST body without `proof` requests notarization and the response body
//! is the opaque proof; a POST body carrying `proof` asks the service to
//! confirm it issued that proof (2xx plus non-empty body).

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Proof of external attestation for one checkpoint hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotaryReceipt {
    pub provider: String,
    /// The checkpoint HMAC that was notarized, hex.
    pub hash: String,
    /// Provider-opaque proof blob, base64.
    pub proof: String,
    pub notarized_at: DateTime<Utc>,
}

/// One external attestation service.
#[async_trait]
pub trait NotaryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Submit `hash` for attestation and return the receipt.
    async fn notarize(&self, hash: &str) -> Result<NotaryReceipt>;

    /// Ask the provider whether it issued `receipt`. Ok(false) means the
    /// provider answered and said no; transport errors stay errors so the
    /// caller can distinguish "rejected" from "unreachable".
    async fn verify(&self, receipt: &NotaryReceipt) -> Result<bool>;
}

/// Name-keyed provider registry, populated once at startup.
#[derive(Default)]
pub struct NotaryRegistry {
    providers: RwLock<HashMap<String, Arc<dyn NotaryProvider>>>,
}

impl NotaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn NotaryProvider>) {
        let name = provider.name().to_string();
        debug!("Registered notary provider '{}'", name);
        self.providers.write().insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NotaryProvider>> {
        self.providers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

lazy_static! {
    /// Process-wide registry, filled in during startup.
    pub static ref NOTARY_REGISTRY: NotaryRegistry = NotaryRegistry::new();
}

/// Notary backed by a single HTTP webhook.
pub struct WebhookNotary {
    url: String,
    client: Client,
}

impl WebhookNotary {
    pub const PROVIDER_NAME: &'static str = "webhook";

    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { url: url.into(), client }
    }
}

#[async_trait]
impl NotaryProvider for WebhookNotary {
    fn name(&self) -> &str {
        Self::PROVIDER_NAME
    }

    async fn notarize(&self, hash: &str) -> Result<NotaryReceipt> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "hash": hash }))
            .send()
            .await
            .with_context(|| format!("Notary webhook unreachable: {}", self.url))?;

        let status = response.status();
        let body = response.text().await.context("Notary response unreadable")?;
        if !status.is_success() {
            anyhow::bail!("Notary webhook returned {}: {}", status, body);
        }
        let proof_raw = body.trim();
        if proof_raw.is_empty() {
            anyhow::bail!("Notary webhook returned an empty proof");
        }

        Ok(NotaryReceipt {
            provider: Self::PROVIDER_NAME.to_string(),
            hash: hash.to_string(),
            proof: base64::engine::general_purpose::STANDARD.encode(proof_raw),
            notarized_at: Utc::now(),
        })
    }

    async fn verify(&self, receipt: &NotaryReceipt) -> Result<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "hash": receipt.hash, "proof": receipt.proof }))
            .send()
            .await
            .with_context(|| format!("Notary webhook unreachable: {}", self.url))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("Notary webhook rejected receipt: {} {}", status, body);
            return Ok(false);
        }
        Ok(!body.trim().is_empty())
    }
}

// =============================================================================
// TESTS
// =============================================================================
