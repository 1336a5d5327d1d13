//! Proof bundle assembly.
//!
//! A bundle is the portable form of a ledger range: manifest, derived
//! summary body, the ordered events, and the checkpoints that fall inside
//! the range. It must carry everything a verifier with zero database access
//! needs, which is why partial ranges embed the opening state (the refold
//! of everything before the range) alongside the events themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::ledger::checkpoint::Checkpoint;
use crate::ledger::events::LedgerEvent;
use crate::ledger::lifecycle::LifecycleState;
use crate::ledger::metrics::{facts_from_events, trade_snapshot_hash};
use crate::ledger::notary::NotaryReceipt;
use crate::ledger::state::RunningState;
use crate::ledger::store::LedgerStore;

/// Default cap on events per bundle, keeps memory and verify time bounded.
pub const DEFAULT_MAX_BUNDLE_EVENTS: usize = 50_000;

/// Bumped when the bundle layout changes incompatibly.
pub const BUNDLE_FORMAT_VERSION: &str = "TPB_V1";

/// Who, what range, and when. Everything a consumer needs to cite a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    /// Deterministic per (instance, range): UUIDv5 over a trackproof URI.
    pub bundle_id: Uuid,
    pub format_version: String,
    pub instance_id: String,
    pub instance_name: String,
    pub lifecycle_state: LifecycleState,
    pub from_seq_no: u64,
    pub to_seq_no: u64,
    pub event_count: usize,
    pub checkpoint_count: usize,
    pub generated_at: DateTime<Utc>,
    /// Producing system identity, e.g. "trackproof-backend/0.1.0".
    pub generator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notarization: Option<NotaryReceipt>,
}

/// Derived summary over the bundled range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleBody {
    /// State before the first bundled event; default when the range is
    /// anchored at sequence 1.
    pub opening_state: RunningState,
    /// State after folding every bundled event onto the opening state.
    pub closing_state: RunningState,
    /// Canonical hash over closed trades in range, absent when none closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_snapshot_hash: Option<String>,
    pub closed_trade_count: usize,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleReport {
    pub manifest: BundleManifest,
    pub body: BundleBody,
}

/// The exported value object handed to external verifiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProofBundle {
    pub report: BundleReport,
    pub events: Vec<LedgerEvent>,
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    UnknownInstance { instance_id: String },
    NoEvents { instance_id: String },
    InvalidRange { from_seq_no: u64, to_seq_no: u64 },
    TooLarge { requested: usize, cap: usize },
    Storage(String),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::UnknownInstance { instance_id } => {
                write!(f, "unknown instance '{}'", instance_id)
            }
            BundleError::NoEvents { instance_id } => {
                write!(f, "instance '{}' has no events to bundle", instance_id)
            }
            BundleError::InvalidRange { from_seq_no, to_seq_no } => {
                write!(f, "invalid range [{}, {}]", from_seq_no, to_seq_no)
            }
            BundleError::TooLarge { requested, cap } => {
                write!(f, "range spans {} events, cap is {}", requested, cap)
            }
            BundleError::Storage(detail) => write!(f, "storage error: {}", detail),
        }
    }
}

impl std::error::Error for BundleError {}

/// Assembles proof bundles from the persisted ledger.
pub struct BundleGenerator {
    store: Arc<LedgerStore>,
    max_events: usize,
}

impl BundleGenerator {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self::with_cap(store, DEFAULT_MAX_BUNDLE_EVENTS)
    }

    pub fn with_cap(store: Arc<LedgerStore>, max_events: usize) -> Self {
        Self { store, max_events }
    }

    /// Build a bundle for `[from, to]`, defaulting to the full ledger.
    /// A `to` past the head is clamped to the head.
    pub fn generate(
        &self,
        instance_id: &str,
        from_seq_no: Option<u64>,
        to_seq_no: Option<u64>,
    ) -> Result<ProofBundle, BundleError> {
        let instance = self
            .store
            .instance(instance_id)
            .map_err(|e| BundleError::Storage(e.to_string()))?
            .ok_or_else(|| BundleError::UnknownInstance { instance_id: instance_id.to_string() })?;

        let head = self
            .store
            .max_seq_no(instance_id)
            .map_err(|e| BundleError::Storage(e.to_string()))?;
        if head == 0 {
            return Err(BundleError::NoEvents { instance_id: instance_id.to_string() });
        }

        let from = from_seq_no.unwrap_or(1);
        let to = to_seq_no.unwrap_or(head).min(head);
        if from == 0 || from > to {
            return Err(BundleError::InvalidRange { from_seq_no: from, to_seq_no: to });
        }

        let requested = (to - from + 1) as usize;
        if requested > self.max_events {
            return Err(BundleError::TooLarge { requested, cap: self.max_events });
        }

        let events = self
            .store
            .events_in_range(instance_id, from, to)
            .map_err(|e| BundleError::Storage(e.to_string()))?;
        if events.is_empty() {
            return Err(BundleError::NoEvents { instance_id: instance_id.to_string() });
        }

        let opening_state = if from == 1 {
            RunningState::default()
        } else {
            let prefix = self
                .store
                .events_in_range(instance_id, 1, from - 1)
                .map_err(|e| BundleError::Storage(e.to_string()))?;
            RunningState::default().fold(&prefix)
        };
        let closing_state = opening_state.clone().fold(&events);

        let facts = facts_from_events(&events);
        let snapshot_hash = if facts.is_empty() {
            None
        } else {
            trade_snapshot_hash(&facts, opening_state.balance).ok()
        };

        let checkpoints = self
            .store
            .checkpoints_in_range(instance_id, from, to)
            .map_err(|e| BundleError::Storage(e.to_string()))?;
        let notarization = self
            .store
            .latest_receipt_in_range(instance_id, from, to)
            .map_err(|e| BundleError::Storage(e.to_string()))?;

        let manifest = BundleManifest {
            bundle_id: bundle_id(instance_id, from, to),
            format_version: BUNDLE_FORMAT_VERSION.to_string(),
            instance_id: instance.instance_id,
            instance_name: instance.display_name,
            lifecycle_state: instance.lifecycle_state,
            from_seq_no: from,
            to_seq_no: to,
            event_count: events.len(),
            checkpoint_count: checkpoints.len(),
            generated_at: Utc::now(),
            generator: format!("trackproof-backend/{}", env!("CARGO_PKG_VERSION")),
            notarization,
        };
        let body = BundleBody {
            opening_state,
            closing_state,
            trade_snapshot_hash: snapshot_hash,
            closed_trade_count: facts.len(),
            period_start: events[0].timestamp,
            period_end: events[events.len() - 1].timestamp,
        };

        Ok(ProofBundle {
            report: BundleReport { manifest, body },
            events,
            checkpoints,
        })
    }
}

fn bundle_id(instance_id: &str, from_seq_no: u64, to_seq_no: u64) -> Uuid {
    let name = format!("trackproof://{}/{}-{}", instance_id, from_seq_no, to_seq_no);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

// =============================================================================
// TESTS
// =============================================================================
