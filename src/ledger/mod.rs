//! Tamper-Evident Trading Ledger
//!
//! Append-only, hash-chained event log for live trading instances, with
//! signed state checkpoints and portable proof bundles a third party can
//! verify offline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         EventLedger                             │
//! │  (validates, rate-limits, serializes appends per instance)      │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ validate    │        │ canonical   │        │ rate_limit  │
//! │ (payloads)  │        │ (hashing)   │        │ (sliding)   │
//! └─────────────┘        └─────────────┘        └─────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         LedgerStore                             │
//! │  SQLite: events + running_state + checkpoints, one txn/append   │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                                              │
//!        ▼                                              ▼
//! ┌─────────────┐                               ┌─────────────┐
//! │ Bundle      │                               │ Checkpoint  │
//! │ Generator   │                               │ Signer      │
//! └──────┬──────┘                               │ (HMAC)      │
//!        │                                      └─────────────┘
//!        ▼
//! ┌─────────────┐    ┌─────────────┐
//! │ Bundle      │───▶│ Notary      │
//! │ Verifier    │    │ Registry    │
//! │ (L1/L2/L3)  │    │ (L3 only)   │
//! └─────────────┘    └─────────────┘
//! ```
//!
//! # Integrity Guarantees
//!
//! - **Chain**: `event[n].prevHash == event[n-1].hash`, genesis from zeros
//! - **Sequence**: per-instance `seqNo` from 1, no gaps, no reuse
//! - **State**: `RunningState` is a pure fold over the event list
//! - **Checkpoints**: HMAC-signed with a per-instance derived key
//! - **Verification**: bundles re-derive everything; the database is
//!   never consulted

pub mod bundle;
pub mod canonical;
pub mod chain;
pub mod checkpoint;
pub mod events;
pub mod lifecycle;
// Derived analytics over closed trades (never authoritative)
pub mod metrics;
pub mod notary;
pub mod rate_limit;
pub mod state;
pub mod store;
pub mod validate;
pub mod verify;

pub use bundle::{
    BundleError, BundleGenerator, BundleManifest, BundleReport, ProofBundle,
    DEFAULT_MAX_BUNDLE_EVENTS,
};
pub use canonical::{
    canonical_event_string, canonical_state_string, compute_event_hash, recompute_event_hash,
    sha256_hex,
};
pub use chain::{AppendRejection, EventLedger, LifecycleUpdateError};
pub use checkpoint::{
    checkpoint_due, verify_state_hmac, Checkpoint, CheckpointSigner, SecretPair,
    CHECKPOINT_INTERVAL, PREVIOUS_SECRET_ENV, SECRET_ENV,
};
pub use events::{EventType, LedgerEvent, GENESIS_PREV_HASH};
pub use lifecycle::{LifecycleError, LifecycleState, Transition};
pub use metrics::{trade_snapshot_hash, TradeFact, WalkForwardSummary, WalkForwardWindow};
pub use notary::{NotaryProvider, NotaryReceipt, NotaryRegistry, WebhookNotary, NOTARY_REGISTRY};
pub use rate_limit::{Admission, AdmissionStore, MemoryAdmissionStore, RateLimiter};
pub use state::{format_money, from_money, to_money, Money, RunningState};
pub use store::{InstanceRow, LedgerStore, StoreStats};
pub use validate::{validate, ValidationError};
pub use verify::{
    broker_history_digest, BundleVerifier, VerificationFailure, VerificationLevel,
    VerificationResult,
};
