//! Ledger append engine.
//!
//! One appended event is one unit of work: validate, admit, link, hash,
//! fold, maybe checkpoint, persist. Steps after admission run under a
//! per-instance lock so two concurrent appends can never hand out the same
//! sequence number or fork the chain.
//!
//! A divergence between the stored running state cursor and the events
//! table head means some earlier write was half-applied or the database was
//! touched from outside. That is a chain break: every append is rejected
//! until an explicit CHAIN_RECOVERY event re-anchors the instance, and the
//! recovery rebuilds the running state by refolding the full event list.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::ledger::canonical::compute_event_hash;
use crate::ledger::checkpoint::{checkpoint_due, CheckpointSigner};
use crate::ledger::events::{EventType, LedgerEvent, GENESIS_PREV_HASH};
use crate::ledger::lifecycle::{self, LifecycleError, LifecycleState, Transition};
use crate::ledger::rate_limit::{Admission, RateLimiter};
use crate::ledger::state::RunningState;
use crate::ledger::store::LedgerStore;
use crate::ledger::validate::{validate, ValidationError};

/// Default bound on how long one append waits for the instance lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(5_000);

/// Why an append was refused. Nothing was persisted in any of these cases.
#[derive(Debug)]
pub enum AppendRejection {
    InvalidPayload(ValidationError),
    RateLimited {
        retry_after_secs: u64,
    },
    /// Lock wait exceeded its bound; transient, safe to retry.
    Busy {
        waited_ms: u64,
    },
    /// Running state cursor and event head disagree.
    ChainBreak {
        state_seq_no: u64,
        state_hash: String,
        head_seq_no: u64,
        head_hash: String,
    },
    Internal(String),
}

impl AppendRejection {
    /// Stable label for logs and the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            AppendRejection::InvalidPayload(_) => "invalid_payload",
            AppendRejection::RateLimited { .. } => "rate_limited",
            AppendRejection::Busy { .. } => "busy",
            AppendRejection::ChainBreak { .. } => "chain_break",
            AppendRejection::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for AppendRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendRejection::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
            AppendRejection::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry in {}s", retry_after_secs)
            }
            AppendRejection::Busy { waited_ms } => {
                write!(f, "instance busy after waiting {}ms", waited_ms)
            }
            AppendRejection::ChainBreak { state_seq_no, head_seq_no, .. } => {
                write!(
                    f,
                    "chain break: state cursor at seq {} but event head at seq {}; append CHAIN_RECOVERY to re-anchor",
                    state_seq_no, head_seq_no
                )
            }
            AppendRejection::Internal(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

impl std::error::Error for AppendRejection {}

/// Why a lifecycle update was refused.
#[derive(Debug)]
pub enum LifecycleUpdateError {
    UnknownInstance,
    Lifecycle(LifecycleError),
    Internal(String),
}

impl fmt::Display for LifecycleUpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleUpdateError::UnknownInstance => write!(f, "unknown instance"),
            LifecycleUpdateError::Lifecycle(e) => write!(f, "{}", e),
            LifecycleUpdateError::Internal(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

impl std::error::Error for LifecycleUpdateError {}

impl From<LifecycleError> for LifecycleUpdateError {
    fn from(e: LifecycleError) -> Self {
        LifecycleUpdateError::Lifecycle(e)
    }
}

/// Lazily created per-instance append locks.
#[derive(Default)]
struct InstanceLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    fn handle(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }
}

/// The append engine plus the instance-scoped operations built on it.
pub struct EventLedger {
    store: Arc<LedgerStore>,
    limiter: RateLimiter,
    signer: Arc<CheckpointSigner>,
    locks: InstanceLocks,
    lock_wait: Duration,
}

impl EventLedger {
    pub fn new(store: Arc<LedgerStore>, limiter: RateLimiter, signer: Arc<CheckpointSigner>) -> Self {
        Self::with_lock_wait(store, limiter, signer, DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(
        store: Arc<LedgerStore>,
        limiter: RateLimiter,
        signer: Arc<CheckpointSigner>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            store,
            limiter,
            signer,
            locks: InstanceLocks::default(),
            lock_wait,
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn signer(&self) -> &Arc<CheckpointSigner> {
        &self.signer
    }

    /// Validate, admit, link and persist one event.
    pub fn append(
        &self,
        instance_id: &str,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerEvent, AppendRejection> {
        let result = self.append_inner(instance_id, event_type, payload, timestamp);
        match &result {
            Ok(event) => {
                counter!("ledger_events_appended_total", 1, "event_type" => event.event_type.as_str());
                if checkpoint_due(event.event_type, event.seq_no) {
                    counter!("ledger_checkpoints_created_total", 1);
                }
            }
            Err(rejection) => {
                counter!("ledger_appends_rejected_total", 1, "reason" => rejection.reason());
                warn!(
                    instance_id = %instance_id,
                    reason = rejection.reason(),
                    "append rejected: {}",
                    rejection
                );
            }
        }
        result
    }

    fn append_inner(
        &self,
        instance_id: &str,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerEvent, AppendRejection> {
        let etype = validate(event_type, &payload).map_err(AppendRejection::InvalidPayload)?;

        match self.limiter.try_admit(instance_id) {
            Admission::Admitted => {}
            Admission::RateLimited { retry_after_secs } => {
                return Err(AppendRejection::RateLimited { retry_after_secs });
            }
        }

        let lock = self.locks.handle(instance_id);
        let Some(_guard) = lock.try_lock_for(self.lock_wait) else {
            return Err(AppendRejection::Busy { waited_ms: self.lock_wait.as_millis() as u64 });
        };

        self.store
            .ensure_instance(instance_id, instance_id)
            .map_err(|e| AppendRejection::Internal(e.to_string()))?;

        let head = self
            .store
            .head(instance_id)
            .map_err(|e| AppendRejection::Internal(e.to_string()))?;
        let mut state = self
            .store
            .running_state(instance_id)
            .map_err(|e| AppendRejection::Internal(e.to_string()))?
            .unwrap_or_default();

        let (head_seq_no, head_hash) = head.unwrap_or((0, GENESIS_PREV_HASH.to_string()));
        if state.last_seq_no != head_seq_no || state.last_event_hash != head_hash {
            if etype == EventType::ChainRecovery {
                warn!(
                    instance_id = %instance_id,
                    state_seq_no = state.last_seq_no,
                    head_seq_no,
                    "re-anchoring broken chain via recovery event"
                );
                state = self.refold(instance_id, head_seq_no)?;
            } else {
                return Err(AppendRejection::ChainBreak {
                    state_seq_no: state.last_seq_no,
                    state_hash: state.last_event_hash.clone(),
                    head_seq_no,
                    head_hash,
                });
            }
        }

        let seq_no = head_seq_no + 1;
        let hash = compute_event_hash(etype, &payload, timestamp, seq_no, &head_hash);
        let event = LedgerEvent {
            instance_id: instance_id.to_string(),
            seq_no,
            event_type: etype,
            payload,
            timestamp,
            prev_hash: head_hash,
            hash,
        };

        state.apply(&event);
        let checkpoint = if checkpoint_due(etype, seq_no) {
            Some(
                self.signer
                    .sign(instance_id, &state)
                    .map_err(|e| AppendRejection::Internal(e.to_string()))?,
            )
        } else {
            None
        };

        self.store
            .append_atomic(&event, &state, checkpoint.as_ref())
            .map_err(|e| AppendRejection::Internal(e.to_string()))?;

        info!(
            instance_id = %instance_id,
            seq_no,
            event_type = %etype,
            checkpointed = checkpoint.is_some(),
            "event appended"
        );
        Ok(event)
    }

    /// Rebuild the running state from the authoritative event list.
    fn refold(&self, instance_id: &str, head_seq_no: u64) -> Result<RunningState, AppendRejection> {
        let events = self
            .store
            .events_in_range(instance_id, 1, head_seq_no)
            .map_err(|e| AppendRejection::Internal(e.to_string()))?;
        Ok(RunningState::default().fold(&events))
    }

    /// Current derived state for an instance, default if nothing appended.
    pub fn running_state(&self, instance_id: &str) -> anyhow::Result<RunningState> {
        Ok(self.store.running_state(instance_id)?.unwrap_or_default())
    }

    /// Operator-initiated retirement. The only lifecycle move callers can
    /// trigger from the outside.
    pub fn retire(&self, instance_id: &str) -> Result<Transition, LifecycleUpdateError> {
        let current = self
            .store
            .lifecycle_state(instance_id)
            .map_err(|e| LifecycleUpdateError::Internal(e.to_string()))?
            .ok_or(LifecycleUpdateError::UnknownInstance)?;
        let transition = lifecycle::manual_retirement(current)?;
        self.store
            .set_lifecycle(instance_id, &transition)
            .map_err(|e| LifecycleUpdateError::Internal(e.to_string()))?;
        info!(instance_id = %instance_id, reason = %transition.reason, "instance retired");
        Ok(transition)
    }

    /// Accept a transition decided by an external monitoring collaborator.
    pub fn advance_lifecycle(
        &self,
        instance_id: &str,
        target: LifecycleState,
        reason: &str,
    ) -> Result<Transition, LifecycleUpdateError> {
        let current = self
            .store
            .lifecycle_state(instance_id)
            .map_err(|e| LifecycleUpdateError::Internal(e.to_string()))?
            .ok_or(LifecycleUpdateError::UnknownInstance)?;
        let transition = lifecycle::transition(current, target, reason)?;
        self.store
            .set_lifecycle(instance_id, &transition)
            .map_err(|e| LifecycleUpdateError::Internal(e.to_string()))?;
        info!(
            instance_id = %instance_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "lifecycle advanced"
        );
        Ok(transition)
    }

    /// Drop idle rate-limit windows; called from the background loop.
    pub fn purge_rate_windows(&self) {
        self.limiter.purge();
    }
}

// =============================================================================
// TESTS
// =============================================================================
