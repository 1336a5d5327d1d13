//! Instance lifecycle state machine.
//!
//! Three states, two legal transitions, no way back:
//!
//! ```text
//! DRAFT ──> LIVE_MONITORING ──> INVALIDATED
//! ```
//!
//! Invalidation is terminal. An instance whose chain breaks or whose owner
//! retires it can only be replaced by a fresh instance with a fresh chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason recorded for an operator-initiated retirement.
pub const REASON_MANUAL: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[serde(rename = "DRAFT")]
    Draft,
    #[serde(rename = "LIVE_MONITORING")]
    LiveMonitoring,
    #[serde(rename = "INVALIDATED")]
    Invalidated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "DRAFT",
            LifecycleState::LiveMonitoring => "LIVE_MONITORING",
            LifecycleState::Invalidated => "INVALIDATED",
        }
    }

    pub fn from_label(label: &str) -> Result<Self, LifecycleError> {
        match label {
            "DRAFT" => Ok(LifecycleState::Draft),
            "LIVE_MONITORING" => Ok(LifecycleState::LiveMonitoring),
            "INVALIDATED" => Ok(LifecycleState::Invalidated),
            other => Err(LifecycleError::UnknownState { label: other.to_string() }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Invalidated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded state change, persisted to the lifecycle audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    IllegalTransition { from: LifecycleState, to: LifecycleState },
    AlreadyInvalidated,
    UnknownState { label: String },
    UnknownLegacyPhase { label: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::IllegalTransition { from, to } => {
                write!(f, "illegal lifecycle transition {} -> {}", from, to)
            }
            LifecycleError::AlreadyInvalidated => {
                write!(f, "instance is already invalidated")
            }
            LifecycleError::UnknownState { label } => {
                write!(f, "unknown lifecycle state '{}'", label)
            }
            LifecycleError::UnknownLegacyPhase { label } => {
                write!(f, "unknown legacy phase '{}'", label)
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Validate and build a transition. The only legal moves are
/// DRAFT -> LIVE_MONITORING and LIVE_MONITORING -> INVALIDATED.
pub fn transition(
    current: LifecycleState,
    target: LifecycleState,
    reason: &str,
) -> Result<Transition, LifecycleError> {
    if current == LifecycleState::Invalidated && target == LifecycleState::Invalidated {
        return Err(LifecycleError::AlreadyInvalidated);
    }
    let legal = matches!(
        (current, target),
        (LifecycleState::Draft, LifecycleState::LiveMonitoring)
            | (LifecycleState::LiveMonitoring, LifecycleState::Invalidated)
    );
    if !legal {
        return Err(LifecycleError::IllegalTransition { from: current, to: target });
    }
    Ok(Transition {
        from: current,
        to: target,
        reason: reason.to_string(),
        at: Utc::now(),
    })
}

/// Operator-initiated retirement of a live instance.
pub fn manual_retirement(current: LifecycleState) -> Result<Transition, LifecycleError> {
    transition(current, LifecycleState::Invalidated, REASON_MANUAL)
}

/// Map a legacy four-phase label onto the three-state model.
///
/// The old model split live instances into PROVING and PROVEN; both fold
/// into LIVE_MONITORING here. Unknown labels are rejected rather than
/// guessed at.
pub fn from_legacy_phase(label: &str) -> Result<LifecycleState, LifecycleError> {
    match label {
        "NEW" => Ok(LifecycleState::Draft),
        "PROVING" | "PROVEN" => Ok(LifecycleState::LiveMonitoring),
        "RETIRED" => Ok(LifecycleState::Invalidated),
        other => Err(LifecycleError::UnknownLegacyPhase { label: other.to_string() }),
    }
}

// =============================================================================
// TESTS
// =============================================================================
