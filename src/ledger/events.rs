//! Ledger event model.
//!
//! Every record an instance reports (trades, snapshots, session boundaries,
//! broker evidence) becomes a `LedgerEvent` in that instance's chain. Events
//! are append-only: once written they are never updated or deleted, and a
//! detected inconsistency is corrected only by appending a CHAIN_RECOVERY
//! event on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared predecessor hash of the first event in a chain (64 zero chars).
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Closed set of event types an instance may report.
///
/// The wire/storage labels are the SCREAMING_SNAKE forms; anything outside
/// this set is rejected before it can touch the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "SESSION_START")]
    SessionStart,
    #[serde(rename = "SESSION_END")]
    SessionEnd,
    #[serde(rename = "TRADE_OPEN")]
    TradeOpen,
    #[serde(rename = "TRADE_CLOSE")]
    TradeClose,
    #[serde(rename = "TRADE_MODIFY")]
    TradeModify,
    #[serde(rename = "PARTIAL_CLOSE")]
    PartialClose,
    #[serde(rename = "SNAPSHOT")]
    Snapshot,
    #[serde(rename = "CASHFLOW")]
    Cashflow,
    #[serde(rename = "CHAIN_RECOVERY")]
    ChainRecovery,
    #[serde(rename = "BROKER_EVIDENCE")]
    BrokerEvidence,
    #[serde(rename = "BROKER_HISTORY_DIGEST")]
    BrokerHistoryDigest,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::SessionStart,
        EventType::SessionEnd,
        EventType::TradeOpen,
        EventType::TradeClose,
        EventType::TradeModify,
        EventType::PartialClose,
        EventType::Snapshot,
        EventType::Cashflow,
        EventType::ChainRecovery,
        EventType::BrokerEvidence,
        EventType::BrokerHistoryDigest,
    ];

    /// Canonical wire/storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "SESSION_START",
            EventType::SessionEnd => "SESSION_END",
            EventType::TradeOpen => "TRADE_OPEN",
            EventType::TradeClose => "TRADE_CLOSE",
            EventType::TradeModify => "TRADE_MODIFY",
            EventType::PartialClose => "PARTIAL_CLOSE",
            EventType::Snapshot => "SNAPSHOT",
            EventType::Cashflow => "CASHFLOW",
            EventType::ChainRecovery => "CHAIN_RECOVERY",
            EventType::BrokerEvidence => "BROKER_EVIDENCE",
            EventType::BrokerHistoryDigest => "BROKER_HISTORY_DIGEST",
        }
    }

    /// Parse a wire/storage label. `None` for anything outside the closed set.
    pub fn from_label(label: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == label)
    }

    /// Broker-sourced corroboration events feed level-2 verification only;
    /// they never move the running account state.
    pub fn is_broker_sourced(&self) -> bool {
        matches!(
            self,
            EventType::BrokerEvidence | EventType::BrokerHistoryDigest
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One link in an instance's hash chain.
///
/// `hash` covers the canonical encoding of (eventType, payload, timestamp,
/// seqNo) concatenated with `prev_hash`, so editing any field of any past
/// event is detectable from the chain alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub instance_id: String,
    /// Strictly increasing from 1 per instance, no gaps.
    pub seq_no: u64,
    pub event_type: EventType,
    /// Shape is fixed per event type and validated before append.
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Hash of the preceding event, or [`GENESIS_PREV_HASH`] for seqNo 1.
    pub prev_hash: String,
    pub hash: String,
}

impl LedgerEvent {
    /// Payload field as f64, tolerant of absent/non-numeric values.
    /// Used by fold paths that must stay total on untrusted bundle input.
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    /// Payload field as i64 (tickets, counts).
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    /// Payload field as str.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

// =============================================================================
// TESTS
// =============================================================================
