//! Canonical encodings and digests.
//!
//! Everything signed or hashed in this crate goes through here, so the rules
//! live in one place:
//!
//! - Event hash input: compact JSON of `{eventType, payload, seqNo,
//!   timestampMs}` with keys in ascending alphabetical order at every level,
//!   concatenated with the UTF-8 bytes of `prevHash`.
//! - State string: `key=value` pairs joined by `|`, keys alphabetical,
//!   monetary fields to exactly two decimals, counters as plain integers.
//!
//! # Invariants
//!
//! - Two logically equal inputs encode to byte-identical strings.
//! - Encoding is independent of serde_json map-ordering features; object
//!   keys are sorted explicitly.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ledger::events::{EventType, LedgerEvent};
use crate::ledger::state::{format_money, RunningState};

/// SHA-256 over raw bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 64-char lowercase hex check, used wherever a hash-shaped field is taken
/// from untrusted input.
pub fn is_hex_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Canonical compact JSON with recursively sorted object keys.
///
/// serde_json's default map is already ordered, but the signed format must
/// not depend on a cargo feature flag, so ordering is enforced here.
fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles string escaping; a plain &str never fails
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical_json(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).unwrap_or_default());
        }
    }
}

/// Canonical content string of an event, before chaining in `prevHash`.
pub fn canonical_event_string(
    event_type: EventType,
    payload: &Value,
    timestamp: DateTime<Utc>,
    seq_no: u64,
) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("{\"eventType\":\"");
    out.push_str(event_type.as_str());
    out.push_str("\",\"payload\":");
    write_canonical_json(payload, &mut out);
    out.push_str(",\"seqNo\":");
    out.push_str(&seq_no.to_string());
    out.push_str(",\"timestampMs\":");
    out.push_str(&timestamp.timestamp_millis().to_string());
    out.push('}');
    out
}

/// Event hash: `SHA256(canonical || prevHash)`, lowercase hex.
pub fn compute_event_hash(
    event_type: EventType,
    payload: &Value,
    timestamp: DateTime<Utc>,
    seq_no: u64,
    prev_hash: &str,
) -> String {
    let canonical = canonical_event_string(event_type, payload, timestamp, seq_no);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute an event's hash from its declared fields. Used by verification;
/// matches what the append engine wrote iff no field was altered.
pub fn recompute_event_hash(event: &LedgerEvent) -> String {
    compute_event_hash(
        event.event_type,
        &event.payload,
        event.timestamp,
        event.seq_no,
        &event.prev_hash,
    )
}

/// Canonical signing input for a checkpoint: the running state as
/// `key=value` pairs, keys in ascending alphabetical order.
pub fn canonical_state_string(state: &RunningState) -> String {
    format!(
        "balance={}|equity={}|highWaterMark={}|lastEventHash={}|lastSeqNo={}|lossCount={}|maxDrawdown={}|maxDrawdownPct={:.2}|totalCommission={}|totalProfit={}|totalSwap={}|totalTrades={}|winCount={}",
        format_money(state.balance),
        format_money(state.equity),
        format_money(state.high_water_mark),
        state.last_event_hash,
        state.last_seq_no,
        state.loss_count,
        format_money(state.max_drawdown),
        state.max_drawdown_pct,
        format_money(state.total_commission),
        format_money(state.total_profit),
        format_money(state.total_swap),
        state.total_trades,
        state.win_count,
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::events::GENESIS_PREV_HASH;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_canonical_event_string_sorts_payload_keys() {
        let payload = serde_json::json!({ "ticket": 1, "profit": 50.0, "direction": "BUY" });
        let s = canonical_event_string(EventType::TradeClose, &payload, ts(), 2);
        assert_eq!(
            s,
            "{\"eventType\":\"TRADE_CLOSE\",\"payload\":{\"direction\":\"BUY\",\"profit\":50.0,\"ticket\":1},\"seqNo\":2,\"timestampMs\":1700000000000}"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_objects() {
        let payload = serde_json::json!({ "b": { "z": 1, "a": [ { "y": 2, "x": 3 } ] }, "a": 0 });
        let mut out = String::new();
        write_canonical_json(&payload, &mut out);
        assert_eq!(out, "{\"a\":0,\"b\":{\"a\":[{\"x\":3,\"y\":2}],\"z\":1}}");
    }

    #[test]
    fn test_event_hash_deterministic() {
        let payload = serde_json::json!({ "ticket": 1, "profit": 50.0 });
        let h1 = compute_event_hash(EventType::TradeClose, &payload, ts(), 2, GENESIS_PREV_HASH);
        let h2 = compute_event_hash(EventType::TradeClose, &payload, ts(), 2, GENESIS_PREV_HASH);
        assert_eq!(h1, h2);
        assert!(is_hex_hash(&h1));
    }

    #[test]
    fn test_event_hash_changes_with_any_input() {
        let payload = serde_json::json!({ "ticket": 1, "profit": 50.0 });
        let base = compute_event_hash(EventType::TradeClose, &payload, ts(), 2, GENESIS_PREV_HASH);

        let tampered_payload = serde_json::json!({ "ticket": 1, "profit": 51.0 });
        assert_ne!(
            base,
            compute_event_hash(EventType::TradeClose, &tampered_payload, ts(), 2, GENESIS_PREV_HASH)
        );
        assert_ne!(
            base,
            compute_event_hash(EventType::TradeClose, &payload, ts(), 3, GENESIS_PREV_HASH)
        );
        assert_ne!(
            base,
            compute_event_hash(EventType::PartialClose, &payload, ts(), 2, GENESIS_PREV_HASH)
        );
        let other_prev = "1".repeat(64);
        assert_ne!(
            base,
            compute_event_hash(EventType::TradeClose, &payload, ts(), 2, &other_prev)
        );
    }

    #[test]
    fn test_state_string_fixed_layout() {
        let state = RunningState::default();
        let s = canonical_state_string(&state);
        assert_eq!(
            s,
            format!(
                "balance=0.00|equity=0.00|highWaterMark=0.00|lastEventHash={}|lastSeqNo=0|lossCount=0|maxDrawdown=0.00|maxDrawdownPct=0.00|totalCommission=0.00|totalProfit=0.00|totalSwap=0.00|totalTrades=0|winCount=0",
                GENESIS_PREV_HASH
            )
        );
    }

    #[test]
    fn test_state_string_two_decimal_money() {
        let state = RunningState {
            balance: 4800,
            equity: 4800,
            total_profit: 5000,
            total_swap: -150,
            total_commission: -50,
            max_drawdown_pct: 12.3456,
            ..RunningState::default()
        };
        let s = canonical_state_string(&state);
        assert!(s.contains("balance=48.00"));
        assert!(s.contains("totalSwap=-1.50"));
        assert!(s.contains("maxDrawdownPct=12.35"));
    }

    #[test]
    fn test_equal_states_encode_identically() {
        let a = RunningState { balance: 123, ..RunningState::default() };
        let b = RunningState { balance: 123, ..RunningState::default() };
        assert_eq!(canonical_state_string(&a), canonical_state_string(&b));
    }

    #[test]
    fn test_is_hex_hash() {
        assert!(is_hex_hash(&"a".repeat(64)));
        assert!(is_hex_hash(GENESIS_PREV_HASH));
        assert!(!is_hex_hash(&"A".repeat(64)));
        assert!(!is_hex_hash(&"a".repeat(63)));
        assert!(!is_hex_hash(&"g".repeat(64)));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
