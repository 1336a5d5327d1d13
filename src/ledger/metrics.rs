//! Derived metrics over closed trades.
//!
//! # Design Principles
//!
//! 1. **Derived, never authoritative**: everything here is recomputed from
//!    ledger events. Nothing in this module is stored as a source of truth.
//! 2. **Order independence**: the snapshot hash must not depend on the order
//!    facts arrive in, only on the set itself.
//! 3. **Conservative aggregation**: a multi-window validation claim is only
//!    as strong as its weakest window, so trade counts aggregate by minimum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ledger::canonical::sha256_hex;
use crate::ledger::events::{EventType, LedgerEvent};
use crate::ledger::state::{format_money, to_money, Money};

/// Version tag baked into the snapshot hash preimage.
pub const SNAPSHOT_HASH_VERSION: &str = "TSH_V1";

/// One closed trade, reduced to the fields Monte Carlo replay needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TradeFact {
    pub id: String,
    /// Realized profit in cents.
    pub profit: Money,
    pub executed_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// Hashing nothing would certify nothing; refuse instead.
    EmptyFactSet,
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsError::EmptyFactSet => write!(f, "cannot hash an empty trade fact set"),
        }
    }
}

impl std::error::Error for MetricsError {}

/// Canonical hash of a trade fact set plus starting balance.
///
/// Facts are sorted by `(executedAt, id)` so any permutation of the same set
/// produces the same hash. Changing one profit, one timestamp, the balance,
/// or the set size changes the hash.
pub fn trade_snapshot_hash(
    facts: &[TradeFact],
    initial_balance: Money,
) -> Result<String, MetricsError> {
    if facts.is_empty() {
        return Err(MetricsError::EmptyFactSet);
    }

    let mut ordered: Vec<&TradeFact> = facts.iter().collect();
    ordered.sort_by(|a, b| {
        a.executed_at
            .cmp(&b.executed_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let profits = ordered
        .iter()
        .map(|f| format_money(f.profit))
        .collect::<Vec<_>>()
        .join(",");
    // Escape the separator so distinct source sets can never encode alike.
    let sources = ordered
        .iter()
        .map(|f| f.source.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|s| s.replace('\\', "\\\\").replace(',', "\\,"))
        .collect::<Vec<_>>()
        .join(",");
    let first = ordered[0].executed_at.timestamp_millis();
    let last = ordered[ordered.len() - 1].executed_at.timestamp_millis();

    let canonical = format!(
        "v={}|count={}|initialBalance={}|first={}|last={}|profits={}|sources={}",
        SNAPSHOT_HASH_VERSION,
        ordered.len(),
        format_money(initial_balance),
        first,
        last,
        profits,
        sources,
    );
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Extract trade facts from a span of ledger events. Only TRADE_CLOSE
/// events carry realized profit; everything else is skipped.
pub fn facts_from_events(events: &[LedgerEvent]) -> Vec<TradeFact> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::TradeClose)
        .filter_map(|e| {
            let ticket = e.payload_i64("ticket")?;
            let profit = to_money(e.payload_f64("profit")?);
            Some(TradeFact {
                id: ticket.to_string(),
                profit,
                executed_at: e.timestamp,
                source: "ledger".to_string(),
            })
        })
        .collect()
}

// ===== WALK-FORWARD AGGREGATION =====

/// Out-of-sample statistics for one validation window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardWindow {
    /// How much the out-of-sample Sharpe fell short of in-sample, percent.
    pub sharpe_degradation_pct: f64,
    pub out_of_sample_trades: u64,
}

/// Aggregate over all validation windows of one strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardSummary {
    /// Arithmetic mean of per-window degradations, 0 with no windows.
    pub sharpe_degradation_pct: f64,
    /// Minimum across windows: the claim is bounded by the weakest window.
    pub out_of_sample_trade_count: u64,
    pub window_count: usize,
}

pub fn aggregate_walk_forward(windows: &[WalkForwardWindow]) -> WalkForwardSummary {
    if windows.is_empty() {
        return WalkForwardSummary {
            sharpe_degradation_pct: 0.0,
            out_of_sample_trade_count: 0,
            window_count: 0,
        };
    }
    let mean = windows
        .iter()
        .map(|w| w.sharpe_degradation_pct)
        .sum::<f64>()
        / windows.len() as f64;
    let min_trades = windows
        .iter()
        .map(|w| w.out_of_sample_trades)
        .min()
        .unwrap_or(0);
    WalkForwardSummary {
        sharpe_degradation_pct: mean,
        out_of_sample_trade_count: min_trades,
        window_count: windows.len(),
    }
}

// =============================================================================
// TESTS
// =============================================================================
