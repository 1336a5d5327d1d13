//! Running account state derived from the event chain.
//!
//! # Design Principles
//!
//! 1. **Derived, never authoritative**: `RunningState` is a pure fold over
//!    the ordered event list. Anyone holding the events can recompute it,
//!    which is exactly what checkpoint verification does.
//!
//! 2. **Exact money**: monetary values are integer cents so the fold and the
//!    canonical two-decimal encoding are exact. Floats exist only at the JSON
//!    boundary.
//!
//! 3. **Total on untrusted input**: the fold never panics, whatever the
//!    payload contains. Verification feeds it attacker-controlled bundles;
//!    garbage folds to a state that simply fails the checkpoint comparison.

use serde::{Deserialize, Serialize};

use crate::ledger::events::{EventType, LedgerEvent, GENESIS_PREV_HASH};

// =============================================================================
// FIXED-POINT MONEY
// =============================================================================

/// Monetary amount in integer cents of the account currency.
pub type Money = i64;

/// Cents per currency unit.
pub const MONEY_SCALE: i64 = 100;

/// Convert a JSON-boundary f64 into cents, rounding half away from zero.
pub fn to_money(value: f64) -> Money {
    (value * MONEY_SCALE as f64).round() as Money
}

/// Convert cents back to an f64 currency amount.
pub fn from_money(amount: Money) -> f64 {
    amount as f64 / MONEY_SCALE as f64
}

/// Exact two-decimal text form of a cent amount ("-3.05", "0.00", "1250.50").
pub fn format_money(amount: Money) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// =============================================================================
// RUNNING STATE
// =============================================================================

/// Aggregate account state after folding events `1..=last_seq_no`.
///
/// Mutated exactly once per appended event via [`RunningState::apply`];
/// never rewound. Checkpoints sign a canonical encoding of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningState {
    pub balance: Money,
    pub equity: Money,
    pub high_water_mark: Money,
    pub max_drawdown: Money,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub total_profit: Money,
    pub total_swap: Money,
    pub total_commission: Money,
    pub last_seq_no: u64,
    pub last_event_hash: String,
}

impl Default for RunningState {
    fn default() -> Self {
        Self {
            balance: 0,
            equity: 0,
            high_water_mark: 0,
            max_drawdown: 0,
            max_drawdown_pct: 0.0,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            total_profit: 0,
            total_swap: 0,
            total_commission: 0,
            last_seq_no: 0,
            last_event_hash: GENESIS_PREV_HASH.to_string(),
        }
    }
}

impl RunningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Monetary effects depend on the event type:
    /// TRADE_CLOSE moves realized PnL, SNAPSHOT overwrites balance/equity,
    /// CASHFLOW shifts the balance baseline. Everything else only advances
    /// the chain cursor.
    pub fn apply(&mut self, event: &LedgerEvent) {
        match event.event_type {
            EventType::TradeClose => self.apply_trade_close(event),
            EventType::Snapshot => {
                self.balance = payload_money(event, "balance");
                self.equity = payload_money(event, "equity");
                self.refresh_drawdown();
            }
            EventType::Cashflow => {
                let amount = payload_money(event, "amount");
                self.balance += amount;
                self.equity += amount;
                self.refresh_drawdown();
            }
            _ => {}
        }

        self.last_seq_no = event.seq_no;
        self.last_event_hash = event.hash.clone();
    }

    fn apply_trade_close(&mut self, event: &LedgerEvent) {
        let profit = payload_money(event, "profit");
        let swap = payload_money(event, "swap");
        let commission = payload_money(event, "commission");

        self.total_trades += 1;
        self.total_profit += profit;
        self.total_swap += swap;
        self.total_commission += commission;
        if profit >= 0 {
            self.win_count += 1;
        } else {
            self.loss_count += 1;
        }

        self.balance += profit + swap + commission;
        self.equity = self.balance;
        self.refresh_drawdown();
    }

    fn refresh_drawdown(&mut self) {
        if self.equity > self.high_water_mark {
            self.high_water_mark = self.equity;
        }
        let drawdown = self.high_water_mark - self.equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
        if self.high_water_mark > 0 {
            let pct = drawdown as f64 / self.high_water_mark as f64 * 100.0;
            if pct > self.max_drawdown_pct {
                self.max_drawdown_pct = pct;
            }
        }
    }

    /// Refold a slice of ordered events on top of this state.
    pub fn fold(mut self, events: &[LedgerEvent]) -> RunningState {
        for event in events {
            self.apply(event);
        }
        self
    }
}

/// Payload money field in cents; absent or non-numeric reads as zero so the
/// fold stays total on untrusted input.
fn payload_money(event: &LedgerEvent, key: &str) -> Money {
    to_money(event.payload_f64(key).unwrap_or(0.0))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_event(seq_no: u64, event_type: EventType, payload: serde_json::Value) -> LedgerEvent {
        LedgerEvent {
            instance_id: "inst-1".to_string(),
            seq_no,
            event_type,
            payload,
            timestamp: Utc::now(),
            prev_hash: GENESIS_PREV_HASH.to_string(),
            hash: format!("{:064x}", seq_no),
        }
    }

    #[test]
    fn test_money_round_trip() {
        assert_eq!(to_money(50.0), 5000);
        assert_eq!(to_money(-3.055), -306);
        assert_eq!(to_money(0.004), 0);
        assert_eq!(from_money(5000), 50.0);
    }

    #[test]
    fn test_format_money_two_decimals() {
        assert_eq!(format_money(0), "0.00");
        assert_eq!(format_money(5), "0.05");
        assert_eq!(format_money(5000), "50.00");
        assert_eq!(format_money(-305), "-3.05");
        assert_eq!(format_money(125050), "1250.50");
    }

    #[test]
    fn test_trade_close_updates_counters_and_balance() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::TradeClose,
            serde_json::json!({ "ticket": 1, "profit": 50.0, "swap": -1.5, "commission": -0.5 }),
        ));

        assert_eq!(state.total_trades, 1);
        assert_eq!(state.win_count, 1);
        assert_eq!(state.loss_count, 0);
        assert_eq!(state.total_profit, 5000);
        assert_eq!(state.total_swap, -150);
        assert_eq!(state.total_commission, -50);
        assert_eq!(state.balance, 4800);
        assert_eq!(state.equity, 4800);
        assert_eq!(state.last_seq_no, 1);
    }

    #[test]
    fn test_losing_trade_counts_loss() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::TradeClose,
            serde_json::json!({ "ticket": 1, "profit": -25.0 }),
        ));
        assert_eq!(state.loss_count, 1);
        assert_eq!(state.win_count, 0);
        assert_eq!(state.balance, -2500);
    }

    #[test]
    fn test_break_even_counts_as_win() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::TradeClose,
            serde_json::json!({ "ticket": 1, "profit": 0.0 }),
        ));
        assert_eq!(state.win_count, 1);
        assert_eq!(state.loss_count, 0);
    }

    #[test]
    fn test_snapshot_overwrites_balance_and_equity() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::Snapshot,
            serde_json::json!({ "balance": 1000.0, "equity": 980.5 }),
        ));
        assert_eq!(state.balance, 100000);
        assert_eq!(state.equity, 98050);
        assert_eq!(state.high_water_mark, 98050);
    }

    #[test]
    fn test_drawdown_tracks_high_water_mark() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::Snapshot,
            serde_json::json!({ "balance": 1000.0, "equity": 1000.0 }),
        ));
        state.apply(&make_event(
            2,
            EventType::Snapshot,
            serde_json::json!({ "balance": 1000.0, "equity": 900.0 }),
        ));

        assert_eq!(state.high_water_mark, 100000);
        assert_eq!(state.max_drawdown, 10000);
        assert!((state.max_drawdown_pct - 10.0).abs() < 1e-9);

        // Recovery must not shrink the recorded maximum.
        state.apply(&make_event(
            3,
            EventType::Snapshot,
            serde_json::json!({ "balance": 1000.0, "equity": 990.0 }),
        ));
        assert_eq!(state.max_drawdown, 10000);
    }

    #[test]
    fn test_cashflow_shifts_baseline() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::Cashflow,
            serde_json::json!({ "amount": 500.0, "kind": "DEPOSIT" }),
        ));
        assert_eq!(state.balance, 50000);
        assert_eq!(state.equity, 50000);

        state.apply(&make_event(
            2,
            EventType::Cashflow,
            serde_json::json!({ "amount": -200.0, "kind": "WITHDRAWAL" }),
        ));
        assert_eq!(state.balance, 30000);
    }

    #[test]
    fn test_non_monetary_events_only_advance_cursor() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::TradeOpen,
            serde_json::json!({ "ticket": 7, "symbol": "EURUSD", "direction": "BUY", "lots": 0.1, "openPrice": 1.1 }),
        ));
        assert_eq!(state.balance, 0);
        assert_eq!(state.total_trades, 0);
        assert_eq!(state.last_seq_no, 1);
    }

    #[test]
    fn test_fold_matches_sequential_apply() {
        let events = vec![
            make_event(1, EventType::Snapshot, serde_json::json!({ "balance": 100.0, "equity": 100.0 })),
            make_event(2, EventType::TradeClose, serde_json::json!({ "ticket": 1, "profit": 10.0 })),
        ];
        let folded = RunningState::new().fold(&events);

        let mut sequential = RunningState::new();
        for e in &events {
            sequential.apply(e);
        }
        assert_eq!(folded, sequential);
    }

    #[test]
    fn test_garbage_payload_does_not_panic() {
        let mut state = RunningState::new();
        state.apply(&make_event(
            1,
            EventType::TradeClose,
            serde_json::json!({ "profit": "not-a-number", "swap": null }),
        ));
        assert_eq!(state.total_trades, 1);
        assert_eq!(state.balance, 0);
    }
}
