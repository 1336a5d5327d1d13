//! Proof Bundle Verifier - Single Authoritative Source for Verification
//!
//! This module implements the SOLE PATHWAY for declaring a proof bundle
//! verified. It has no database access by design: everything it checks is
//! recomputed from the bundle itself, so a consumer can run it days later
//! on an untrusted export and trust the answer.
//!
//! # Verification Levels
//!
//! - **L1 (ledger integrity)**: every event hash recomputed, every chain
//!   link confirmed, the running state refolded and compared against each
//!   checkpoint's declared state and HMAC.
//! - **L2 (broker corroboration)**: BROKER_EVIDENCE and
//!   BROKER_HISTORY_DIGEST events cross-checked against the trades they
//!   claim to confirm. Not attempted when no such events exist.
//! - **L3 (notarization)**: the bundle's receipt checked against a
//!   registered notary provider. Not attempted without a receipt and a
//!   matching provider.
//!
//! `verified` is true iff L1 passes. `level` is the highest tier that was
//! both attempted and passed, and the hierarchy is strict: without broker
//! evidence the level caps at L1 no matter what a notary says.
//!
//! Tampering is a negative verification result, never a crash: malformed
//! input maps to failures, not panics.

use metrics::counter;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::ledger::bundle::{ProofBundle, DEFAULT_MAX_BUNDLE_EVENTS};
use crate::ledger::canonical::{canonical_state_string, recompute_event_hash, sha256_hex};
use crate::ledger::checkpoint::{verify_state_hmac, Checkpoint, SecretPair};
use crate::ledger::events::{EventType, LedgerEvent, GENESIS_PREV_HASH};
use crate::ledger::notary::NotaryRegistry;
use crate::ledger::state::{format_money, to_money, Money, RunningState};

/// Price fields must agree within this absolute tolerance.
pub const PRICE_TOLERANCE: f64 = 0.0001;

/// Profit fields must agree within one cent.
pub const PROFIT_TOLERANCE_CENTS: Money = 1;

/// Broker and ledger timestamps must agree within two minutes.
pub const TIME_TOLERANCE_MS: i64 = 120_000;

// =============================================================================
// VERIFICATION FAILURES
// =============================================================================

/// Explicit enumeration of every way a bundle can fail verification.
///
/// This is a CLOSED enum - all possible verification failures are
/// enumerated here. Each variant carries the location of the problem and
/// appears in reports/logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerificationFailure {
    /// Recomputing an event's hash did not reproduce the stored value.
    EventHashMismatch {
        seq_no: u64,
        declared: String,
        computed: String,
    },

    /// `prevHash` does not match the preceding event's hash.
    ChainLinkBroken {
        seq_no: u64,
        expected_prev_hash: String,
        declared_prev_hash: String,
    },

    /// Sequence numbers are not contiguous.
    SequenceGap {
        expected_seq_no: u64,
        found_seq_no: u64,
    },

    /// The declared opening state does not connect to the first event.
    OpeningStateMismatch { detail: String },

    /// Refolding the events did not reproduce a checkpoint's state.
    CheckpointStateDivergence {
        seq_no: u64,
        declared: String,
        recomputed: String,
    },

    /// A checkpoint's HMAC verified under neither the current nor the
    /// previous secret.
    CheckpointHmacInvalid { seq_no: u64 },

    /// A checkpoint references a sequence number with no event in range.
    CheckpointOutsideRange { seq_no: u64 },

    /// The bundle exceeds the verifier's event cap.
    BundleTooLarge { event_count: usize, cap: usize },

    /// The bundle is structurally inconsistent with its own manifest.
    MalformedBundle { detail: String },

    /// Broker evidence references a ticket with no matching trade event.
    BrokerTicketUnmatched { ticket: i64 },

    /// A broker-reported field disagrees with the ledger beyond tolerance.
    BrokerFieldMismatch {
        ticket: i64,
        field: String,
        ledger_value: String,
        broker_value: String,
    },

    /// Recomputing the broker history digest did not match the declaration.
    BrokerDigestMismatch { seq_no: u64 },

    /// The digest's declared trade count disagrees with the ledger.
    BrokerTradeCountMismatch { declared: i64, actual: i64 },

    /// The receipt's hash matches no checkpoint HMAC in the bundle.
    NotaryHashMismatch { receipt_hash: String },

    /// The provider answered and disowned the receipt.
    NotaryReceiptRejected { provider: String },

    /// The provider could not be reached; attempted but not passed.
    NotaryUnreachable { provider: String, detail: String },
}

impl VerificationFailure {
    /// Get a human-readable short code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EventHashMismatch { .. } => "EVENT_HASH_MISMATCH",
            Self::ChainLinkBroken { .. } => "CHAIN_LINK_BROKEN",
            Self::SequenceGap { .. } => "SEQUENCE_GAP",
            Self::OpeningStateMismatch { .. } => "OPENING_STATE_MISMATCH",
            Self::CheckpointStateDivergence { .. } => "CHECKPOINT_STATE_DIVERGENCE",
            Self::CheckpointHmacInvalid { .. } => "CHECKPOINT_HMAC_INVALID",
            Self::CheckpointOutsideRange { .. } => "CHECKPOINT_OUTSIDE_RANGE",
            Self::BundleTooLarge { .. } => "BUNDLE_TOO_LARGE",
            Self::MalformedBundle { .. } => "MALFORMED_BUNDLE",
            Self::BrokerTicketUnmatched { .. } => "BROKER_TICKET_UNMATCHED",
            Self::BrokerFieldMismatch { .. } => "BROKER_FIELD_MISMATCH",
            Self::BrokerDigestMismatch { .. } => "BROKER_DIGEST_MISMATCH",
            Self::BrokerTradeCountMismatch { .. } => "BROKER_TRADE_COUNT_MISMATCH",
            Self::NotaryHashMismatch { .. } => "NOTARY_HASH_MISMATCH",
            Self::NotaryReceiptRejected { .. } => "NOTARY_RECEIPT_REJECTED",
            Self::NotaryUnreachable { .. } => "NOTARY_UNREACHABLE",
        }
    }

    /// Get a human-readable description of this failure.
    pub fn description(&self) -> String {
        match self {
            Self::EventHashMismatch { seq_no, declared, computed } => {
                format!(
                    "Event seq {} declares hash {} but its content hashes to {}",
                    seq_no,
                    short_hash(declared),
                    short_hash(computed)
                )
            }
            Self::ChainLinkBroken { seq_no, expected_prev_hash, declared_prev_hash } => {
                format!(
                    "Event seq {} declares prevHash {} but the preceding event's hash is {}",
                    seq_no,
                    short_hash(declared_prev_hash),
                    short_hash(expected_prev_hash)
                )
            }
            Self::SequenceGap { expected_seq_no, found_seq_no } => {
                format!("Expected seq {} next but found {}", expected_seq_no, found_seq_no)
            }
            Self::OpeningStateMismatch { detail } => {
                format!("Opening state does not connect to the first event: {}", detail)
            }
            Self::CheckpointStateDivergence { seq_no, .. } => {
                format!(
                    "Checkpoint at seq {} declares a state the events do not reproduce",
                    seq_no
                )
            }
            Self::CheckpointHmacInvalid { seq_no } => {
                format!("Checkpoint at seq {} carries an HMAC no known secret produced", seq_no)
            }
            Self::CheckpointOutsideRange { seq_no } => {
                format!("Checkpoint at seq {} has no corresponding event in the bundle", seq_no)
            }
            Self::BundleTooLarge { event_count, cap } => {
                format!("Bundle carries {} events, verifier cap is {}", event_count, cap)
            }
            Self::MalformedBundle { detail } => {
                format!("Bundle is structurally inconsistent: {}", detail)
            }
            Self::BrokerTicketUnmatched { ticket } => {
                format!("Broker evidence for ticket {} matches no trade event in range", ticket)
            }
            Self::BrokerFieldMismatch { ticket, field, ledger_value, broker_value } => {
                format!(
                    "Ticket {}: ledger {}={} but broker reports {}",
                    ticket, field, ledger_value, broker_value
                )
            }
            Self::BrokerDigestMismatch { seq_no } => {
                format!(
                    "Broker history digest at seq {} does not match the recomputed digest",
                    seq_no
                )
            }
            Self::BrokerTradeCountMismatch { declared, actual } => {
                format!(
                    "Broker digest declares {} closed trades but the ledger shows {}",
                    declared, actual
                )
            }
            Self::NotaryHashMismatch { receipt_hash } => {
                format!(
                    "Notary receipt hash {} matches no checkpoint HMAC in the bundle",
                    short_hash(receipt_hash)
                )
            }
            Self::NotaryReceiptRejected { provider } => {
                format!("Notary provider '{}' does not recognize the receipt", provider)
            }
            Self::NotaryUnreachable { provider, detail } => {
                format!("Notary provider '{}' unreachable: {}", provider, detail)
            }
        }
    }
}

fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(12) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

// =============================================================================
// VERIFICATION RESULT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VerificationLevel {
    L1,
    L2,
    L3,
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationLevel::L1 => write!(f, "L1"),
            VerificationLevel::L2 => write!(f, "L2"),
            VerificationLevel::L3 => write!(f, "L3"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LevelOneReport {
    pub passed: bool,
    /// True when the bundle starts at seq 1 from genesis with a default
    /// opening state; such a bundle is self-certifying from nothing.
    pub anchored: bool,
    pub events_checked: usize,
    pub checkpoints_checked: usize,
    pub failures: Vec<VerificationFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LevelTwoReport {
    pub attempted: bool,
    pub passed: bool,
    pub evidence_events: usize,
    pub matched_trades: usize,
    pub failures: Vec<VerificationFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LevelThreeReport {
    pub attempted: bool,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub failures: Vec<VerificationFailure>,
}

impl LevelThreeReport {
    fn not_attempted(note: Option<String>) -> Self {
        Self { attempted: false, passed: false, provider: None, note, failures: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// True iff L1 passed. Higher tiers refine the level, never this flag.
    pub verified: bool,
    /// Highest tier both attempted and passed; absent when L1 failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<VerificationLevel>,
    pub summary: String,
    pub l1: LevelOneReport,
    pub l2: LevelTwoReport,
    pub l3: LevelThreeReport,
}

impl VerificationResult {
    pub fn failures(&self) -> impl Iterator<Item = &VerificationFailure> {
        self.l1
            .failures
            .iter()
            .chain(self.l2.failures.iter())
            .chain(self.l3.failures.iter())
    }

    /// Format as a compact one-line summary.
    pub fn format_compact(&self) -> String {
        if self.verified {
            match self.level {
                Some(level) => format!("VERIFIED ({})", level),
                None => "VERIFIED".to_string(),
            }
        } else {
            format!("FAILED ({} failures)", self.failures().count())
        }
    }

    /// Format as a detailed report.
    pub fn format_report(&self) -> String {
        let mut out = String::new();

        out.push_str("╔══════════════════════════════════════════════════════════════════════════════╗\n");
        out.push_str("║                         PROOF BUNDLE VERIFICATION                            ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════════════════════════╣\n");

        if self.verified {
            let level = self
                .level
                .map(|l| l.to_string())
                .unwrap_or_else(|| "L1".to_string());
            out.push_str(&format!("║  RESULT: ✓ VERIFIED at {}                                                    ║\n", level));
            out.push_str("║                                                                              ║\n");
            out.push_str(&format!(
                "║    ✓ L1 ledger integrity ({} events, {} checkpoints{})\n",
                self.l1.events_checked,
                self.l1.checkpoints_checked,
                if self.l1.anchored { ", anchored" } else { "" }
            ));
            if self.l2.attempted {
                let mark = if self.l2.passed { "✓" } else { "✗" };
                out.push_str(&format!(
                    "║    {} L2 broker corroboration ({} evidence events, {} matched)\n",
                    mark, self.l2.evidence_events, self.l2.matched_trades
                ));
            } else {
                out.push_str("║    - L2 broker corroboration not attempted (no evidence events)\n");
            }
            if self.l3.attempted {
                let mark = if self.l3.passed { "✓" } else { "✗" };
                let provider = self.l3.provider.as_deref().unwrap_or("?");
                out.push_str(&format!("║    {} L3 notarization via '{}'\n", mark, provider));
            } else {
                out.push_str("║    - L3 notarization not attempted\n");
            }
        } else {
            out.push_str("║  RESULT: ✗ FAILED                                                            ║\n");
        }

        let failure_count = self.failures().count();
        if failure_count > 0 {
            out.push_str("╠══════════════════════════════════════════════════════════════════════════════╣\n");
            out.push_str(&format!("║  {} failure(s):\n", failure_count));
            for (i, failure) in self.failures().enumerate() {
                let desc = failure.description();
                let max_desc_chars = 70;
                let display_desc = match desc.char_indices().nth(max_desc_chars - 3) {
                    Some((idx, _)) => format!("{}...", &desc[..idx]),
                    None => desc,
                };
                out.push_str(&format!("║  {}. [{}]\n", i + 1, failure.code()));
                out.push_str(&format!("║     {}\n", display_desc));
            }
        }

        out.push_str("╚══════════════════════════════════════════════════════════════════════════════╝\n");
        out
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_compact())
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

/// Stateless bundle verifier: secrets in, verdict out.
pub struct BundleVerifier {
    secrets: SecretPair,
    max_events: usize,
}

impl BundleVerifier {
    pub fn new(secrets: SecretPair) -> Self {
        Self::with_cap(secrets, DEFAULT_MAX_BUNDLE_EVENTS)
    }

    pub fn with_cap(secrets: SecretPair, max_events: usize) -> Self {
        Self { secrets, max_events }
    }

    /// L1 + L2 verification. L3 is reported as not attempted.
    pub fn verify(&self, bundle: &ProofBundle) -> VerificationResult {
        let (l1, l2) = self.verify_core(bundle);
        let l3 = LevelThreeReport::not_attempted(None);
        finish(l1, l2, l3)
    }

    /// Full verification including notarization, when the bundle carries a
    /// receipt and the registry knows its provider.
    pub async fn verify_with_notary(
        &self,
        bundle: &ProofBundle,
        registry: &NotaryRegistry,
    ) -> VerificationResult {
        let (l1, l2) = self.verify_core(bundle);
        let l3 = self.verify_notarization(bundle, registry).await;
        finish(l1, l2, l3)
    }

    fn verify_core(&self, bundle: &ProofBundle) -> (LevelOneReport, LevelTwoReport) {
        let l1 = self.verify_integrity(bundle);
        let l2 = verify_broker_corroboration(&bundle.events);
        (l1, l2)
    }

    // ===== LEVEL 1: LEDGER INTEGRITY =====

    fn verify_integrity(&self, bundle: &ProofBundle) -> LevelOneReport {
        let events = &bundle.events;
        let manifest = &bundle.report.manifest;
        let opening = &bundle.report.body.opening_state;

        let mut report = LevelOneReport {
            passed: false,
            anchored: false,
            events_checked: events.len(),
            checkpoints_checked: bundle.checkpoints.len(),
            failures: Vec::new(),
        };

        if events.is_empty() {
            report.failures.push(VerificationFailure::MalformedBundle {
                detail: "bundle carries no events".to_string(),
            });
            return report;
        }
        if events.len() > self.max_events {
            report.failures.push(VerificationFailure::BundleTooLarge {
                event_count: events.len(),
                cap: self.max_events,
            });
            return report;
        }

        let first = &events[0];
        let last = &events[events.len() - 1];
        if manifest.event_count != events.len()
            || manifest.from_seq_no != first.seq_no
            || manifest.to_seq_no != last.seq_no
        {
            report.failures.push(VerificationFailure::MalformedBundle {
                detail: format!(
                    "manifest declares [{}..{}] with {} events but the bundle holds [{}..{}] with {}",
                    manifest.from_seq_no,
                    manifest.to_seq_no,
                    manifest.event_count,
                    first.seq_no,
                    last.seq_no,
                    events.len()
                ),
            });
        }

        report.anchored = first.seq_no == 1
            && first.prev_hash == GENESIS_PREV_HASH
            && *opening == RunningState::default();

        // Anchor checks: either genesis or an opening state that connects.
        if first.seq_no == 1 {
            if first.prev_hash != GENESIS_PREV_HASH {
                report.failures.push(VerificationFailure::ChainLinkBroken {
                    seq_no: 1,
                    expected_prev_hash: GENESIS_PREV_HASH.to_string(),
                    declared_prev_hash: first.prev_hash.clone(),
                });
            }
            if *opening != RunningState::default() {
                report.failures.push(VerificationFailure::OpeningStateMismatch {
                    detail: "range starts at seq 1 but the opening state is not pristine"
                        .to_string(),
                });
            }
        } else {
            if opening.last_seq_no + 1 != first.seq_no {
                report.failures.push(VerificationFailure::OpeningStateMismatch {
                    detail: format!(
                        "opening state ends at seq {} but the range starts at seq {}",
                        opening.last_seq_no, first.seq_no
                    ),
                });
            }
            if opening.last_event_hash != first.prev_hash {
                report.failures.push(VerificationFailure::OpeningStateMismatch {
                    detail: format!(
                        "opening state hash {} does not match the first event's prevHash {}",
                        short_hash(&opening.last_event_hash),
                        short_hash(&first.prev_hash)
                    ),
                });
            }
        }

        // Per-event hash recomputation is embarrassingly parallel.
        let hash_failures: Vec<VerificationFailure> = events
            .par_iter()
            .map(|event| {
                let computed = recompute_event_hash(event);
                (computed != event.hash).then(|| VerificationFailure::EventHashMismatch {
                    seq_no: event.seq_no,
                    declared: event.hash.clone(),
                    computed,
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();
        report.failures.extend(hash_failures);

        // Contiguity and links are inherently sequential.
        for pair in events.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.seq_no != prev.seq_no + 1 {
                report.failures.push(VerificationFailure::SequenceGap {
                    expected_seq_no: prev.seq_no + 1,
                    found_seq_no: next.seq_no,
                });
            }
            if next.prev_hash != prev.hash {
                report.failures.push(VerificationFailure::ChainLinkBroken {
                    seq_no: next.seq_no,
                    expected_prev_hash: prev.hash.clone(),
                    declared_prev_hash: next.prev_hash.clone(),
                });
            }
        }

        // Refold from the opening state and hold each checkpoint against
        // the recomputed state at its sequence number.
        let mut by_seq: BTreeMap<u64, &Checkpoint> =
            bundle.checkpoints.iter().map(|c| (c.seq_no, c)).collect();
        let mut state = opening.clone();
        for event in events {
            state.apply(event);
            if let Some(checkpoint) = by_seq.remove(&event.seq_no) {
                let recomputed = canonical_state_string(&state);
                let declared = canonical_state_string(&checkpoint.state);
                if recomputed != declared {
                    report.failures.push(VerificationFailure::CheckpointStateDivergence {
                        seq_no: checkpoint.seq_no,
                        declared,
                        recomputed,
                    });
                }
                if verify_state_hmac(
                    &self.secrets,
                    &manifest.instance_id,
                    &checkpoint.state,
                    &checkpoint.hmac,
                )
                .is_none()
                {
                    report
                        .failures
                        .push(VerificationFailure::CheckpointHmacInvalid {
                            seq_no: checkpoint.seq_no,
                        });
                }
            }
        }
        for seq_no in by_seq.into_keys() {
            report
                .failures
                .push(VerificationFailure::CheckpointOutsideRange { seq_no });
        }

        report.passed = report.failures.is_empty();
        report
    }

    // ===== LEVEL 3: NOTARIZATION =====

    async fn verify_notarization(
        &self,
        bundle: &ProofBundle,
        registry: &NotaryRegistry,
    ) -> LevelThreeReport {
        let Some(receipt) = &bundle.report.manifest.notarization else {
            return LevelThreeReport::not_attempted(None);
        };
        let Some(provider) = registry.get(&receipt.provider) else {
            return LevelThreeReport::not_attempted(Some(format!(
                "receipt names provider '{}' but none is registered",
                receipt.provider
            )));
        };

        let mut report = LevelThreeReport {
            attempted: true,
            passed: false,
            provider: Some(receipt.provider.clone()),
            note: None,
            failures: Vec::new(),
        };

        // The receipt must attest a checkpoint this bundle actually carries.
        if !bundle.checkpoints.iter().any(|c| c.hmac == receipt.hash) {
            report.failures.push(VerificationFailure::NotaryHashMismatch {
                receipt_hash: receipt.hash.clone(),
            });
            return report;
        }

        match provider.verify(receipt).await {
            Ok(true) => report.passed = true,
            Ok(false) => report.failures.push(VerificationFailure::NotaryReceiptRejected {
                provider: receipt.provider.clone(),
            }),
            Err(e) => report.failures.push(VerificationFailure::NotaryUnreachable {
                provider: receipt.provider.clone(),
                detail: e.to_string(),
            }),
        }
        report
    }
}

// ===== LEVEL 2: BROKER CORROBORATION =====

/// Canonical digest over closed trades: `ticket:profit` lines sorted by
/// ticket. Shared between ingestion-side producers and the verifier.
pub fn broker_history_digest<I>(closed_trades: I) -> String
where
    I: IntoIterator<Item = (i64, Money)>,
{
    let mut trades: Vec<(i64, Money)> = closed_trades.into_iter().collect();
    trades.sort();
    let lines: Vec<String> = trades
        .into_iter()
        .map(|(ticket, profit)| format!("{}:{}", ticket, format_money(profit)))
        .collect();
    sha256_hex(lines.join("\n").as_bytes())
}

fn verify_broker_corroboration(events: &[LedgerEvent]) -> LevelTwoReport {
    let mut report = LevelTwoReport {
        attempted: false,
        passed: false,
        evidence_events: 0,
        matched_trades: 0,
        failures: Vec::new(),
    };

    let closes: Vec<&LedgerEvent> = events
        .iter()
        .filter(|e| e.event_type == EventType::TradeClose)
        .collect();
    let opens: Vec<&LedgerEvent> = events
        .iter()
        .filter(|e| e.event_type == EventType::TradeOpen)
        .collect();

    for event in events {
        match event.event_type {
            EventType::BrokerEvidence => {
                report.attempted = true;
                report.evidence_events += 1;
                if check_evidence(event, &opens, &closes, &mut report.failures) {
                    report.matched_trades += 1;
                }
            }
            EventType::BrokerHistoryDigest => {
                report.attempted = true;
                report.evidence_events += 1;
                check_digest(event, &closes, &mut report.failures);
            }
            _ => {}
        }
    }

    report.passed = report.attempted && report.failures.is_empty();
    report
}

/// Returns true when the evidence fully matched a trade event.
fn check_evidence(
    evidence: &LedgerEvent,
    opens: &[&LedgerEvent],
    closes: &[&LedgerEvent],
    failures: &mut Vec<VerificationFailure>,
) -> bool {
    let Some(ticket) = evidence.payload_i64("ticket") else {
        failures.push(VerificationFailure::MalformedBundle {
            detail: format!("broker evidence at seq {} lacks a ticket", evidence.seq_no),
        });
        return false;
    };

    let subject = closes
        .iter()
        .find(|e| e.payload_i64("ticket") == Some(ticket))
        .or_else(|| opens.iter().find(|e| e.payload_i64("ticket") == Some(ticket)));
    let Some(subject) = subject else {
        failures.push(VerificationFailure::BrokerTicketUnmatched { ticket });
        return false;
    };

    let before = failures.len();

    for field in ["openPrice", "closePrice"] {
        if let (Some(broker), Some(ledger)) =
            (evidence.payload_f64(field), subject.payload_f64(field))
        {
            if (broker - ledger).abs() > PRICE_TOLERANCE {
                failures.push(VerificationFailure::BrokerFieldMismatch {
                    ticket,
                    field: field.to_string(),
                    ledger_value: format!("{}", ledger),
                    broker_value: format!("{}", broker),
                });
            }
        }
    }

    if let (Some(broker), Some(ledger)) =
        (evidence.payload_f64("profit"), subject.payload_f64("profit"))
    {
        if (to_money(broker) - to_money(ledger)).abs() > PROFIT_TOLERANCE_CENTS {
            failures.push(VerificationFailure::BrokerFieldMismatch {
                ticket,
                field: "profit".to_string(),
                ledger_value: format_money(to_money(ledger)),
                broker_value: format_money(to_money(broker)),
            });
        }
    }

    if let Some(closed_at) = evidence.payload_i64("closedAt") {
        let ledger_ms = subject.timestamp.timestamp_millis();
        if (closed_at - ledger_ms).abs() > TIME_TOLERANCE_MS {
            failures.push(VerificationFailure::BrokerFieldMismatch {
                ticket,
                field: "closedAt".to_string(),
                ledger_value: ledger_ms.to_string(),
                broker_value: closed_at.to_string(),
            });
        }
    }

    failures.len() == before
}

fn check_digest(
    digest_event: &LedgerEvent,
    closes: &[&LedgerEvent],
    failures: &mut Vec<VerificationFailure>,
) {
    let Some(declared_digest) = digest_event.payload_str("digest") else {
        failures.push(VerificationFailure::MalformedBundle {
            detail: format!("broker digest at seq {} lacks a digest field", digest_event.seq_no),
        });
        return;
    };
    let declared_count = digest_event.payload_i64("tradeCount").unwrap_or(-1);

    // A digest covers every trade closed before it in the chain.
    let covered: Vec<(i64, Money)> = closes
        .iter()
        .filter(|e| e.seq_no < digest_event.seq_no)
        .filter_map(|e| {
            Some((e.payload_i64("ticket")?, to_money(e.payload_f64("profit")?)))
        })
        .collect();

    if declared_count != covered.len() as i64 {
        failures.push(VerificationFailure::BrokerTradeCountMismatch {
            declared: declared_count,
            actual: covered.len() as i64,
        });
    }
    if broker_history_digest(covered) != declared_digest {
        failures.push(VerificationFailure::BrokerDigestMismatch {
            seq_no: digest_event.seq_no,
        });
    }
}

// ===== RESULT ASSEMBLY =====

fn finish(l1: LevelOneReport, l2: LevelTwoReport, l3: LevelThreeReport) -> VerificationResult {
    let verified = l1.passed;
    let level = if !verified {
        None
    } else if l2.attempted && l2.passed {
        if l3.attempted && l3.passed {
            Some(VerificationLevel::L3)
        } else {
            Some(VerificationLevel::L2)
        }
    } else {
        Some(VerificationLevel::L1)
    };

    let summary = if verified {
        let mut parts = vec![format!(
            "ledger integrity verified across {} events and {} checkpoints",
            l1.events_checked, l1.checkpoints_checked
        )];
        if l2.attempted {
            if l2.passed {
                parts.push(format!(
                    "broker corroboration passed ({} evidence events)",
                    l2.evidence_events
                ));
            } else {
                parts.push(format!(
                    "broker corroboration failed ({} issues)",
                    l2.failures.len()
                ));
            }
        } else {
            parts.push("no broker evidence present".to_string());
        }
        if l3.attempted {
            parts.push(if l3.passed {
                "notarization confirmed".to_string()
            } else {
                "notarization not confirmed".to_string()
            });
        }
        parts.join("; ")
    } else {
        format!("ledger integrity failed with {} issue(s)", l1.failures.len())
    };

    counter!(
        "bundle_verifications_total",
        1,
        "outcome" => if verified { "verified" } else { "failed" }
    );

    let result = VerificationResult { verified, level, summary, l1, l2, l3 };
    for failure in result.failures() {
        warn!(code = failure.code(), "verification failure: {}", failure.description());
    }
    result
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::bundle::BundleGenerator;
    use crate::ledger::chain::EventLedger;
    use crate::ledger::checkpoint::{CheckpointSigner, SecretPair};
    use crate::ledger::notary::{NotaryProvider, NotaryReceipt};
    use crate::ledger::rate_limit::{MemoryAdmissionStore, RateLimiter};
    use crate::ledger::store::LedgerStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    const SECRET: &str = "verify-test-secret";

    fn make_engine() -> EventLedger {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let limiter = RateLimiter::new(Arc::new(MemoryAdmissionStore::new()), 100_000);
        let signer = Arc::new(CheckpointSigner::new(
            SecretPair::new(SECRET, None).unwrap(),
        ));
        EventLedger::new(store, limiter, signer)
    }

    fn make_verifier() -> BundleVerifier {
        BundleVerifier::new(SecretPair::new(SECRET, None).unwrap())
    }

    fn append_trade_pair(engine: &EventLedger, ticket: i64, profit: f64) {
        engine
            .append(
                "inst-1",
                "TRADE_OPEN",
                json!({"ticket": ticket, "symbol": "EURUSD", "direction": "BUY",
                       "lots": 0.1, "openPrice": 1.0800}),
                Utc::now(),
            )
            .unwrap();
        engine
            .append(
                "inst-1",
                "TRADE_CLOSE",
                json!({"ticket": ticket, "symbol": "EURUSD", "direction": "BUY",
                       "lots": 0.1, "openPrice": 1.0800, "closePrice": 1.0900,
                       "profit": profit, "swap": 0.0, "commission": 0.0}),
                Utc::now(),
            )
            .unwrap();
    }

    fn make_bundle(engine: &EventLedger) -> ProofBundle {
        BundleGenerator::new(engine.store().clone())
            .generate("inst-1", None, None)
            .unwrap()
    }

    #[test]
    fn test_clean_bundle_verifies_at_l1() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let result = make_verifier().verify(&make_bundle(&engine));
        assert!(result.verified, "failures: {:?}", result.l1.failures);
        assert_eq!(result.level, Some(VerificationLevel::L1));
        assert!(result.l1.anchored);
        assert!(!result.l2.attempted);
        assert!(!result.l3.attempted);
    }

    #[test]
    fn test_tampered_payload_located_at_its_seq_no() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let mut bundle = make_bundle(&engine);
        bundle.events[1].payload["profit"] = json!(51.0);

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        assert_eq!(result.level, None);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::EventHashMismatch { seq_no: 2, .. }
        )));
    }

    #[test]
    fn test_tamper_with_recomputed_hash_breaks_the_link() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append("inst-1", "SNAPSHOT", json!({"balance": 1050.0, "equity": 1050.0}), Utc::now())
            .unwrap();

        let mut bundle = make_bundle(&engine);
        // A smarter tamper: fix up the event's own hash after editing it.
        bundle.events[1].payload["profit"] = json!(500.0);
        bundle.events[1].hash = recompute_event_hash(&bundle.events[1]);

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        // The next link no longer matches, and the checkpoint at seq 2 no
        // longer agrees with the refolded state.
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::ChainLinkBroken { seq_no: 3, .. }
        )));
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::CheckpointStateDivergence { seq_no: 2, .. }
        )));
    }

    #[test]
    fn test_report_renders_when_tampered_fields_are_not_hex() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        // A tampered prevHash is arbitrary unicode, not hex.
        let mut bundle = make_bundle(&engine);
        bundle.events[1].prev_hash = "🎯".repeat(12);

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::ChainLinkBroken { seq_no: 2, .. }
        )));

        let report = result.format_report();
        assert!(report.contains("CHAIN_LINK_BROKEN"));
        assert!(report.contains("..."));
    }

    #[test]
    fn test_forged_checkpoint_state_fails_hmac() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let mut bundle = make_bundle(&engine);
        bundle.checkpoints[0].state.balance += 100_000;

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::CheckpointStateDivergence { seq_no: 2, .. }
        )));
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::CheckpointHmacInvalid { seq_no: 2 }
        )));
    }

    #[test]
    fn test_missing_event_reported_as_gap() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append("inst-1", "SNAPSHOT", json!({"balance": 1050.0, "equity": 1050.0}), Utc::now())
            .unwrap();

        let mut bundle = make_bundle(&engine);
        bundle.events.remove(1);
        bundle.report.manifest.event_count = 2;

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::SequenceGap { expected_seq_no: 2, found_seq_no: 3 }
        )));
    }

    #[test]
    fn test_partial_bundle_verifies_without_genesis() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        for _ in 0..3 {
            engine
                .append("inst-1", "SNAPSHOT", json!({"balance": 1050.0, "equity": 1050.0}), Utc::now())
                .unwrap();
        }

        let bundle = BundleGenerator::new(engine.store().clone())
            .generate("inst-1", Some(3), Some(5))
            .unwrap();
        let result = make_verifier().verify(&bundle);
        assert!(result.verified, "failures: {:?}", result.l1.failures);
        assert!(!result.l1.anchored);
    }

    #[test]
    fn test_tampered_opening_state_rejected() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        for _ in 0..3 {
            engine
                .append("inst-1", "SNAPSHOT", json!({"balance": 1050.0, "equity": 1050.0}), Utc::now())
                .unwrap();
        }

        let mut bundle = BundleGenerator::new(engine.store().clone())
            .generate("inst-1", Some(3), Some(5))
            .unwrap();
        bundle.report.body.opening_state.last_event_hash = "e".repeat(64);

        let result = make_verifier().verify(&bundle);
        assert!(!result.verified);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::OpeningStateMismatch { .. }
        )));
    }

    #[test]
    fn test_wrong_secret_fails_every_checkpoint() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let verifier = BundleVerifier::new(SecretPair::new("some-other-secret", None).unwrap());
        let result = verifier.verify(&make_bundle(&engine));
        assert!(!result.verified);
        assert!(result.l1.failures.iter().all(|f| matches!(
            f,
            VerificationFailure::CheckpointHmacInvalid { .. }
        )));
    }

    #[test]
    fn test_rotated_verifier_accepts_previous_secret() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let verifier = BundleVerifier::new(
            SecretPair::new("rotated-in", Some(SECRET.to_string())).unwrap(),
        );
        let result = verifier.verify(&make_bundle(&engine));
        assert!(result.verified, "failures: {:?}", result.l1.failures);
    }

    #[test]
    fn test_broker_evidence_lifts_level_to_l2() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        let close_at = engine.store().events_in_range("inst-1", 2, 2).unwrap()[0]
            .timestamp
            .timestamp_millis();
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 1, "source": "mt5-history",
                       "closePrice": 1.0900, "profit": 50.0, "closedAt": close_at}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        assert!(result.verified, "failures: {:?}", result.l1.failures);
        assert_eq!(result.level, Some(VerificationLevel::L2));
        assert!(result.l2.attempted && result.l2.passed);
        assert_eq!(result.l2.matched_trades, 1);
    }

    #[test]
    fn test_broker_mismatch_caps_level_at_l1() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 1, "source": "mt5-history", "profit": 49.50}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        // The chain itself is intact; only the corroboration disagrees.
        assert!(result.verified);
        assert_eq!(result.level, Some(VerificationLevel::L1));
        assert!(result.l2.attempted && !result.l2.passed);
        assert!(result.l2.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::BrokerFieldMismatch { ticket: 1, .. }
        )));
    }

    #[test]
    fn test_evidence_for_open_trade_matches_the_open() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append(
                "inst-1",
                "TRADE_OPEN",
                json!({"ticket": 2, "symbol": "GBPUSD", "direction": "SELL",
                       "lots": 0.2, "openPrice": 1.2710}),
                Utc::now(),
            )
            .unwrap();
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 2, "source": "mt5-history", "openPrice": 1.2710}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        // Ticket 2 has no close yet; the evidence corroborates its open.
        assert!(
            result.l2.attempted && result.l2.passed,
            "failures: {:?}",
            result.l2.failures
        );
        assert_eq!(result.l2.matched_trades, 1);
        assert_eq!(result.level, Some(VerificationLevel::L2));
    }

    #[test]
    fn test_unknown_ticket_reported() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 999, "source": "mt5-history"}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        assert!(result.l2.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::BrokerTicketUnmatched { ticket: 999 }
        )));
    }

    #[test]
    fn test_history_digest_confirms_and_rejects() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        append_trade_pair(&engine, 2, -20.0);

        let digest = broker_history_digest(vec![(1, 5_000), (2, -2_000)]);
        engine
            .append(
                "inst-1",
                "BROKER_HISTORY_DIGEST",
                json!({"digest": digest, "tradeCount": 2, "source": "mt5-history"}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        assert!(result.verified);
        assert_eq!(result.level, Some(VerificationLevel::L2));

        // Doctor the digest in the tail event and fix up its hash. The
        // chain stays internally consistent, which is exactly the attack
        // corroboration exists to catch.
        let mut doctored = make_bundle(&engine);
        doctored.events[4].payload["digest"] = json!("0".repeat(64));
        doctored.events[4].hash = recompute_event_hash(&doctored.events[4]);
        let result = make_verifier().verify(&doctored);
        assert!(result.l2.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::BrokerDigestMismatch { .. }
        )));
    }

    #[test]
    fn test_digest_trade_count_mismatch() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let digest = broker_history_digest(vec![(1, 5_000)]);
        engine
            .append(
                "inst-1",
                "BROKER_HISTORY_DIGEST",
                json!({"digest": digest, "tradeCount": 3, "source": "mt5-history"}),
                Utc::now(),
            )
            .unwrap();

        let result = make_verifier().verify(&make_bundle(&engine));
        assert!(result.l2.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::BrokerTradeCountMismatch { declared: 3, actual: 1 }
        )));
    }

    #[test]
    fn test_verifier_cap_rejects_oversized_bundle() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let verifier = BundleVerifier::with_cap(SecretPair::new(SECRET, None).unwrap(), 1);
        let result = verifier.verify(&make_bundle(&engine));
        assert!(!result.verified);
        assert!(result.l1.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::BundleTooLarge { event_count: 2, cap: 1 }
        )));
    }

    // ===== NOTARIZATION =====

    struct StubNotary {
        accept: bool,
    }

    #[async_trait]
    impl NotaryProvider for StubNotary {
        fn name(&self) -> &str {
            "stub"
        }

        async fn notarize(&self, hash: &str) -> anyhow::Result<NotaryReceipt> {
            Ok(NotaryReceipt {
                provider: "stub".to_string(),
                hash: hash.to_string(),
                proof: "c3R1Yg==".to_string(),
                notarized_at: Utc::now(),
            })
        }

        async fn verify(&self, _receipt: &NotaryReceipt) -> anyhow::Result<bool> {
            Ok(self.accept)
        }
    }

    async fn notarized_bundle(engine: &EventLedger, registry: &NotaryRegistry) -> ProofBundle {
        let checkpoint = engine.store().latest_checkpoint("inst-1").unwrap().unwrap();
        let provider = registry.get("stub").unwrap();
        let receipt = provider.notarize(&checkpoint.hmac).await.unwrap();
        engine
            .store()
            .store_receipt("inst-1", checkpoint.seq_no, &receipt)
            .unwrap();
        make_bundle(engine)
    }

    #[tokio::test]
    async fn test_notarization_with_broker_evidence_reaches_l3() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 1, "source": "mt5-history", "profit": 50.0}),
                Utc::now(),
            )
            .unwrap();

        let registry = NotaryRegistry::new();
        registry.register(Arc::new(StubNotary { accept: true }));
        let bundle = notarized_bundle(&engine, &registry).await;

        let result = make_verifier().verify_with_notary(&bundle, &registry).await;
        assert!(result.verified, "failures: {:?}", result.l1.failures);
        assert_eq!(result.level, Some(VerificationLevel::L3));
        assert!(result.l3.attempted && result.l3.passed);
    }

    #[tokio::test]
    async fn test_level_caps_at_l1_without_broker_evidence() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let registry = NotaryRegistry::new();
        registry.register(Arc::new(StubNotary { accept: true }));
        let bundle = notarized_bundle(&engine, &registry).await;

        let result = make_verifier().verify_with_notary(&bundle, &registry).await;
        assert!(result.verified);
        assert!(result.l3.passed);
        assert_eq!(result.level, Some(VerificationLevel::L1));
    }

    #[tokio::test]
    async fn test_rejected_receipt_caps_level() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);
        engine
            .append(
                "inst-1",
                "BROKER_EVIDENCE",
                json!({"ticket": 1, "source": "mt5-history", "profit": 50.0}),
                Utc::now(),
            )
            .unwrap();

        let registry = NotaryRegistry::new();
        registry.register(Arc::new(StubNotary { accept: false }));
        let bundle = notarized_bundle(&engine, &registry).await;

        let result = make_verifier().verify_with_notary(&bundle, &registry).await;
        assert!(result.verified);
        assert_eq!(result.level, Some(VerificationLevel::L2));
        assert!(result.l3.attempted && !result.l3.passed);
        assert!(result.l3.failures.iter().any(|f| matches!(
            f,
            VerificationFailure::NotaryReceiptRejected { .. }
        )));
    }

    #[tokio::test]
    async fn test_unregistered_provider_means_not_attempted() {
        let engine = make_engine();
        append_trade_pair(&engine, 1, 50.0);

        let signing_registry = NotaryRegistry::new();
        signing_registry.register(Arc::new(StubNotary { accept: true }));
        let bundle = notarized_bundle(&engine, &signing_registry).await;

        let empty_registry = NotaryRegistry::new();
        let result = make_verifier()
            .verify_with_notary(&bundle, &empty_registry)
            .await;
        assert!(result.verified);
        assert!(!result.l3.attempted);
        assert!(result.l3.note.is_some());
    }
}
