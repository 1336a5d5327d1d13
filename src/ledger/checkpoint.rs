//! Signed state checkpoints.
//!
//! A checkpoint binds a running state to its position in the chain with an
//! HMAC-SHA256 over the canonical state string, keyed per instance:
//!
//! ```text
//! derivedKey = HMAC-SHA256(globalSecret, instanceId)
//! hmac       = HMAC-SHA256(derivedKey, canonicalStateString)
//! ```
//!
//! Per-instance derivation means a leaked signature for one instance gives
//! an attacker nothing against any other instance.
//!
//! Rotation keeps one previous secret alive: verification tries the current
//! secret first, then the previous one, so checkpoints written before a
//! rotation stay verifiable until the old secret is retired.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use crate::ledger::canonical::canonical_state_string;
use crate::ledger::events::EventType;
use crate::ledger::state::RunningState;

type HmacSha256 = Hmac<Sha256>;

/// A checkpoint is written on every trade close and every Nth event.
pub const CHECKPOINT_INTERVAL: u64 = 100;

/// Environment variable holding the active signing secret.
pub const SECRET_ENV: &str = "LEDGER_SIGNING_SECRET";

/// Environment variable holding the previous secret during rotation.
pub const PREVIOUS_SECRET_ENV: &str = "LEDGER_SIGNING_SECRET_PREVIOUS";

/// Signed snapshot of the running state at one chain position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub instance_id: String,
    pub seq_no: u64,
    pub state: RunningState,
    /// Hex HMAC-SHA256 over the canonical state string.
    pub hmac: String,
    pub created_at: DateTime<Utc>,
}

/// True when an event at `seq_no` must carry a checkpoint.
pub fn checkpoint_due(event_type: EventType, seq_no: u64) -> bool {
    event_type == EventType::TradeClose || seq_no % CHECKPOINT_INTERVAL == 0
}

/// Which secret a signature verified against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedSecret {
    Current,
    Previous,
}

/// Active signing secret plus at most one not-yet-retired predecessor.
#[derive(Clone)]
pub struct SecretPair {
    current: String,
    previous: Option<String>,
}

impl SecretPair {
    pub fn new(current: impl Into<String>, previous: Option<String>) -> anyhow::Result<Self> {
        let current = current.into();
        if current.is_empty() {
            anyhow::bail!("signing secret must not be empty");
        }
        let previous = previous.filter(|p| !p.is_empty());
        Ok(Self { current, previous })
    }

    /// Load from the environment. A missing current secret is fatal: the
    /// service must never run with a default or hardcoded key.
    pub fn from_env() -> anyhow::Result<Self> {
        let current = std::env::var(SECRET_ENV)
            .map_err(|_| anyhow::anyhow!("{} must be set (no default is ever used)", SECRET_ENV))?;
        let previous = std::env::var(PREVIOUS_SECRET_ENV).ok();
        Self::new(current, previous)
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }
}

/// HMAC key for one instance, derived from a global secret.
fn derive_instance_key(secret: &str, instance_id: &str) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to derive instance key: {}", e))?;
    mac.update(instance_id.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex HMAC over the canonical state string, keyed for `instance_id`.
pub fn state_hmac(secret: &str, instance_id: &str, state: &RunningState) -> anyhow::Result<String> {
    let key = derive_instance_key(secret, instance_id)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("failed to key state hmac: {}", e))?;
    mac.update(canonical_state_string(state).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify `hmac` against the current secret, then the previous one.
///
/// Comparison goes through `Mac::verify_slice`, which is constant-time, so
/// signature checking leaks nothing about how close a forgery got.
pub fn verify_state_hmac(
    secrets: &SecretPair,
    instance_id: &str,
    state: &RunningState,
    hmac_hex: &str,
) -> Option<MatchedSecret> {
    let Ok(signature) = hex::decode(hmac_hex) else {
        return None;
    };

    let canonical = canonical_state_string(state);
    let verify_with = |secret: &str| -> bool {
        let Ok(key) = derive_instance_key(secret, instance_id) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
            return false;
        };
        mac.update(canonical.as_bytes());
        mac.verify_slice(&signature).is_ok()
    };

    if verify_with(&secrets.current) {
        return Some(MatchedSecret::Current);
    }
    if let Some(previous) = &secrets.previous {
        if verify_with(previous) {
            return Some(MatchedSecret::Previous);
        }
    }
    None
}

/// Shared signer handle. Rotation swaps the secret pair atomically, so
/// in-flight appends finish under whichever pair they started with.
pub struct CheckpointSigner {
    secrets: ArcSwap<SecretPair>,
}

impl CheckpointSigner {
    pub fn new(secrets: SecretPair) -> Self {
        Self { secrets: ArcSwap::from_pointee(secrets) }
    }

    pub fn rotate(&self, secrets: SecretPair) {
        self.secrets.store(Arc::new(secrets));
    }

    pub fn secrets(&self) -> Arc<SecretPair> {
        self.secrets.load_full()
    }

    /// Build a signed checkpoint for the state after `seq_no` was applied.
    pub fn sign(&self, instance_id: &str, state: &RunningState) -> anyhow::Result<Checkpoint> {
        let secrets = self.secrets.load();
        let hmac = state_hmac(&secrets.current, instance_id, state)?;
        Ok(Checkpoint {
            instance_id: instance_id.to_string(),
            seq_no: state.last_seq_no,
            state: state.clone(),
            hmac,
            created_at: Utc::now(),
        })
    }

    pub fn verify(
        &self,
        instance_id: &str,
        state: &RunningState,
        hmac_hex: &str,
    ) -> Option<MatchedSecret> {
        verify_state_hmac(&self.secrets.load(), instance_id, state, hmac_hex)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state(seq_no: u64) -> RunningState {
        let mut state = RunningState::default();
        state.last_seq_no = seq_no;
        state.last_event_hash = "a".repeat(64);
        state
    }

    fn pair(current: &str, previous: Option<&str>) -> SecretPair {
        SecretPair::new(current, previous.map(String::from)).unwrap()
    }

    #[test]
    fn test_sign_then_verify_roundtrip() {
        let signer = CheckpointSigner::new(pair("secret-a", None));
        let state = make_state(7);

        let checkpoint = signer.sign("inst-1", &state).unwrap();
        assert_eq!(checkpoint.seq_no, 7);
        assert_eq!(checkpoint.hmac.len(), 64);
        assert_eq!(
            signer.verify("inst-1", &state, &checkpoint.hmac),
            Some(MatchedSecret::Current)
        );
    }

    #[test]
    fn test_signature_is_instance_scoped() {
        let signer = CheckpointSigner::new(pair("secret-a", None));
        let state = make_state(7);

        let checkpoint = signer.sign("inst-1", &state).unwrap();
        assert_eq!(signer.verify("inst-2", &state, &checkpoint.hmac), None);
    }

    #[test]
    fn test_tampered_state_fails_verification() {
        let signer = CheckpointSigner::new(pair("secret-a", None));
        let state = make_state(7);
        let checkpoint = signer.sign("inst-1", &state).unwrap();

        let mut forged = state.clone();
        forged.balance += 1;
        assert_eq!(signer.verify("inst-1", &forged, &checkpoint.hmac), None);
    }

    #[test]
    fn test_rotation_accepts_previous_secret() {
        let signer = CheckpointSigner::new(pair("old-secret", None));
        let state = make_state(3);
        let old_checkpoint = signer.sign("inst-1", &state).unwrap();

        signer.rotate(pair("new-secret", Some("old-secret")));
        assert_eq!(
            signer.verify("inst-1", &state, &old_checkpoint.hmac),
            Some(MatchedSecret::Previous)
        );

        let new_checkpoint = signer.sign("inst-1", &state).unwrap();
        assert_ne!(new_checkpoint.hmac, old_checkpoint.hmac);
        assert_eq!(
            signer.verify("inst-1", &state, &new_checkpoint.hmac),
            Some(MatchedSecret::Current)
        );
    }

    #[test]
    fn test_retiring_old_secret_rejects_old_signatures() {
        let signer = CheckpointSigner::new(pair("old-secret", None));
        let state = make_state(3);
        let old_checkpoint = signer.sign("inst-1", &state).unwrap();

        signer.rotate(pair("new-secret", None));
        assert_eq!(signer.verify("inst-1", &state, &old_checkpoint.hmac), None);
    }

    #[test]
    fn test_malformed_hex_rejected_without_panic() {
        let signer = CheckpointSigner::new(pair("secret-a", None));
        let state = make_state(1);
        assert_eq!(signer.verify("inst-1", &state, "not hex at all"), None);
        assert_eq!(signer.verify("inst-1", &state, ""), None);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(SecretPair::new("", None).is_err());
        let p = SecretPair::new("ok", Some(String::new())).unwrap();
        assert!(!p.has_previous());
    }

    #[test]
    fn test_checkpoint_due_rules() {
        assert!(checkpoint_due(EventType::TradeClose, 3));
        assert!(checkpoint_due(EventType::Snapshot, 100));
        assert!(checkpoint_due(EventType::TradeClose, 200));
        assert!(!checkpoint_due(EventType::Snapshot, 99));
        assert!(!checkpoint_due(EventType::TradeOpen, 101));
    }
}
