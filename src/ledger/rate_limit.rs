//! Sliding-window ingestion admission control, one window per instance.
//!
//! The window state lives behind [`AdmissionStore`] so single-process
//! deployments use the in-memory map here while multi-process deployments
//! can plug a shared cache in without touching the algorithm.
//!
//! # Invariants
//!
//! - Check-and-record is one atomic operation per key: two racing calls can
//!   never both see the same under-limit count and both get admitted past
//!   the cap.
//! - At most `limit` admissions exist inside any trailing window.
//! - Keys idle for two full window lengths are dropped by `purge`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

/// Default admissions per instance per minute.
pub const DEFAULT_LIMIT_PER_MINUTE: usize = 100;

/// Sliding window length in milliseconds.
pub const WINDOW_MS: i64 = 60_000;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    RateLimited {
        /// Seconds until the oldest in-window admission expires.
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Key-value backing for the sliding windows.
pub trait AdmissionStore: Send + Sync {
    /// Atomic check-and-record: admit iff fewer than `limit` admissions are
    /// recorded inside `(now_ms - window_ms, now_ms]`, recording `now_ms` on
    /// admission.
    fn check_and_record(&self, key: &str, now_ms: i64, window_ms: i64, limit: usize) -> Admission;

    /// Drop keys with no admission since `now_ms - 2 * window_ms`.
    fn purge_stale(&self, now_ms: i64, window_ms: i64) -> usize;

    /// Number of keys currently tracked.
    fn tracked_keys(&self) -> usize;
}

/// Process-local store: per-key timestamp deques behind one mutex.
#[derive(Default)]
pub struct MemoryAdmissionStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdmissionStore for MemoryAdmissionStore {
    fn check_and_record(&self, key: &str, now_ms: i64, window_ms: i64, limit: usize) -> Admission {
        // One lock span covers expire + count + record, which is what makes
        // the operation atomic under concurrent admission attempts.
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_default();

        let cutoff = now_ms - window_ms;
        while window.front().is_some_and(|&ts| ts <= cutoff) {
            window.pop_front();
        }

        if window.len() >= limit {
            let oldest = window.front().copied().unwrap_or(now_ms);
            let retry_ms = (oldest + window_ms - now_ms).max(0);
            return Admission::RateLimited {
                retry_after_secs: (retry_ms as u64).div_ceil(1000),
            };
        }

        window.push_back(now_ms);
        Admission::Admitted
    }

    fn purge_stale(&self, now_ms: i64, window_ms: i64) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        let cutoff = now_ms - 2 * window_ms;
        windows.retain(|_, window| window.back().is_some_and(|&ts| ts > cutoff));
        before - windows.len()
    }

    fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Admission front-end used by the append engine.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn AdmissionStore>,
    limit_per_minute: usize,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AdmissionStore>, limit_per_minute: usize) -> Self {
        Self { store, limit_per_minute }
    }

    pub fn with_default_limit(store: Arc<dyn AdmissionStore>) -> Self {
        Self::new(store, DEFAULT_LIMIT_PER_MINUTE)
    }

    pub fn limit_per_minute(&self) -> usize {
        self.limit_per_minute
    }

    pub fn try_admit(&self, instance_id: &str) -> Admission {
        self.try_admit_at(instance_id, Utc::now().timestamp_millis())
    }

    pub fn try_admit_at(&self, instance_id: &str, now_ms: i64) -> Admission {
        self.store
            .check_and_record(instance_id, now_ms, WINDOW_MS, self.limit_per_minute)
    }

    /// Periodic maintenance; safe to call from a background task.
    pub fn purge(&self) {
        self.purge_at(Utc::now().timestamp_millis());
    }

    pub fn purge_at(&self, now_ms: i64) {
        let dropped = self.store.purge_stale(now_ms, WINDOW_MS);
        if dropped > 0 {
            debug!(dropped, remaining = self.store.tracked_keys(), "purged idle rate windows");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_limiter(limit: usize) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryAdmissionStore::new()), limit)
    }

    #[test]
    fn test_exactly_limit_admissions_per_window() {
        let limiter = make_limiter(5);
        let t0 = 1_700_000_000_000;

        for i in 0..5 {
            assert!(limiter.try_admit_at("inst-1", t0 + i).is_admitted(), "admission {}", i);
        }
        assert_eq!(
            limiter.try_admit_at("inst-1", t0 + 5),
            Admission::RateLimited { retry_after_secs: 60 }
        );
    }

    #[test]
    fn test_window_slides() {
        let limiter = make_limiter(2);
        let t0 = 1_700_000_000_000;

        assert!(limiter.try_admit_at("inst-1", t0).is_admitted());
        assert!(limiter.try_admit_at("inst-1", t0 + 1_000).is_admitted());
        assert!(!limiter.try_admit_at("inst-1", t0 + 2_000).is_admitted());

        // First admission leaves the window after 60s; one slot frees up.
        assert!(limiter.try_admit_at("inst-1", t0 + WINDOW_MS + 1).is_admitted());
        assert!(!limiter.try_admit_at("inst-1", t0 + WINDOW_MS + 2).is_admitted());
    }

    #[test]
    fn test_instances_do_not_share_windows() {
        let limiter = make_limiter(1);
        let t0 = 1_700_000_000_000;

        assert!(limiter.try_admit_at("inst-1", t0).is_admitted());
        assert!(limiter.try_admit_at("inst-2", t0).is_admitted());
        assert!(!limiter.try_admit_at("inst-1", t0 + 1).is_admitted());
    }

    #[test]
    fn test_retry_after_reflects_oldest_entry() {
        let limiter = make_limiter(1);
        let t0 = 1_700_000_000_000;

        assert!(limiter.try_admit_at("inst-1", t0).is_admitted());
        // 30s into the window the oldest entry has 30s left.
        assert_eq!(
            limiter.try_admit_at("inst-1", t0 + 30_000),
            Admission::RateLimited { retry_after_secs: 30 }
        );
    }

    #[test]
    fn test_purge_drops_idle_keys_only() {
        let store = Arc::new(MemoryAdmissionStore::new());
        let limiter = RateLimiter::new(store.clone(), 10);
        let t0 = 1_700_000_000_000;

        limiter.try_admit_at("idle", t0);
        limiter.try_admit_at("active", t0 + 2 * WINDOW_MS - 1_000);
        limiter.purge_at(t0 + 2 * WINDOW_MS + 1);

        assert_eq!(store.tracked_keys(), 1);
        // The active key keeps its history.
        assert!(limiter.try_admit_at("active", t0 + 2 * WINDOW_MS + 2).is_admitted());
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = make_limiter(50);
        let t0 = 1_700_000_000_000;

        let mut handles = Vec::new();
        for i in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0usize;
                for j in 0..25 {
                    if limiter.try_admit_at("inst-1", t0 + (i * 25 + j)).is_admitted() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
    }
}
