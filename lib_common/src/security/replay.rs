//! # Replay Guard
//!
//! Remembers every signature accepted within the last `retention_secs`
//! seconds and refuses to accept the same signature twice inside that window.
//!
//! Entries are kept in arrival order in a `VecDeque`. Each call first pops
//! expired entries off the front, then scans what is left. The working set is
//! bounded by `retention × request rate`, which keeps the linear scan cheap at
//! the rates a telemetry relay sees.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;

use crate::utils::clock::{Clock, SystemClock};

/// One accepted signature and the timestamp it was signed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    /// The signed Unix timestamp, in seconds.
    pub timestamp: i64,
    /// The raw (decoded) signature bytes.
    pub signature: Vec<u8>,
}

/// Time-windowed set of recently accepted signatures.
#[derive(Debug)]
pub struct ReplayGuard {
    retention_secs: i64,
    entries: Mutex<VecDeque<ReplayRecord>>,
    clock: Arc<dyn Clock>,
}

impl ReplayGuard {
    /// Creates a guard that remembers signatures for `retention_secs` seconds.
    pub fn new(retention_secs: i64) -> Self {
        Self::with_clock(retention_secs, Arc::new(SystemClock))
    }

    /// Creates a guard reading time from `clock`.
    pub fn with_clock(retention_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention_secs,
            entries: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Admits `signature` if it is not already live in the window.
    ///
    /// Returns `true` when the signature was recorded, `false` when an equal
    /// signature is still retained. Eviction, lookup and insertion happen
    /// under one lock acquisition, so two concurrent callers presenting the
    /// same signature can never both be admitted.
    pub fn record(&self, timestamp: i64, signature: &[u8]) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = self.clock.now_secs();

        while entries
            .front()
            .is_some_and(|oldest| self.is_expired(oldest, now))
        {
            entries.pop_front();
        }

        // Arrival order is not strictly timestamp order, so an expired entry
        // can still sit behind a live one. It no longer counts as a match.
        let seen = entries.iter().any(|existing| {
            !self.is_expired(existing, now) && bool::from(existing.signature.as_slice().ct_eq(signature))
        });
        if seen {
            return false;
        }

        entries.push_back(ReplayRecord {
            timestamp,
            signature: signature.to_vec(),
        });
        true
    }

    /// Number of records currently held, expired stragglers included.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the guard holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured retention window in seconds.
    pub fn retention_secs(&self) -> i64 {
        self.retention_secs
    }

    fn is_expired(&self, record: &ReplayRecord, now: i64) -> bool {
        now.saturating_sub(record.timestamp) > self.retention_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    const T0: i64 = 1_700_000_000;

    fn guard(retention: i64) -> (ReplayGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (ReplayGuard::with_clock(retention, clock.clone()), clock)
    }

    #[test]
    fn test_second_record_of_same_signature_is_rejected() {
        let (guard, _clock) = guard(120);
        assert!(guard.record(T0, b"sig-a"));
        assert!(!guard.record(T0, b"sig-a"));
        assert!(guard.record(T0, b"sig-b"));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_signature_is_admitted_again_after_retention() {
        let (guard, clock) = guard(120);
        assert!(guard.record(T0, b"sig-a"));

        clock.advance(120);
        assert!(!guard.record(T0, b"sig-a"), "still inside the window at exactly retention");

        clock.advance(1);
        assert!(guard.record(T0, b"sig-a"));
        assert_eq!(guard.len(), 1, "expired entry was evicted before re-insert");
    }

    #[test]
    fn test_expired_entry_behind_live_one_does_not_match() {
        let (guard, clock) = guard(60);
        // Newer timestamp arrives first, older one second.
        assert!(guard.record(T0 + 30, b"young"));
        assert!(guard.record(T0, b"old"));

        clock.advance(61);
        // "young" is still live and blocks front eviction of "old".
        assert!(guard.record(T0, b"old"));
        assert!(!guard.record(T0 + 30, b"young"));
    }

    #[test]
    fn test_eviction_drains_front() {
        let (guard, clock) = guard(10);
        for i in 0..5u8 {
            assert!(guard.record(T0, &[i]));
        }
        assert_eq!(guard.len(), 5);

        clock.advance(11);
        assert!(guard.record(T0 + 11, b"fresh"));
        assert_eq!(guard.len(), 1);
    }
}
