//! In-memory first-line duplicate filter for webhook deliveries.
//!
//! Providers retry on timeout, so the same event ID can arrive several
//! times within seconds. This guard absorbs those redeliveries without
//! touching the database. It is volatile by design: the durable store in
//! [`crate::dedup`] stays authoritative across restarts, this tier is a
//! best-effort pre-filter only.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{SystemTime, UNIX_EPOCH};

/// How long a seen event ID is remembered. Shorter than the durable
/// store's retention on purpose; anything older falls through to it.
const RETENTION_SECS: i64 = 24 * 60 * 60;

pub struct ReplayGuard {
    seen: DashMap<String, i64>,
    retention_secs: i64,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::with_retention(RETENTION_SECS)
    }

    pub fn with_retention(retention_secs: i64) -> Self {
        Self {
            seen: DashMap::new(),
            retention_secs,
        }
    }

    /// Returns whether `event_id` was already recorded; records it if not.
    ///
    /// Test-and-set is atomic: two concurrent deliveries of the same ID
    /// cannot both observe "not seen". Blank IDs always pass through as
    /// unseen so that missing correlation data never blocks processing.
    pub fn check_and_record(&self, event_id: &str) -> bool {
        self.check_and_record_at(event_id, now_epoch())
    }

    fn check_and_record_at(&self, event_id: &str, now: i64) -> bool {
        if event_id.trim().is_empty() {
            return false;
        }
        self.sweep(now);
        // The entry holds the shard lock, making test-and-set atomic.
        match self.seen.entry(event_id.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                false
            }
        }
    }

    /// Evicts entries older than the retention window. Cost is linear in
    /// table size, which is acceptable at webhook volumes.
    fn sweep(&self, now: i64) {
        self.seen
            .retain(|_, first_seen| now - *first_seen <= self.retention_secs);
    }

    /// Forgets an event ID so a later delivery is treated as unseen.
    /// Used when the durable record for the event could not be written
    /// and the provider must be allowed back in on retry.
    pub fn remove(&self, event_id: &str) {
        self.seen.remove(event_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_is_not_a_replay_second_is() {
        let guard = ReplayGuard::new();
        assert!(!guard.check_and_record("evt_1"));
        assert!(guard.check_and_record("evt_1"));
    }

    #[test]
    fn distinct_ids_do_not_interfere() {
        let guard = ReplayGuard::new();
        assert!(!guard.check_and_record("evt_1"));
        assert!(!guard.check_and_record("evt_2"));
        assert!(guard.check_and_record("evt_1"));
        assert!(guard.check_and_record("evt_2"));
    }

    #[test]
    fn blank_ids_always_pass_and_are_never_recorded() {
        let guard = ReplayGuard::new();
        assert!(!guard.check_and_record(""));
        assert!(!guard.check_and_record(""));
        assert!(!guard.check_and_record("   "));
        assert!(guard.is_empty());
    }

    #[test]
    fn removed_id_is_unseen_again() {
        let guard = ReplayGuard::new();
        assert!(!guard.check_and_record("evt_1"));
        guard.remove("evt_1");
        assert!(!guard.check_and_record("evt_1"));
        assert!(guard.check_and_record("evt_1"));
    }

    #[test]
    fn expired_entries_are_treated_as_unseen_again() {
        let guard = ReplayGuard::with_retention(60);
        assert!(!guard.check_and_record_at("evt_1", 1_000));
        assert!(guard.check_and_record_at("evt_1", 1_030));
        // Past the retention window the entry is swept and re-recorded.
        assert!(!guard.check_and_record_at("evt_1", 1_100));
        assert!(guard.check_and_record_at("evt_1", 1_110));
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let guard = ReplayGuard::with_retention(60);
        assert!(!guard.check_and_record_at("old", 1_000));
        assert!(!guard.check_and_record_at("recent", 1_050));
        assert!(!guard.check_and_record_at("new", 1_070));
        assert_eq!(guard.len(), 2);
        assert!(guard.check_and_record_at("recent", 1_075));
    }
}
