//! Outage tracking: turns the stream of check results into outage events.
//!
//! Per-host state machine with two states, Up (no open event) and Down
//! (exactly one open event). The tracker owns all event creation and
//! closure; everything else only reads.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::db::{CheckResult, Store, StoreError};

/// What a recorded check did to the host's outage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Host stayed Up or stayed Down.
    None,
    /// Host went Down: a new outage event was opened.
    Opened(i64),
    /// Host stayed Down: the open event's counters were bumped.
    Extended(i64),
    /// Host came back Up: the open event was closed as recovered.
    Recovered(i64),
}

pub struct OutageTracker {
    store: Arc<Store>,
    // One lock per host so the read-modify-write transition below is
    // serialized per host while different hosts proceed in parallel.
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OutageTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            host_locks: Mutex::new(HashMap::new()),
        }
    }

    fn host_lock(&self, host_address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.host_locks.lock().unwrap();
        locks
            .entry(host_address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one check result to the host's state machine.
    ///
    /// A fully failed check opens an outage (or extends the open one); any
    /// partial or full success closes the open outage as recovered. At most
    /// one event per host is ever open.
    pub fn record(&self, result: &CheckResult) -> Result<Transition, StoreError> {
        let lock = self.host_lock(&result.host_address);
        let _guard = lock.lock().unwrap();

        let active = self.store.get_active_outage(&result.host_address)?;

        let transition = match active {
            None if result.is_total_failure() => {
                let notes = format!(
                    "0/{} packets received",
                    result.packets_sent
                );
                let id = self.store.create_outage_event(
                    &result.host_name,
                    &result.host_address,
                    result.timestamp,
                    Some(&notes),
                )?;
                tracing::warn!(
                    host = %result.host_address,
                    event_id = id,
                    "host went down, outage opened"
                );
                Transition::Opened(id)
            }
            Some(open) if result.is_total_failure() => {
                self.store.update_outage_event(
                    open.id,
                    open.checks_failed + 1,
                    open.checks_during_outage + 1,
                )?;
                Transition::Extended(open.id)
            }
            Some(open) => {
                self.store.close_outage_event(
                    open.id,
                    result.timestamp,
                    Some(result.success_rate),
                    "recovered",
                )?;
                tracing::info!(
                    host = %result.host_address,
                    event_id = open.id,
                    success_rate = result.success_rate,
                    "host recovered, outage closed"
                );
                Transition::Recovered(open.id)
            }
            None => Transition::None,
        };

        Ok(transition)
    }

    /// Close open outages for hosts that are no longer configured. Passing
    /// an empty set closes every open outage.
    pub fn close_removed_hosts(
        &self,
        active_host_addresses: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let closed = self
            .store
            .close_outages_for_removed_hosts(active_host_addresses)?;
        if closed > 0 {
            tracing::info!(closed, "closed outages for hosts removed from configuration");
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use tempfile::NamedTempFile;

    fn tracker() -> (NamedTempFile, Arc<Store>, OutageTracker) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let tracker = OutageTracker::new(store.clone());
        (tmp, store, tracker)
    }

    fn down(address: &str, timestamp: DateTime<Utc>) -> CheckResult {
        CheckResult::new("Test Host", address, timestamp, 10, 0, None, None, None)
    }

    fn up(address: &str, timestamp: DateTime<Utc>, received: u32) -> CheckResult {
        CheckResult::new(
            "Test Host",
            address,
            timestamp,
            10,
            received,
            Some(8.0),
            Some(20.0),
            Some(12.0),
        )
    }

    #[test]
    fn test_success_while_up_is_a_no_op() {
        let (_tmp, store, tracker) = tracker();
        let t = tracker.record(&up("10.0.0.1", Utc::now(), 10)).unwrap();
        assert_eq!(t, Transition::None);
        assert!(store.get_outage_events(None, None, None, false, None).unwrap().is_empty());
    }

    #[test]
    fn test_first_failing_check_opens_outage() {
        let (_tmp, store, tracker) = tracker();
        let now = Utc::now();

        // First-ever check for the host fails: still opens an outage.
        let t = tracker.record(&down("10.0.0.1", now)).unwrap();
        let id = match t {
            Transition::Opened(id) => id,
            other => panic!("expected Opened, got {:?}", other),
        };

        let active = store.get_active_outage("10.0.0.1").unwrap().unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.start_time.timestamp(), now.timestamp());
        assert_eq!(active.checks_failed, 1);
        assert_eq!(active.checks_during_outage, 1);
    }

    #[test]
    fn test_repeated_failures_extend_single_event() {
        let (_tmp, store, tracker) = tracker();
        let now = Utc::now();

        tracker.record(&down("10.0.0.1", now)).unwrap();
        for i in 1..5 {
            let t = tracker
                .record(&down("10.0.0.1", now + ChronoDuration::seconds(30 * i)))
                .unwrap();
            assert!(matches!(t, Transition::Extended(_)));
        }

        // The invariant: never more than one open event per host.
        let open = store.get_outage_events(Some("10.0.0.1"), None, None, true, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].checks_failed, 5);
        assert_eq!(open[0].checks_during_outage, 5);
    }

    #[test]
    fn test_recovery_closes_outage() {
        let (_tmp, store, tracker) = tracker();
        let t0 = Utc::now() - ChronoDuration::minutes(5);

        tracker.record(&down("10.0.0.1", t0)).unwrap();
        tracker.record(&down("10.0.0.1", t0 + ChronoDuration::seconds(30))).unwrap();

        let recovery = up("10.0.0.1", t0 + ChronoDuration::seconds(60), 9);
        let t = tracker.record(&recovery).unwrap();
        assert!(matches!(t, Transition::Recovered(_)));

        assert!(store.get_active_outage("10.0.0.1").unwrap().is_none());

        let events = store.get_outage_events(Some("10.0.0.1"), None, None, false, None).unwrap();
        assert_eq!(events.len(), 1);
        let closed = &events[0];
        assert_eq!(closed.checks_failed, 2);
        assert_eq!(closed.checks_during_outage, 2);
        assert_eq!(closed.recovery_success_rate, Some(90.0));
        assert_eq!(closed.notes.as_deref(), Some("recovered"));
        assert_eq!(closed.duration_seconds(), Some(60));
    }

    #[test]
    fn test_partial_recovery_scenario() {
        // Down at T0, still down at T0+30s, recovers at T0+60s with 95%.
        let (_tmp, store, tracker) = tracker();
        let t0 = Utc::now() - ChronoDuration::minutes(2);

        tracker.record(&down("10.0.0.1", t0)).unwrap();
        tracker.record(&down("10.0.0.1", t0 + ChronoDuration::seconds(30))).unwrap();

        let recovery = CheckResult::new(
            "Test Host",
            "10.0.0.1",
            t0 + ChronoDuration::seconds(60),
            20,
            19,
            Some(8.0),
            Some(20.0),
            Some(12.0),
        );
        tracker.record(&recovery).unwrap();

        let events = store.get_outage_events(Some("10.0.0.1"), None, None, false, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].checks_failed, 2);
        assert_eq!(events[0].checks_during_outage, 2);
        assert_eq!(events[0].duration_seconds(), Some(60));
        assert_eq!(events[0].recovery_success_rate, Some(95.0));
    }

    #[test]
    fn test_down_up_round_trip_produces_one_closed_event() {
        let (_tmp, store, tracker) = tracker();
        let t0 = Utc::now() - ChronoDuration::minutes(10);

        tracker.record(&down("10.0.0.1", t0)).unwrap();
        tracker.record(&up("10.0.0.1", t0 + ChronoDuration::seconds(300), 10)).unwrap();

        let events = store.get_outage_events(Some("10.0.0.1"), None, None, false, None).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_active());
        assert_eq!(events[0].duration_seconds(), Some(300));
    }

    #[test]
    fn test_flapping_host_produces_separate_events() {
        let (_tmp, store, tracker) = tracker();
        let t0 = Utc::now() - ChronoDuration::minutes(10);

        tracker.record(&down("10.0.0.1", t0)).unwrap();
        tracker.record(&up("10.0.0.1", t0 + ChronoDuration::seconds(60), 10)).unwrap();
        tracker.record(&down("10.0.0.1", t0 + ChronoDuration::seconds(120))).unwrap();
        tracker.record(&up("10.0.0.1", t0 + ChronoDuration::seconds(180), 10)).unwrap();

        let events = store.get_outage_events(Some("10.0.0.1"), None, None, false, None).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.is_active()));
        assert!(events.iter().all(|e| e.duration_seconds() == Some(60)));
    }

    #[test]
    fn test_independent_hosts_do_not_interfere() {
        let (_tmp, store, tracker) = tracker();
        let now = Utc::now();

        tracker.record(&down("10.0.0.1", now)).unwrap();
        tracker.record(&down("10.0.0.2", now)).unwrap();
        tracker.record(&up("10.0.0.1", now + ChronoDuration::seconds(60), 10)).unwrap();

        assert!(store.get_active_outage("10.0.0.1").unwrap().is_none());
        assert!(store.get_active_outage("10.0.0.2").unwrap().is_some());
    }

    #[test]
    fn test_close_removed_hosts_delegates() {
        let (_tmp, store, tracker) = tracker();
        let now = Utc::now();

        tracker.record(&down("10.0.0.1", now)).unwrap();
        tracker.record(&down("10.0.0.2", now)).unwrap();
        tracker.record(&down("10.0.0.3", now)).unwrap();

        let active: HashSet<String> = ["10.0.0.1".to_string()].into_iter().collect();
        assert_eq!(tracker.close_removed_hosts(&active).unwrap(), 2);
        assert_eq!(tracker.close_removed_hosts(&active).unwrap(), 0);
        assert!(store.get_active_outage("10.0.0.1").unwrap().is_some());
    }
}
