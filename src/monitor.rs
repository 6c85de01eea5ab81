//! One check cycle over the configured host set.
//!
//! Probes run concurrently; each result is appended to the store and fed
//! to the outage tracker, then outages for hosts no longer configured are
//! closed. Cadence is left to whatever invokes the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Config, HostConfig};
use crate::db::{CheckResult, Store, StoreError};
use crate::outage::OutageTracker;
use crate::probe::{run_ping, PingOutcome};

/// Cap on probes in flight within one cycle.
const MAX_CONCURRENT_PROBES: usize = 8;

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub checks_recorded: usize,
    pub hosts_down: usize,
    pub outages_closed_for_removed: usize,
}

pub struct Monitor {
    config: Config,
    store: Arc<Store>,
    tracker: OutageTracker,
}

impl Monitor {
    pub fn new(config: Config, store: Arc<Store>, tracker: OutageTracker) -> Self {
        Self {
            config,
            store,
            tracker,
        }
    }

    /// Probe every configured host once and record the outcomes.
    pub async fn run_cycle(&self) -> Result<CycleSummary, StoreError> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut join_set = JoinSet::new();
        let count = self.config.ping_count;
        let timeout = self.config.timeout();

        for host in self.config.hosts.clone() {
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();

                // Spread probe starts so a large host set does not burst
                // onto the network at the same instant.
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let checked_at = Utc::now();
                let outcome = match run_ping(&host.address, count, timeout).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(
                            host = %host.address,
                            error = %e,
                            "probe could not run, recording total loss"
                        );
                        PingOutcome::lost(count)
                    }
                };
                (host, checked_at, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((host, checked_at, outcome)) => {
                    results.push(result_from_outcome(&host, checked_at, &outcome));
                }
                Err(e) => tracing::error!("probe task failed: {}", e),
            }
        }

        self.ingest(results)
    }

    /// Record a batch of check results and reconcile the outage state with
    /// the configured host set.
    pub fn ingest(&self, results: Vec<CheckResult>) -> Result<CycleSummary, StoreError> {
        let mut summary = CycleSummary::default();

        for result in &results {
            if let Err(e) = self.store.append(result) {
                tracing::error!(host = %result.host_address, error = %e, "failed to store check result");
                continue;
            }
            if let Err(e) = self.tracker.record(result) {
                tracing::error!(host = %result.host_address, error = %e, "failed to update outage state");
                continue;
            }
            summary.checks_recorded += 1;
            if result.is_total_failure() {
                summary.hosts_down += 1;
            }
        }

        let active: HashSet<String> = self
            .config
            .hosts
            .iter()
            .map(|h| h.address.clone())
            .collect();
        summary.outages_closed_for_removed = self.tracker.close_removed_hosts(&active)?;

        Ok(summary)
    }
}

fn result_from_outcome(
    host: &HostConfig,
    checked_at: DateTime<Utc>,
    outcome: &PingOutcome,
) -> CheckResult {
    CheckResult::new(
        &host.name,
        &host.address,
        checked_at,
        outcome.packets_sent,
        outcome.packets_received,
        outcome.min_latency_ms,
        outcome.max_latency_ms,
        outcome.avg_latency_ms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn monitor_with_hosts(hosts: &[(&str, &str)]) -> (NamedTempFile, Arc<Store>, Monitor) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let config = Config {
            hosts: hosts
                .iter()
                .map(|(name, address)| HostConfig {
                    name: name.to_string(),
                    address: address.to_string(),
                })
                .collect(),
            ping_count: 10,
            timeout_seconds: 5.0,
            retention_days: 90,
            database_path: tmp.path().to_string_lossy().into_owned(),
            http_port: 8080,
        };
        let tracker = OutageTracker::new(store.clone());
        let monitor = Monitor::new(config, store.clone(), tracker);
        (tmp, store, monitor)
    }

    fn host(name: &str, address: &str) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            address: address.to_string(),
        }
    }

    #[test]
    fn test_ingest_round_trip_opens_and_closes_one_outage() {
        let (_tmp, store, monitor) = monitor_with_hosts(&[("gw", "192.168.1.1")]);
        let gw = host("gw", "192.168.1.1");
        let t0 = Utc::now() - ChronoDuration::minutes(2);

        let down = result_from_outcome(&gw, t0, &PingOutcome::lost(10));
        let summary = monitor.ingest(vec![down]).unwrap();
        assert_eq!(summary.checks_recorded, 1);
        assert_eq!(summary.hosts_down, 1);

        let up = result_from_outcome(
            &gw,
            t0 + ChronoDuration::seconds(60),
            &PingOutcome::from_rtts(10, &[10.0, 12.0, 11.0, 13.0, 14.0, 12.0, 15.0, 10.5, 11.5, 12.5]),
        );
        monitor.ingest(vec![up]).unwrap();

        let events = store
            .get_outage_events(Some("192.168.1.1"), None, None, false, None)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_active());
        assert_eq!(events[0].duration_seconds(), Some(60));
        assert_eq!(events[0].recovery_success_rate, Some(100.0));
    }

    #[test]
    fn test_ingest_closes_outages_for_unconfigured_hosts() {
        let (_tmp, store, monitor) = monitor_with_hosts(&[("kept", "10.0.0.1")]);
        let t0 = Utc::now() - ChronoDuration::minutes(5);

        // An outage left over from a host that has since been dropped from
        // the configuration.
        store.create_outage_event("gone", "10.0.0.2", t0, None).unwrap();

        let kept_down = result_from_outcome(&host("kept", "10.0.0.1"), t0, &PingOutcome::lost(10));
        let summary = monitor.ingest(vec![kept_down]).unwrap();
        assert_eq!(summary.outages_closed_for_removed, 1);

        assert!(store.get_active_outage("10.0.0.1").unwrap().is_some());
        let gone_events = store
            .get_outage_events(Some("10.0.0.2"), None, None, false, None)
            .unwrap();
        assert_eq!(gone_events.len(), 1);
        assert!(!gone_events[0].is_active());
        assert_eq!(gone_events[0].recovery_success_rate, None);

        // A second cycle with the same configuration closes nothing more.
        let kept_still_down = result_from_outcome(
            &host("kept", "10.0.0.1"),
            t0 + ChronoDuration::seconds(60),
            &PingOutcome::lost(10),
        );
        let summary = monitor.ingest(vec![kept_still_down]).unwrap();
        assert_eq!(summary.outages_closed_for_removed, 0);
    }

    #[test]
    fn test_success_rate_survives_probe_to_statistics() {
        // The stored rate is exactly received/sent * 100, end to end.
        let (_tmp, store, monitor) = monitor_with_hosts(&[("gw", "192.168.1.1")]);
        let gw = host("gw", "192.168.1.1");
        let now = Utc::now();

        let partial = PingOutcome::from_rtts(10, &[8.1, 9.0, 10.2, 11.4, 12.0, 13.3, 25.5]);
        assert_eq!(partial.packets_received, 7);
        monitor
            .ingest(vec![result_from_outcome(&gw, now, &partial)])
            .unwrap();

        let stats = store.get_statistics("192.168.1.1", None, None).unwrap();
        assert_eq!(stats.total_checks, 1);
        assert!((stats.avg_success_rate - 70.0).abs() < 1e-9);
        assert_eq!(stats.overall_min_latency, Some(8.1));
        assert_eq!(stats.overall_max_latency, Some(25.5));
    }
}
