//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A host known to the monitor, either from configuration or from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredHost {
    pub name: String,
    pub address: String,
}

/// One completed reachability check against a host.
///
/// Rows are append-only: written once by the check cycle and never mutated.
/// Latency values are milliseconds and are all absent exactly when every
/// packet was lost (`success_rate == 0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub host_address: String,
    pub host_name: String,
    pub timestamp: DateTime<Utc>,
    pub packets_sent: u32,
    pub packets_received: u32,
    /// packets_received / packets_sent * 100, in [0, 100].
    pub success_rate: f64,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub avg_latency: Option<f64>,
}

impl CheckResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_name: &str,
        host_address: &str,
        timestamp: DateTime<Utc>,
        packets_sent: u32,
        packets_received: u32,
        min_latency: Option<f64>,
        max_latency: Option<f64>,
        avg_latency: Option<f64>,
    ) -> Self {
        let success_rate = if packets_sent == 0 {
            0.0
        } else {
            f64::from(packets_received) / f64::from(packets_sent) * 100.0
        };
        Self {
            host_address: host_address.to_string(),
            host_name: host_name.to_string(),
            timestamp,
            packets_sent,
            packets_received,
            success_rate,
            min_latency,
            max_latency,
            avg_latency,
        }
    }

    /// True when every packet in the check was lost.
    pub fn is_total_failure(&self) -> bool {
        self.success_rate == 0.0
    }
}

/// Lifecycle marker for an outage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OutageStart,
    OutageEnd,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::OutageStart => "outage_start",
            EventType::OutageEnd => "outage_end",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "outage_end" => EventType::OutageEnd,
            _ => EventType::OutageStart,
        }
    }
}

/// One continuous interval of total check failure for a host.
///
/// An event is open while `end_time` is absent; closing it (recovery or
/// removal from the monitored set) fills `end_time`. Events are never
/// deleted, they form the outage audit log.
#[derive(Debug, Clone, Serialize)]
pub struct OutageEvent {
    pub id: i64,
    pub host_address: String,
    /// Display name snapshotted at creation time.
    pub host_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub checks_failed: i64,
    pub checks_during_outage: i64,
    /// Success rate of the check that closed the event; absent for
    /// removal closes.
    pub recovery_success_rate: Option<f64>,
    pub event_type: EventType,
    pub notes: Option<String>,
}

impl OutageEvent {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Seconds between start and end, present iff the event is closed.
    pub fn duration_seconds(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).num_seconds())
    }
}

/// Success-rate and latency aggregates for one host over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostStatistics {
    pub total_checks: i64,
    pub avg_success_rate: f64,
    pub min_success_rate: f64,
    pub max_success_rate: f64,
    pub overall_avg_latency: Option<f64>,
    pub overall_min_latency: Option<f64>,
    pub overall_max_latency: Option<f64>,
}

/// Outage aggregates for one host over a time window.
///
/// `avg_duration_seconds` is computed over closed events only; open events
/// have no duration yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutageStatistics {
    pub total_outages: i64,
    pub active_outages: i64,
    pub avg_duration_seconds: f64,
    pub total_downtime_seconds: i64,
}
