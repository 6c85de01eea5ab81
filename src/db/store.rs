//! SQLite store for check results and outage events.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

/// Marker written into `notes` when an outage is closed because its host
/// left the monitored set rather than because it recovered.
pub const REMOVAL_NOTES: &str = "Host removed from monitoring configuration";

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("outage event {0} not found")]
    NotFound(i64),
    #[error("outage event {0} is already closed")]
    AlreadyClosed(i64),
    #[error("invalid check result: {0}")]
    Validation(String),
}

/// Thread-safe store handle.
///
/// A single connection guarded by a mutex: one writer at a time, which is
/// all the check cycle needs since checks per host are sequential. The
/// busy timeout bounds every operation so lock contention surfaces as a
/// `Storage` error instead of a hang.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Check results ---

    /// Durably persist one check result. Rejects malformed results with
    /// `Validation` before anything touches the database.
    pub fn append(&self, result: &CheckResult) -> Result<(), StoreError> {
        validate(result)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO check_results
             (host_address, host_name, timestamp, packets_sent, packets_received,
              success_rate, min_latency, max_latency, avg_latency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.host_address,
                result.host_name,
                fmt_db_time(result.timestamp),
                result.packets_sent,
                result.packets_received,
                result.success_rate,
                result.min_latency,
                result.max_latency,
                result.avg_latency,
            ],
        )?;
        Ok(())
    }

    /// The most recent check result for every distinct host address,
    /// ordered by host name (ties broken by address).
    pub fn latest_per_host(&self) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host_address, host_name, timestamp, packets_sent, packets_received,
                    success_rate, min_latency, max_latency, avg_latency
             FROM check_results AS r
             WHERE r.id = (SELECT r2.id FROM check_results AS r2
                           WHERE r2.host_address = r.host_address
                           ORDER BY r2.timestamp DESC, r2.id DESC LIMIT 1)
             ORDER BY r.host_name ASC, r.host_address ASC",
        )?;

        let results = stmt
            .query_map([], row_to_check_result)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Check results for one host, ascending by timestamp. An absent start
    /// means unbounded past; an absent end means "now".
    pub fn range_query(
        &self,
        host_address: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<CheckResult>, StoreError> {
        let end = end.unwrap_or_else(Utc::now);

        let mut sql = String::from(
            "SELECT host_address, host_name, timestamp, packets_sent, packets_received,
                    success_rate, min_latency, max_latency, avg_latency
             FROM check_results
             WHERE host_address = ?",
        );
        let mut values = vec![Value::Text(host_address.to_string())];
        if let Some(start) = start {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Text(fmt_db_time(start)));
        }
        sql.push_str(" AND timestamp <= ? ORDER BY timestamp ASC, id ASC");
        values.push(Value::Text(fmt_db_time(end)));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_from_iter(values), row_to_check_result)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Every host address that ever produced a check result, with its most
    /// recently seen display name, sorted alphabetically by name. Reflects
    /// history, not just the current configuration.
    pub fn all_monitored_hosts(&self) -> Result<Vec<MonitoredHost>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host_name, host_address
             FROM check_results AS r
             WHERE r.id = (SELECT r2.id FROM check_results AS r2
                           WHERE r2.host_address = r.host_address
                           ORDER BY r2.timestamp DESC, r2.id DESC LIMIT 1)
             ORDER BY r.host_name ASC",
        )?;

        let hosts = stmt
            .query_map([], |row| {
                Ok(MonitoredHost {
                    name: row.get(0)?,
                    address: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(hosts)
    }

    /// Delete check results strictly older than the cutoff, returning the
    /// number of rows removed. Outage events are a separate relation and
    /// are never touched here.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM check_results WHERE timestamp < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(removed)
    }

    // --- Outage events ---

    /// Insert a new open outage event and return its id. Counters start
    /// at 1: the check that opened the outage is the first failed check.
    pub fn create_outage_event(
        &self,
        host_name: &str,
        host_address: &str,
        start_time: DateTime<Utc>,
        notes: Option<&str>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outage_events
             (host_address, host_name, start_time, checks_failed, checks_during_outage,
              event_type, notes)
             VALUES (?1, ?2, ?3, 1, 1, ?4, ?5)",
            params![
                host_address,
                host_name,
                fmt_db_time(start_time),
                EventType::OutageStart.as_str(),
                notes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The single open outage event for a host, or `None` when the host
    /// is up.
    pub fn get_active_outage(&self, host_address: &str) -> Result<Option<OutageEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                "SELECT id, host_address, host_name, start_time, end_time, checks_failed,
                        checks_during_outage, recovery_success_rate, event_type, notes
                 FROM outage_events
                 WHERE host_address = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC, id DESC LIMIT 1",
                params![host_address],
                row_to_outage_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Overwrite the failure counters of an open event. Fails with
    /// `NotFound` when the id does not reference an open event.
    pub fn update_outage_event(
        &self,
        id: i64,
        checks_failed: i64,
        checks_during_outage: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE outage_events
             SET checks_failed = ?1, checks_during_outage = ?2
             WHERE id = ?3 AND end_time IS NULL",
            params![checks_failed, checks_during_outage, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Close an open outage event. Closing an already-closed event fails
    /// with `AlreadyClosed`; an unknown id fails with `NotFound`.
    pub fn close_outage_event(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        recovery_success_rate: Option<f64>,
        notes: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE outage_events
             SET end_time = ?1, recovery_success_rate = ?2, event_type = ?3, notes = ?4
             WHERE id = ?5 AND end_time IS NULL",
            params![
                fmt_db_time(end_time),
                recovery_success_rate,
                EventType::OutageEnd.as_str(),
                notes,
                id,
            ],
        )?;
        if changed == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM outage_events WHERE id = ?1",
                    params![id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return Err(if exists {
                StoreError::AlreadyClosed(id)
            } else {
                StoreError::NotFound(id)
            });
        }
        Ok(())
    }

    /// Close every open outage whose host is not in the active set, marking
    /// it as removed rather than recovered. An empty set closes all open
    /// events. Safe to call repeatedly: already-closed events are skipped,
    /// so a second call with the same set closes zero.
    pub fn close_outages_for_removed_hosts(
        &self,
        active_host_addresses: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let now = fmt_db_time(Utc::now());
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let open: Vec<(i64, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, host_address FROM outage_events WHERE end_time IS NULL")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let mut closed = 0;
        for (id, host_address) in open {
            if active_host_addresses.contains(&host_address) {
                continue;
            }
            tx.execute(
                "UPDATE outage_events
                 SET end_time = ?1, event_type = ?2, notes = ?3
                 WHERE id = ?4 AND end_time IS NULL",
                params![now, EventType::OutageEnd.as_str(), REMOVAL_NOTES, id],
            )?;
            closed += 1;
        }

        tx.commit()?;
        Ok(closed)
    }

    /// Outage events, most recent start first, with optional host, time
    /// range, active-only, and limit filters. The time range filters on
    /// `start_time`.
    pub fn get_outage_events(
        &self,
        host_address: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        active_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<OutageEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, host_address, host_name, start_time, end_time, checks_failed,
                    checks_during_outage, recovery_success_rate, event_type, notes
             FROM outage_events",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(host) = host_address {
            clauses.push("host_address = ?");
            values.push(Value::Text(host.to_string()));
        }
        if let Some(start) = start {
            clauses.push("start_time >= ?");
            values.push(Value::Text(fmt_db_time(start)));
        }
        if let Some(end) = end {
            clauses.push("start_time <= ?");
            values.push(Value::Text(fmt_db_time(end)));
        }
        if active_only {
            clauses.push("end_time IS NULL");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY start_time DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values), row_to_outage_event)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Statistics ---

    /// Success-rate and latency aggregates for one host over a time
    /// window. Latency aggregates skip rows where every packet was lost;
    /// an empty window yields the zero/absent result.
    pub fn get_statistics(
        &self,
        host_address: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<HostStatistics, StoreError> {
        let end = end.unwrap_or_else(Utc::now);

        let mut sql = String::from(
            "SELECT COUNT(*),
                    AVG(success_rate), MIN(success_rate), MAX(success_rate),
                    AVG(avg_latency), MIN(min_latency), MAX(max_latency)
             FROM check_results
             WHERE host_address = ?",
        );
        let mut values = vec![Value::Text(host_address.to_string())];
        if let Some(start) = start {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Text(fmt_db_time(start)));
        }
        sql.push_str(" AND timestamp <= ?");
        values.push(Value::Text(fmt_db_time(end)));

        let conn = self.conn.lock().unwrap();
        let stats = conn.query_row(&sql, params_from_iter(values), |row| {
            Ok(HostStatistics {
                total_checks: row.get(0)?,
                avg_success_rate: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                min_success_rate: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                max_success_rate: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                overall_avg_latency: row.get(4)?,
                overall_min_latency: row.get(5)?,
                overall_max_latency: row.get(6)?,
            })
        })?;
        Ok(stats)
    }

    /// Outage aggregates for one host over events whose start falls in the
    /// window. Average duration is computed over closed events only.
    pub fn get_outage_statistics(
        &self,
        host_address: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<OutageStatistics, StoreError> {
        let events = self.get_outage_events(Some(host_address), start, end, false, None)?;

        let mut stats = OutageStatistics {
            total_outages: events.len() as i64,
            ..Default::default()
        };
        let mut closed_durations: Vec<i64> = Vec::new();
        for event in &events {
            match event.duration_seconds() {
                Some(duration) => closed_durations.push(duration),
                None => stats.active_outages += 1,
            }
        }
        if !closed_durations.is_empty() {
            stats.total_downtime_seconds = closed_durations.iter().sum();
            stats.avg_duration_seconds =
                stats.total_downtime_seconds as f64 / closed_durations.len() as f64;
        }
        Ok(stats)
    }
}

/// Contract checks applied at the store boundary so a malformed result
/// never corrupts downstream aggregates.
fn validate(result: &CheckResult) -> Result<(), StoreError> {
    if result.packets_sent == 0 {
        return Err(StoreError::Validation(
            "packets_sent must be positive".to_string(),
        ));
    }
    if result.packets_received > result.packets_sent {
        return Err(StoreError::Validation(format!(
            "packets_received ({}) exceeds packets_sent ({})",
            result.packets_received, result.packets_sent
        )));
    }
    let expected_rate =
        f64::from(result.packets_received) / f64::from(result.packets_sent) * 100.0;
    if (result.success_rate - expected_rate).abs() > 1e-6 {
        return Err(StoreError::Validation(format!(
            "success_rate {} does not match received/sent ({})",
            result.success_rate, expected_rate
        )));
    }
    let latencies = [
        result.min_latency,
        result.avg_latency,
        result.max_latency,
    ];
    if result.packets_received == 0 {
        if latencies.iter().any(Option::is_some) {
            return Err(StoreError::Validation(
                "latency values present for a fully failed check".to_string(),
            ));
        }
    } else {
        match (result.min_latency, result.avg_latency, result.max_latency) {
            (Some(min), Some(avg), Some(max)) => {
                if !(min <= avg && avg <= max) {
                    return Err(StoreError::Validation(format!(
                        "latency ordering violated: min={} avg={} max={}",
                        min, avg, max
                    )));
                }
                if min <= 0.0 {
                    return Err(StoreError::Validation(
                        "latency values must be positive".to_string(),
                    ));
                }
            }
            _ => {
                return Err(StoreError::Validation(
                    "latency values missing for a check with received packets".to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn row_to_check_result(row: &Row<'_>) -> SqlResult<CheckResult> {
    let time_str: String = row.get(2)?;
    Ok(CheckResult {
        host_address: row.get(0)?,
        host_name: row.get(1)?,
        timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
        packets_sent: row.get(3)?,
        packets_received: row.get(4)?,
        success_rate: row.get(5)?,
        min_latency: row.get(6)?,
        max_latency: row.get(7)?,
        avg_latency: row.get(8)?,
    })
}

fn row_to_outage_event(row: &Row<'_>) -> SqlResult<OutageEvent> {
    let start_str: String = row.get(3)?;
    let end_str: Option<String> = row.get(4)?;
    let event_type: String = row.get(8)?;
    Ok(OutageEvent {
        id: row.get(0)?,
        host_address: row.get(1)?,
        host_name: row.get(2)?,
        start_time: parse_db_time(&start_str).unwrap_or_else(Utc::now),
        end_time: end_str.as_deref().and_then(parse_db_time),
        checks_failed: row.get(5)?,
        checks_during_outage: row.get(6)?,
        recovery_success_rate: row.get(7)?,
        event_type: EventType::from_db(&event_type),
        notes: row.get(9)?,
    })
}

fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
