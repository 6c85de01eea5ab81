//! HTTP request handlers for the query API.

use super::AppState;
use crate::db::{EventType, OutageEvent, StoreError};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn parse_time(s: Option<&String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn store_error(e: StoreError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

// ============================================================================
// Current status and host list
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest_per_host() {
        Ok(results) => Json(results).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn handle_hosts(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.all_monitored_hosts() {
        Ok(hosts) => Json(hosts).into_response(),
        Err(e) => store_error(e),
    }
}

// ============================================================================
// Check results and statistics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub host: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn handle_results(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let start = parse_time(query.start.as_ref());
    let end = parse_time(query.end.as_ref());

    match state.store.range_query(&query.host, start, end) {
        Ok(results) => Json(results).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn handle_statistics(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let start = parse_time(query.start.as_ref());
    let end = parse_time(query.end.as_ref());

    match state.store.get_statistics(&query.host, start, end) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(e),
    }
}

// ============================================================================
// Outage history
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OutagesQuery {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Outage event as served to dashboards, with the derived duration
/// spelled out.
#[derive(Debug, Serialize)]
pub struct ApiOutageEvent {
    pub id: i64,
    pub host_address: String,
    pub host_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub checks_failed: i64,
    pub checks_during_outage: i64,
    pub recovery_success_rate: Option<f64>,
    pub event_type: EventType,
    pub notes: Option<String>,
    pub active: bool,
}

impl From<OutageEvent> for ApiOutageEvent {
    fn from(event: OutageEvent) -> Self {
        let duration_seconds = event.duration_seconds();
        let active = event.is_active();
        Self {
            id: event.id,
            host_address: event.host_address,
            host_name: event.host_name,
            start_time: event.start_time,
            end_time: event.end_time,
            duration_seconds,
            checks_failed: event.checks_failed,
            checks_during_outage: event.checks_during_outage,
            recovery_success_rate: event.recovery_success_rate,
            event_type: event.event_type,
            notes: event.notes,
            active,
        }
    }
}

pub async fn handle_outages(
    State(state): State<AppState>,
    Query(query): Query<OutagesQuery>,
) -> impl IntoResponse {
    let start = parse_time(query.start.as_ref());
    let end = parse_time(query.end.as_ref());

    match state.store.get_outage_events(
        query.host.as_deref(),
        start,
        end,
        query.active_only,
        query.limit,
    ) {
        Ok(events) => {
            let events: Vec<ApiOutageEvent> = events.into_iter().map(Into::into).collect();
            Json(events).into_response()
        }
        Err(e) => store_error(e),
    }
}

pub async fn handle_outage_statistics(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let start = parse_time(query.start.as_ref());
    let end = parse_time(query.end.as_ref());

    match state.store.get_outage_statistics(&query.host, start, end) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(e),
    }
}
