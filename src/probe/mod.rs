//! Probe execution for reachability checks.

mod ping;

pub use ping::run_ping;

use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Summary of one multi-packet ping check. Latency values are
/// milliseconds; all absent when every packet was lost.
#[derive(Debug, Clone, PartialEq)]
pub struct PingOutcome {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

impl PingOutcome {
    /// Build an outcome from the round-trip times of the packets that
    /// made it back.
    pub fn from_rtts(packets_sent: u32, rtts_ms: &[f64]) -> Self {
        if rtts_ms.is_empty() {
            return Self::lost(packets_sent);
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &rtt in rtts_ms {
            min = min.min(rtt);
            max = max.max(rtt);
            sum += rtt;
        }
        Self {
            packets_sent,
            packets_received: rtts_ms.len() as u32,
            min_latency_ms: Some(min),
            max_latency_ms: Some(max),
            avg_latency_ms: Some(sum / rtts_ms.len() as f64),
        }
    }

    /// An outcome where no reply came back at all.
    pub fn lost(packets_sent: u32) -> Self {
        Self {
            packets_sent,
            packets_received: 0,
            min_latency_ms: None,
            max_latency_ms: None,
            avg_latency_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_rtts() {
        let outcome = PingOutcome::from_rtts(5, &[10.5, 12.3, 8.1, 11.2]);
        assert_eq!(outcome.packets_sent, 5);
        assert_eq!(outcome.packets_received, 4);
        assert_eq!(outcome.min_latency_ms, Some(8.1));
        assert_eq!(outcome.max_latency_ms, Some(12.3));
        let avg = outcome.avg_latency_ms.unwrap();
        assert!((avg - 10.525).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_single_rtt() {
        let outcome = PingOutcome::from_rtts(1, &[12.5]);
        assert_eq!(outcome.min_latency_ms, Some(12.5));
        assert_eq!(outcome.max_latency_ms, Some(12.5));
        assert_eq!(outcome.avg_latency_ms, Some(12.5));
    }

    #[test]
    fn test_outcome_all_lost() {
        let outcome = PingOutcome::from_rtts(10, &[]);
        assert_eq!(outcome, PingOutcome::lost(10));
        assert_eq!(outcome.packets_received, 0);
        assert_eq!(outcome.avg_latency_ms, None);
    }
}
