//! Health Tracker (spec §4.3): passive per-server success/failure metrics
//! and circuit-breaker decision.

use std::collections::HashMap;

use serde::Serialize;

/// Consecutive-failure threshold that flips a server to unhealthy.
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default)]
struct ServerHealth {
    total_calls: u64,
    failed_calls: u64,
    total_response_ms: u64,
    consecutive_failures: u32,
    last_success_ts_ms: Option<u64>,
    last_failure_ts_ms: Option<u64>,
    last_error: Option<String>,
}

/// Per-server success/failure metrics for one request (spec §3, §4.3).
#[derive(Debug, Clone, Default)]
pub struct HealthTracker {
    servers: HashMap<String, ServerHealth>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerHealthSummary {
    pub healthy: bool,
    pub total_calls: u64,
    pub failure_rate: f64,
    pub avg_response_ms_on_success: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, server_id: &str, elapsed_ms: u64, now_ms: u64) {
        let entry = self.servers.entry(server_id.to_string()).or_default();
        entry.total_calls += 1;
        entry.total_response_ms += elapsed_ms;
        entry.consecutive_failures = 0;
        entry.last_success_ts_ms = Some(now_ms);
    }

    pub fn record_failure(&mut self, server_id: &str, error: impl Into<String>, now_ms: u64) {
        let entry = self.servers.entry(server_id.to_string()).or_default();
        entry.total_calls += 1;
        entry.failed_calls += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_ts_ms = Some(now_ms);
        entry.last_error = Some(error.into());
        if entry.consecutive_failures == CONSECUTIVE_FAILURE_THRESHOLD {
            tracing::warn!(server_id, "circuit breaker opened after consecutive failures");
        }
    }

    /// True if the server is unknown (never seen) or below the failure
    /// threshold; this is the circuit-breaker gate consulted before a call.
    pub fn is_healthy(&self, server_id: &str) -> bool {
        self.servers
            .get(server_id)
            .map(|s| s.consecutive_failures < CONSECUTIVE_FAILURE_THRESHOLD)
            .unwrap_or(true)
    }

    pub fn summary(&self) -> HashMap<String, ServerHealthSummary> {
        self.servers
            .iter()
            .map(|(id, s)| {
                let successes = s.total_calls.saturating_sub(s.failed_calls);
                let failure_rate = if s.total_calls == 0 {
                    0.0
                } else {
                    s.failed_calls as f64 / s.total_calls as f64
                };
                let avg_response_ms_on_success = if successes == 0 {
                    0.0
                } else {
                    s.total_response_ms as f64 / successes as f64
                };
                (
                    id.clone(),
                    ServerHealthSummary {
                        healthy: s.consecutive_failures < CONSECUTIVE_FAILURE_THRESHOLD,
                        total_calls: s.total_calls,
                        failure_rate,
                        avg_response_ms_on_success,
                        consecutive_failures: s.consecutive_failures,
                        last_error: s.last_error.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_server_is_healthy() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_healthy("unknown"));
    }

    #[test]
    fn three_consecutive_failures_opens_the_breaker() {
        let mut tracker = HealthTracker::new();
        tracker.record_failure("s1", "boom", 1);
        tracker.record_failure("s1", "boom", 2);
        assert!(tracker.is_healthy("s1"));
        tracker.record_failure("s1", "boom", 3);
        assert!(!tracker.is_healthy("s1"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut tracker = HealthTracker::new();
        tracker.record_failure("s1", "boom", 1);
        tracker.record_failure("s1", "boom", 2);
        tracker.record_failure("s1", "boom", 3);
        assert!(!tracker.is_healthy("s1"));
        tracker.record_success("s1", 50, 4);
        assert!(tracker.is_healthy("s1"));
    }

    #[test]
    fn summary_reports_failure_rate_and_average_latency() {
        let mut tracker = HealthTracker::new();
        tracker.record_success("s1", 100, 1);
        tracker.record_success("s1", 300, 2);
        tracker.record_failure("s1", "timeout", 3);
        let summary = tracker.summary();
        let s1 = &summary["s1"];
        assert_eq!(s1.total_calls, 3);
        assert!((s1.failure_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert!((s1.avg_response_ms_on_success - 200.0).abs() < 1e-9);
        assert_eq!(s1.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn circuit_breaker_scenario_from_spec() {
        // spec §8 scenario 3
        let mut tracker = HealthTracker::new();
        tracker.record_failure("S1", "e1", 1);
        tracker.record_failure("S1", "e2", 2);
        tracker.record_failure("S1", "e3", 3);
        assert!(!tracker.is_healthy("S1"));
        tracker.record_success("S1", 20, 4);
        assert!(tracker.is_healthy("S1"));
    }
}
