use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::mux::chain::Attempt;

/// Round-trip statistics for a single endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundTripStats {
    pub attempts: u64,
    pub network_errors: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub total_latency_micros: u64,
    pub max_latency_micros: u64,
}

impl RoundTripStats {
    fn record(&mut self, attempt: &Attempt) {
        self.attempts += 1;
        let micros = attempt.duration.as_micros() as u64;
        self.total_latency_micros += micros;
        self.max_latency_micros = self.max_latency_micros.max(micros);
        if attempt.is_network_error() {
            self.network_errors += 1;
        }
        if let Some(status) = attempt.status {
            match status.as_u16() {
                200..=299 => self.status_2xx += 1,
                300..=399 => self.status_3xx += 1,
                400..=499 => self.status_4xx += 1,
                500..=599 => self.status_5xx += 1,
                _ => {}
            }
        }
    }

    pub fn mean_latency(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_micros / self.attempts)
    }
}

/// Per-endpoint round-trip stats, keyed by the endpoint's stable id.
/// Shared between the forwarder (writer) and the stats API (reader).
#[derive(Debug, Default)]
pub struct PerfMonitor {
    endpoints: DashMap<String, RoundTripStats>,
}

impl PerfMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, endpoint_id: &str, attempt: &Attempt) {
        self.endpoints
            .entry(endpoint_id.to_string())
            .or_default()
            .record(attempt);
    }

    pub fn endpoint_stats(&self, endpoint_id: &str) -> Option<RoundTripStats> {
        self.endpoints.get(endpoint_id).map(|s| s.clone())
    }

    pub fn reset_endpoint(&self, endpoint_id: &str) {
        self.endpoints.remove(endpoint_id);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut stats: Vec<_> = self
            .endpoints
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "endpoint": entry.key(),
                    "stats": entry.value().clone(),
                })
            })
            .collect();
        stats.sort_by_key(|v| v["endpoint"].as_str().unwrap_or_default().to_string());
        serde_json::json!({ "endpoints": stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn records_attempts_by_class() {
        let mon = PerfMonitor::new();
        mon.record(
            "e1",
            &Attempt {
                status: Some(StatusCode::OK),
                duration: Duration::from_millis(10),
                ..Attempt::default()
            },
        );
        mon.record(
            "e1",
            &Attempt {
                error: Some("connection reset".into()),
                duration: Duration::from_millis(30),
                ..Attempt::default()
            },
        );

        let stats = mon.endpoint_stats("e1").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.status_2xx, 1);
        assert_eq!(stats.network_errors, 1);
        assert_eq!(stats.mean_latency(), Duration::from_millis(20));
        assert!(mon.endpoint_stats("e2").is_none());

        mon.reset_endpoint("e1");
        assert!(mon.endpoint_stats("e1").is_none());
    }
}
