//! Metrics Collection
//!
//! Counters and gauges for the PEX node, shared by the HTTP handlers, the
//! gossip protocol and the membership monitor.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for the PEX node
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Inbound registrations accepted
    pub registrations_accepted: AtomicU64,

    /// Inbound registrations refused (validation, deny list, already registered)
    pub registrations_rejected: AtomicU64,

    /// Requests refused by the rate limiter
    pub rate_limited_requests: AtomicU64,

    /// Outbound handshakes that got an answer
    pub handshakes_succeeded: AtomicU64,

    /// Outbound handshakes that failed or timed out
    pub handshakes_failed: AtomicU64,

    /// Liveness probes answered
    pub probes_succeeded: AtomicU64,

    /// Liveness probes failed or timed out
    pub probes_failed: AtomicU64,

    /// Peers the monitor presumed dead
    pub peers_marked_inactive: AtomicU64,

    /// Peers in the registry
    pub known_peers: AtomicU64,

    /// Peers not marked inactive
    pub active_peers: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_registrations_accepted(&self) {
        self.registrations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_registrations_rejected(&self) {
        self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshakes_succeeded(&self) {
        self.handshakes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshakes_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_probes_succeeded(&self) {
        self.probes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_probes_failed(&self) {
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_peers_marked_inactive(&self) {
        self.peers_marked_inactive.fetch_add(1, Ordering::Relaxed);
    }

    /// Update registry gauges
    pub fn set_peer_counts(&self, known: u64, active: u64) {
        self.known_peers.store(known, Ordering::Relaxed);
        self.active_peers.store(active, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut output = String::new();

        let series: [(&str, &str, &str, u64); 11] = [
            ("uptime_seconds", "gauge", "PEX node uptime in seconds", self.uptime_secs()),
            ("registrations_accepted", "counter", "Inbound registrations accepted", load(&self.registrations_accepted)),
            ("registrations_rejected", "counter", "Inbound registrations rejected", load(&self.registrations_rejected)),
            ("rate_limited", "counter", "Rate-limited requests", load(&self.rate_limited_requests)),
            ("handshakes_succeeded", "counter", "Outbound handshakes answered", load(&self.handshakes_succeeded)),
            ("handshakes_failed", "counter", "Outbound handshakes failed", load(&self.handshakes_failed)),
            ("probes_succeeded", "counter", "Liveness probes answered", load(&self.probes_succeeded)),
            ("probes_failed", "counter", "Liveness probes failed", load(&self.probes_failed)),
            ("peers_marked_inactive", "counter", "Peers presumed dead", load(&self.peers_marked_inactive)),
            ("known_peers", "gauge", "Peers in the registry", load(&self.known_peers)),
            ("active_peers", "gauge", "Peers not marked inactive", load(&self.active_peers)),
        ];

        for (name, kind, help, value) in series {
            let _ = write!(
                output,
                "# HELP bitorch_pex_{name} {help}\n\
                 # TYPE bitorch_pex_{name} {kind}\n\
                 bitorch_pex_{name} {value}\n\n",
            );
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "registrations": {
                "accepted": load(&self.registrations_accepted),
                "rejected": load(&self.registrations_rejected),
            },
            "rate_limited": load(&self.rate_limited_requests),
            "handshakes": {
                "succeeded": load(&self.handshakes_succeeded),
                "failed": load(&self.handshakes_failed),
            },
            "probes": {
                "succeeded": load(&self.probes_succeeded),
                "failed": load(&self.probes_failed),
            },
            "peers": {
                "known": load(&self.known_peers),
                "active": load(&self.active_peers),
                "marked_inactive": load(&self.peers_marked_inactive),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.inc_registrations_accepted();
        metrics.inc_registrations_accepted();
        metrics.inc_handshakes_failed();

        assert_eq!(metrics.registrations_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.handshakes_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.set_peer_counts(12, 9);

        let output = metrics.to_prometheus();

        assert!(output.contains("# TYPE bitorch_pex_known_peers gauge"));
        assert!(output.contains("bitorch_pex_known_peers 12"));
        assert!(output.contains("bitorch_pex_active_peers 9"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.inc_peers_marked_inactive();

        let json = metrics.to_json();

        assert_eq!(json["peers"]["marked_inactive"], 1);
    }
}
