//! Observability infrastructure for the topology agent
//!
//! Prometheus metrics covering the trigger pipeline: wakeup cadence, scan
//! latency, upstream failures, rate-limiter shedding, and publish outcomes.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Histogram buckets for scan latency (in seconds).
const SCAN_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Histogram buckets for the gap between observer wakeups (in seconds).
const WAKEUP_INTERVAL_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Global metrics instance (registered once).
static GLOBAL_METRICS: OnceLock<TopologyMetricsInner> = OnceLock::new();

struct TopologyMetricsInner {
    scan_latency_seconds: Histogram,
    wakeup_interval_seconds: Histogram,
    scan_errors_total: IntCounterVec,
    events_received_total: IntCounterVec,
    events_dropped_total: IntCounter,
    topology_updates_total: IntCounterVec,
    update_errors_total: IntCounter,
}

impl TopologyMetricsInner {
    fn new() -> Self {
        Self {
            scan_latency_seconds: register_histogram!(
                "topology_agent_scan_latency_seconds",
                "Time spent scanning and aggregating node resources",
                SCAN_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scan_latency_seconds"),

            wakeup_interval_seconds: register_histogram!(
                "topology_agent_wakeup_interval_seconds",
                "Wall-clock gap between consecutive observer wakeups",
                WAKEUP_INTERVAL_BUCKETS.to_vec()
            )
            .expect("Failed to register wakeup_interval_seconds"),

            scan_errors_total: register_int_counter_vec!(
                "topology_agent_scan_errors_total",
                "Failed pod-resources calls, by call name",
                &["call"]
            )
            .expect("Failed to register scan_errors_total"),

            events_received_total: register_int_counter_vec!(
                "topology_agent_events_received_total",
                "Trigger events processed by the observer, by origin",
                &["origin"]
            )
            .expect("Failed to register events_received_total"),

            events_dropped_total: register_int_counter!(
                "topology_agent_events_dropped_total",
                "Trigger events shed by the rate limiter's burst buffer"
            )
            .expect("Failed to register events_dropped_total"),

            topology_updates_total: register_int_counter_vec!(
                "topology_agent_topology_updates_total",
                "Successful topology object reconciliations, by update reason",
                &["reason"]
            )
            .expect("Failed to register topology_updates_total"),

            update_errors_total: register_int_counter!(
                "topology_agent_update_errors_total",
                "Failed topology object reconciliations"
            )
            .expect("Failed to register update_errors_total"),
        }
    }
}

/// Lightweight handle to the global metrics instance. Clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct TopologyMetrics {
    _private: (),
}

impl Default for TopologyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyMetrics {
    /// Create a metrics handle, initializing the global collectors if
    /// needed.
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TopologyMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TopologyMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_scan_latency(&self, duration_secs: f64) {
        self.inner().scan_latency_seconds.observe(duration_secs);
    }

    pub fn observe_wakeup_interval(&self, duration_secs: f64) {
        self.inner().wakeup_interval_seconds.observe(duration_secs);
    }

    pub fn inc_scan_error(&self, call: &str) {
        self.inner().scan_errors_total.with_label_values(&[call]).inc();
    }

    pub fn inc_events_received(&self, origin: &str) {
        self.inner()
            .events_received_total
            .with_label_values(&[origin])
            .inc();
    }

    pub fn inc_events_dropped(&self) {
        self.inner().events_dropped_total.inc();
    }

    pub fn inc_topology_updates(&self, reason: &str) {
        self.inner()
            .topology_updates_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_update_errors(&self) {
        self.inner().update_errors_total.inc();
    }
}

/// Convenience accessor for pipeline code.
pub fn metrics() -> TopologyMetrics {
    TopologyMetrics::new()
}
