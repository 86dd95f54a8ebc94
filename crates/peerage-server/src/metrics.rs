//! Prometheus metrics.
//!
//! Installs a prometheus recorder whose handle the API server renders on
//! `/metrics`. Handlers record through the `metrics` crate's global
//! recorder, so recording is a no-op when metrics are disabled.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use peerage_cluster::{ClusterStatusSnapshot, Liveness, RemovalOutcome};

/// Histogram buckets for removal latency (1ms to 30s). A removal spans a
/// residency check and a consensus round trip, possibly several.
const HISTOGRAM_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Installs the prometheus recorder and spawns its upkeep task.
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .set_buckets(HISTOGRAM_BUCKETS)
        .map_err(|e| format!("failed to set histogram buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))?;

    // periodic upkeep for histogram aggregation
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    Ok(handle)
}

/// Records the terminal outcome of one `remove_peer` request.
#[inline]
pub fn record_removal(outcome: &RemovalOutcome, proposals: u32, duration: Duration) {
    counter!("peerage_removals_total", "outcome" => outcome.label()).increment(1);
    histogram!("peerage_removal_duration_seconds").record(duration.as_secs_f64());
    counter!("peerage_removal_proposals_total").increment(u64::from(proposals));
}

/// Records a `cluster_status` request and publishes the topology gauges.
#[inline]
pub fn record_status(snapshot: &ClusterStatusSnapshot) {
    counter!("peerage_status_requests_total").increment(1);
    gauge!("peerage_topology_version").set(snapshot.version as f64);
    gauge!("peerage_peers").set(snapshot.peers.len() as f64);
    let stale = snapshot
        .peers
        .iter()
        .filter(|p| p.liveness == Liveness::Stale)
        .count();
    gauge!("peerage_peers_stale").set(stale as f64);
}

/// Records a request answered with an error status before reaching the core.
#[inline]
pub fn record_bad_request(route: &'static str) {
    counter!("peerage_http_bad_requests_total", "route" => route).increment(1);
}
