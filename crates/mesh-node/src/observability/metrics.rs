//! Metrics definitions for the mesh node.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label is drawn from a fixed set of values chosen by the caller:
//! - `outcome`/`status`: a handful of values per metric
//! - `kind`: offer, answer, candidate
//! - `state`: the six link states
//! - `operation`: join, leave, evict
//! - `actor_type`: mesh
//!
//! Member ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Room transactions are a handful of store round-trips plus backoff
        .set_buckets_for_metric(
            Matcher::Prefix("mesh_room_txn".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set room transaction buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Admission
// ============================================================================

/// Record an admission attempt.
///
/// Metric: `mesh_admissions_total`
/// Labels: `outcome` (admitted, already_member, full, error)
pub fn record_admission(outcome: &str) {
    counter!("mesh_admissions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a departure that removed a member record.
///
/// Metric: `mesh_departures_total`
/// Labels: `reason` (leave, ghost)
pub fn record_departure(reason: &str) {
    counter!("mesh_departures_total", "reason" => reason.to_string()).increment(1);
}

/// Record an optimistic commit that lost to a concurrent writer.
///
/// Metric: `mesh_room_txn_conflicts_total`
/// Labels: `operation` (join, leave, evict)
pub fn record_txn_conflict(operation: &str) {
    counter!("mesh_room_txn_conflicts_total", "operation" => operation.to_string()).increment(1);
}

/// Record the wall time of a room transaction including retries.
///
/// Metric: `mesh_room_txn_duration_seconds`
/// Labels: `operation`
pub fn record_txn_duration(operation: &str, duration: Duration) {
    histogram!("mesh_room_txn_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Presence
// ============================================================================

/// Record a heartbeat result.
///
/// Metric: `mesh_heartbeats_total`
/// Labels: `status` (refreshed, rejoined, evicted, error)
pub fn record_heartbeat(status: &str) {
    counter!("mesh_heartbeats_total", "status" => status.to_string()).increment(1);
}

/// Set the number of live members in the local view, self included.
///
/// Metric: `mesh_members_online`
pub fn set_members_online(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_members_online").set(count as f64);
}

/// Record a ghost observed by the local sweep.
///
/// Metric: `mesh_ghosts_detected_total`
pub fn record_ghost_detected() {
    counter!("mesh_ghosts_detected_total").increment(1);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record an envelope write.
///
/// Metric: `mesh_signals_sent_total`
/// Labels: `kind`, `status` (success, error)
pub fn record_signal_sent(kind: &str, status: &str) {
    counter!("mesh_signals_sent_total", "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record an envelope taken out of the local mailbox.
///
/// Metric: `mesh_signals_consumed_total`
/// Labels: `kind`, `status` (applied, duplicate, ignored)
pub fn record_signal_consumed(kind: &str, status: &str) {
    counter!("mesh_signals_consumed_total", "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
}

// ============================================================================
// Links
// ============================================================================

/// Record a peer link entering a state.
///
/// Metric: `mesh_link_transitions_total`
/// Labels: `state`
pub fn record_link_transition(state: &str) {
    counter!("mesh_link_transitions_total", "state" => state.to_string()).increment(1);
}

/// Set the number of peer links that are not closed.
///
/// Metric: `mesh_links_active`
pub fn set_links_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_links_active").set(count as f64);
}

/// Set whether any link is currently reconnecting (0 or 1).
///
/// Metric: `mesh_reconnecting`
pub fn set_reconnecting(reconnecting: bool) {
    gauge!("mesh_reconnecting").set(if reconnecting { 1.0 } else { 0.0 });
}

// ============================================================================
// Actor
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `mesh_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}
