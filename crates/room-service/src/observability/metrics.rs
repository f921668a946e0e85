//! Metrics definitions for the Room Service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rs_` prefix for Room Service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `message_type`: bounded by the signaling protocol (~15 values)
//! - `outcome`: `ok` or an error kind (~12 values)
//! - `operation`: bounded by media engine calls (~8 values)
//! - `decision`: `approved`, `rejected`
//! - `transition`: bounded by lifecycle transitions (~6 values)
//! - `actor_type`: `room`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Engine calls include ICE/DTLS setup on real SFUs, so the tail is long
        .set_buckets_for_metric(
            Matcher::Prefix("rs_engine_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine call buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rs_signaling_latency".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Rooms & Peers (Gauges)
// ============================================================================

/// Set the number of live rooms.
///
/// Metric: `rs_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_rooms_active").set(count as f64);
}

/// A peer session joined a room.
///
/// Metric: `rs_peers_active`
pub fn peer_joined() {
    gauge!("rs_peers_active").increment(1.0);
}

/// A peer session left a room.
pub fn peer_left() {
    gauge!("rs_peers_active").decrement(1.0);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rs_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling request.
///
/// Metric: `rs_signaling_messages_total`, `rs_signaling_latency_seconds`
/// Labels: `message_type`, `outcome`
pub fn record_signaling_message(message_type: &str, outcome: &str, duration: Duration) {
    counter!(
        "rs_signaling_messages_total",
        "message_type" => message_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("rs_signaling_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a peer evicted because its outbound queue was full.
///
/// Metric: `rs_slow_peer_evictions_total`
pub fn record_slow_peer_eviction() {
    counter!("rs_slow_peer_evictions_total").increment(1);
}

// ============================================================================
// Media engine
// ============================================================================

/// Record the duration of one media engine call.
///
/// Metric: `rs_engine_call_seconds`
/// Labels: `operation`
pub fn record_engine_call(operation: &str, duration: Duration) {
    histogram!("rs_engine_call_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a media engine call that exceeded the bounded wait.
///
/// Metric: `rs_engine_timeouts_total`
/// Labels: `operation`
pub fn record_engine_timeout(operation: &str) {
    counter!("rs_engine_timeouts_total", "operation" => operation.to_string()).increment(1);
}

// ============================================================================
// Meetings
// ============================================================================

/// Record a host decision on a waiting participant.
///
/// Metric: `rs_waiting_room_decisions_total`
/// Labels: `decision`
pub fn record_waiting_room_decision(approved: bool) {
    let decision = if approved { "approved" } else { "rejected" };
    counter!("rs_waiting_room_decisions_total", "decision" => decision).increment(1);
}

/// Record a meeting lifecycle transition.
///
/// Metric: `rs_lifecycle_transitions_total`
/// Labels: `transition`
pub fn record_lifecycle_transition(transition: &'static str) {
    counter!("rs_lifecycle_transitions_total", "transition" => transition).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Recording without an installed recorder goes to the global no-op
    // recorder and must not panic.
    #[test]
    fn test_recording_without_recorder() {
        set_rooms_active(0);
        peer_joined();
        peer_left();
        set_actor_mailbox_depth("room", 12);
        record_signaling_message("produce", "ok", Duration::from_millis(3));
        record_slow_peer_eviction();
        record_engine_call("create_transport", Duration::from_millis(8));
        record_engine_timeout("consume");
        record_waiting_room_decision(true);
        record_lifecycle_transition("scheduled_to_active");
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(3);
            record_engine_timeout("consume");
            record_engine_timeout("consume");
            record_waiting_room_decision(false);
        });

        let metrics = snapshotter.snapshot().into_vec();

        let rooms = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rs_rooms_active")
            .expect("rooms gauge recorded");
        assert!(matches!(rooms.3, DebugValue::Gauge(v) if v.into_inner() == 3.0));

        let timeouts = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rs_engine_timeouts_total")
            .expect("timeout counter recorded");
        assert!(matches!(timeouts.3, DebugValue::Counter(2)));

        let decision = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rs_waiting_room_decisions_total")
            .expect("decision counter recorded");
        assert!(decision
            .0
            .key()
            .labels()
            .any(|label| label.key() == "decision" && label.value() == "rejected"));
    }
}
