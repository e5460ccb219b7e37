//! Metric definitions for the Room Controller.
//!
//! Prometheus conventions: `rc_` prefix, `_total` for counters, `_seconds`
//! for duration histograms. Every label value comes from a closed enum.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the render handle.
///
/// Must run before anything is recorded.
///
/// # Errors
///
/// Returns an error if bucket configuration fails or a recorder is
/// already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rc_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("rc_whiteboard_flush_ops".to_string()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
        )
        .map_err(|e| format!("Failed to set whiteboard flush buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `rc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_rooms_active").set(count as f64);
}

/// Metric: `rc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_connections_active").set(count as f64);
}

/// Metric: `rc_actor_mailbox_depth`, labelled by `actor_type`.
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Signaling message handling latency.
///
/// Metric: `rc_message_latency_seconds`
/// Labels: `message_type` (bounded by the `ClientMessage` variants)
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("rc_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}

/// Metric: `rc_producers_total`, labelled by `source`.
pub fn record_producer_created(source: &'static str) {
    counter!("rc_producers_total", "source" => source).increment(1);
}

/// Metric: `rc_producers_closed_total`, labelled by `source`.
pub fn record_producer_closed(source: &'static str) {
    counter!("rc_producers_closed_total", "source" => source).increment(1);
}

/// Streamer decision on a permission request.
///
/// Metric: `rc_permission_decisions_total`
/// Labels: `capability` (audio, video, `screen_share`), `decision`
/// (granted, denied, revoked)
pub fn record_permission_decision(capability: &'static str, decision: &'static str) {
    counter!(
        "rc_permission_decisions_total",
        "capability" => capability,
        "decision" => decision
    )
    .increment(1);
}

/// Metric: `rc_recordings_total`, labelled by `outcome` (completed, failed).
pub fn record_recording(outcome: &'static str) {
    counter!("rc_recordings_total", "outcome" => outcome).increment(1);
}

/// Ops persisted in one whiteboard flush.
///
/// Metric: `rc_whiteboard_flush_ops`
pub fn record_whiteboard_flush(ops: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("rc_whiteboard_flush_ops").record(ops as f64);
}

/// Metric: `rc_actor_panics_total`, labelled by `actor_type`.
///
/// Any non-zero value is a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Outbound events dropped because a connection mailbox was full.
///
/// Metric: `rc_messages_dropped_total`
pub fn record_message_dropped(actor_type: &'static str) {
    counter!("rc_messages_dropped_total", "actor_type" => actor_type).increment(1);
}
