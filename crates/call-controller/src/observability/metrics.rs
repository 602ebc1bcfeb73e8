//! Metrics definitions for the Call Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix for Call Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (controller, call, pipeline)
//! - `transition`: bounded by participant statuses and call states (~10 values)
//! - `reason`: end reasons, unknown administrative reasons fold into `other`
//! - `operation`: media operations (5 values)
//! - `worker`: bounded by the configured pool size
//! - `event`: signaling event kinds (9 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Media engine calls are in-cluster RPCs
        .set_buckets_for_metric(
            Matcher::Prefix("cc_media".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set media latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("cc_signaling".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        // Call durations span seconds to hours
        .set_buckets_for_metric(
            Matcher::Full("cc_call_duration_seconds".to_string()),
            &[
                5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
            ],
        )
        .map_err(|e| format!("Failed to set call duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Call Metrics
// ============================================================================

/// Set the number of live call sessions.
///
/// Metric: `cc_calls_active`
pub fn set_calls_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_calls_active").set(count as f64);
}

/// Record a committed state transition.
///
/// Metric: `cc_call_transitions_total`
/// Labels: `transition` (participant status or call state entered)
pub fn record_call_transition(transition: &'static str) {
    counter!("cc_call_transitions_total", "transition" => transition).increment(1);
}

/// Record an ended call.
///
/// Metrics: `cc_calls_ended_total` (labels: `reason`), `cc_call_duration_seconds`
pub fn record_call_ended(reason: &str, duration_seconds: u64) {
    let reason = match reason {
        "completed" | "unanswered" | "timeout" | "media_failure" | "shutdown" => {
            reason.to_string()
        }
        _ => "other".to_string(),
    };
    counter!("cc_calls_ended_total", "reason" => reason).increment(1);
    #[allow(clippy::cast_precision_loss)]
    histogram!("cc_call_duration_seconds").record(duration_seconds as f64);
}

/// Record call record persistence outcome.
///
/// Metric: `cc_call_records_persisted_total`
/// Labels: `status` (success, failure)
pub fn record_call_record_persisted(status: &'static str) {
    counter!("cc_call_records_persisted_total", "status" => status).increment(1);
}

// ============================================================================
// Media Metrics
// ============================================================================

/// Record media engine operation latency.
///
/// Metric: `cc_media_operation_latency_seconds`
/// Labels: `operation` (create_router, attach_participant, detach_participant, release_router)
pub fn record_media_operation(operation: &'static str, duration: Duration) {
    histogram!("cc_media_operation_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Set the router count hosted by a worker.
///
/// Metric: `cc_router_count`
/// Labels: `worker` (pool index)
pub fn set_worker_router_count(worker: usize, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_router_count", "worker" => worker.to_string()).set(count as f64);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record signaling event handling latency.
///
/// Metric: `cc_signaling_latency_seconds`
/// Labels: `event`
pub fn record_signaling_latency(event: &'static str, duration: Duration) {
    histogram!("cc_signaling_latency_seconds", "event" => event).record(duration.as_secs_f64());
}

/// Record a rejected signaling event.
///
/// Metric: `cc_errors_total`
/// Labels: `event`, `error_type`, `error_code`
pub fn record_error(event: &'static str, error_type: &'static str, error_code: i32) {
    counter!("cc_errors_total",
        "event" => event,
        "error_type" => error_type,
        "error_code" => error_code.to_string()
    )
    .increment(1);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `cc_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Record an actor panic. Any non-zero value is a bug.
///
/// Metric: `cc_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("cc_actor_panics_total", "actor_type" => actor_type).increment(1);
}
