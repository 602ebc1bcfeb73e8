//! Observability for the Call Controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded; free-form values such as administrative end
//! reasons are folded into a fixed set before they become labels.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cc_calls_active` | Gauge | none | Live call sessions |
//! | `cc_call_transitions_total` | Counter | `transition` | Committed state transitions |
//! | `cc_calls_ended_total` | Counter | `reason` | Ended calls by reason |
//! | `cc_call_duration_seconds` | Histogram | none | Call length |
//! | `cc_call_records_persisted_total` | Counter | `status` | Record persistence outcome |
//! | `cc_media_operation_latency_seconds` | Histogram | `operation` | Media engine latency |
//! | `cc_router_count` | Gauge | `worker` | Routers per media worker |
//! | `cc_signaling_latency_seconds` | Histogram | `event` | Signaling handling latency |
//! | `cc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
