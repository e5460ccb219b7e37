//! Observability for the Room Controller.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit safe fields.
//! Metric labels are bounded enums (actor type, media source, capability,
//! outcome, message type); session and user ids never become labels.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rc_rooms_active` | Gauge | none | Live room actors |
//! | `rc_connections_active` | Gauge | none | Live signaling sockets |
//! | `rc_message_latency_seconds` | Histogram | `message_type` | Signaling handling latency |
//! | `rc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `rc_producers_total` | Counter | `source` | Producers created |
//! | `rc_producers_closed_total` | Counter | `source` | Producers closed |
//! | `rc_permission_decisions_total` | Counter | `capability`, `decision` | Streamer answers |
//! | `rc_recordings_total` | Counter | `outcome` | Finished recordings |
//! | `rc_whiteboard_flush_ops` | Histogram | none | Ops per flushed batch |
//! | `rc_actor_panics_total` | Counter | `actor_type` | Actor panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
