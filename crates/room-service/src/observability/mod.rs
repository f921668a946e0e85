//! Observability module for the Room Service.
//!
//! # Privacy by Default
//!
//! Run loops use `#[instrument(skip_all)]` with explicit safe fields (room id,
//! meeting id, peer id). Passwords and tokens are never recorded.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rs_rooms_active` | Gauge | none | Live rooms in the registry |
//! | `rs_peers_active` | Gauge | none | Peer sessions joined to a room |
//! | `rs_signaling_messages_total` | Counter | `message_type`, `outcome` | Signaling requests handled |
//! | `rs_signaling_latency_seconds` | Histogram | `message_type` | Signaling request latency |
//! | `rs_engine_call_seconds` | Histogram | `operation` | Media engine call latency |
//! | `rs_engine_timeouts_total` | Counter | `operation` | Engine calls that hit the bounded wait |
//! | `rs_waiting_room_decisions_total` | Counter | `decision` | Host admission decisions |
//! | `rs_lifecycle_transitions_total` | Counter | `transition` | Meeting status changes |
//! | `rs_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `rs_slow_peer_evictions_total` | Counter | none | Peers dropped for a full outbound queue |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
