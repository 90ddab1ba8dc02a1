//! Observability for the mesh node.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Member ids appear in logs but never as metric labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `mesh_admissions_total` | Counter | `outcome` |
//! | `mesh_departures_total` | Counter | `reason` |
//! | `mesh_room_txn_conflicts_total` | Counter | `operation` |
//! | `mesh_room_txn_duration_seconds` | Histogram | `operation` |
//! | `mesh_heartbeats_total` | Counter | `status` |
//! | `mesh_members_online` | Gauge | none |
//! | `mesh_ghosts_detected_total` | Counter | none |
//! | `mesh_signals_sent_total` | Counter | `kind`, `status` |
//! | `mesh_signals_consumed_total` | Counter | `kind`, `status` |
//! | `mesh_link_transitions_total` | Counter | `state` |
//! | `mesh_links_active` | Gauge | none |
//! | `mesh_reconnecting` | Gauge | none |
//! | `mesh_actor_mailbox_depth` | Gauge | `actor_type` |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
