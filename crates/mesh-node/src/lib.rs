//! Huddle Mesh node library.
//!
//! Coordinates a small full-mesh call (default capacity 3) over a shared
//! document store:
//!
//! - Capacity-bounded admission with optimistic transactions on the room counter
//! - Heartbeat liveness and ghost eviction
//! - Per-recipient signaling mailboxes consumed at most once
//! - One peer link per remote member with a deterministic offerer
//! - Per-link quality tiers and active-speaker election
//!
//! # Architecture
//!
//! ```text
//! MeetingSession
//! ├── RoomAdmission (join / leave / evict_ghost)
//! ├── Heartbeat task
//! ├── member + mailbox forwarders
//! └── MeshActor
//!     ├── Roster
//!     ├── PeerLink per remote (over a PeerTransport)
//!     └── QualityMonitor
//! ```
//!
//! # Modules
//!
//! - [`session`] - session lifecycle, the entry point for applications
//! - [`admission`] - room counter transactions
//! - [`presence`] - heartbeat and ghost detection
//! - [`mailbox`] - signaling envelopes
//! - [`actors`] - the coordinator and link state machine
//! - [`quality`] - quality tiers and active speaker
//! - [`store`] - document store trait, in-memory and Redis implementations
//! - [`transport`] - peer transport trait and the WebRTC implementation

pub mod actors;
pub mod admission;
pub mod clock;
pub mod config;
pub mod errors;
pub mod mailbox;
pub mod media;
pub mod observability;
pub mod presence;
pub mod quality;
pub mod session;
pub mod store;
pub mod transport;
