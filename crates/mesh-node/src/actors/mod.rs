//! Actor model for the mesh node.
//!
//! ```text
//! MeetingSession
//! ├── MeshActor (one per session, owns roster, links and quality state)
//! │   └── PeerLink (one per remote member, driven only by the actor)
//! ├── Heartbeat task (refreshes our record, reports eviction)
//! └── forwarders (member subscription + three signal mailboxes -> actor)
//! ```
//!
//! # Modules
//!
//! - [`mesh`] - `MeshActor` and its handle
//! - [`link`] - per-remote link state machine
//! - [`messages`] - message, event and view types
//! - [`metrics`] - mailbox monitoring

pub mod link;
pub mod mesh;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use link::{should_offer, LinkState, PeerLink};
pub use mesh::{MeshActor, MeshActorHandle, MeshActorParams};
pub use messages::*;
pub use metrics::{MailboxLevel, MailboxMonitor};
