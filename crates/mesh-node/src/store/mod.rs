//! Document store abstraction.
//!
//! The store holds three kinds of state for one room:
//!
//! - the room counter and its version, mutated only through
//!   [`DocumentStore::commit_room`] (optimistic concurrency on the version)
//! - one [`MemberRecord`] per admitted member, observable through
//!   [`DocumentStore::subscribe_members`]
//! - per-recipient signal mailboxes, one per [`SignalKind`]
//!
//! Two implementations ship with the crate: [`InMemoryStore`] for a single
//! process and [`RedisStore`] for real deployments.

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use crate::errors::MeshError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MemberId, MemberRecord, SignalEnvelope, SignalKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consistent read of the counter, its version and one member's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub count: u32,
    pub version: u64,
    pub member: Option<MemberRecord>,
}

/// Member side of a room commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberWrite {
    Put(MemberRecord),
    Delete(MemberId),
}

/// Atomic write applied by [`DocumentStore::commit_room`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomWrite {
    pub count: u32,
    pub member: MemberWrite,
}

/// Result of an optimistic commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The version moved since the snapshot was read; nothing was written.
    Conflict,
}

/// Change event on the member collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemberChange {
    Added { member: MemberRecord },
    Modified { member: MemberRecord },
    Removed { id: MemberId },
}

impl MemberChange {
    pub fn member_id(&self) -> &MemberId {
        match self {
            MemberChange::Added { member } | MemberChange::Modified { member } => &member.id,
            MemberChange::Removed { id } => id,
        }
    }
}

/// Storage backend for admission, presence and signaling.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the counter, version and the given member's record.
    async fn read_room(&self, member_id: &MemberId) -> Result<RoomSnapshot, MeshError>;

    /// Apply `write` only if the room version still equals `expected_version`.
    async fn commit_room(
        &self,
        expected_version: u64,
        write: RoomWrite,
    ) -> Result<CommitOutcome, MeshError>;

    /// Refresh a member's liveness. Returns false if the record no longer exists.
    async fn touch_member(
        &self,
        member_id: &MemberId,
        last_active: DateTime<Utc>,
    ) -> Result<bool, MeshError>;

    async fn list_members(&self) -> Result<Vec<MemberRecord>, MeshError>;

    /// Stream of member changes. Existing members are delivered first as `Added`.
    async fn subscribe_members(&self) -> Result<mpsc::UnboundedReceiver<MemberChange>, MeshError>;

    /// Append an envelope to a recipient's mailbox. Returns the assigned sequence.
    async fn put_signal(
        &self,
        recipient: &MemberId,
        envelope: SignalEnvelope,
    ) -> Result<u64, MeshError>;

    /// Stream of envelopes in one mailbox, backlog first, in creation order.
    async fn subscribe_signals(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, MeshError>;

    /// Remove a consumed envelope. Deleting a missing envelope is not an error.
    async fn delete_signal(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
        envelope_id: &str,
    ) -> Result<(), MeshError>;
}

pub type SharedStore = Arc<dyn DocumentStore>;
