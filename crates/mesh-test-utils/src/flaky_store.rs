//! Fault-injecting document store.
//!
//! Wraps an [`InMemoryStore`] and can:
//! - fail the next N signal writes, of any kind or of one kind
//! - refuse the next N signal writes with a non-retryable error
//! - freeze a member's heartbeats (touches succeed but change nothing)
//! - yield between the read and the commit of room transactions, so
//!   concurrent joins interleave deterministically

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MemberId, MemberRecord, SignalEnvelope, SignalKind};
use mesh_node::errors::MeshError;
use mesh_node::store::{
    CommitOutcome, DocumentStore, InMemoryStore, MemberChange, RoomSnapshot, RoomWrite,
    SharedStore,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Pending failures for `put_signal`.
#[derive(Debug)]
struct WriteFault {
    /// `None` matches every kind.
    kind: Option<SignalKind>,
    remaining: u32,
    retryable: bool,
}

impl WriteFault {
    fn error(&self) -> MeshError {
        if self.retryable {
            MeshError::Store("injected signal write failure".to_string())
        } else {
            MeshError::Internal("injected signal write refusal".to_string())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    write_faults: Arc<Mutex<Vec<WriteFault>>>,
    frozen: Arc<Mutex<HashSet<MemberId>>>,
    interleave: Arc<AtomicBool>,
}

impl FlakyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for inspection.
    #[must_use]
    pub fn memory(&self) -> &InMemoryStore {
        &self.inner
    }

    #[must_use]
    pub fn shared(&self) -> SharedStore {
        Arc::new(self.clone())
    }

    fn add_fault(&self, kind: Option<SignalKind>, n: u32, retryable: bool) {
        self.write_faults.lock().unwrap().push(WriteFault {
            kind,
            remaining: n,
            retryable,
        });
    }

    /// Fail the next `n` calls to `put_signal` with a retryable store error.
    pub fn fail_next_signal_writes(&self, n: u32) {
        self.add_fault(None, n, true);
    }

    /// Fail the next `n` writes of `kind` envelopes only.
    pub fn fail_next_writes_of(&self, kind: SignalKind, n: u32) {
        self.add_fault(Some(kind), n, true);
    }

    /// Fail the next `n` calls to `put_signal` with an error not worth retrying.
    pub fn refuse_next_signal_writes(&self, n: u32) {
        self.add_fault(None, n, false);
    }

    fn take_write_fault(&self, kind: SignalKind) -> Option<MeshError> {
        let mut faults = self.write_faults.lock().unwrap();
        let fault = faults
            .iter_mut()
            .find(|fault| fault.remaining > 0 && fault.kind.map_or(true, |k| k == kind))?;
        fault.remaining -= 1;
        let error = fault.error();
        faults.retain(|fault| fault.remaining > 0);
        Some(error)
    }

    /// Stop `member`'s heartbeats from reaching the store.
    pub fn freeze_heartbeats(&self, member: &str) {
        self.frozen.lock().unwrap().insert(MemberId::from(member));
    }

    pub fn thaw_heartbeats(&self, member: &str) {
        self.frozen.lock().unwrap().remove(&MemberId::from(member));
    }

    /// Yield to other tasks inside every room transaction.
    pub fn force_interleaving(&self) {
        self.interleave.store(true, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn read_room(&self, member_id: &MemberId) -> Result<RoomSnapshot, MeshError> {
        let snapshot = self.inner.read_room(member_id).await;
        self.maybe_yield().await;
        snapshot
    }

    async fn commit_room(
        &self,
        expected_version: u64,
        write: RoomWrite,
    ) -> Result<CommitOutcome, MeshError> {
        self.maybe_yield().await;
        self.inner.commit_room(expected_version, write).await
    }

    async fn touch_member(
        &self,
        member_id: &MemberId,
        last_active: DateTime<Utc>,
    ) -> Result<bool, MeshError> {
        if self.frozen.lock().unwrap().contains(member_id) {
            // The stalled client believes it is still present
            return Ok(true);
        }
        self.inner.touch_member(member_id, last_active).await
    }

    async fn list_members(&self) -> Result<Vec<MemberRecord>, MeshError> {
        self.inner.list_members().await
    }

    async fn subscribe_members(&self) -> Result<mpsc::UnboundedReceiver<MemberChange>, MeshError> {
        self.inner.subscribe_members().await
    }

    async fn put_signal(
        &self,
        recipient: &MemberId,
        envelope: SignalEnvelope,
    ) -> Result<u64, MeshError> {
        if let Some(error) = self.take_write_fault(envelope.kind) {
            return Err(error);
        }
        self.inner.put_signal(recipient, envelope).await
    }

    async fn subscribe_signals(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, MeshError> {
        self.inner.subscribe_signals(recipient, kind).await
    }

    async fn delete_signal(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
        envelope_id: &str,
    ) -> Result<(), MeshError> {
        self.inner.delete_signal(recipient, kind, envelope_id).await
    }
}
