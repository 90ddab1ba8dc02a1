//! In-process document store.
//!
//! Serializes every operation behind one mutex, which gives the same
//! optimistic-commit semantics as the Redis scripts. Clones share state, so
//! several sessions in one process can meet in the same room.

use super::{
    CommitOutcome, DocumentStore, MemberChange, MemberWrite, RoomSnapshot, RoomWrite,
};
use crate::errors::MeshError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MemberId, MemberRecord, SignalEnvelope, SignalKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Record of one successful `put_signal`, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSignal {
    pub recipient: MemberId,
    pub kind: SignalKind,
    pub sender_id: MemberId,
    pub envelope_id: String,
}

type MailboxKey = (MemberId, SignalKind);

#[derive(Debug, Default)]
struct Inner {
    count: u32,
    version: u64,
    members: BTreeMap<MemberId, MemberRecord>,
    member_watchers: Vec<mpsc::UnboundedSender<MemberChange>>,
    next_seq: u64,
    mailboxes: HashMap<MailboxKey, BTreeMap<u64, SignalEnvelope>>,
    signal_watchers: HashMap<MailboxKey, Vec<mpsc::UnboundedSender<SignalEnvelope>>>,
    sent: Vec<SentSignal>,
}

impl Inner {
    fn publish_member(&mut self, change: &MemberChange) {
        self.member_watchers
            .retain(|watcher| watcher.send(change.clone()).is_ok());
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current room counter.
    pub fn count(&self) -> u32 {
        self.lock().count
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn member(&self, id: &MemberId) -> Option<MemberRecord> {
        self.lock().members.get(id).cloned()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.lock().members.keys().cloned().collect()
    }

    /// Envelopes currently waiting in one mailbox, in creation order.
    pub fn mailbox(&self, recipient: &MemberId, kind: SignalKind) -> Vec<SignalEnvelope> {
        self.lock()
            .mailboxes
            .get(&(recipient.clone(), kind))
            .map(|mailbox| mailbox.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every envelope ever written, in write order.
    pub fn sent_signals(&self) -> Vec<SentSignal> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn read_room(&self, member_id: &MemberId) -> Result<RoomSnapshot, MeshError> {
        let inner = self.lock();
        Ok(RoomSnapshot {
            count: inner.count,
            version: inner.version,
            member: inner.members.get(member_id).cloned(),
        })
    }

    async fn commit_room(
        &self,
        expected_version: u64,
        write: RoomWrite,
    ) -> Result<CommitOutcome, MeshError> {
        let mut inner = self.lock();
        if inner.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }

        inner.count = write.count;
        inner.version += 1;

        let change = match write.member {
            MemberWrite::Put(member) => {
                if inner.members.insert(member.id.clone(), member.clone()).is_some() {
                    MemberChange::Modified { member }
                } else {
                    MemberChange::Added { member }
                }
            }
            MemberWrite::Delete(id) => {
                if inner.members.remove(&id).is_none() {
                    return Ok(CommitOutcome::Committed);
                }
                MemberChange::Removed { id }
            }
        };
        inner.publish_member(&change);

        Ok(CommitOutcome::Committed)
    }

    async fn touch_member(
        &self,
        member_id: &MemberId,
        last_active: DateTime<Utc>,
    ) -> Result<bool, MeshError> {
        let mut inner = self.lock();
        let Some(record) = inner.members.get_mut(member_id) else {
            return Ok(false);
        };
        record.online = true;
        record.last_active = last_active;
        let change = MemberChange::Modified {
            member: record.clone(),
        };
        // Touches move the version so a concurrent ghost eviction re-reads.
        inner.version += 1;
        inner.publish_member(&change);
        Ok(true)
    }

    async fn list_members(&self) -> Result<Vec<MemberRecord>, MeshError> {
        Ok(self.lock().members.values().cloned().collect())
    }

    async fn subscribe_members(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<MemberChange>, MeshError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for member in inner.members.values() {
            // Receiver is still held here, send cannot fail
            let _ = tx.send(MemberChange::Added {
                member: member.clone(),
            });
        }
        inner.member_watchers.push(tx);
        Ok(rx)
    }

    async fn put_signal(
        &self,
        recipient: &MemberId,
        mut envelope: SignalEnvelope,
    ) -> Result<u64, MeshError> {
        let mut inner = self.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        envelope.seq = seq;

        let key = (recipient.clone(), envelope.kind);
        inner.sent.push(SentSignal {
            recipient: recipient.clone(),
            kind: envelope.kind,
            sender_id: envelope.sender_id.clone(),
            envelope_id: envelope.id.clone(),
        });
        inner
            .mailboxes
            .entry(key.clone())
            .or_default()
            .insert(seq, envelope.clone());
        if let Some(watchers) = inner.signal_watchers.get_mut(&key) {
            watchers.retain(|watcher| watcher.send(envelope.clone()).is_ok());
        }
        Ok(seq)
    }

    async fn subscribe_signals(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, MeshError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (recipient.clone(), kind);
        let mut inner = self.lock();
        if let Some(backlog) = inner.mailboxes.get(&key) {
            for envelope in backlog.values() {
                let _ = tx.send(envelope.clone());
            }
        }
        inner.signal_watchers.entry(key).or_default().push(tx);
        Ok(rx)
    }

    async fn delete_signal(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
        envelope_id: &str,
    ) -> Result<(), MeshError> {
        let mut inner = self.lock();
        if let Some(mailbox) = inner.mailboxes.get_mut(&(recipient.clone(), kind)) {
            mailbox.retain(|_, envelope| envelope.id != envelope_id);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(id: &str) -> MemberRecord {
        MemberRecord::admitted(MemberId::from(id), id.to_uppercase(), Utc::now())
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = InMemoryStore::new();
        let snapshot = store.read_room(&MemberId::from("alice")).await.unwrap();

        let first = store
            .commit_room(
                snapshot.version,
                RoomWrite {
                    count: 1,
                    member: MemberWrite::Put(record("alice")),
                },
            )
            .await
            .unwrap();
        let second = store
            .commit_room(
                snapshot.version,
                RoomWrite {
                    count: 1,
                    member: MemberWrite::Put(record("bob")),
                },
            )
            .await
            .unwrap();

        assert_eq!(first, CommitOutcome::Committed);
        assert_eq!(second, CommitOutcome::Conflict);
        assert_eq!(store.count(), 1);
        assert!(store.member(&MemberId::from("bob")).is_none());
    }

    #[tokio::test]
    async fn test_member_subscription_replays_then_streams() {
        let store = InMemoryStore::new();
        store
            .commit_room(
                0,
                RoomWrite {
                    count: 1,
                    member: MemberWrite::Put(record("alice")),
                },
            )
            .await
            .unwrap();

        let mut changes = store.subscribe_members().await.unwrap();
        store
            .commit_room(
                1,
                RoomWrite {
                    count: 0,
                    member: MemberWrite::Delete(MemberId::from("alice")),
                },
            )
            .await
            .unwrap();

        assert!(matches!(changes.recv().await, Some(MemberChange::Added { .. })));
        assert!(matches!(changes.recv().await, Some(MemberChange::Removed { ref id }) if id.as_str() == "alice"));
    }

    #[tokio::test]
    async fn test_touch_missing_member_returns_false() {
        let store = InMemoryStore::new();

        let touched = store
            .touch_member(&MemberId::from("ghost"), Utc::now())
            .await
            .unwrap();

        assert!(!touched);
        assert_eq!(store.version(), 0);
    }

    #[tokio::test]
    async fn test_touch_moves_version() {
        let store = InMemoryStore::new();
        store
            .commit_room(
                0,
                RoomWrite {
                    count: 1,
                    member: MemberWrite::Put(record("alice")),
                },
            )
            .await
            .unwrap();

        assert!(store
            .touch_member(&MemberId::from("alice"), Utc::now())
            .await
            .unwrap());

        assert_eq!(store.version(), 2);
    }

    #[tokio::test]
    async fn test_signal_backlog_then_live_in_order() {
        let store = InMemoryStore::new();
        let bob = MemberId::from("bob");
        let first = SignalEnvelope::candidate(MemberId::from("alice"), "c1".to_string());
        store.put_signal(&bob, first.clone()).await.unwrap();

        let mut rx = store
            .subscribe_signals(&bob, SignalKind::Candidate)
            .await
            .unwrap();
        let second = SignalEnvelope::candidate(MemberId::from("alice"), "c2".to_string());
        store.put_signal(&bob, second.clone()).await.unwrap();

        let got_first = rx.recv().await.unwrap();
        let got_second = rx.recv().await.unwrap();
        assert_eq!(got_first.id, first.id);
        assert_eq!(got_second.id, second.id);
        assert!(got_first.seq < got_second.seq);
    }

    #[tokio::test]
    async fn test_mailboxes_are_scoped_by_recipient_and_kind() {
        let store = InMemoryStore::new();
        let bob = MemberId::from("bob");
        let offer = SignalEnvelope::offer(MemberId::from("alice"), "Alice", "sdp".to_string());
        store.put_signal(&bob, offer).await.unwrap();

        assert_eq!(store.mailbox(&bob, SignalKind::Offer).len(), 1);
        assert!(store.mailbox(&bob, SignalKind::Answer).is_empty());
        assert!(store
            .mailbox(&MemberId::from("carol"), SignalKind::Offer)
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_signal_is_idempotent() {
        let store = InMemoryStore::new();
        let bob = MemberId::from("bob");
        let envelope = SignalEnvelope::answer(MemberId::from("alice"), "sdp".to_string());
        store.put_signal(&bob, envelope.clone()).await.unwrap();

        store
            .delete_signal(&bob, SignalKind::Answer, &envelope.id)
            .await
            .unwrap();
        store
            .delete_signal(&bob, SignalKind::Answer, &envelope.id)
            .await
            .unwrap();

        assert!(store.mailbox(&bob, SignalKind::Answer).is_empty());
    }
}
