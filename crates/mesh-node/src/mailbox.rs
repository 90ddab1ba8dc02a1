//! Signaling mailbox.
//!
//! Each member has three mailboxes (offers, answers, candidates). Envelopes
//! are consumed by applying their effect and then deleting them; the delete is
//! the acknowledgement. A crash between apply and delete can re-deliver an
//! envelope, so the consumed log makes a repeated id a no-op and every apply
//! checks negotiation state before acting.

use crate::actors::MeshActorHandle;
use crate::config::RetryPolicy;
use crate::errors::MeshError;
use crate::observability::metrics;
use crate::store::SharedStore;
use common::types::{MemberId, SignalEnvelope, SignalKind};
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default number of consumed envelope ids remembered.
pub const DEFAULT_CONSUMED_LOG_CAPACITY: usize = 1_024;

/// Bounded set of recently consumed envelope ids (oldest evicted first).
#[derive(Debug)]
pub struct ConsumedLog {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ConsumedLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an id. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Send side and acknowledgement bookkeeping for the local member's mailboxes.
pub struct SignalMailbox {
    store: SharedStore,
    local_id: MemberId,
    retry: RetryPolicy,
    consumed: ConsumedLog,
}

impl SignalMailbox {
    pub fn new(store: SharedStore, local_id: MemberId, retry: RetryPolicy) -> Self {
        Self {
            store,
            local_id,
            retry,
            consumed: ConsumedLog::new(DEFAULT_CONSUMED_LOG_CAPACITY),
        }
    }

    pub fn local_id(&self) -> &MemberId {
        &self.local_id
    }

    /// Write `envelope` into `recipient`'s mailbox with bounded retry.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::SignalingWrite` once every attempt has failed, or
    /// at the first error that retrying cannot fix.
    #[instrument(skip_all, fields(recipient = %recipient, kind = envelope.kind.as_str()))]
    pub async fn send(
        &self,
        recipient: &MemberId,
        envelope: SignalEnvelope,
    ) -> Result<(), MeshError> {
        let kind = envelope.kind;
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            match self.store.put_signal(recipient, envelope.clone()).await {
                Ok(seq) => {
                    debug!(
                        target: "mesh.mailbox",
                        recipient = %recipient,
                        kind = kind.as_str(),
                        seq,
                        "Envelope sent"
                    );
                    metrics::record_signal_sent(kind.as_str(), "success");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target: "mesh.mailbox",
                        recipient = %recipient,
                        kind = kind.as_str(),
                        attempt,
                        error = %e,
                        "Envelope write failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        metrics::record_signal_sent(kind.as_str(), "error");
        Err(MeshError::SignalingWrite(format!(
            "{} to {recipient} not delivered: {}",
            kind.as_str(),
            last_error.map_or_else(|| "no attempts".to_string(), |e| e.to_string())
        )))
    }

    /// True if this envelope id has already been consumed.
    pub fn already_consumed(&self, envelope_id: &str) -> bool {
        self.consumed.contains(envelope_id)
    }

    /// Mark an applied envelope consumed and delete it from the store.
    ///
    /// The id is recorded before the delete so a failed delete still cannot
    /// cause a second apply.
    #[instrument(skip_all, fields(kind = envelope.kind.as_str(), sender = %envelope.sender_id))]
    pub async fn acknowledge(&mut self, envelope: &SignalEnvelope) -> Result<(), MeshError> {
        if self.consumed.insert(&envelope.id) {
            metrics::record_signal_consumed(envelope.kind.as_str(), "applied");
        }

        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            match self
                .store
                .delete_signal(&self.local_id, envelope.kind, &envelope.id)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        target: "mesh.mailbox",
                        kind = envelope.kind.as_str(),
                        attempt,
                        error = %e,
                        "Envelope delete failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(MeshError::SignalingWrite(format!(
            "delete of {} envelope failed: {}",
            envelope.kind.as_str(),
            last_error.map_or_else(|| "no attempts".to_string(), |e| e.to_string())
        )))
    }

    /// Delete a re-delivered envelope without applying it again.
    pub async fn discard_duplicate(&self, envelope: &SignalEnvelope) {
        metrics::record_signal_consumed(envelope.kind.as_str(), "duplicate");
        if let Err(e) = self
            .store
            .delete_signal(&self.local_id, envelope.kind, &envelope.id)
            .await
        {
            debug!(target: "mesh.mailbox", error = %e, "Duplicate envelope delete failed");
        }
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }
}

/// Open all three mailbox subscriptions for `recipient`.
pub async fn subscribe_all(
    store: &SharedStore,
    recipient: &MemberId,
) -> Result<Vec<(SignalKind, mpsc::UnboundedReceiver<SignalEnvelope>)>, MeshError> {
    let mut subscriptions = Vec::with_capacity(SignalKind::ALL.len());
    for kind in SignalKind::ALL {
        subscriptions.push((kind, store.subscribe_signals(recipient, kind).await?));
    }
    Ok(subscriptions)
}

/// Forward one mailbox subscription to the coordinator until cancelled.
pub fn spawn_forwarder(
    kind: SignalKind,
    mut envelopes: mpsc::UnboundedReceiver<SignalEnvelope>,
    mesh: MeshActorHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                envelope = envelopes.recv() => {
                    let Some(envelope) = envelope else {
                        warn!(target: "mesh.mailbox", kind = kind.as_str(), "Mailbox subscription ended");
                        break;
                    };
                    if mesh.signal_received(envelope).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(target: "mesh.mailbox", kind = kind.as_str(), "Mailbox forwarder stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, InMemoryStore};
    use std::sync::Arc;

    #[test]
    fn test_consumed_log_rejects_repeats() {
        let mut log = ConsumedLog::new(8);

        assert!(log.insert("env-1"));
        assert!(!log.insert("env-1"));
        assert!(log.contains("env-1"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_consumed_log_evicts_oldest() {
        let mut log = ConsumedLog::new(2);
        log.insert("a");
        log.insert("b");
        log.insert("c");

        assert!(!log.contains("a"));
        assert!(log.contains("b"));
        assert!(log.contains("c"));
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_send_then_acknowledge_empties_mailbox() {
        let store = InMemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let alice = MemberId::from("alice");
        let bob = MemberId::from("bob");
        let sender = SignalMailbox::new(Arc::clone(&shared), alice.clone(), RetryPolicy::signaling());
        let mut receiver = SignalMailbox::new(shared, bob.clone(), RetryPolicy::signaling());

        let envelope = SignalEnvelope::offer(alice, "Alice", "v=0".to_string());
        sender.send(&bob, envelope.clone()).await.unwrap();
        assert_eq!(store.mailbox(&bob, SignalKind::Offer).len(), 1);

        receiver.acknowledge(&envelope).await.unwrap();

        assert!(store.mailbox(&bob, SignalKind::Offer).is_empty());
        assert!(receiver.already_consumed(&envelope.id));
        assert_eq!(receiver.consumed_count(), 1);
    }

    #[tokio::test]
    async fn test_acknowledging_twice_counts_once() {
        let store = InMemoryStore::new();
        let bob = MemberId::from("bob");
        let mut receiver = SignalMailbox::new(Arc::new(store), bob, RetryPolicy::signaling());
        let envelope = SignalEnvelope::answer(MemberId::from("alice"), "v=0".to_string());

        receiver.acknowledge(&envelope).await.unwrap();
        receiver.acknowledge(&envelope).await.unwrap();

        assert_eq!(receiver.consumed_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_opens_three_mailboxes() {
        let store = InMemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let bob = MemberId::from("bob");
        let candidate = SignalEnvelope::candidate(MemberId::from("alice"), "c".to_string());
        store.put_signal(&bob, candidate.clone()).await.unwrap();

        let mut subscriptions = subscribe_all(&shared, &bob).await.unwrap();

        assert_eq!(subscriptions.len(), 3);
        let (kind, rx) = subscriptions
            .iter_mut()
            .find(|(kind, _)| *kind == SignalKind::Candidate)
            .unwrap();
        assert_eq!(*kind, SignalKind::Candidate);
        assert_eq!(rx.recv().await.unwrap().id, candidate.id);
    }
}
