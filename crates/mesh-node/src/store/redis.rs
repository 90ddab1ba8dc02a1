//! Redis-backed document store.
//!
//! # Key Patterns
//!
//! - `mesh:{room}:version` - Room version (optimistic concurrency token)
//! - `mesh:{room}:count` - Room counter
//! - `mesh:{room}:members` - Member records (HASH, id -> JSON)
//! - `mesh:{room}:members:events` - Member change channel (PUBLISH)
//! - `mesh:{room}:signal_seq` - Envelope sequence (monotonic counter)
//! - `mesh:{room}:mailbox:{recipient}:{kind}` - Mailbox (HASH, envelope id -> JSON)
//! - `mesh:{room}:mailbox:{recipient}:{kind}:events` - Mailbox channel (PUBLISH)
//!
//! # Connection Pattern
//!
//! Commands share one `MultiplexedConnection`, cloned per operation. Each
//! subscription opens its own pub/sub connection and subscribes *before*
//! reading the backlog, so no change can slip between the two.

use super::lua_scripts;
use super::{
    CommitOutcome, DocumentStore, MemberChange, MemberWrite, RoomSnapshot, RoomWrite,
};
use crate::errors::MeshError;
use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use common::types::{MemberId, MemberRecord, SignalEnvelope, SignalKind};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

/// Mailboxes abandoned by crashed senders expire after an hour.
const MAILBOX_TTL_SECONDS: u64 = 3_600;

/// Redis document store for one room.
///
/// Cheaply cloneable; the underlying `MultiplexedConnection` is designed to be
/// shared across tasks.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    room_id: String,
    commit_room_script: Script,
    touch_member_script: Script,
    send_signal_script: Script,
}

impl RedisStore {
    /// Connect to Redis and scope every key to `room_id`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Store` if the connection fails.
    pub async fn connect(redis_url: &str, room_id: &str) -> Result<Self, MeshError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Note: Do NOT log redis_url as it may contain credentials
            error!(target: "mesh.store.redis", error = %e, "Failed to open Redis client");
            MeshError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "mesh.store.redis", error = %e, "Failed to connect to Redis");
                MeshError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            room_id: room_id.to_string(),
            commit_room_script: Script::new(lua_scripts::COMMIT_ROOM),
            touch_member_script: Script::new(lua_scripts::TOUCH_MEMBER),
            send_signal_script: Script::new(lua_scripts::SEND_SIGNAL),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("mesh:{}:{suffix}", self.room_id)
    }

    fn members_key(&self) -> String {
        self.key("members")
    }

    fn members_channel(&self) -> String {
        self.key("members:events")
    }

    fn mailbox_key(&self, recipient: &MemberId, kind: SignalKind) -> String {
        self.key(&format!("mailbox:{recipient}:{}", kind.as_str()))
    }

    fn mailbox_channel(&self, recipient: &MemberId, kind: SignalKind) -> String {
        format!("{}:events", self.mailbox_key(recipient, kind))
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<PubSub, MeshError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            warn!(target: "mesh.store.redis", error = %e, "Failed to open pub/sub connection");
            MeshError::Store(format!("Failed to open pub/sub connection: {e}"))
        })?;
        pubsub.subscribe(channel).await.map_err(|e| {
            warn!(target: "mesh.store.redis", error = %e, channel = %channel, "Failed to subscribe");
            MeshError::Store(format!("Failed to subscribe: {e}"))
        })?;
        Ok(pubsub)
    }
}

fn decode<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, MeshError> {
    serde_json::from_str(raw).map_err(|e| MeshError::Store(format!("Malformed {what}: {e}")))
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<String, MeshError> {
    serde_json::to_string(value).map_err(|e| MeshError::Store(format!("Failed to encode {what}: {e}")))
}

/// Forward pub/sub payloads into `tx` until the receiver is dropped.
///
/// `accept` filters out payloads that were already delivered from the backlog.
fn spawn_forwarder<T, F>(pubsub: PubSub, tx: mpsc::UnboundedSender<T>, what: &'static str, mut accept: F)
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut messages = Box::pin(pubsub.into_on_message());
        loop {
            tokio::select! {
                () = tx.closed() => break,
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!(target: "mesh.store.redis", what, "Pub/sub stream ended");
                        break;
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(target: "mesh.store.redis", what, error = %e, "Unreadable pub/sub payload");
                            continue;
                        }
                    };
                    match decode::<T>(&payload, what) {
                        Ok(item) if accept(&item) => {
                            if tx.send(item).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "mesh.store.redis", what, error = %e, "Dropping malformed event");
                        }
                    }
                }
            }
        }
        debug!(target: "mesh.store.redis", what, "Subscription closed");
    });
}

#[async_trait]
impl DocumentStore for RedisStore {
    #[instrument(skip_all, fields(member_id = %member_id))]
    async fn read_room(&self, member_id: &MemberId) -> Result<RoomSnapshot, MeshError> {
        let mut conn = self.connection.clone();

        let (version, count, member): (Option<u64>, Option<u32>, Option<String>) =
            ::redis::pipe()
                .atomic()
                .get(self.key("version"))
                .get(self.key("count"))
                .hget(self.members_key(), member_id.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(target: "mesh.store.redis", error = %e, "Failed to read room");
                    MeshError::Store(format!("Failed to read room: {e}"))
                })?;

        Ok(RoomSnapshot {
            count: count.unwrap_or(0),
            version: version.unwrap_or(0),
            member: member
                .map(|raw| decode::<MemberRecord>(&raw, "member record"))
                .transpose()?,
        })
    }

    #[instrument(skip_all, fields(expected_version = expected_version, count = write.count))]
    async fn commit_room(
        &self,
        expected_version: u64,
        write: RoomWrite,
    ) -> Result<CommitOutcome, MeshError> {
        let mut conn = self.connection.clone();

        let (op, member_id, record_json) = match &write.member {
            MemberWrite::Put(record) => ("put", record.id.clone(), encode(record, "member record")?),
            MemberWrite::Delete(id) => ("delete", id.clone(), String::new()),
        };

        let result: i32 = self
            .commit_room_script
            .key(self.key("version"))
            .key(self.key("count"))
            .key(self.members_key())
            .arg(expected_version)
            .arg(write.count)
            .arg(op)
            .arg(member_id.as_str())
            .arg(record_json)
            .arg(self.members_channel())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "mesh.store.redis", error = %e, "Room commit failed");
                MeshError::Store(format!("Room commit failed: {e}"))
            })?;

        match result {
            1 => Ok(CommitOutcome::Committed),
            0 => {
                debug!(target: "mesh.store.redis", expected_version, "Room commit conflicted");
                Ok(CommitOutcome::Conflict)
            }
            _ => Err(MeshError::Store(
                "Room commit rejected its arguments".to_string(),
            )),
        }
    }

    #[instrument(skip_all, fields(member_id = %member_id))]
    async fn touch_member(
        &self,
        member_id: &MemberId,
        last_active: DateTime<Utc>,
    ) -> Result<bool, MeshError> {
        let mut conn = self.connection.clone();

        let result: i32 = self
            .touch_member_script
            .key(self.key("version"))
            .key(self.members_key())
            .arg(member_id.as_str())
            .arg(last_active.to_rfc3339_opts(SecondsFormat::Millis, true))
            .arg(self.members_channel())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "mesh.store.redis", error = %e, "Heartbeat write failed");
                MeshError::Store(format!("Heartbeat write failed: {e}"))
            })?;

        Ok(result == 1)
    }

    async fn list_members(&self) -> Result<Vec<MemberRecord>, MeshError> {
        let mut conn = self.connection.clone();

        let raw: HashMap<String, String> = conn.hgetall(self.members_key()).await.map_err(|e| {
            warn!(target: "mesh.store.redis", error = %e, "Failed to list members");
            MeshError::Store(format!("Failed to list members: {e}"))
        })?;

        raw.values()
            .map(|json| decode::<MemberRecord>(json, "member record"))
            .collect()
    }

    async fn subscribe_members(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<MemberChange>, MeshError> {
        let pubsub = self.subscribe_channel(&self.members_channel()).await?;
        let backlog = self.list_members().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        for member in backlog {
            let _ = tx.send(MemberChange::Added { member });
        }
        spawn_forwarder(pubsub, tx, "member change", |_: &MemberChange| true);
        Ok(rx)
    }

    #[instrument(skip_all, fields(recipient = %recipient, kind = envelope.kind.as_str()))]
    async fn put_signal(
        &self,
        recipient: &MemberId,
        envelope: SignalEnvelope,
    ) -> Result<u64, MeshError> {
        let mut conn = self.connection.clone();
        let payload = encode(&envelope, "envelope")?;

        let seq: u64 = self
            .send_signal_script
            .key(self.key("signal_seq"))
            .key(self.mailbox_key(recipient, envelope.kind))
            .arg(&envelope.id)
            .arg(payload)
            .arg(self.mailbox_channel(recipient, envelope.kind))
            .arg(MAILBOX_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "mesh.store.redis", error = %e, "Signal write failed");
                MeshError::SignalingWrite(format!("Signal write failed: {e}"))
            })?;

        Ok(seq)
    }

    #[instrument(skip_all, fields(recipient = %recipient, kind = kind.as_str()))]
    async fn subscribe_signals(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, MeshError> {
        let pubsub = self
            .subscribe_channel(&self.mailbox_channel(recipient, kind))
            .await?;

        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(self.mailbox_key(recipient, kind))
            .await
            .map_err(|e| {
                warn!(target: "mesh.store.redis", error = %e, "Failed to read mailbox backlog");
                MeshError::Store(format!("Failed to read mailbox backlog: {e}"))
            })?;

        let mut backlog: Vec<SignalEnvelope> = raw
            .values()
            .filter_map(|json| match decode::<SignalEnvelope>(json, "envelope") {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(target: "mesh.store.redis", error = %e, "Skipping malformed envelope");
                    None
                }
            })
            .collect();
        backlog.sort_by_key(|envelope| envelope.seq);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut seen: HashSet<String> = HashSet::with_capacity(backlog.len());
        for envelope in backlog {
            seen.insert(envelope.id.clone());
            let _ = tx.send(envelope);
        }
        // Envelopes published between SUBSCRIBE and HGETALL arrive twice
        spawn_forwarder(pubsub, tx, "envelope", move |envelope: &SignalEnvelope| {
            !seen.remove(&envelope.id)
        });
        Ok(rx)
    }

    async fn delete_signal(
        &self,
        recipient: &MemberId,
        kind: SignalKind,
        envelope_id: &str,
    ) -> Result<(), MeshError> {
        let mut conn = self.connection.clone();

        let _: i64 = conn
            .hdel(self.mailbox_key(recipient, kind), envelope_id)
            .await
            .map_err(|e| {
                warn!(target: "mesh.store.redis", error = %e, "Signal delete failed");
                MeshError::SignalingWrite(format!("Signal delete failed: {e}"))
            })?;
        Ok(())
    }
}
