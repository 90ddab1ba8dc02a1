//! Presence heartbeat and ghost detection.
//!
//! A member republishes `last_active` every heartbeat interval. Any observer
//! treats a member whose record is older than the ghost timeout as departed,
//! whether or not it ever sent a leave.

use crate::actors::MeshActorHandle;
use crate::admission::RoomAdmission;
use crate::clock::Clock;
use crate::errors::MeshError;
use crate::observability::metrics;
use crate::store::{MemberChange, SharedStore};
use chrono::{DateTime, Utc};
use common::types::{MemberId, MemberRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// True once `now - last_active` exceeds `ghost_timeout`.
pub fn is_ghost(record: &MemberRecord, now: DateTime<Utc>, ghost_timeout: Duration) -> bool {
    chrono::Duration::from_std(ghost_timeout)
        .is_ok_and(|timeout| now.signed_duration_since(record.last_active) > timeout)
}

/// Effect of a change on the local roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterUpdate {
    Joined,
    Updated,
    Left,
    Unchanged,
}

/// Local view of the member collection.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    members: BTreeMap<MemberId, MemberRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, change: &MemberChange) -> RosterUpdate {
        match change {
            MemberChange::Added { member } | MemberChange::Modified { member } => {
                match self.members.insert(member.id.clone(), member.clone()) {
                    None => RosterUpdate::Joined,
                    Some(previous) if previous == *member => RosterUpdate::Unchanged,
                    Some(_) => RosterUpdate::Updated,
                }
            }
            MemberChange::Removed { id } => match self.members.remove(id) {
                Some(_) => RosterUpdate::Left,
                None => RosterUpdate::Unchanged,
            },
        }
    }

    pub fn get(&self, id: &MemberId) -> Option<&MemberRecord> {
        self.members.get(id)
    }

    /// Members that are online and not ghosts.
    pub fn live(&self, now: DateTime<Utc>, ghost_timeout: Duration) -> Vec<&MemberRecord> {
        self.members
            .values()
            .filter(|record| record.online && !is_ghost(record, now, ghost_timeout))
            .collect()
    }

    pub fn is_live(&self, id: &MemberId, now: DateTime<Utc>, ghost_timeout: Duration) -> bool {
        self.members
            .get(id)
            .is_some_and(|record| record.online && !is_ghost(record, now, ghost_timeout))
    }

    pub fn ghosts(&self, now: DateTime<Utc>, ghost_timeout: Duration) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|record| is_ghost(record, now, ghost_timeout))
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Outcome of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Refreshed,
    /// Our record had been evicted and admission let us back in.
    Rejoined,
    /// Our record had been evicted and the room filled up meanwhile.
    Evicted,
}

/// Periodic liveness refresh for the local member.
pub struct Heartbeat {
    store: SharedStore,
    admission: RoomAdmission,
    member_id: MemberId,
    display_name: String,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Heartbeat {
    pub fn new(
        store: SharedStore,
        admission: RoomAdmission,
        member_id: MemberId,
        display_name: String,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            admission,
            member_id,
            display_name,
            interval,
            clock,
        }
    }

    /// Refresh `last_active`, re-running admission if our record is gone.
    #[instrument(skip_all, fields(member_id = %self.member_id))]
    pub async fn beat(&self) -> Result<Beat, MeshError> {
        if self
            .store
            .touch_member(&self.member_id, self.clock.now())
            .await?
        {
            metrics::record_heartbeat("refreshed");
            return Ok(Beat::Refreshed);
        }

        warn!(
            target: "mesh.presence",
            member_id = %self.member_id,
            "Own membership record missing, rejoining"
        );
        match self.admission.join(&self.member_id, &self.display_name).await {
            Ok(_) => {
                metrics::record_heartbeat("rejoined");
                Ok(Beat::Rejoined)
            }
            Err(MeshError::CapacityExceeded { .. }) => {
                metrics::record_heartbeat("evicted");
                Ok(Beat::Evicted)
            }
            Err(e) => Err(e),
        }
    }

    /// Run until cancelled or evicted.
    pub fn spawn(self, cancel_token: CancellationToken, mesh: MeshActorHandle) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel_token, mesh))
    }

    async fn run(self, cancel_token: CancellationToken, mesh: MeshActorHandle) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            target: "mesh.presence",
            member_id = %self.member_id,
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.beat().await {
                        Ok(Beat::Refreshed) => {
                            debug!(target: "mesh.presence", member_id = %self.member_id, "Heartbeat sent");
                        }
                        Ok(Beat::Rejoined) => {
                            info!(target: "mesh.presence", member_id = %self.member_id, "Rejoined after eviction");
                        }
                        Ok(Beat::Evicted) => {
                            warn!(target: "mesh.presence", member_id = %self.member_id, "Evicted and room is full");
                            if let Err(e) = mesh.evicted().await {
                                debug!(target: "mesh.presence", error = %e, "Coordinator gone");
                            }
                            break;
                        }
                        Err(e) => {
                            // Next tick retries; peers only evict after the ghost timeout
                            warn!(target: "mesh.presence", member_id = %self.member_id, error = %e, "Heartbeat failed");
                            metrics::record_heartbeat("error");
                        }
                    }
                }
            }
        }

        debug!(target: "mesh.presence", member_id = %self.member_id, "Heartbeat stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::RetryPolicy;
    use crate::store::{DocumentStore, InMemoryStore};

    fn record_at(id: &str, last_active: DateTime<Utc>) -> MemberRecord {
        MemberRecord {
            id: MemberId::from(id),
            name: id.to_string(),
            online: true,
            last_active,
            joined_at: last_active,
        }
    }

    #[test]
    fn test_is_ghost_boundary() {
        let now = Utc::now();
        let timeout = Duration::from_secs(12);

        assert!(!is_ghost(&record_at("a", now - chrono::Duration::seconds(12)), now, timeout));
        assert!(is_ghost(
            &record_at("a", now - chrono::Duration::milliseconds(12_001)),
            now,
            timeout
        ));
        assert!(!is_ghost(&record_at("a", now), now, timeout));
    }

    #[test]
    fn test_roster_partitions_live_and_ghosts() {
        let now = Utc::now();
        let timeout = Duration::from_secs(12);
        let mut roster = Roster::new();
        roster.apply(&MemberChange::Added {
            member: record_at("fresh", now),
        });
        roster.apply(&MemberChange::Added {
            member: record_at("stale", now - chrono::Duration::seconds(30)),
        });

        let live: Vec<_> = roster.live(now, timeout).iter().map(|r| r.id.clone()).collect();

        assert_eq!(live, vec![MemberId::from("fresh")]);
        assert_eq!(roster.ghosts(now, timeout), vec![MemberId::from("stale")]);
        assert!(roster.is_live(&MemberId::from("fresh"), now, timeout));
        assert!(!roster.is_live(&MemberId::from("stale"), now, timeout));
    }

    #[test]
    fn test_roster_apply_reports_effect() {
        let now = Utc::now();
        let mut roster = Roster::new();
        let record = record_at("a", now);

        assert_eq!(
            roster.apply(&MemberChange::Added {
                member: record.clone()
            }),
            RosterUpdate::Joined
        );
        assert_eq!(
            roster.apply(&MemberChange::Added {
                member: record.clone()
            }),
            RosterUpdate::Unchanged
        );
        assert_eq!(
            roster.apply(&MemberChange::Modified {
                member: record_at("a", now + chrono::Duration::seconds(5))
            }),
            RosterUpdate::Updated
        );
        let removed = MemberChange::Removed {
            id: MemberId::from("a"),
        };
        assert_eq!(roster.apply(&removed), RosterUpdate::Left);
        assert_eq!(roster.apply(&removed), RosterUpdate::Unchanged);
        assert!(roster.is_empty());
    }

    fn heartbeat(store: &InMemoryStore, clock: Arc<TokioClock>, capacity: u32) -> Heartbeat {
        let shared: SharedStore = Arc::new(store.clone());
        let admission = RoomAdmission::new(
            Arc::clone(&shared),
            capacity,
            RetryPolicy::transaction(),
            clock.clone(),
        );
        Heartbeat::new(
            shared,
            admission,
            MemberId::from("alice"),
            "Alice".to_string(),
            Duration::from_secs(5),
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_beat_refreshes_last_active() {
        let store = InMemoryStore::new();
        let clock = Arc::new(TokioClock::new());
        let heartbeat = heartbeat(&store, clock.clone(), 3);
        heartbeat
            .admission
            .join(&MemberId::from("alice"), "Alice")
            .await
            .unwrap();
        let before = store.member(&MemberId::from("alice")).unwrap().last_active;

        tokio::time::advance(Duration::from_secs(5)).await;
        let beat = heartbeat.beat().await.unwrap();

        assert_eq!(beat, Beat::Refreshed);
        let after = store.member(&MemberId::from("alice")).unwrap().last_active;
        assert_eq!((after - before).num_seconds(), 5);
    }

    #[tokio::test]
    async fn test_beat_rejoins_after_eviction() {
        let store = InMemoryStore::new();
        let heartbeat = heartbeat(&store, Arc::new(TokioClock::new()), 3);

        let beat = heartbeat.beat().await.unwrap();

        assert_eq!(beat, Beat::Rejoined);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_beat_reports_eviction_when_room_filled() {
        let store = InMemoryStore::new();
        let clock = Arc::new(TokioClock::new());
        let heartbeat = heartbeat(&store, clock, 1);
        heartbeat
            .admission
            .join(&MemberId::from("bob"), "Bob")
            .await
            .unwrap();

        let beat = heartbeat.beat().await.unwrap();

        assert_eq!(beat, Beat::Evicted);
        assert!(store.list_members().await.unwrap().iter().all(|m| m.id.as_str() == "bob"));
    }
}
