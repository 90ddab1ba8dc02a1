//! Capacity-bounded room admission.
//!
//! Every operation is one optimistic read-modify-write over the room counter
//! and the caller's member record: read a [`RoomSnapshot`], decide, then commit
//! against the snapshot's version. A conflict means another writer got there
//! first; the whole decision is re-run on fresh state after an exponential
//! backoff, up to [`RetryPolicy::max_attempts`].
//!
//! The counter is never read and written without that version check, so
//! concurrent joins cannot overcommit the room.

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::errors::MeshError;
use crate::observability::metrics;
use crate::presence::is_ghost;
use crate::store::{CommitOutcome, MemberWrite, RoomSnapshot, RoomWrite, SharedStore};
use common::types::{MemberId, MemberRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New member; the counter was incremented.
    Admitted { count: u32 },
    /// Caller already held membership; record refreshed, counter untouched.
    AlreadyMember { count: u32 },
}

impl Admission {
    pub fn count(self) -> u32 {
        match self {
            Admission::Admitted { count } | Admission::AlreadyMember { count } => count,
        }
    }
}

/// Result of a leave or eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Record deleted and counter decremented.
    Removed { count: u32 },
    /// No record existed; nothing changed.
    NotMember,
    /// Eviction skipped because the member heartbeated in the meantime.
    StillAlive,
}

/// What a transaction decided after looking at a snapshot.
enum Step<T> {
    Commit(RoomWrite, T),
    Done(T),
    Abort(MeshError),
}

/// Admission controller for one room.
#[derive(Clone)]
pub struct RoomAdmission {
    store: SharedStore,
    capacity: u32,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RoomAdmission {
    pub fn new(store: SharedStore, capacity: u32, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            capacity,
            retry,
            clock,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Admit `member_id`, or refresh its record if it is already a member.
    ///
    /// # Errors
    ///
    /// - `MeshError::CapacityExceeded` if the room is full (no side effects)
    /// - `MeshError::Contention` if the retry budget ran out
    #[instrument(skip_all, fields(member_id = %member_id))]
    pub async fn join(&self, member_id: &MemberId, name: &str) -> Result<Admission, MeshError> {
        let capacity = self.capacity;
        let result = self
            .transact("join", member_id, |snapshot| {
                let now = self.clock.now();
                match &snapshot.member {
                    Some(existing) => Step::Commit(
                        RoomWrite {
                            count: snapshot.count,
                            member: MemberWrite::Put(existing.refreshed(name, now)),
                        },
                        Admission::AlreadyMember {
                            count: snapshot.count,
                        },
                    ),
                    None if snapshot.count >= capacity => {
                        Step::Abort(MeshError::CapacityExceeded { capacity })
                    }
                    None => {
                        let count = snapshot.count + 1;
                        Step::Commit(
                            RoomWrite {
                                count,
                                member: MemberWrite::Put(MemberRecord::admitted(
                                    member_id.clone(),
                                    name,
                                    now,
                                )),
                            },
                            Admission::Admitted { count },
                        )
                    }
                }
            })
            .await;

        match &result {
            Ok(Admission::Admitted { count }) => {
                info!(target: "mesh.admission", member_id = %member_id, count, "Member admitted");
                metrics::record_admission("admitted");
            }
            Ok(Admission::AlreadyMember { count }) => {
                info!(target: "mesh.admission", member_id = %member_id, count, "Member rejoined");
                metrics::record_admission("already_member");
            }
            Err(MeshError::CapacityExceeded { capacity }) => {
                warn!(target: "mesh.admission", member_id = %member_id, capacity, "Room full, join rejected");
                metrics::record_admission("full");
            }
            Err(e) => {
                warn!(target: "mesh.admission", member_id = %member_id, error = %e, "Join failed");
                metrics::record_admission("error");
            }
        }
        result
    }

    /// Remove `member_id`. Repeated calls never decrement twice.
    #[instrument(skip_all, fields(member_id = %member_id))]
    pub async fn leave(&self, member_id: &MemberId) -> Result<Departure, MeshError> {
        let result = self
            .transact("leave", member_id, |snapshot| match &snapshot.member {
                Some(_) => remove(snapshot, member_id),
                None => Step::Done(Departure::NotMember),
            })
            .await;

        if let Ok(departure) = &result {
            log_departure("leave", member_id, *departure);
        }
        result
    }

    /// Remove `member_id` only if its record is still stale at commit time.
    #[instrument(skip_all, fields(member_id = %member_id))]
    pub async fn evict_ghost(
        &self,
        member_id: &MemberId,
        ghost_timeout: Duration,
    ) -> Result<Departure, MeshError> {
        let result = self
            .transact("evict", member_id, |snapshot| match &snapshot.member {
                Some(record) if !is_ghost(record, self.clock.now(), ghost_timeout) => {
                    Step::Done(Departure::StillAlive)
                }
                Some(_) => remove(snapshot, member_id),
                None => Step::Done(Departure::NotMember),
            })
            .await;

        if let Ok(departure) = &result {
            log_departure("ghost", member_id, *departure);
        }
        result
    }

    async fn transact<T, F>(
        &self,
        operation: &'static str,
        member_id: &MemberId,
        mut decide: F,
    ) -> Result<T, MeshError>
    where
        F: FnMut(&RoomSnapshot) -> Step<T>,
    {
        let start = Instant::now();

        for attempt in 0..self.retry.max_attempts {
            let snapshot = self.store.read_room(member_id).await?;

            let (write, value) = match decide(&snapshot) {
                Step::Done(value) => return Ok(value),
                Step::Abort(e) => return Err(e),
                Step::Commit(write, value) => (write, value),
            };

            match self.store.commit_room(snapshot.version, write).await? {
                CommitOutcome::Committed => {
                    metrics::record_txn_duration(operation, start.elapsed());
                    return Ok(value);
                }
                CommitOutcome::Conflict => {
                    metrics::record_txn_conflict(operation);
                    let backoff = self.retry.backoff(attempt);
                    debug!(
                        target: "mesh.admission",
                        operation,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Room commit conflicted, retrying"
                    );
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            target: "mesh.admission",
            operation,
            attempts = self.retry.max_attempts,
            "Room transaction gave up after repeated conflicts"
        );
        Err(MeshError::Contention {
            attempts: self.retry.max_attempts,
        })
    }
}

fn remove(snapshot: &RoomSnapshot, member_id: &MemberId) -> Step<Departure> {
    let count = snapshot.count.saturating_sub(1);
    Step::Commit(
        RoomWrite {
            count,
            member: MemberWrite::Delete(member_id.clone()),
        },
        Departure::Removed { count },
    )
}

fn log_departure(reason: &'static str, member_id: &MemberId, departure: Departure) {
    match departure {
        Departure::Removed { count } => {
            info!(target: "mesh.admission", member_id = %member_id, reason, count, "Member removed");
            metrics::record_departure(reason);
        }
        Departure::NotMember => {
            debug!(target: "mesh.admission", member_id = %member_id, reason, "No membership to remove");
        }
        Departure::StillAlive => {
            debug!(target: "mesh.admission", member_id = %member_id, "Member heartbeated, eviction skipped");
        }
    }
}
