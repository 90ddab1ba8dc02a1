//! Wall-clock source for liveness timestamps.
//!
//! Heartbeats stamp `last_active` and ghost detection compares against it, so
//! every participant sharing a store must read the same notion of "now".
//! [`TokioClock`] follows tokio's (pausable) time so timer-driven behavior can
//! be exercised deterministically.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use tokio::time::Instant;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored at construction and advanced by tokio time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor_instant.elapsed())
            .unwrap_or(chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}
