//! Coordinator mailbox monitoring.
//!
//! | Level    | Depth      |
//! |----------|------------|
//! | Normal   | <= 64      |
//! | Warning  | 65-192     |
//! | Critical | > 192      |
//!
//! Depth is exported as `mesh_actor_mailbox_depth{actor_type="mesh"}`.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const MESH_MAILBOX_NORMAL: usize = 64;
pub const MESH_MAILBOX_WARNING: usize = 192;

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of the coordinator mailbox.
///
/// Senders call [`record_enqueue`](Self::record_enqueue) after a successful
/// send; the actor calls [`record_dequeue`](Self::record_dequeue) once it has
/// taken a message off the queue.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth("mesh", new_depth);

        match level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "mesh.actor.mailbox",
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    threshold = MESH_MAILBOX_WARNING,
                    "Mailbox depth critical"
                );
            }
            // Log once when crossing into warning
            MailboxLevel::Warning if new_depth == MESH_MAILBOX_NORMAL + 1 => {
                debug!(
                    target: "mesh.actor.mailbox",
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    pub fn record_dequeue(&self) {
        // Saturating: a dequeue can race ahead of the sender's enqueue record
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth("mesh", previous.saturating_sub(1));
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        level_for_depth(self.current_depth())
    }
}

fn level_for_depth(depth: usize) -> MailboxLevel {
    if depth > MESH_MAILBOX_WARNING {
        MailboxLevel::Critical
    } else if depth > MESH_MAILBOX_NORMAL {
        MailboxLevel::Warning
    } else {
        MailboxLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_dequeue_tracks_depth_and_peak() {
        let monitor = MailboxMonitor::new("alice");

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_dequeue();

        assert_eq!(monitor.current_depth(), 1);
        assert_eq!(monitor.peak_depth(), 2);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new("alice");

        monitor.record_dequeue();

        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_levels() {
        let monitor = MailboxMonitor::new("alice");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..=MESH_MAILBOX_NORMAL {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..MESH_MAILBOX_WARNING {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }
}
