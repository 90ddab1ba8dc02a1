//! Link quality classification and active-speaker election.
//!
//! The coordinator feeds one [`LinkSample`] per open link on every sampling
//! tick. The monitor turns those into a per-link [`QualityTier`], elects the
//! active speaker and tracks the mesh-wide reconnecting flag.
//!
//! # Speaker policy
//!
//! When no link exceeds the speaking threshold the previous speaker is held.
//! The held speaker is cleared only when that member's link is forgotten
//! (closed), so the highlight never flickers during pauses between words.

use common::types::MemberId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Coarse link health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Good,
    Weak,
    Bad,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Good => "good",
            QualityTier::Weak => "weak",
            QualityTier::Bad => "bad",
        }
    }
}

/// Loss and speaking thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    /// Packet loss above which a link is `Weak`.
    pub weak_loss: f64,
    /// Packet loss above which a link is `Bad`.
    pub bad_loss: f64,
    /// Minimum audio energy that counts as speaking.
    pub speaking_threshold: f64,
}

impl QualityThresholds {
    pub const DEFAULT_WEAK_LOSS: f64 = 2.0;
    pub const DEFAULT_BAD_LOSS: f64 = 10.0;
    pub const DEFAULT_SPEAKING_THRESHOLD: f64 = 0.05;
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            weak_loss: Self::DEFAULT_WEAK_LOSS,
            bad_loss: Self::DEFAULT_BAD_LOSS,
            speaking_threshold: Self::DEFAULT_SPEAKING_THRESHOLD,
        }
    }
}

/// Classify observed packet loss.
pub fn classify(packet_loss: f64, thresholds: &QualityThresholds) -> QualityTier {
    if packet_loss > thresholds.bad_loss {
        QualityTier::Bad
    } else if packet_loss > thresholds.weak_loss {
        QualityTier::Weak
    } else {
        QualityTier::Good
    }
}

/// One statistics reading for one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSample {
    pub remote_id: MemberId,
    pub packet_loss: f64,
    pub audio_energy: f64,
}

/// Change in the mesh-wide reconnecting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectChange {
    /// First link went transient.
    Raised,
    /// Last transient link recovered; the confirmation notice is now showing.
    Cleared,
    /// Last transient link was closed instead of recovering. No notice.
    Dropped,
}

/// Derived quality state for every open link.
#[derive(Debug)]
pub struct QualityMonitor {
    thresholds: QualityThresholds,
    notice_duration: Duration,
    tiers: BTreeMap<MemberId, QualityTier>,
    active_speaker: Option<MemberId>,
    reconnecting: bool,
    /// Some link went back to connected during the current outage.
    recovered: bool,
    notice_until: Option<Instant>,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds, notice_duration: Duration) -> Self {
        Self {
            thresholds,
            notice_duration,
            tiers: BTreeMap::new(),
            active_speaker: None,
            reconnecting: false,
            recovered: false,
            notice_until: None,
        }
    }

    /// Apply one sampling tick. Returns true if any derived value changed.
    pub fn record(&mut self, samples: &[LinkSample]) -> bool {
        let mut changed = false;

        for sample in samples {
            let tier = classify(sample.packet_loss, &self.thresholds);
            if self.tiers.insert(sample.remote_id.clone(), tier) != Some(tier) {
                debug!(
                    target: "mesh.quality",
                    remote_id = %sample.remote_id,
                    packet_loss = sample.packet_loss,
                    tier = tier.as_str(),
                    "Link quality tier changed"
                );
                changed = true;
            }
        }

        if let Some(speaker) = self.elect(samples) {
            if self.active_speaker.as_ref() != Some(&speaker) {
                debug!(target: "mesh.quality", speaker = %speaker, "Active speaker changed");
                self.active_speaker = Some(speaker);
                changed = true;
            }
        }

        changed
    }

    /// Loudest link above the speaking threshold; ties go to the lower id.
    fn elect(&self, samples: &[LinkSample]) -> Option<MemberId> {
        let mut best: Option<&LinkSample> = None;
        for sample in samples
            .iter()
            .filter(|s| s.audio_energy > self.thresholds.speaking_threshold)
        {
            best = match best {
                Some(current)
                    if current.audio_energy > sample.audio_energy
                        || (current.audio_energy == sample.audio_energy
                            && current.remote_id <= sample.remote_id) =>
                {
                    Some(current)
                }
                _ => Some(sample),
            };
        }
        best.map(|s| s.remote_id.clone())
    }

    /// Drop all tracking for a closed link.
    pub fn forget(&mut self, remote_id: &MemberId) -> bool {
        let had_tier = self.tiers.remove(remote_id).is_some();
        let was_speaker = self.active_speaker.as_ref() == Some(remote_id);
        if was_speaker {
            self.active_speaker = None;
        }
        had_tier || was_speaker
    }

    /// Update the reconnecting flag from the current count of transient links.
    ///
    /// `recovered` is true when the caller just saw a link go from
    /// reconnecting back to connected. The confirmation notice only shows if
    /// that happened at least once during the outage.
    pub fn update_reconnecting(
        &mut self,
        transient_links: usize,
        recovered: bool,
        now: Instant,
    ) -> Option<ReconnectChange> {
        if self.reconnecting {
            self.recovered |= recovered;
        }
        match (self.reconnecting, transient_links > 0) {
            (false, true) => {
                self.reconnecting = true;
                self.recovered = false;
                self.notice_until = None;
                Some(ReconnectChange::Raised)
            }
            (true, false) => {
                self.reconnecting = false;
                if std::mem::take(&mut self.recovered) {
                    self.notice_until = Some(now + self.notice_duration);
                    Some(ReconnectChange::Cleared)
                } else {
                    Some(ReconnectChange::Dropped)
                }
            }
            _ => None,
        }
    }

    /// Hide the confirmation notice once its display time has passed.
    pub fn expire_notice(&mut self, now: Instant) -> bool {
        match self.notice_until {
            Some(deadline) if now >= deadline => {
                self.notice_until = None;
                true
            }
            _ => false,
        }
    }

    /// When the confirmation notice should be hidden, if it is showing.
    pub fn notice_deadline(&self) -> Option<Instant> {
        self.notice_until
    }

    pub fn tier(&self, remote_id: &MemberId) -> Option<QualityTier> {
        self.tiers.get(remote_id).copied()
    }

    pub fn tiers(&self) -> &BTreeMap<MemberId, QualityTier> {
        &self.tiers
    }

    pub fn active_speaker(&self) -> Option<&MemberId> {
        self.active_speaker.as_ref()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn connected_notice(&self) -> bool {
        self.notice_until.is_some()
    }
}
