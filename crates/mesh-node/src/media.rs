//! Local media capture.
//!
//! A session acquires its local tracks once at join. Each track carries a
//! shared enabled flag so mic and video toggles take effect on every peer
//! link without renegotiation.

use crate::errors::MeshError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// One local track. Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// The local stream: zero or more tracks plus a release latch.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    tracks: Vec<LocalTrack>,
    released: Arc<AtomicBool>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A stream with no tracks, used when capture is unavailable.
    pub fn empty() -> Self {
        Self::new("local", Vec::new())
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }

    /// Whether every track of `kind` is enabled. False if there is none.
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        let mut of_kind = self.tracks.iter().filter(|track| track.kind == kind).peekable();
        of_kind.peek().is_some() && of_kind.all(LocalTrack::is_enabled)
    }

    /// Flip the enabled flag of every track of `kind`. Returns the new state.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        let enabled = !self.is_enabled(kind);
        let mut touched = false;
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            track.set_enabled(enabled);
            touched = true;
        }
        debug!(target: "mesh.media", kind = kind.as_str(), enabled, "Track toggled");
        enabled && touched
    }

    /// Stop capture. Idempotent; returns true on the first call.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.tracks {
            track.set_enabled(false);
        }
        info!(target: "mesh.media", tracks = self.tracks.len(), "Local media released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Source of local media.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire the local stream.
    ///
    /// # Errors
    ///
    /// `MeshError::MediaUnavailable` when the device is missing or access is denied.
    async fn acquire(&self) -> Result<LocalMedia, MeshError>;
}

/// Capture that produces track handles without a device, for headless nodes.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticCapture {
    pub audio: bool,
    pub video: bool,
}

impl SyntheticCapture {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self) -> Result<LocalMedia, MeshError> {
        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::with_capacity(2);
        if self.audio {
            tracks.push(LocalTrack::new(format!("{stream_id}-audio"), TrackKind::Audio));
        }
        if self.video {
            tracks.push(LocalTrack::new(format!("{stream_id}-video"), TrackKind::Video));
        }
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_capture_honours_kinds() {
        let media = SyntheticCapture::new(true, false).acquire().await.unwrap();

        assert!(media.has_kind(TrackKind::Audio));
        assert!(!media.has_kind(TrackKind::Video));
        assert_eq!(media.tracks().len(), 1);
    }

    #[test]
    fn test_toggle_flips_shared_flag() {
        let media = LocalMedia::new(
            "s",
            vec![
                LocalTrack::new("a", TrackKind::Audio),
                LocalTrack::new("v", TrackKind::Video),
            ],
        );
        let attached = media.tracks().first().cloned().unwrap();

        assert!(!media.toggle(TrackKind::Audio));
        assert!(!attached.is_enabled());
        assert!(media.is_enabled(TrackKind::Video));

        assert!(media.toggle(TrackKind::Audio));
        assert!(attached.is_enabled());
    }

    #[test]
    fn test_toggle_without_tracks_stays_off() {
        let media = LocalMedia::empty();

        assert!(!media.toggle(TrackKind::Video));
        assert!(!media.is_enabled(TrackKind::Video));
    }

    #[test]
    fn test_release_is_idempotent() {
        let media = LocalMedia::new("s", vec![LocalTrack::new("a", TrackKind::Audio)]);

        assert!(media.release());
        assert!(!media.release());
        assert!(media.is_released());
        assert!(!media.is_enabled(TrackKind::Audio));
    }
}
