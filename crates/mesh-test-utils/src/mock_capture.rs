//! Media capture fake.

use async_trait::async_trait;
use mesh_node::errors::MeshError;
use mesh_node::media::{LocalMedia, LocalTrack, MediaCapture, TrackKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Capture that either hands out audio+video tracks or is denied.
#[derive(Debug, Clone)]
pub struct MockCapture {
    denied: bool,
    acquisitions: Arc<AtomicU32>,
    issued: Arc<Mutex<Vec<LocalMedia>>>,
}

impl MockCapture {
    /// Capture with one audio and one video track.
    #[must_use]
    pub fn available() -> Self {
        Self {
            denied: false,
            acquisitions: Arc::new(AtomicU32::new(0)),
            issued: Arc::default(),
        }
    }

    /// Capture that fails as if the user refused permission.
    #[must_use]
    pub fn denied() -> Self {
        Self {
            denied: true,
            acquisitions: Arc::new(AtomicU32::new(0)),
            issued: Arc::default(),
        }
    }

    /// Number of `acquire` calls so far.
    #[must_use]
    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Streams handed out that have not been released yet.
    #[must_use]
    pub fn unreleased(&self) -> usize {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|media| !media.is_released())
            .count()
    }
}

#[async_trait]
impl MediaCapture for MockCapture {
    async fn acquire(&self) -> Result<LocalMedia, MeshError> {
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.denied {
            return Err(MeshError::MediaUnavailable(
                "permission denied".to_string(),
            ));
        }
        let stream_id = format!("mock-stream-{n}");
        let media = LocalMedia::new(
            stream_id.clone(),
            vec![
                LocalTrack::new(format!("{stream_id}-audio"), TrackKind::Audio),
                LocalTrack::new(format!("{stream_id}-video"), TrackKind::Video),
            ],
        );
        self.issued.lock().unwrap().push(media.clone());
        Ok(media)
    }
}
