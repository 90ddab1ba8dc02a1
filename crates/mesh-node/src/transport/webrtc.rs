//! WebRTC transport backed by webrtc-rs.

use super::{
    LinkStats, PeerConnection, PeerTransport, RemoteTrack, TransportEvent, TransportEventKind,
    TransportEventSender, TransportState,
};
use crate::errors::MeshError;
use crate::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use common::types::MemberId;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTCRtpParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::sdp::extmap::AUDIO_LEVEL_URI;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn transport_err(context: &str, e: impl std::fmt::Display) -> MeshError {
    MeshError::Transport(format!("{context}: {e}"))
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<TransportState> {
    match state {
        RTCIceConnectionState::New => Some(TransportState::New),
        RTCIceConnectionState::Checking => Some(TransportState::Checking),
        RTCIceConnectionState::Connected => Some(TransportState::Connected),
        RTCIceConnectionState::Completed => Some(TransportState::Completed),
        RTCIceConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCIceConnectionState::Failed => Some(TransportState::Failed),
        RTCIceConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// RFC 6464 level meaning silence (-127 dBov or quieter).
const SILENT_AUDIO_LEVEL: u8 = 127;

/// Negotiated id of the audio level header extension, if any.
fn audio_level_extension_id(parameters: &RTCRtpParameters) -> Option<u8> {
    parameters
        .header_extensions
        .iter()
        .find(|ext| ext.uri == AUDIO_LEVEL_URI)
        .and_then(|ext| u8::try_from(ext.id).ok())
}

/// Level in -dBov from an audio level extension payload, voice bit masked off.
fn parse_audio_level(payload: &[u8]) -> Option<u8> {
    payload.first().map(|byte| byte & 0x7F)
}

/// Linear amplitude in `[0, 1]` for a -dBov level.
fn energy_from_level(level: u8) -> f64 {
    if level >= SILENT_AUDIO_LEVEL {
        return 0.0;
    }
    10f64.powf(-f64::from(level) / 20.0)
}

/// Drain a remote audio track, keeping the latest level it carried.
async fn read_audio_levels(track: Arc<TrackRemote>, extension_id: u8, level: Arc<AtomicU8>) {
    while let Ok((packet, _)) = track.read_rtp().await {
        let latest = packet
            .header
            .get_extension(extension_id)
            .as_deref()
            .and_then(parse_audio_level);
        if let Some(latest) = latest {
            level.store(latest, Ordering::Relaxed);
        }
    }
    level.store(SILENT_AUDIO_LEVEL, Ordering::Relaxed);
    debug!(target: "mesh.link", track_id = %track.id(), "Audio level reader stopped");
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// Opens webrtc-rs peer connections with the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcTransport {
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn connect(
        &self,
        local_id: &MemberId,
        remote_id: &MemberId,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerConnection>, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_err("register codecs", e))?;
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: AUDIO_LEVEL_URI.to_owned(),
                },
                RTPCodecType::Audio,
                None,
            )
            .map_err(|e| transport_err("register audio level extension", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| transport_err("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| transport_err("new peer connection", e))?,
        );

        let candidate_tx = events.clone();
        let candidate_remote = remote_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let remote_id = candidate_remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let encoded = candidate
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()));
                match encoded {
                    Ok(json) => {
                        let _ = tx.send(TransportEvent {
                            remote_id,
                            generation,
                            kind: TransportEventKind::LocalCandidate(json),
                        });
                    }
                    Err(e) => {
                        warn!(target: "mesh.link", remote_id = %remote_id, error = %e, "Candidate encoding failed");
                    }
                }
            })
        }));

        let state_tx = events.clone();
        let state_remote = remote_id.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = state_tx.clone();
            let remote_id = state_remote.clone();
            Box::pin(async move {
                if let Some(state) = map_ice_state(state) {
                    let _ = tx.send(TransportEvent {
                        remote_id,
                        generation,
                        kind: TransportEventKind::StateChanged(state),
                    });
                }
            })
        }));

        let audio_level = Arc::new(AtomicU8::new(SILENT_AUDIO_LEVEL));
        let track_level = Arc::clone(&audio_level);
        let track_tx = events;
        let track_remote = remote_id.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
                let tx = track_tx.clone();
                let remote_id = track_remote.clone();
                let level = Arc::clone(&track_level);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    if kind == TrackKind::Audio {
                        match audio_level_extension_id(&receiver.get_parameters().await) {
                            Some(extension_id) => {
                                tokio::spawn(read_audio_levels(Arc::clone(&track), extension_id, level));
                            }
                            None => {
                                debug!(target: "mesh.link", remote_id = %remote_id, "Remote audio carries no level");
                            }
                        }
                    }
                    let _ = tx.send(TransportEvent {
                        remote_id,
                        generation,
                        kind: TransportEventKind::RemoteTrack(RemoteTrack {
                            track_id: track.id(),
                            stream_id: track.stream_id(),
                            kind,
                        }),
                    });
                })
            },
        ));

        debug!(
            target: "mesh.link",
            local_id = %local_id,
            remote_id = %remote_id,
            generation,
            "Peer connection created"
        );

        Ok(Box::new(WebRtcConnection {
            pc,
            counters: Mutex::new(LossCounters::default()),
            audio_level,
        }))
    }
}

#[derive(Debug, Default)]
struct LossCounters {
    packets_sent: u64,
    packets_lost: i64,
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    counters: Mutex<LossCounters>,
    /// Latest remote audio level in -dBov.
    audio_level: Arc<AtomicU8>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        for track in tracks {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind),
                track.id.clone(),
                "local".to_string(),
            ));
            self.pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| transport_err("add track", e))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MeshError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| transport_err("create offer", e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| transport_err("set local offer", e))?;
        Ok(sdp)
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, MeshError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| transport_err("parse offer", e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| transport_err("set remote offer", e))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| transport_err("create answer", e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| transport_err("set local answer", e))?;
        Ok(sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MeshError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| transport_err("parse answer", e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| transport_err("set remote answer", e))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), MeshError> {
        let init: RTCIceCandidateInit =
            serde_json::from_str(candidate).map_err(|e| transport_err("parse candidate", e))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| transport_err("add candidate", e))
    }

    async fn stats(&self) -> Result<LinkStats, MeshError> {
        let report = self.pc.get_stats().await;
        let mut packets_sent: u64 = 0;
        let mut packets_lost: i64 = 0;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(rtp) => packets_sent += rtp.packets_sent,
                StatsReportType::RemoteInboundRTP(remote) => packets_lost += remote.packets_lost,
                _ => {}
            }
        }

        let mut counters = self.counters.lock().await;
        let interval_sent = packets_sent.saturating_sub(counters.packets_sent);
        let interval_lost = packets_lost.saturating_sub(counters.packets_lost).max(0);
        counters.packets_sent = packets_sent;
        counters.packets_lost = packets_lost;

        #[allow(clippy::cast_precision_loss)]
        let packet_loss = if interval_sent > 0 {
            interval_lost as f64 / interval_sent as f64 * 100.0
        } else {
            0.0
        };

        Ok(LinkStats {
            packet_loss,
            audio_energy: energy_from_level(self.audio_level.load(Ordering::Relaxed)),
        })
    }

    async fn close(&self) -> Result<(), MeshError> {
        self.pc
            .close()
            .await
            .map_err(|e| transport_err("close", e))
    }
}
