use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    LocalMedia, MediaConstraints, MediaError, MediaEvent, MediaKind, MediaStack,
    MediaStreamHandle,
};
use crate::protocol::{CandidateBlob, SessionDescriptor};

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub stun_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Media stack backed by the `webrtc` crate: one `RTCPeerConnection` per
/// remote participant, trickle candidates surfaced as `MediaEvent`s.
///
/// Capture itself stays outside this crate. `acquire_local` allocates static
/// sample tracks; the embedding application feeds them via
/// [`RtcMediaStack::local_tracks`] (`TrackLocalStaticSample::write_sample`).
pub struct RtcMediaStack {
    api: API,
    config: RTCConfiguration,
    events: mpsc::UnboundedSender<MediaEvent>,
    peers: AsyncMutex<HashMap<String, Arc<RTCPeerConnection>>>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    // Candidates that overtook the remote description; add_ice_candidate
    // rejects them until set_remote_description has run.
    pending_candidates: AsyncMutex<HashMap<String, Vec<RTCIceCandidateInit>>>,
}

impl RtcMediaStack {
    pub fn new(
        config: RtcConfig,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<Self>, MediaError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.stun_servers,
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Arc::new(Self {
            api,
            config: rtc_config,
            events,
            peers: AsyncMutex::new(HashMap::new()),
            local_tracks: Mutex::new(Vec::new()),
            pending_candidates: AsyncMutex::new(HashMap::new()),
        }))
    }

    /// The outbound tracks acquired so far. The application writes captured
    /// samples into these.
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().unwrap().clone()
    }

    async fn ensure_peer(&self, peer: &str) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut peers = self.peers.lock().await;
        if let Some(pc) = peers.get(peer) {
            return Ok(Arc::clone(pc));
        }

        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(to_media_error)?,
        );
        tracing::debug!(target = "porch::media", peer, "peer connection created");

        let events = self.events.clone();
        let peer_name = peer.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let peer = peer_name.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = events.send(MediaEvent::LocalCandidate {
                                peer,
                                candidate: CandidateBlob {
                                    candidate: json.candidate,
                                    sdp_mid: json.sdp_mid,
                                    sdp_mline_index: json.sdp_mline_index.map(u32::from),
                                },
                            });
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "porch::media",
                                peer = %peer,
                                error = %err,
                                "failed to serialize local candidate"
                            );
                        }
                    }
                }
            })
        }));

        let events = self.events.clone();
        let peer_name = peer.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            tracing::info!(
                target = "porch::media",
                peer = %peer_name,
                %kind,
                "remote track arrived"
            );
            let _ = events.send(MediaEvent::RemoteTrack {
                peer: peer_name.clone(),
                stream: MediaStreamHandle::rtc(peer_name.clone(), kind, track),
            });
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let peer_name = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            let peer = peer_name.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "porch::media",
                    peer = %peer,
                    ?state,
                    "peer connection state changed"
                );
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(MediaEvent::PeerConnected { peer });
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(MediaEvent::PeerFailed {
                            peer,
                            reason: "peer connection failed".into(),
                        });
                    }
                    _ => {}
                }
            })
        }));

        let tracks = self.local_tracks.lock().unwrap().clone();
        if tracks.is_empty() {
            // Nothing to send; still negotiate inbound media like the
            // browser's offerToReceive options.
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(to_media_error)?;
            }
        } else {
            for track in tracks {
                pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(to_media_error)?;
            }
        }

        peers.insert(peer.to_string(), Arc::clone(&pc));
        Ok(pc)
    }
}

#[async_trait]
impl MediaStack for RtcMediaStack {
    async fn acquire_local(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                "audio".to_owned(),
                "porch".to_owned(),
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                "video".to_owned(),
                "porch".to_owned(),
            )));
        }
        *self.local_tracks.lock().unwrap() = tracks;
        Ok(LocalMedia {
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    async fn create_offer(&self, peer: &str) -> Result<SessionDescriptor, MediaError> {
        let pc = self.ensure_peer(peer).await?;
        let offer = pc.create_offer(None).await.map_err(to_media_error)?;
        pc.set_local_description(offer).await.map_err(to_media_error)?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MediaError::Negotiation("missing local description".into()))?;
        Ok(descriptor_from_session(&local))
    }

    async fn create_answer(&self, peer: &str) -> Result<SessionDescriptor, MediaError> {
        let pc = self.ensure_peer(peer).await?;
        let answer = pc.create_answer(None).await.map_err(to_media_error)?;
        pc.set_local_description(answer)
            .await
            .map_err(to_media_error)?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MediaError::Negotiation("missing local description".into()))?;
        Ok(descriptor_from_session(&local))
    }

    async fn apply_remote_descriptor(
        &self,
        peer: &str,
        descriptor: SessionDescriptor,
    ) -> Result<(), MediaError> {
        let pc = self.ensure_peer(peer).await?;
        let remote = session_from_descriptor(&descriptor)?;
        pc.set_remote_description(remote)
            .await
            .map_err(to_media_error)?;

        let held = self
            .pending_candidates
            .lock()
            .await
            .remove(peer)
            .unwrap_or_default();
        for init in held {
            if let Err(err) = pc.add_ice_candidate(init).await {
                tracing::warn!(
                    target = "porch::media",
                    peer,
                    error = %err,
                    "held candidate rejected"
                );
            }
        }
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        peer: &str,
        candidate: CandidateBlob,
    ) -> Result<(), MediaError> {
        let pc = self.ensure_peer(peer).await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|index| index as u16),
            username_fragment: None,
        };
        if pc.remote_description().await.is_none() {
            self.pending_candidates
                .lock()
                .await
                .entry(peer.to_string())
                .or_default()
                .push(init);
            return Ok(());
        }
        pc.add_ice_candidate(init).await.map_err(to_media_error)
    }

    async fn drop_peer(&self, peer: &str) {
        self.pending_candidates.lock().await.remove(peer);
        let removed = self.peers.lock().await.remove(peer);
        if let Some(pc) = removed {
            if let Err(err) = pc.close().await {
                tracing::debug!(
                    target = "porch::media",
                    peer,
                    error = %err,
                    "peer connection close error"
                );
            }
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_media_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_media_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn descriptor_from_session(description: &RTCSessionDescription) -> SessionDescriptor {
    SessionDescriptor {
        sdp: description.sdp.clone(),
        kind: description.sdp_type.to_string(),
    }
}

fn session_from_descriptor(
    descriptor: &SessionDescriptor,
) -> Result<RTCSessionDescription, MediaError> {
    match RTCSdpType::from(descriptor.kind.as_str()) {
        RTCSdpType::Offer => {
            RTCSessionDescription::offer(descriptor.sdp.clone()).map_err(to_media_error)
        }
        RTCSdpType::Answer => {
            RTCSessionDescription::answer(descriptor.sdp.clone()).map_err(to_media_error)
        }
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(descriptor.sdp.clone()).map_err(to_media_error)
        }
        RTCSdpType::Rollback | RTCSdpType::Unspecified => Err(MediaError::Negotiation(format!(
            "unsupported sdp type {}",
            descriptor.kind
        ))),
    }
}

fn to_media_error<E: std::fmt::Display>(err: E) -> MediaError {
    MediaError::Negotiation(err.to_string())
}
