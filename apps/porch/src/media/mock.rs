use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    LocalMedia, MediaConstraints, MediaError, MediaEvent, MediaKind, MediaStack,
    MediaStreamHandle,
};
use crate::protocol::{CandidateBlob, SessionDescriptor};

/// Scriptable media stack for tests. Descriptors are fabricated, candidates
/// are recorded, and a live path is reported as soon as both descriptors for
/// a peer are in place.
pub struct MockMediaStack {
    events: mpsc::UnboundedSender<MediaEvent>,
    deny_audio: AtomicBool,
    deny_video: AtomicBool,
    peers: Mutex<HashMap<String, MockPeer>>,
}

#[derive(Default)]
struct MockPeer {
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    applied_candidates: Vec<CandidateBlob>,
    remote_descriptors_applied: usize,
    live_reported: bool,
    candidate_serial: u32,
}

impl MockMediaStack {
    pub fn new(events: mpsc::UnboundedSender<MediaEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            deny_audio: AtomicBool::new(false),
            deny_video: AtomicBool::new(false),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn deny_audio(&self) {
        self.deny_audio.store(true, Ordering::SeqCst);
    }

    pub fn deny_video(&self) {
        self.deny_video.store(true, Ordering::SeqCst);
    }

    /// Remote candidates applied for `peer`, in application order.
    pub fn applied_candidates(&self, peer: &str) -> Vec<CandidateBlob> {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|p| p.applied_candidates.clone())
            .unwrap_or_default()
    }

    /// How many remote descriptors have been applied for `peer`.
    pub fn remote_descriptors_applied(&self, peer: &str) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|p| p.remote_descriptors_applied)
            .unwrap_or(0)
    }

    pub fn knows_peer(&self, peer: &str) -> bool {
        self.peers.lock().unwrap().contains_key(peer)
    }

    /// Emit a synthetic remote track for `peer`, as a real stack would once
    /// media starts flowing.
    pub fn emit_remote_track(&self, peer: &str, kind: MediaKind) {
        let _ = self.events.send(MediaEvent::RemoteTrack {
            peer: peer.to_string(),
            stream: MediaStreamHandle::synthetic(peer, kind),
        });
    }

    fn with_peer<R>(&self, peer: &str, f: impl FnOnce(&mut MockPeer) -> R) -> R {
        let mut peers = self.peers.lock().unwrap();
        f(peers.entry(peer.to_string()).or_default())
    }

    fn emit_candidate(&self, peer: &str, serial: u32) {
        let _ = self.events.send(MediaEvent::LocalCandidate {
            peer: peer.to_string(),
            candidate: CandidateBlob {
                candidate: format!("mock:candidate:{peer}:{serial}"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        });
    }

    fn maybe_report_live(&self, peer: &str) {
        let report = self.with_peer(peer, |state| {
            if state.local.is_some() && state.remote.is_some() && !state.live_reported {
                state.live_reported = true;
                true
            } else {
                false
            }
        });
        if report {
            let _ = self.events.send(MediaEvent::PeerConnected {
                peer: peer.to_string(),
            });
        }
    }
}

#[async_trait]
impl MediaStack for MockMediaStack {
    async fn acquire_local(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio && self.deny_audio.load(Ordering::SeqCst) {
            return Err(MediaError::CapabilityUnavailable("audio".into()));
        }
        if constraints.video && self.deny_video.load(Ordering::SeqCst) {
            return Err(MediaError::CapabilityUnavailable("video".into()));
        }
        Ok(LocalMedia {
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    async fn create_offer(&self, peer: &str) -> Result<SessionDescriptor, MediaError> {
        let (descriptor, serial) = self.with_peer(peer, |state| {
            let descriptor = SessionDescriptor::offer(format!("v=0 mock offer for {peer}"));
            state.local = Some(descriptor.clone());
            let serial = state.candidate_serial;
            state.candidate_serial += 1;
            (descriptor, serial)
        });
        self.emit_candidate(peer, serial);
        self.maybe_report_live(peer);
        Ok(descriptor)
    }

    async fn create_answer(&self, peer: &str) -> Result<SessionDescriptor, MediaError> {
        let (descriptor, serial) = self.with_peer(peer, |state| {
            if state.remote.is_none() {
                return (None, 0);
            }
            let descriptor = SessionDescriptor::answer(format!("v=0 mock answer for {peer}"));
            state.local = Some(descriptor.clone());
            let serial = state.candidate_serial;
            state.candidate_serial += 1;
            (Some(descriptor), serial)
        });
        let descriptor = descriptor.ok_or_else(|| {
            MediaError::Negotiation(format!("answer requested before remote offer for {peer}"))
        })?;
        self.emit_candidate(peer, serial);
        self.maybe_report_live(peer);
        Ok(descriptor)
    }

    async fn apply_remote_descriptor(
        &self,
        peer: &str,
        descriptor: SessionDescriptor,
    ) -> Result<(), MediaError> {
        self.with_peer(peer, |state| {
            state.remote = Some(descriptor);
            state.remote_descriptors_applied += 1;
        });
        self.maybe_report_live(peer);
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        peer: &str,
        candidate: CandidateBlob,
    ) -> Result<(), MediaError> {
        self.with_peer(peer, |state| {
            state.applied_candidates.push(candidate);
        });
        Ok(())
    }

    async fn drop_peer(&self, peer: &str) {
        self.peers.lock().unwrap().remove(peer);
    }
}
