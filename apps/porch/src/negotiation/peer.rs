use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::Instant;

use crate::media::MediaStack;
use crate::protocol::{CandidateBlob, Payload, SessionDescriptor};
use crate::session::RoomEvent;
use crate::transport::RoomChannel;

use super::SharedLocalMedia;

/// Which side of a pair opens negotiation. Decided purely from the two
/// identities so both sides agree without coordination: the lexicographically
/// smaller one calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl NegotiationRole {
    pub fn for_pair(local: &str, remote: &str) -> Self {
        if local < remote {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, NegotiationRole::Initiator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Failed)
    }
}

/// Single-assignment slot for the remote answer. Fulfilled at most once;
/// waiters that show up after fulfillment resolve immediately.
pub struct AnswerSlot {
    value: RwLock<Option<SessionDescriptor>>,
    notify: Notify,
}

impl AnswerSlot {
    pub fn new() -> Self {
        Self {
            value: RwLock::new(None),
            notify: Notify::new(),
        }
    }

    /// Stores the answer. Returns `false` if the slot was already fulfilled;
    /// the value is left untouched in that case.
    pub async fn fulfill(&self, descriptor: SessionDescriptor) -> bool {
        let mut guard = self.value.write().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(descriptor);
        drop(guard);
        self.notify.notify_waiters();
        self.notify.notify_one();
        true
    }

    pub async fn wait(&self) -> SessionDescriptor {
        loop {
            if let Some(value) = self.value.read().await.clone() {
                return value;
            }
            let notified = self.notify.notified();
            if let Some(value) = self.value.read().await.clone() {
                return value;
            }
            notified.await;
        }
    }

    pub async fn peek(&self) -> Option<SessionDescriptor> {
        self.value.read().await.clone()
    }
}

impl Default for AnswerSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to one peer's negotiation, delivered in arrival order over the
/// peer's own queue.
#[derive(Debug)]
pub enum PeerSignal {
    /// The local side won the tie-break and should open negotiation.
    Start,
    RemoteOffer(SessionDescriptor),
    RemoteAnswer(SessionDescriptor),
    RemoteCandidate(CandidateBlob),
    /// The media stack reports a live path to this peer.
    MediaLive,
    MediaFailed(String),
}

/// Read-only view of a peer negotiation, handed to the session layer.
#[derive(Clone)]
pub struct PeerObserver {
    pub username: String,
    pub role: NegotiationRole,
    state: watch::Receiver<NegotiationState>,
    answer: Arc<AnswerSlot>,
}

impl PeerObserver {
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Waits until the negotiation reaches a terminal state; `true` means
    /// connected.
    pub async fn wait_terminal(&self) -> bool {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(state) => matches!(*state, NegotiationState::Connected),
            Err(_) => false,
        }
    }

    pub async fn wait_connected(&self) -> bool {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == NegotiationState::Connected)
            .await
            .is_ok()
    }

    /// The "await remote answer" primitive: resolves with the first
    /// `negotiate-answer` seen for this peer, immediately if it already
    /// arrived.
    pub async fn remote_answer(&self) -> SessionDescriptor {
        self.answer.wait().await
    }
}

pub(crate) struct PeerNegotiation {
    local: String,
    remote: String,
    role: NegotiationRole,
    state: NegotiationState,
    state_tx: watch::Sender<NegotiationState>,
    answer: Arc<AnswerSlot>,
    channel: Arc<dyn RoomChannel>,
    media: Arc<dyn MediaStack>,
    local_media: Arc<SharedLocalMedia>,
    events: mpsc::UnboundedSender<RoomEvent>,
    queued_candidates: Vec<CandidateBlob>,
    local_descriptor: Option<SessionDescriptor>,
    remote_descriptor: Option<SessionDescriptor>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl PeerNegotiation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: String,
        remote: String,
        channel: Arc<dyn RoomChannel>,
        media: Arc<dyn MediaStack>,
        local_media: Arc<SharedLocalMedia>,
        events: mpsc::UnboundedSender<RoomEvent>,
        timeout: Option<Duration>,
    ) -> (Self, PeerObserver) {
        let role = NegotiationRole::for_pair(&local, &remote);
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let answer = Arc::new(AnswerSlot::new());
        let observer = PeerObserver {
            username: remote.clone(),
            role,
            state: state_rx,
            answer: Arc::clone(&answer),
        };
        let negotiation = Self {
            local,
            remote,
            role,
            state: NegotiationState::Idle,
            state_tx,
            answer,
            channel,
            media,
            local_media,
            events,
            queued_candidates: Vec::new(),
            local_descriptor: None,
            remote_descriptor: None,
            timeout,
            deadline: None,
        };
        (negotiation, observer)
    }

    pub(crate) async fn run(mut self, mut signals: mpsc::UnboundedReceiver<PeerSignal>) {
        loop {
            let signal = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, signals.recv()).await {
                    Ok(signal) => signal,
                    Err(_) => {
                        self.deadline = None;
                        if !self.state.is_terminal() {
                            self.fail("negotiation timed out").await;
                        }
                        continue;
                    }
                },
                None => signals.recv().await,
            };
            let Some(signal) = signal else {
                break;
            };
            self.handle(signal).await;
        }
    }

    async fn handle(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::Start => self.start_as_initiator().await,
            PeerSignal::RemoteOffer(offer) => self.on_remote_offer(offer).await,
            PeerSignal::RemoteAnswer(answer) => self.on_remote_answer(answer).await,
            PeerSignal::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
            PeerSignal::MediaLive => self.on_media_live(),
            PeerSignal::MediaFailed(reason) => {
                if !self.state.is_terminal() {
                    self.fail(&reason).await;
                }
            }
        }
    }

    async fn start_as_initiator(&mut self) {
        if self.state != NegotiationState::Idle {
            tracing::debug!(
                target = "porch::negotiation",
                peer = %self.remote,
                state = ?self.state,
                "duplicate start ignored"
            );
            return;
        }
        if let Err(err) = self.local_media.ensure(self.media.as_ref()).await {
            self.fail(&format!("local capture unavailable: {err}")).await;
            return;
        }
        let offer = match self.media.create_offer(&self.remote).await {
            Ok(offer) => offer,
            Err(err) => {
                self.fail(&format!("offer creation failed: {err}")).await;
                return;
            }
        };
        self.local_descriptor = Some(offer.clone());
        self.set_state(NegotiationState::OfferSent);
        self.flush_queued_candidates().await;
        if let Err(err) = self
            .channel
            .send(Some(&self.remote), Payload::NegotiateOffer { offer })
        {
            self.fail(&format!("offer send failed: {err}")).await;
            return;
        }
        self.arm_deadline();
    }

    async fn on_remote_offer(&mut self, offer: SessionDescriptor) {
        if self.state != NegotiationState::Idle {
            tracing::warn!(
                target = "porch::negotiation",
                peer = %self.remote,
                state = ?self.state,
                "offer in unexpected state; dropped"
            );
            return;
        }
        self.set_state(NegotiationState::OfferReceived);
        self.remote_descriptor = Some(offer.clone());
        if let Err(err) = self.local_media.ensure(self.media.as_ref()).await {
            self.fail(&format!("local capture unavailable: {err}")).await;
            return;
        }
        if let Err(err) = self.media.apply_remote_descriptor(&self.remote, offer).await {
            self.fail(&format!("remote offer rejected: {err}")).await;
            return;
        }
        let answer = match self.media.create_answer(&self.remote).await {
            Ok(answer) => answer,
            Err(err) => {
                self.fail(&format!("answer creation failed: {err}")).await;
                return;
            }
        };
        self.local_descriptor = Some(answer.clone());
        self.flush_queued_candidates().await;
        if let Err(err) = self
            .channel
            .send(Some(&self.remote), Payload::NegotiateAnswer { answer })
        {
            self.fail(&format!("answer send failed: {err}")).await;
            return;
        }
        self.set_state(NegotiationState::AnswerSent);
        self.arm_deadline();
    }

    async fn on_remote_answer(&mut self, answer: SessionDescriptor) {
        if self.state != NegotiationState::OfferSent {
            // Covers duplicate answers for an already-connected peer as well
            // as answers that raced past their offer.
            tracing::warn!(
                target = "porch::negotiation",
                peer = %self.remote,
                state = ?self.state,
                "answer in unexpected state; dropped"
            );
            return;
        }
        self.set_state(NegotiationState::AnswerReceived);
        if !self.answer.fulfill(answer.clone()).await {
            tracing::warn!(
                target = "porch::negotiation",
                peer = %self.remote,
                "answer slot already fulfilled"
            );
        }
        self.remote_descriptor = Some(answer.clone());
        match self.media.apply_remote_descriptor(&self.remote, answer).await {
            Ok(()) => {
                self.deadline = None;
                self.set_state(NegotiationState::Connected);
                let _ = self.events.send(RoomEvent::PeerConnected {
                    username: self.remote.clone(),
                });
            }
            Err(err) => self.fail(&format!("remote answer rejected: {err}")).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: CandidateBlob) {
        if self.state == NegotiationState::Failed {
            tracing::debug!(
                target = "porch::negotiation",
                peer = %self.remote,
                "candidate for failed negotiation dropped"
            );
            return;
        }
        if self.local_descriptor.is_some() {
            if let Err(err) = self
                .media
                .apply_remote_candidate(&self.remote, candidate)
                .await
            {
                tracing::warn!(
                    target = "porch::negotiation",
                    peer = %self.remote,
                    error = %err,
                    "candidate rejected by media stack"
                );
            }
        } else {
            self.queued_candidates.push(candidate);
            tracing::debug!(
                target = "porch::negotiation",
                peer = %self.remote,
                queued = self.queued_candidates.len(),
                "candidate queued ahead of descriptor"
            );
        }
    }

    fn on_media_live(&mut self) {
        match self.state {
            NegotiationState::AnswerSent => {
                self.deadline = None;
                self.set_state(NegotiationState::Connected);
                let _ = self.events.send(RoomEvent::PeerConnected {
                    username: self.remote.clone(),
                });
            }
            NegotiationState::Connected => {}
            state => {
                tracing::debug!(
                    target = "porch::negotiation",
                    peer = %self.remote,
                    ?state,
                    "media live outside answer wait"
                );
            }
        }
    }

    async fn fail(&mut self, reason: &str) {
        if self.state == NegotiationState::Failed {
            return;
        }
        tracing::warn!(
            target = "porch::negotiation",
            peer = %self.remote,
            role = ?self.role,
            reason,
            "negotiation failed"
        );
        self.deadline = None;
        self.set_state(NegotiationState::Failed);
        self.media.drop_peer(&self.remote).await;
        let _ = self.events.send(RoomEvent::NegotiationFailed {
            username: self.remote.clone(),
            reason: reason.to_string(),
        });
    }

    async fn flush_queued_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.queued_candidates) {
            if let Err(err) = self
                .media
                .apply_remote_candidate(&self.remote, candidate)
                .await
            {
                tracing::warn!(
                    target = "porch::negotiation",
                    peer = %self.remote,
                    error = %err,
                    "queued candidate rejected by media stack"
                );
            }
        }
    }

    fn arm_deadline(&mut self) {
        if let Some(timeout) = self.timeout {
            self.deadline = Some(Instant::now() + timeout);
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        tracing::debug!(
            target = "porch::negotiation",
            local = %self.local,
            peer = %self.remote,
            from = ?self.state,
            to = ?state,
            "state transition"
        );
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
