use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{OnceCell, mpsc};

use crate::media::{
    LocalMedia, MediaConstraints, MediaError, MediaEvent, MediaStack, acquire_with_fallback,
};
use crate::presence::Roster;
use crate::protocol::{Envelope, Inbound, Payload};
use crate::session::RoomEvent;
use crate::transport::RoomChannel;

pub mod peer;

pub use peer::{NegotiationRole, NegotiationState, PeerObserver};
use peer::{PeerNegotiation, PeerSignal};

/// Session-wide local capture. Acquired at most once and shared read-only by
/// every peer negotiation; a failed acquisition is also remembered so the
/// ladder does not rerun per peer.
pub(crate) struct SharedLocalMedia {
    constraints: MediaConstraints,
    acquired: OnceCell<Option<LocalMedia>>,
}

impl SharedLocalMedia {
    pub(crate) fn new(constraints: MediaConstraints) -> Arc<Self> {
        Arc::new(Self {
            constraints,
            acquired: OnceCell::new(),
        })
    }

    pub(crate) async fn ensure(&self, stack: &dyn MediaStack) -> Result<LocalMedia, MediaError> {
        let acquired = self
            .acquired
            .get_or_init(|| async {
                match acquire_with_fallback(stack, self.constraints).await {
                    Ok(local) => Some(local),
                    Err(err) => {
                        tracing::warn!(
                            target = "porch::media",
                            error = %err,
                            "local capture acquisition failed"
                        );
                        None
                    }
                }
            })
            .await;
        (*acquired).ok_or(MediaError::AcquisitionExhausted)
    }
}

struct PeerHandle {
    signals: mpsc::UnboundedSender<PeerSignal>,
    task: tokio::task::JoinHandle<()>,
}

/// The dispatcher: sole owner of the roster and the peer map, driven by the
/// room channel and the media-stack event stream. Messages for one peer are
/// forwarded into that peer's queue, so per-peer ordering holds while peers
/// stay independent of each other.
pub struct NegotiationEngine {
    local: String,
    color: Option<String>,
    channel: Arc<dyn RoomChannel>,
    media: Arc<dyn MediaStack>,
    events: mpsc::UnboundedSender<RoomEvent>,
    roster: Roster,
    peers: HashMap<String, PeerHandle>,
    observers: Arc<StdRwLock<HashMap<String, PeerObserver>>>,
    local_media: Arc<SharedLocalMedia>,
    negotiation_timeout: Option<Duration>,
}

impl NegotiationEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: String,
        color: Option<String>,
        channel: Arc<dyn RoomChannel>,
        media: Arc<dyn MediaStack>,
        events: mpsc::UnboundedSender<RoomEvent>,
        observers: Arc<StdRwLock<HashMap<String, PeerObserver>>>,
        constraints: MediaConstraints,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            local,
            color,
            channel,
            media,
            events,
            roster: Roster::new(),
            peers: HashMap::new(),
            observers,
            local_media: SharedLocalMedia::new(constraints),
            negotiation_timeout,
        }
    }

    pub(crate) async fn run(mut self, mut media_events: mpsc::UnboundedReceiver<MediaEvent>) {
        let channel = Arc::clone(&self.channel);
        let mut media_open = true;
        loop {
            tokio::select! {
                inbound = channel.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => {
                        tracing::info!(target = "porch::negotiation", "room channel closed");
                        let _ = self.events.send(RoomEvent::ChannelClosed);
                        break;
                    }
                },
                event = media_events.recv(), if media_open => match event {
                    Some(event) => self.handle_media_event(event),
                    None => media_open = false,
                },
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(envelope) => {
                if !envelope.is_for(&self.local) {
                    tracing::trace!(
                        target = "porch::negotiation",
                        sender = %envelope.username,
                        to = ?envelope.to,
                        "addressed elsewhere; dropped"
                    );
                    return;
                }
                self.handle_envelope(envelope).await;
            }
            Inbound::Unhandled(value) => {
                tracing::debug!(
                    target = "porch::negotiation",
                    kind = %value.get("type").and_then(|t| t.as_str()).unwrap_or("?"),
                    "unhandled message type"
                );
                let _ = self.events.send(RoomEvent::Unhandled { message: value });
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let sender = envelope.username;
        match envelope.payload {
            Payload::IntroduceSelf { color } => self.on_introduce(sender, color).await,
            Payload::Hello { color } => self.on_hello(sender, color),
            Payload::NegotiateOffer { offer } => {
                if sender == self.local {
                    return;
                }
                let _ = self
                    .peer_signals(&sender)
                    .send(PeerSignal::RemoteOffer(offer));
            }
            Payload::NegotiateAnswer { answer } => {
                if sender == self.local {
                    return;
                }
                // An answer never creates negotiation state; with no matching
                // offer outstanding it is a protocol-ordering anomaly.
                match self.peers.get(&sender) {
                    Some(handle) => {
                        let _ = handle.signals.send(PeerSignal::RemoteAnswer(answer));
                    }
                    None => {
                        tracing::warn!(
                            target = "porch::negotiation",
                            peer = %sender,
                            "answer for unknown peer; dropped"
                        );
                    }
                }
            }
            Payload::NetworkCandidate { candidate } => {
                if sender == self.local {
                    return;
                }
                let _ = self
                    .peer_signals(&sender)
                    .send(PeerSignal::RemoteCandidate(candidate));
            }
            Payload::ChatMessage { color, message } => {
                let _ = self.events.send(RoomEvent::Chat {
                    username: sender,
                    color,
                    message,
                });
            }
            Payload::Leave => self.on_leave(&sender).await,
        }
    }

    async fn on_introduce(&mut self, sender: String, color: Option<String>) {
        let is_new = self.roster.record(&sender, color.as_deref());
        if sender == self.local {
            // The relay echoes our own introduction back to us.
            return;
        }
        if !is_new {
            tracing::trace!(
                target = "porch::negotiation",
                peer = %sender,
                "known participant reintroduced"
            );
            return;
        }
        tracing::info!(target = "porch::negotiation", peer = %sender, "participant joined");
        let _ = self.events.send(RoomEvent::PeerJoined {
            username: sender.clone(),
            color,
        });

        // Re-broadcast our introduction so a late joiner learns about us, and
        // answer with our self-description.
        if let Err(err) = self.channel.send(
            None,
            Payload::IntroduceSelf {
                color: self.color.clone(),
            },
        ) {
            tracing::warn!(
                target = "porch::negotiation",
                error = %err,
                "introduction re-broadcast failed"
            );
        }
        if let Err(err) = self.channel.send(
            Some(&sender),
            Payload::Hello {
                color: self.color.clone(),
            },
        ) {
            tracing::warn!(
                target = "porch::negotiation",
                error = %err,
                "hello send failed"
            );
        }

        if NegotiationRole::for_pair(&self.local, &sender).is_initiator() {
            let _ = self.peer_signals(&sender).send(PeerSignal::Start);
        }
    }

    fn on_hello(&mut self, sender: String, color: Option<String>) {
        if sender == self.local {
            return;
        }
        // A self-description establishes presence but never negotiation.
        if self.roster.record(&sender, color.as_deref()) {
            let _ = self.events.send(RoomEvent::PeerJoined {
                username: sender,
                color,
            });
        }
    }

    async fn on_leave(&mut self, sender: &str) {
        if sender == self.local {
            return;
        }
        if !self.roster.mark_left(sender) {
            return;
        }
        tracing::info!(target = "porch::negotiation", peer = %sender, "participant left");
        if let Some(handle) = self.peers.remove(sender) {
            handle.task.abort();
        }
        self.observers.write().unwrap().remove(sender);
        self.media.drop_peer(sender).await;
        let _ = self.events.send(RoomEvent::PeerLeft {
            username: sender.to_string(),
        });
    }

    /// Looks up the peer's signal queue, creating the negotiation lazily.
    /// Creation is idempotent: one instance per remote identity, ever.
    fn peer_signals(&mut self, username: &str) -> mpsc::UnboundedSender<PeerSignal> {
        if let Some(handle) = self.peers.get(username) {
            return handle.signals.clone();
        }

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (negotiation, observer) = PeerNegotiation::new(
            self.local.clone(),
            username.to_string(),
            Arc::clone(&self.channel),
            Arc::clone(&self.media),
            Arc::clone(&self.local_media),
            self.events.clone(),
            self.negotiation_timeout,
        );
        tracing::debug!(
            target = "porch::negotiation",
            peer = %username,
            role = ?observer.role,
            "peer negotiation created"
        );
        let task = tokio::spawn(negotiation.run(signals_rx));
        self.observers
            .write()
            .unwrap()
            .insert(username.to_string(), observer);
        self.peers.insert(
            username.to_string(),
            PeerHandle {
                signals: signals_tx.clone(),
                task,
            },
        );
        signals_tx
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate { peer, candidate } => {
                if let Err(err) = self
                    .channel
                    .send(Some(&peer), Payload::NetworkCandidate { candidate })
                {
                    tracing::warn!(
                        target = "porch::negotiation",
                        peer = %peer,
                        error = %err,
                        "candidate send failed"
                    );
                }
            }
            MediaEvent::RemoteTrack { peer, stream } => {
                let _ = self.events.send(RoomEvent::RemoteMedia {
                    username: peer,
                    stream,
                });
            }
            MediaEvent::PeerConnected { peer } => {
                if let Some(handle) = self.peers.get(&peer) {
                    let _ = handle.signals.send(PeerSignal::MediaLive);
                }
            }
            MediaEvent::PeerFailed { peer, reason } => {
                if let Some(handle) = self.peers.get(&peer) {
                    let _ = handle.signals.send(PeerSignal::MediaFailed(reason));
                }
            }
        }
    }
}
