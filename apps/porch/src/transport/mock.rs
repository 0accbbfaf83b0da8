use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{ChannelError, RoomChannel};
use crate::protocol::{self, Envelope, Inbound, Payload};

/// In-memory stand-in for the room relay. Like the real relay it fans every
/// frame out to all members, sender included, and does no routing of its own;
/// `to` filtering stays a client-side concern. Frames travel as encoded JSON
/// so the wire codec is exercised end to end.
#[derive(Default)]
pub struct RoomHub {
    members: Mutex<Vec<mpsc::UnboundedSender<Inbound>>>,
    log: Mutex<Vec<Envelope>>,
}

impl RoomHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins the room and emits the introduction handshake, mirroring
    /// `WebSocketChannel::connect`.
    pub fn join(
        self: &Arc<Self>,
        username: &str,
        color: Option<&str>,
    ) -> Arc<MockRoomChannel> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.members.lock().unwrap().push(inbound_tx);
        let channel = Arc::new(MockRoomChannel {
            username: username.to_string(),
            hub: Arc::clone(self),
            inbound_rx: AsyncMutex::new(inbound_rx),
        });
        let _ = channel.send(
            None,
            Payload::IntroduceSelf {
                color: color.map(str::to_string),
            },
        );
        channel
    }

    /// Delivers an envelope as if some member had sent it. Tests use this to
    /// impersonate scripted peers.
    pub fn inject(&self, envelope: Envelope) {
        if let Ok(text) = protocol::encode_envelope(&envelope) {
            self.publish(&text);
        }
    }

    /// Delivers raw wire text, valid or otherwise.
    pub fn inject_raw(&self, text: &str) {
        self.publish(text);
    }

    /// Every envelope the hub has relayed, in delivery order.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.log.lock().unwrap().clone()
    }

    fn publish(&self, text: &str) {
        let Ok(inbound) = protocol::decode_inbound(text) else {
            return;
        };
        if let Inbound::Message(envelope) = &inbound {
            self.log.lock().unwrap().push(envelope.clone());
        }
        let members = self.members.lock().unwrap();
        for member in members.iter() {
            let _ = member.send(inbound.clone());
        }
    }
}

pub struct MockRoomChannel {
    username: String,
    hub: Arc<RoomHub>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
}

#[async_trait]
impl RoomChannel for MockRoomChannel {
    fn local_identity(&self) -> &str {
        &self.username
    }

    fn send(&self, to: Option<&str>, payload: Payload) -> Result<(), ChannelError> {
        let envelope = Envelope {
            username: self.username.clone(),
            to: to.map(str::to_string),
            payload,
        };
        let text = protocol::encode_envelope(&envelope)?;
        self.hub.publish(&text);
        Ok(())
    }

    async fn recv(&self) -> Option<Inbound> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }
}
