use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Inbound, Payload};

pub mod mock;
pub mod websocket;

pub use mock::{MockRoomChannel, RoomHub};
pub use websocket::WebSocketChannel;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel setup failed: {0}")]
    Setup(String),
    #[error("room channel closed")]
    Closed,
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The room-scoped send/broadcast channel the negotiation engine sits on.
///
/// `send` attaches the local sender identity to every envelope before
/// transmission; callers only name the recipient (`None` = broadcast) and the
/// payload. Delivery is fan-out, unordered across peers, at-most-once.
#[async_trait]
pub trait RoomChannel: Send + Sync {
    fn local_identity(&self) -> &str;

    fn send(&self, to: Option<&str>, payload: Payload) -> Result<(), ChannelError>;

    /// Next inbound message. `None` means the channel is gone for good; there
    /// is no automatic reconnect.
    async fn recv(&self) -> Option<Inbound>;
}
