use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::config::Config;
use crate::media::{MediaConstraints, MediaError, MediaEvent, MediaStack, MediaStreamHandle};
use crate::media::rtc::{RtcConfig, RtcMediaStack};
use crate::negotiation::{NegotiationEngine, PeerObserver};
use crate::protocol::Payload;
use crate::transport::{ChannelError, RoomChannel, WebSocketChannel};

/// Everything the UI layer needs to render the room, delivered over one
/// stream in arrival order.
#[derive(Debug)]
pub enum RoomEvent {
    PeerJoined {
        username: String,
        color: Option<String>,
    },
    PeerLeft {
        username: String,
    },
    Chat {
        username: String,
        color: Option<String>,
        message: String,
    },
    PeerConnected {
        username: String,
    },
    RemoteMedia {
        username: String,
        stream: MediaStreamHandle,
    },
    NegotiationFailed {
        username: String,
        reason: String,
    },
    Unhandled {
        message: Value,
    },
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("room event stream already taken")]
    EventsTaken,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub username: String,
    pub color: Option<String>,
    pub constraints: MediaConstraints,
    pub negotiation_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            color: Some(random_color().to_string()),
            constraints: MediaConstraints::AUDIO_VIDEO,
            negotiation_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

/// One joined room: the channel, the negotiation engine, and the event
/// stream the UI consumes.
pub struct RoomSession {
    username: String,
    color: Option<String>,
    channel: Arc<dyn RoomChannel>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
    observers: Arc<StdRwLock<HashMap<String, PeerObserver>>>,
    engine_task: tokio::task::JoinHandle<()>,
}

impl RoomSession {
    /// Connects over WebSocket with the `webrtc`-backed media stack.
    pub async fn connect(
        config: &Config,
        room: &str,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        if options.username.trim().is_empty() {
            return Err(SessionError::InvalidOptions("username cannot be empty".into()));
        }
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let media = RtcMediaStack::new(
            RtcConfig {
                stun_servers: config.stun_servers.clone(),
            },
            media_tx,
        )?;
        let channel = WebSocketChannel::connect(
            &config.server,
            room,
            &options.username,
            options.color.as_deref(),
        )
        .await?;
        Ok(Self::spawn(options, channel, media, media_rx))
    }

    /// Wires a session onto an already-connected channel and media stack.
    /// The channel is expected to have emitted its introduction handshake.
    pub fn spawn(
        options: SessionOptions,
        channel: Arc<dyn RoomChannel>,
        media: Arc<dyn MediaStack>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let observers = Arc::new(StdRwLock::new(HashMap::new()));
        let engine = NegotiationEngine::new(
            options.username.clone(),
            options.color.clone(),
            Arc::clone(&channel),
            media,
            events_tx,
            Arc::clone(&observers),
            options.constraints,
            options.negotiation_timeout,
        );
        let engine_task = tokio::spawn(engine.run(media_events));
        Self {
            username: options.username,
            color: options.color,
            channel,
            events_rx: AsyncMutex::new(Some(events_rx)),
            observers,
            engine_task,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn send_chat(&self, message: impl Into<String>) -> Result<(), ChannelError> {
        self.channel.send(
            None,
            Payload::ChatMessage {
                color: self.color.clone(),
                message: message.into(),
            },
        )
    }

    /// The room event stream. Can be taken once.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<RoomEvent>, SessionError> {
        let mut guard = self.events_rx.lock().await;
        guard.take().ok_or(SessionError::EventsTaken)
    }

    /// Observer for the negotiation with `username`, if one exists yet.
    pub fn peer(&self, username: &str) -> Option<PeerObserver> {
        self.observers.read().unwrap().get(username).cloned()
    }

    /// Announces departure and tears the session down. Peer tasks end when
    /// their queues close; per-peer media is released by the remote sides'
    /// own teardown handling.
    pub async fn leave(self) {
        if let Err(err) = self.channel.send(None, Payload::Leave) {
            tracing::debug!(
                target = "porch::negotiation",
                error = %err,
                "leave broadcast failed"
            );
        }
        self.engine_task.abort();
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.engine_task.abort();
    }
}

/// Display colors carried in introductions.
const AVAILABLE_COLORS: &[&str] = &[
    "lightblue",
    "pink",
    "lightgreen",
    "yellow",
    "aquamarine",
    "coral",
    "gold",
    "khaki",
    "lavender",
    "lightsalmon",
    "mediumturquoise",
    "palegreen",
    "peachpuff",
    "plum",
    "powderblue",
    "salmon",
    "skyblue",
    "springgreen",
    "thistle",
    "violet",
    "wheat",
];

pub fn random_color() -> &'static str {
    let mut rng = rand::thread_rng();
    AVAILABLE_COLORS
        .choose(&mut rng)
        .copied()
        .unwrap_or("lightblue")
}
