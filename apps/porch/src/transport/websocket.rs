use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{ChannelError, RoomChannel};
use crate::protocol::{self, Envelope, Inbound, Payload};

/// WebSocket room channel. One connection per room; a writer task drains the
/// outbound queue, a reader task decodes inbound frames. The connection is
/// CONNECTED once `connect` returns and the introduction handshake has been
/// queued ahead of any other traffic.
pub struct WebSocketChannel {
    username: String,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketChannel {
    pub async fn connect(
        server_base: &str,
        room: &str,
        username: &str,
        color: Option<&str>,
    ) -> Result<Arc<Self>, ChannelError> {
        let websocket_url = derive_room_url(server_base, room)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| ChannelError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "porch::channel",
            url = %websocket_url,
            username,
            "room websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let writer_handle = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                match protocol::encode_envelope(&envelope) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "porch::channel",
                            error = %err,
                            "dropping unencodable envelope"
                        );
                    }
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => forward_frame(&inbound_tx, &text),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            forward_frame(&inbound_tx, &text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(
                            target = "porch::channel",
                            error = %err,
                            "room websocket error"
                        );
                        break;
                    }
                }
            }
            // inbound_tx drops here; recv() starts returning None
        });

        let channel = Arc::new(Self {
            username: username.to_string(),
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        });

        // Presence before negotiation: announce ourselves before any other
        // traffic can go out.
        channel.send(
            None,
            Payload::IntroduceSelf {
                color: color.map(str::to_string),
            },
        )?;

        Ok(channel)
    }
}

fn forward_frame(inbound_tx: &mpsc::UnboundedSender<Inbound>, text: &str) {
    match protocol::decode_inbound(text) {
        Ok(inbound) => {
            let _ = inbound_tx.send(inbound);
        }
        Err(err) => {
            tracing::warn!(
                target = "porch::channel",
                error = %err,
                "discarding non-JSON frame"
            );
        }
    }
}

#[async_trait]
impl RoomChannel for WebSocketChannel {
    fn local_identity(&self) -> &str {
        &self.username
    }

    fn send(&self, to: Option<&str>, payload: Payload) -> Result<(), ChannelError> {
        let envelope = Envelope {
            username: self.username.clone(),
            to: to.map(str::to_string),
            payload,
        };
        self.outbound_tx
            .send(envelope)
            .map_err(|_| ChannelError::Closed)
    }

    async fn recv(&self) -> Option<Inbound> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn derive_room_url(server_base: &str, room: &str) -> Result<Url, ChannelError> {
    let mut base = server_base.trim().to_string();
    if base.is_empty() {
        return Err(ChannelError::Setup("room server url cannot be empty".into()));
    }
    if !base.contains("://") {
        base = format!("http://{base}");
    }
    let base = Url::parse(&base)
        .map_err(|err| ChannelError::Setup(format!("invalid room server url {base}: {err}")))?;

    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::Setup(format!(
                "unsupported room server scheme {other}"
            )));
        }
    };
    ws.set_scheme(scheme)
        .map_err(|_| ChannelError::Setup("invalid websocket scheme".into()))?;
    ws.set_path(&format!("ws/{room}"));
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}
