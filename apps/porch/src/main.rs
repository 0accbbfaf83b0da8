use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use porch_client_core::config::Config;
use porch_client_core::media::MediaConstraints;
use porch_client_core::session::{RoomEvent, RoomSession, SessionOptions};

#[derive(Parser, Debug)]
#[command(name = "porch", about = "Hang out in a room: text chat plus peer-to-peer audio/video.")]
struct Cli {
    /// Room to join; a fresh room id is generated when omitted.
    #[arg(long, short = 'r')]
    room: Option<String>,

    /// Display name, unique within the room.
    #[arg(long, short = 'u')]
    username: String,

    /// Display color; picked at random when omitted.
    #[arg(long)]
    color: Option<String>,

    /// Room server base URL.
    #[arg(long, env = "PORCH_SERVER")]
    server: Option<String>,

    /// Skip microphone capture.
    #[arg(long)]
    no_audio: bool,

    /// Skip camera capture.
    #[arg(long)]
    no_video: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server = server;
    }

    let room = cli
        .room
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut options = SessionOptions::new(cli.username.clone()).with_constraints(MediaConstraints {
        audio: !cli.no_audio,
        video: !cli.no_video,
    });
    options.negotiation_timeout = config.negotiation_timeout;
    if let Some(color) = cli.color {
        options = options.with_color(color);
    }

    let session = RoomSession::connect(&config, &room, options).await?;
    let mut events = session
        .events()
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    println!("room: {room}");
    println!("type to chat, /quit to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(err) = session.send_chat(line) {
                        eprintln!("! chat send failed: {err}");
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
        }
    }

    session.leave().await;
    Ok(())
}

fn print_event(event: RoomEvent) {
    match event {
        RoomEvent::PeerJoined { username, .. } => {
            println!("* {username} enters the room");
        }
        RoomEvent::PeerLeft { username } => {
            println!("* {username} leaves the room");
        }
        RoomEvent::Chat {
            username, message, ..
        } => {
            println!("<{username}> {message}");
        }
        RoomEvent::PeerConnected { username } => {
            println!("* call with {username} is up");
        }
        RoomEvent::RemoteMedia { username, stream } => {
            println!("* receiving {} from {username}", stream.kind);
        }
        RoomEvent::NegotiationFailed { username, reason } => {
            println!("! call with {username} failed: {reason}");
        }
        RoomEvent::Unhandled { message } => {
            println!(
                "? {}",
                serde_json::to_string(&message).unwrap_or_else(|_| "<garbled>".into())
            );
        }
        RoomEvent::ChannelClosed => {
            println!("! disconnected from room server");
        }
    }
}
