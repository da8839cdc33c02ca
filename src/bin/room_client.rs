//! Headless room client binary
//!
//! Joins a room, keeps the peer mesh alive and logs room activity until
//! Ctrl+C. Local media comes from the synthetic capture source, so this
//! is mainly useful for soaking a relay or populating a room that real
//! browser clients join.
//!
//! # Usage
//!
//! ```bash
//! # Join a room on a local relay
//! cargo run --bin room_client -- --room standup --display-name Ada
//!
//! # Join through TLS with a token
//! cargo run --bin room_client -- \
//!   --signaling-url wss://rooms.example.com \
//!   --room standup \
//!   --token s3cret
//!
//! # Configure ICE servers
//! cargo run --bin room_client -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --turn-servers turn:turn.example.com:3478:alice:hunter2
//! ```

use std::sync::Arc;

use clap::Parser;
use peermesh::{RoomConfig, RoomEngine, RoomEvent, SyntheticCapture, TurnServer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peer-mesh room client
///
/// Connects to a relay room and negotiates a WebRTC connection to every
/// other participant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base signaling server URL
    #[arg(
        long,
        default_value = "ws://localhost:8080",
        env = "PEERMESH_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Room to join
    #[arg(long, default_value = "lobby", env = "PEERMESH_ROOM")]
    room: String,

    /// Bearer token passed to the relay as a query parameter
    #[arg(long, env = "PEERMESH_TOKEN")]
    token: Option<String>,

    /// Display name announced to other participants
    #[arg(long, env = "PEERMESH_DISPLAY_NAME")]
    display_name: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "PEERMESH_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Join with the microphone flag on (the mesh starts muted)
    #[arg(long, default_value_t = false)]
    unmuted: bool,

    /// Join with the camera flag on
    #[arg(long, default_value_t = false)]
    camera_on: bool,
}

/// Parse a TURN server string (format: turn:host:port:username:password
/// or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServer, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    let host = parts[1];
    let port = parts[2];
    let username = parts[3].to_string();
    // Password may contain colons, so join remaining parts
    let credential = parts[4..].join(":");

    Ok(TurnServer {
        url: format!("{}:{}:{}", protocol, host, port),
        username,
        credential,
    })
}

fn build_config_from_args(args: &Args) -> Result<RoomConfig, String> {
    let mut config = RoomConfig::new(&args.signaling_url, &args.room)
        .with_stun_servers(args.stun_servers.clone());

    if let Some(token) = &args.token {
        config = config.with_token(token);
    }
    if let Some(name) = &args.display_name {
        config = config.with_display_name(name);
    }

    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn = parse_turn_server(turn_str)?;
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
        turn_servers.push(turn);
    }
    if !turn_servers.is_empty() {
        config = config.with_turn_servers(turn_servers);
    }

    Ok(config)
}

fn init_tracing() {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config_from_args(&args).map_err(anyhow::Error::msg)?;
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %config.signaling_url,
        room = %config.room,
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        "Room client starting"
    );

    let mut room = RoomEngine::join(config, Arc::new(SyntheticCapture)).await?;
    if args.unmuted {
        room.set_mic(true)?;
    }
    if args.camera_on {
        room.set_cam(true)?;
    }

    info!("Joined. Press Ctrl+C to leave.");

    loop {
        tokio::select! {
            maybe_event = room.next_event() => {
                let Some(event) = maybe_event else {
                    warn!("Room engine stopped");
                    return Ok(());
                };
                log_event(&event, &room);
                if matches!(event, RoomEvent::ChannelClosed { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, leaving room");
                break;
            }
        }
    }

    room.leave().await?;
    info!("Left room");
    Ok(())
}

fn log_event(event: &RoomEvent, room: &peermesh::RoomHandle) {
    match event {
        RoomEvent::Welcome { client_id } => {
            info!("Registered as {}", client_id);
        }
        RoomEvent::ParticipantJoined { client_id } => {
            let snapshot = room.current();
            info!(
                "{} joined ({} participants)",
                client_id,
                snapshot.participants.len()
            );
        }
        RoomEvent::ParticipantLeft { client_id } => {
            let snapshot = room.current();
            info!(
                "{} left ({} participants)",
                client_id,
                snapshot.participants.len()
            );
        }
        RoomEvent::Chat {
            display_name, text, ..
        } => {
            info!("[{}] {}", display_name, text);
        }
        RoomEvent::RemoteTrack { from, track } => {
            info!(
                "Receiving {} track from {} (stream {})",
                track.kind(),
                from,
                track.stream_id()
            );
        }
        RoomEvent::Raw { text } => {
            info!("Relay frame: {}", text);
        }
        RoomEvent::ChannelClosed { error } => match error {
            Some(e) => warn!("Signaling channel lost: {}", e),
            None => info!("Signaling channel closed"),
        },
    }
}
