//! Full-mesh WebRTC room engine over a thin WebSocket relay
//!
//! This crate connects to a room on a message-relay signaling server and
//! negotiates one direct WebRTC audio/video connection per remote
//! participant, maintaining the full mesh as people come and go.
//!
//! # Features
//!
//! - **Full-mesh topology**: one peer connection per remote participant
//! - **Deterministic negotiation**: the lexicographically smaller client
//!   id always initiates, so two peers never offer to each other at once
//! - **Media gating**: inbound offers queue until local capture is ready,
//!   latest offer per sender wins
//! - **Self-healing roster**: presence events and additive participant
//!   snapshots drive link reconciliation
//! - **Chat and profile passthrough**: room chat and display names ride
//!   the same signaling channel
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Relay server (ws[s]://host/ws/{room})               │
//! │  ↓ (JSON frames, broadcast within the room)          │
//! │  SignalingChannel (reader/writer tasks)              │
//! │  ↓ events              ↑ messages                    │
//! │  RoomEngine (single task owning all room state)      │
//! │  ├─ ParticipantRegistry (roster + display names)     │
//! │  ├─ MediaGate (local capture readiness)              │
//! │  ├─ PeerManager (one PeerLink per remote)            │
//! │  └─ pending offers (queued until media is ready)     │
//! │     ↓ watch::Receiver<RoomSnapshot> + RoomEvents     │
//! │  embedding UI / CLI                                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peermesh::RoomConfig;
//!
//! let config = RoomConfig::new("ws://localhost:8080", "standup")
//!     .with_display_name("Ada");
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.room, "standup");
//! ```
//!
//! ## Joining a room
//!
//! ```no_run
//! use std::sync::Arc;
//! use peermesh::{RoomConfig, RoomEngine, SyntheticCapture};
//!
//! # async fn example() -> peermesh::Result<()> {
//! let config = RoomConfig::new("wss://example.com", "standup")
//!     .with_display_name("Ada");
//!
//! let mut room = RoomEngine::join(config, Arc::new(SyntheticCapture)).await?;
//! room.send_chat("hello")?;
//!
//! while let Some(event) = room.next_event().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod peer;
pub mod registry;
pub mod signaling;

pub use config::{IceConfig, RoomConfig, TurnServer};
pub use engine::{
    ParticipantSnapshot, PeerSnapshot, RoomEngine, RoomEvent, RoomHandle, RoomSnapshot,
};
pub use error::{Error, Result};
pub use media::{CaptureSource, LocalMedia, MediaGate, MediaState, SyntheticCapture};
pub use peer::{NegotiationState, PeerLink, PeerManager};
pub use registry::{Participant, ParticipantRegistry};
pub use signaling::{
    ChannelStatus, ClientId, IceCandidate, SessionDescription, SignalingChannel, SignalingMessage,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
