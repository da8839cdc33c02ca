//! Peer connections: one link per remote participant

pub mod link;
pub mod manager;

pub use link::{NegotiationState, PeerEvent, PeerEventKind, PeerLink};
pub use manager::PeerManager;
