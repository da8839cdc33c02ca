//! Signaling: wire protocol and relay channel

pub mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, ChannelStatus, SignalSink, SignalingChannel};
pub use protocol::{
    ClientId, IceCandidate, ParticipantEntry, PresenceAction, SdpKind, SessionDescription,
    SignalingMessage, WebrtcAction,
};
