//! Signaling protocol message definitions
//!
//! One JSON object per text frame, dispatched on the `type` field. Field
//! names follow the wire exactly (camelCase), so browser clients and this
//! crate can share a room.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{Error, Result};

/// Relay-assigned client identifier, unique per signaling connection.
///
/// The sole key for peer connections, and the glare tie-breaker: for any
/// pair of participants, the lexicographically smaller id initiates the
/// offer and the larger one answers. Both sides compute this independently
/// from the same two strings, so no coordination is needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap a raw id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id is the offerer toward `remote`.
    ///
    /// Strict ordering, so an id never initiates toward itself.
    pub fn initiates_toward(&self, remote: &ClientId) -> bool {
        self < remote
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One row of a `participants` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEntry {
    /// Participant client id
    pub id: ClientId,

    /// Display name, when the relay knows one
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `presence` action discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
}

/// `webrtc` action discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebrtcAction {
    Offer,
    Answer,
    Ice,
}

/// SDP kind carried in a `webrtc` offer/answer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as it appears on the wire: `{"type": ..., "sdp": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Whether this SDP is an offer or an answer
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Parse into a webrtc-rs session description
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote SDP: {}", e)))
    }

    /// Build the wire form of a local webrtc-rs session description
    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(Error::SdpError(format!(
                    "Unsupported SDP type on the wire: {}",
                    other
                )))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// ICE candidate as it appears on the wire (`RTCIceCandidateInit` shape).
///
/// `sdpMLineIndex` carries the capital L the way browsers emit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Build the wire form of a locally gathered candidate
    pub fn from_init(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }

    /// Convert into the webrtc-rs candidate init
    pub fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: self.username_fragment,
        }
    }
}

/// Signaling messages exchanged with the relay
///
/// The variant set is closed: frames that do not parse into it are passed
/// through opaquely to the transcript layer and never touch mesh state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Relay assigns this connection its client id (first frame received)
    Welcome {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },

    /// Room roster snapshot, sent to a joiner right after `welcome`
    Participants { participants: Vec<ParticipantEntry> },

    /// Display-name announcement. Outgoing frames omit `clientId`; the
    /// relay stamps the sender id before forwarding.
    Profile {
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,

        #[serde(rename = "displayName")]
        display_name: String,
    },

    /// Relay-originated join/leave notification
    Presence {
        action: PresenceAction,

        #[serde(rename = "clientId")]
        client_id: ClientId,

        /// RFC3339 timestamp stamped by the relay
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<String>,
    },

    /// Offer/answer/ICE exchange between two peers. The relay broadcasts
    /// these within the room; `to` narrows delivery on the receiving side.
    Webrtc {
        action: WebrtcAction,

        from: ClientId,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<SessionDescription>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },

    /// Chat line, opaque to the mesh
    Chat {
        #[serde(rename = "clientId")]
        client_id: ClientId,

        #[serde(rename = "displayName", default)]
        display_name: String,

        text: String,

        /// RFC3339 timestamp stamped by the sender
        ts: String,
    },
}

impl SignalingMessage {
    /// Build an outgoing offer directed at `to`
    pub fn offer(from: ClientId, to: ClientId, sdp: SessionDescription) -> Self {
        Self::Webrtc {
            action: WebrtcAction::Offer,
            from,
            to: Some(to),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    /// Build an outgoing answer directed at `to`
    pub fn answer(from: ClientId, to: ClientId, sdp: SessionDescription) -> Self {
        Self::Webrtc {
            action: WebrtcAction::Answer,
            from,
            to: Some(to),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    /// Build an outgoing ICE candidate directed at `to`
    pub fn ice(from: ClientId, to: ClientId, candidate: IceCandidate) -> Self {
        Self::Webrtc {
            action: WebrtcAction::Ice,
            from,
            to: Some(to),
            sdp: None,
            candidate: Some(candidate),
        }
    }

    /// Build an outgoing profile announcement (relay stamps the sender id)
    pub fn profile(display_name: &str) -> Self {
        Self::Profile {
            client_id: None,
            display_name: display_name.to_string(),
        }
    }

    /// Build an outgoing chat line, timestamped now
    pub fn chat(client_id: ClientId, display_name: &str, text: &str) -> Self {
        Self::Chat {
            client_id,
            display_name: display_name.to_string(),
            text: text.to_string(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Serialize to a JSON wire frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse a JSON wire frame
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn test_client_id_ordering_decides_initiator() {
        let a = ClientId::from("a3");
        let b = ClientId::from("b7");
        assert!(a.initiates_toward(&b));
        assert!(!b.initiates_toward(&a));
        assert!(!a.initiates_toward(&a));
    }

    #[test]
    fn test_welcome_parses() {
        let msg = SignalingMessage::from_json(r#"{"type":"welcome","clientId":"a3"}"#).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Welcome {
                client_id: ClientId::from("a3")
            }
        );
    }

    #[test]
    fn test_participants_snapshot_parses() {
        let json = r#"{"type":"participants","participants":[{"id":"b7","displayName":"Bea"},{"id":"z9"}]}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg {
            SignalingMessage::Participants { participants } => {
                assert_eq!(participants.len(), 2);
                assert_eq!(participants[0].id, ClientId::from("b7"));
                assert_eq!(participants[0].display_name.as_deref(), Some("Bea"));
                assert_eq!(participants[1].id, ClientId::from("z9"));
                assert_eq!(participants[1].display_name, None);
            }
            other => panic!("expected participants, got {:?}", other),
        }
    }

    #[test]
    fn test_outgoing_profile_omits_client_id() {
        let json = SignalingMessage::profile("Ada").to_json().unwrap();
        assert!(!json.contains("clientId"));
        assert!(json.contains(r#""displayName":"Ada""#));
    }

    #[test]
    fn test_presence_parses_with_ts() {
        let json = r#"{"type":"presence","action":"join","clientId":"b7","ts":"2024-05-01T10:00:00Z"}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Presence {
                action: PresenceAction::Join,
                client_id: ClientId::from("b7"),
                ts: Some("2024-05-01T10:00:00Z".to_string()),
            }
        );
    }

    #[test]
    fn test_offer_round_trip() {
        let sdp = SessionDescription {
            kind: SdpKind::Offer,
            sdp: MINIMAL_SDP.to_string(),
        };
        let msg = SignalingMessage::offer(ClientId::from("a3"), ClientId::from("b7"), sdp);
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"webrtc""#));
        assert!(json.contains(r#""action":"offer""#));
        assert!(json.contains(r#""to":"b7""#));
        assert!(!json.contains("candidate"));
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 198.51.100.1 49203 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".to_string()),
        };
        let msg = SignalingMessage::ice(ClientId::from("a3"), ClientId::from("b7"), candidate);
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(json.contains(r#""usernameFragment":"frag""#));
        assert!(!json.contains("sdpMlineIndex"));
    }

    #[test]
    fn test_ice_candidate_tolerates_missing_optionals() {
        let json = r#"{"type":"webrtc","action":"ice","from":"b7","candidate":{"candidate":"candidate:1"}}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg {
            SignalingMessage::Webrtc {
                action: WebrtcAction::Ice,
                candidate: Some(candidate),
                to,
                ..
            } => {
                assert_eq!(to, None);
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(candidate.sdp_mline_index, None);
            }
            other => panic!("expected ice, got {:?}", other),
        }
    }

    #[test]
    fn test_chat_round_trip() {
        let msg = SignalingMessage::chat(ClientId::from("a3"), "Ada", "hello");
        let json = msg.to_json().unwrap();
        let parsed = SignalingMessage::from_json(&json).unwrap();
        match parsed {
            SignalingMessage::Chat {
                client_id,
                display_name,
                text,
                ts,
            } => {
                assert_eq!(client_id, ClientId::from("a3"));
                assert_eq!(display_name, "Ada");
                assert_eq!(text, "hello");
                assert!(ts.ends_with('Z'));
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(SignalingMessage::from_json(r#"{"type":"metrics","value":1}"#).is_err());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_session_description_to_rtc() {
        let wire = SessionDescription {
            kind: SdpKind::Offer,
            sdp: MINIMAL_SDP.to_string(),
        };
        let rtc = wire.to_rtc().unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Offer);
        assert_eq!(rtc.sdp, MINIMAL_SDP);

        let back = SessionDescription::from_rtc(&rtc).unwrap();
        assert_eq!(back, wire);
    }
}
