//! Per-remote peer connection and negotiation steps
//!
//! A [`PeerLink`] wraps one `RTCPeerConnection` toward one remote
//! participant. The engine loop owns every link and drives its state
//! machine; the link itself only wires observers and exposes the
//! individual negotiation steps as async functions the engine spawns.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceConfig;
use crate::media::LocalMedia;
use crate::signaling::protocol::{ClientId, IceCandidate, SessionDescription};
use crate::{Error, Result};

/// Negotiation progress for one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Link exists, no SDP exchanged yet
    Idle,
    /// Building the local offer
    Offering,
    /// Offer sent, waiting for the remote answer
    AwaitingAnswer,
    /// Remote offer applied, answer being built or already sent
    Answering,
    /// Remote answer applied, waiting for the transport to come up
    Connecting,
    /// Transport reported connected
    Connected,
    /// Transport reported failed
    Failed,
    /// Transport reported closed
    Closed,
}

impl NegotiationState {
    /// Terminal states never transition again on their own
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Answering => "answering",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Observer activity reported back into the engine loop
#[derive(Debug)]
pub struct PeerEvent {
    /// Remote participant the event belongs to
    pub remote_id: ClientId,
    /// Link generation the event was produced under; events from a
    /// generation that no longer matches the live link are dropped
    pub generation: u64,
    pub kind: PeerEventKind,
}

pub enum PeerEventKind {
    /// A local ICE candidate finished gathering
    LocalCandidate(IceCandidate),
    /// The underlying transport changed state
    StateChanged(RTCPeerConnectionState),
    /// A remote track started arriving
    RemoteTrack(Arc<TrackRemote>),
}

// TrackRemote carries no Debug impl, so spell one out for the variants
// that hold it.
impl fmt::Debug for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEventKind::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEventKind::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            PeerEventKind::RemoteTrack(track) => f
                .debug_struct("RemoteTrack")
                .field("id", &track.id())
                .field("stream_id", &track.stream_id())
                .finish(),
        }
    }
}

/// One connection toward one remote participant
pub struct PeerLink {
    remote_id: ClientId,
    generation: u64,
    state: NegotiationState,
    peer_connection: Arc<RTCPeerConnection>,
}

impl PeerLink {
    /// Create the underlying peer connection and wire its observers
    ///
    /// Observers run on webrtc-rs internal tasks, so they never touch
    /// link state directly; they post [`PeerEvent`]s that re-enter the
    /// engine loop.
    ///
    /// # Example
    ///
    /// ```
    /// use peermesh::{IceConfig, PeerLink};
    /// use tokio::sync::mpsc;
    ///
    /// # tokio_test::block_on(async {
    /// let (events, _rx) = mpsc::unbounded_channel();
    /// let link = PeerLink::connect("b7".into(), 1, &IceConfig::default(), events)
    ///     .await
    ///     .unwrap();
    /// assert_eq!(link.remote_id().as_str(), "b7");
    /// # });
    /// ```
    pub async fn connect(
        remote_id: ClientId,
        generation: u64,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        info!(
            "Creating peer link: remote={}, generation={}",
            remote_id, generation
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        // Locally gathered candidates go out through the engine, which
        // stamps the from/to routing fields.
        let candidate_events = events.clone();
        let candidate_remote = remote_id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            let remote_id = candidate_remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent {
                            remote_id,
                            generation,
                            kind: PeerEventKind::LocalCandidate(IceCandidate::from_init(init)),
                        });
                    }
                    Err(e) => debug!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        let state_remote = remote_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_events.clone();
                let remote_id = state_remote.clone();
                Box::pin(async move {
                    debug!("Peer {} transport state: {}", remote_id, s);
                    let _ = events.send(PeerEvent {
                        remote_id,
                        generation,
                        kind: PeerEventKind::StateChanged(s),
                    });
                })
            },
        ));

        let track_remote_id = remote_id.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            let remote_id = track_remote_id.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent {
                    remote_id,
                    generation,
                    kind: PeerEventKind::RemoteTrack(track),
                });
            })
        }));

        Ok(Self {
            remote_id,
            generation,
            state: NegotiationState::Idle,
            peer_connection,
        })
    }

    /// Remote participant this link points at
    pub fn remote_id(&self) -> &ClientId {
        &self.remote_id
    }

    /// Generation this link was created under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Record a negotiation state transition
    pub fn set_state(&mut self, new_state: NegotiationState) {
        if self.state != new_state {
            debug!(
                "Peer {} negotiation: {} -> {}",
                self.remote_id, self.state, new_state
            );
            self.state = new_state;
        }
    }

    /// Shared handle to the underlying connection, for spawned steps
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.peer_connection)
    }

    /// Attach the local audio and video tracks to this connection
    ///
    /// Idempotent: a track whose id already has a sender is skipped, so
    /// calling this again after media becomes ready never stacks
    /// duplicate senders.
    pub async fn attach_local_tracks(&self, media: &LocalMedia) -> Result<()> {
        let mut attached = Vec::new();
        for sender in self.peer_connection.get_senders().await {
            if let Some(track) = sender.track().await {
                attached.push(track.id().to_string());
            }
        }

        let tracks: [Arc<dyn TrackLocal + Send + Sync>; 2] = [
            Arc::clone(&media.audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&media.video) as Arc<dyn TrackLocal + Send + Sync>,
        ];

        for track in tracks {
            if attached.iter().any(|id| id == track.id()) {
                continue;
            }
            debug!("Attaching local track {} for peer {}", track.id(), self.remote_id);
            self.peer_connection
                .add_track(track)
                .await
                .map_err(|e| Error::MediaTrackError(format!("Failed to add local track: {}", e)))?;
        }

        Ok(())
    }

    /// Close the underlying connection
    pub async fn close(self) -> Result<()> {
        info!("Closing peer link to {}", self.remote_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

/// Create the local offer and apply it as the local description
pub async fn build_offer(peer_connection: &RTCPeerConnection) -> Result<SessionDescription> {
    let offer = peer_connection
        .create_offer(None)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

    peer_connection
        .set_local_description(offer)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

    let local_desc = peer_connection
        .local_description()
        .await
        .ok_or_else(|| Error::SdpError("No local description after setting offer".to_string()))?;

    SessionDescription::from_rtc(&local_desc)
}

/// Apply a remote offer, then create and apply the local answer
pub async fn build_answer(
    peer_connection: &RTCPeerConnection,
    offer: &SessionDescription,
) -> Result<SessionDescription> {
    peer_connection
        .set_remote_description(offer.to_rtc()?)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

    peer_connection
        .set_local_description(answer)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

    let local_desc = peer_connection
        .local_description()
        .await
        .ok_or_else(|| Error::SdpError("No local description after setting answer".to_string()))?;

    SessionDescription::from_rtc(&local_desc)
}

/// Apply the remote answer to a link we offered on
pub async fn apply_answer(
    peer_connection: &RTCPeerConnection,
    answer: &SessionDescription,
) -> Result<()> {
    peer_connection
        .set_remote_description(answer.to_rtc()?)
        .await
        .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
}

/// Add a relayed ICE candidate to this link
pub async fn add_remote_candidate(
    peer_connection: &RTCPeerConnection,
    candidate: IceCandidate,
) -> Result<()> {
    peer_connection
        .add_ice_candidate(candidate.into_init())
        .await
        .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
}
