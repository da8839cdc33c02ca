//! The room engine: one task owning all mutable room state
//!
//! Every state transition happens inside the engine loop, in reaction
//! to an inbound signaling frame, a local command, or the completion of
//! a spawned negotiation step. Handlers run to completion before the
//! next event is taken, so the registry, media gate, peer links and
//! pending-offer queue need no locks.
//!
//! SDP work is too slow to run inline; the loop spawns each step and
//! the result re-enters as an event. A completion re-checks the world
//! on arrival: if the link is gone or its generation changed, the link
//! was torn down mid-step and the completion is dropped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::config::RoomConfig;
use crate::media::{CaptureSource, LocalMedia, MediaGate, MediaState};
use crate::peer::link::{self, NegotiationState, PeerEvent, PeerEventKind};
use crate::peer::manager::PeerManager;
use crate::registry::ParticipantRegistry;
use crate::signaling::channel::{ChannelEvent, ChannelStatus, SignalSink, SignalingChannel};
use crate::signaling::protocol::{
    ClientId, IceCandidate, PresenceAction, SessionDescription, SignalingMessage, WebrtcAction,
};
use crate::{Error, Result};

/// Room activity surfaced to the embedding layer
#[derive(Clone)]
pub enum RoomEvent {
    /// The relay assigned our client id
    Welcome { client_id: ClientId },
    /// A participant joined the room
    ParticipantJoined { client_id: ClientId },
    /// A participant left the room
    ParticipantLeft { client_id: ClientId },
    /// A chat line, inbound or our own echo
    Chat {
        from: ClientId,
        display_name: String,
        text: String,
        ts: String,
    },
    /// A remote track started; hand it to a decode/playout layer
    RemoteTrack {
        from: ClientId,
        track: Arc<TrackRemote>,
    },
    /// A frame that did not parse as a known message, passed through
    Raw { text: String },
    /// The signaling socket is gone
    ChannelClosed { error: Option<String> },
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomEvent::Welcome { client_id } => {
                f.debug_struct("Welcome").field("client_id", client_id).finish()
            }
            RoomEvent::ParticipantJoined { client_id } => f
                .debug_struct("ParticipantJoined")
                .field("client_id", client_id)
                .finish(),
            RoomEvent::ParticipantLeft { client_id } => f
                .debug_struct("ParticipantLeft")
                .field("client_id", client_id)
                .finish(),
            RoomEvent::Chat {
                from,
                display_name,
                text,
                ts,
            } => f
                .debug_struct("Chat")
                .field("from", from)
                .field("display_name", display_name)
                .field("text", text)
                .field("ts", ts)
                .finish(),
            RoomEvent::RemoteTrack { from, track } => f
                .debug_struct("RemoteTrack")
                .field("from", from)
                .field("track_id", &track.id())
                .field("stream_id", &track.stream_id())
                .finish(),
            RoomEvent::Raw { text } => f.debug_struct("Raw").field("text", text).finish(),
            RoomEvent::ChannelClosed { error } => {
                f.debug_struct("ChannelClosed").field("error", error).finish()
            }
        }
    }
}

/// One participant row in the published room state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub id: ClientId,
    pub display_name: String,
    pub is_self: bool,
}

/// One peer link row in the published room state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub remote_id: ClientId,
    pub state: NegotiationState,
    pub remote_stream_id: Option<String>,
}

/// Full room state, published on the watch channel after every event
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub status: ChannelStatus,
    pub local_id: Option<ClientId>,
    /// Participants in first-seen order, including ourselves
    pub participants: Vec<ParticipantSnapshot>,
    /// Peer links sorted by remote id
    pub peers: Vec<PeerSnapshot>,
    pub media: MediaState,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
}

impl RoomSnapshot {
    fn initial() -> Self {
        Self {
            status: ChannelStatus::Connecting,
            local_id: None,
            participants: Vec::new(),
            peers: Vec::new(),
            media: MediaState::Pending,
            mic_enabled: false,
            cam_enabled: false,
        }
    }

    /// Peer row for `remote`, if a link exists
    pub fn peer(&self, remote: &ClientId) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| &p.remote_id == remote)
    }

    /// Participant row for `id`, if present
    pub fn participant(&self, id: &ClientId) -> Option<&ParticipantSnapshot> {
        self.participants.iter().find(|p| &p.id == id)
    }
}

enum RoomCommand {
    SendChat(String),
    SetMic(bool),
    SetCam(bool),
    Leave(oneshot::Sender<()>),
}

/// Handle to a joined room
///
/// Dropping the handle shuts the engine down the same way
/// [`RoomHandle::leave`] does, minus the acknowledgement.
pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshot: watch::Receiver<RoomSnapshot>,
    events: mpsc::UnboundedReceiver<RoomEvent>,
}

impl RoomHandle {
    /// Watch receiver for room state; changes after every handled event
    pub fn snapshot(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.clone()
    }

    /// The most recently published room state
    pub fn current(&self) -> RoomSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Next room event, or `None` once the engine has stopped
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    /// Broadcast a chat line to the room
    pub fn send_chat(&self, text: &str) -> Result<()> {
        self.command(RoomCommand::SendChat(text.to_string()))
    }

    /// Toggle the local microphone flag
    pub fn set_mic(&self, enabled: bool) -> Result<()> {
        self.command(RoomCommand::SetMic(enabled))
    }

    /// Toggle the local camera flag
    pub fn set_cam(&self, enabled: bool) -> Result<()> {
        self.command(RoomCommand::SetCam(enabled))
    }

    /// Leave the room: close every peer link, release the local media
    /// and close the signaling socket
    pub async fn leave(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(RoomCommand::Leave(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| Error::EngineStopped("Room engine stopped before leave completed".to_string()))
    }

    fn command(&self, command: RoomCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::EngineStopped("Room engine is no longer running".to_string()))
    }
}

/// Completion of a spawned negotiation step
struct StepComplete {
    remote_id: ClientId,
    generation: u64,
    outcome: StepOutcome,
}

enum StepOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    AnswerApplied,
    Failed { stage: &'static str, error: Error },
}

enum InternalEvent {
    CaptureReady(LocalMedia),
    CaptureFailed(String),
    Step(StepComplete),
}

/// Offers that arrived before local media was ready
///
/// Holds the latest offer per sender while preserving each sender's
/// first-arrival position, so the flush answers in the order senders
/// first showed up.
#[derive(Debug, Default)]
struct PendingOfferQueue {
    entries: Vec<(ClientId, SessionDescription)>,
}

impl PendingOfferQueue {
    fn enqueue(&mut self, from: &ClientId, sdp: SessionDescription) {
        if let Some(slot) = self.entries.iter_mut().find(|(id, _)| id == from) {
            // newer offer replaces the stale one, position kept
            slot.1 = sdp;
        } else {
            self.entries.push((from.clone(), sdp));
        }
    }

    fn drain(&mut self) -> Vec<(ClientId, SessionDescription)> {
        std::mem::take(&mut self.entries)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The engine task state; constructed by [`RoomEngine::join`] and owned
/// by the spawned loop from then on
pub struct RoomEngine {
    config: RoomConfig,
    sink: Arc<dyn SignalSink>,
    registry: ParticipantRegistry,
    gate: MediaGate,
    manager: PeerManager,
    pending_offers: PendingOfferQueue,
    local_id: Option<ClientId>,
    status: ChannelStatus,
    snapshot_tx: watch::Sender<RoomSnapshot>,
    room_events: mpsc::UnboundedSender<RoomEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
}

impl RoomEngine {
    /// Join a room: connect the signaling channel, start acquiring
    /// local media, and spawn the engine loop
    pub async fn join(config: RoomConfig, capture: Arc<dyn CaptureSource>) -> Result<RoomHandle> {
        config.validate()?;
        let url = config.room_url()?;

        info!("Joining room {} via {}", config.room, url);
        let (channel, channel_rx) = SignalingChannel::connect(url.as_str()).await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (room_tx, room_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RoomSnapshot::initial());

        // capture acquisition runs off-loop; its completion re-enters
        // as an event like any other
        let capture_tx = internal_tx.clone();
        tokio::spawn(async move {
            match capture.acquire().await {
                Ok(media) => {
                    let _ = capture_tx.send(InternalEvent::CaptureReady(media));
                }
                Err(e) => {
                    let _ = capture_tx.send(InternalEvent::CaptureFailed(e.to_string()));
                }
            }
        });

        let engine = RoomEngine {
            manager: PeerManager::new(config.ice.clone(), peer_tx),
            config,
            sink: Arc::new(channel),
            registry: ParticipantRegistry::new(),
            gate: MediaGate::new(),
            pending_offers: PendingOfferQueue::default(),
            local_id: None,
            status: ChannelStatus::Open,
            snapshot_tx,
            room_events: room_tx,
            internal_tx,
        };

        tokio::spawn(engine.run(channel_rx, peer_rx, internal_rx, command_rx));

        Ok(RoomHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: room_rx,
        })
    }

    async fn run(
        mut self,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
        mut command_rx: mpsc::UnboundedReceiver<RoomCommand>,
    ) {
        info!("Room engine started");
        self.publish_snapshot();

        let mut channel_done = false;
        loop {
            tokio::select! {
                maybe = channel_rx.recv(), if !channel_done => match maybe {
                    Some(event) => self.handle_channel_event(event).await,
                    None => channel_done = true,
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                Some(event) = internal_rx.recv() => self.handle_internal_event(event).await,
                maybe = command_rx.recv() => {
                    let stop = match maybe {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            // handle dropped without an explicit leave
                            self.shutdown(None).await;
                            true
                        }
                    };
                    if stop {
                        break;
                    }
                }
            }
            self.publish_snapshot();
        }

        info!("Room engine stopped");
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(text) => self.handle_frame(text).await,
            ChannelEvent::Closed { error } => {
                match &error {
                    Some(e) => {
                        warn!("Signaling channel failed: {}", e);
                        self.status = ChannelStatus::Error;
                    }
                    None => {
                        info!("Signaling channel closed");
                        self.status = ChannelStatus::Closed;
                    }
                }
                // peer links stay up; established media keeps flowing
                // without signaling until the user leaves
                self.emit(RoomEvent::ChannelClosed { error });
            }
        }
    }

    async fn handle_frame(&mut self, text: String) {
        match SignalingMessage::from_json(&text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                debug!("Passing through unparseable frame: {}", e);
                self.emit(RoomEvent::Raw { text });
            }
        }
    }

    async fn handle_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Welcome { client_id } => self.handle_welcome(client_id).await,
            SignalingMessage::Participants { participants } => {
                // additive merge: the snapshot can only introduce
                // participants, never remove them
                self.registry.merge_snapshot(&participants);
                self.announce_profile();
                self.reconcile().await;
            }
            SignalingMessage::Profile {
                client_id,
                display_name,
            } => match client_id {
                Some(id) => self.registry.set_name(&id, &display_name),
                None => warn!("Ignoring profile without a client id"),
            },
            SignalingMessage::Presence {
                action, client_id, ..
            } => match action {
                PresenceAction::Join => {
                    if self.registry.upsert(&client_id) {
                        info!("Participant {} joined", client_id);
                    }
                    self.announce_profile();
                    self.emit(RoomEvent::ParticipantJoined { client_id });
                    self.reconcile().await;
                }
                PresenceAction::Leave => {
                    if self.registry.remove(&client_id) {
                        info!("Participant {} left", client_id);
                    }
                    self.emit(RoomEvent::ParticipantLeft { client_id });
                    self.reconcile().await;
                }
            },
            SignalingMessage::Webrtc {
                action,
                from,
                to,
                sdp,
                candidate,
            } => self.handle_webrtc(action, from, to, sdp, candidate).await,
            SignalingMessage::Chat {
                client_id,
                display_name,
                text,
                ts,
            } => {
                // a chat frame is a sighting of its sender: a missed
                // presence-join or snapshot heals here. Names still come
                // only from profiles and snapshots.
                if self.registry.upsert(&client_id) {
                    info!("Participant {} first seen via chat", client_id);
                }
                let display_name = if display_name.trim().is_empty() {
                    self.registry.name_of(&client_id).to_string()
                } else {
                    display_name
                };
                self.emit(RoomEvent::Chat {
                    from: client_id,
                    display_name,
                    text,
                    ts,
                });
                self.reconcile().await;
            }
        }
    }

    async fn handle_welcome(&mut self, client_id: ClientId) {
        if let Some(existing) = &self.local_id {
            warn!(
                "Ignoring duplicate welcome for {} ({} already assigned)",
                client_id, existing
            );
            return;
        }

        info!("Assigned client id {}", client_id);
        self.local_id = Some(client_id.clone());
        self.registry.upsert(&client_id);
        self.announce_profile();
        self.emit(RoomEvent::Welcome { client_id });
        self.reconcile().await;
    }

    /// Broadcast the local display name whenever the roster changes, so
    /// late joiners learn it; named clients only
    fn announce_profile(&self) {
        if let Some(name) = self.config.display_name_trimmed() {
            self.send(SignalingMessage::profile(name));
        }
    }

    async fn handle_webrtc(
        &mut self,
        action: WebrtcAction,
        from: ClientId,
        to: Option<ClientId>,
        sdp: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
    ) {
        // the relay broadcasts within the room; traffic directed at a
        // different client is dropped, but only once we know who we are
        if let (Some(to), Some(local)) = (&to, &self.local_id) {
            if to != local {
                return;
            }
        }

        match action {
            WebrtcAction::Offer => {
                let Some(sdp) = sdp else {
                    warn!("Offer from {} without SDP ignored", from);
                    return;
                };
                if !self.gate.is_ready() {
                    debug!("Queueing offer from {} until local media is ready", from);
                    self.pending_offers.enqueue(&from, sdp);
                    return;
                }
                self.answer_offer(from, sdp).await;
            }
            WebrtcAction::Answer => {
                let Some(sdp) = sdp else {
                    warn!("Answer from {} without SDP ignored", from);
                    return;
                };
                let Some(link) = self.manager.get(&from) else {
                    debug!("Answer from {} without a peer link ignored", from);
                    return;
                };
                let peer_connection = link.peer_connection();
                let generation = link.generation();
                self.spawn_step(from, generation, "apply answer", async move {
                    link::apply_answer(&peer_connection, &sdp).await?;
                    Ok(StepOutcome::AnswerApplied)
                });
            }
            WebrtcAction::Ice => {
                let Some(candidate) = candidate else {
                    warn!("ICE message from {} without a candidate ignored", from);
                    return;
                };
                let Some(link) = self.manager.get(&from) else {
                    debug!("ICE candidate from {} without a peer link ignored", from);
                    return;
                };
                let peer_connection = link.peer_connection();
                tokio::spawn(async move {
                    // duplicates and out-of-order candidates are routine
                    if let Err(e) = link::add_remote_candidate(&peer_connection, candidate).await {
                        debug!("Absorbed ICE candidate failure from {}: {}", from, e);
                    }
                });
            }
        }
    }

    /// Answer an inbound offer; requires a ready media gate
    async fn answer_offer(&mut self, from: ClientId, sdp: SessionDescription) {
        let link = match self.manager.ensure(&from).await {
            Ok(link) => link,
            Err(e) => {
                debug!("Absorbed failure creating peer link to {}: {}", from, e);
                return;
            }
        };

        // attach before answering so the answer advertises our tracks
        if let Some(media) = self.gate.media() {
            if let Err(e) = link.attach_local_tracks(media).await {
                debug!("Absorbed track attach failure for {}: {}", from, e);
            }
        }

        link.set_state(NegotiationState::Answering);
        let peer_connection = link.peer_connection();
        let generation = link.generation();

        self.spawn_step(from, generation, "build answer", async move {
            let answer = link::build_answer(&peer_connection, &sdp).await?;
            Ok(StepOutcome::AnswerReady(answer))
        });
    }

    /// Open a link toward `remote` and start the offer
    async fn initiate_offer(&mut self, remote: ClientId) {
        let link = match self.manager.ensure(&remote).await {
            Ok(link) => link,
            Err(e) => {
                debug!("Absorbed failure creating peer link to {}: {}", remote, e);
                return;
            }
        };

        if let Some(media) = self.gate.media() {
            if let Err(e) = link.attach_local_tracks(media).await {
                debug!("Absorbed track attach failure for {}: {}", remote, e);
            }
        }

        link.set_state(NegotiationState::Offering);
        let peer_connection = link.peer_connection();
        let generation = link.generation();

        info!("Initiating offer to {}", remote);
        self.spawn_step(remote, generation, "build offer", async move {
            let offer = link::build_offer(&peer_connection).await?;
            Ok(StepOutcome::OfferReady(offer))
        });
    }

    /// Diff the desired peer set against live links: open links toward
    /// participants we initiate to, close links to the departed
    ///
    /// Pure over current state, so running it twice in a row is a no-op.
    async fn reconcile(&mut self) {
        let Some(local) = self.local_id.clone() else {
            return;
        };

        let desired = self.registry.desired_peers(&local);

        if self.gate.is_ready() {
            for remote in &desired {
                // smaller id initiates; the larger side waits for the
                // inbound offer, so glare cannot happen
                if !self.manager.contains(remote) && local.initiates_toward(remote) {
                    self.initiate_offer(remote.clone()).await;
                }
            }
        }

        for remote in self.manager.remote_ids() {
            if !desired.contains(&remote) {
                self.close_link(&remote);
            }
        }
    }

    /// Tear down the link to `remote`, if any; the close runs off-loop
    fn close_link(&mut self, remote: &ClientId) {
        if let Some(link) = self.manager.take(remote) {
            tokio::spawn(async move {
                if let Err(e) = link.close().await {
                    debug!("Error closing peer connection: {}", e);
                }
            });
        }
    }

    /// Spawn a negotiation step whose completion re-enters the loop
    fn spawn_step<F>(&self, remote_id: ClientId, generation: u64, stage: &'static str, step: F)
    where
        F: std::future::Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = match step.await {
                Ok(outcome) => outcome,
                Err(error) => StepOutcome::Failed { stage, error },
            };
            let _ = internal.send(InternalEvent::Step(StepComplete {
                remote_id,
                generation,
                outcome,
            }));
        });
    }

    async fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::CaptureReady(media) => self.handle_capture_ready(media).await,
            InternalEvent::CaptureFailed(message) => {
                // the gate stays shut for good: we never initiate and
                // queued offers are never answered
                warn!("Local capture failed: {}", message);
                self.gate.set_failed(message);
            }
            InternalEvent::Step(step) => self.handle_step(step).await,
        }
    }

    async fn handle_capture_ready(&mut self, media: LocalMedia) {
        let stream_id = media.stream_id.clone();
        if !self.gate.set_ready(media) {
            return;
        }
        info!("Local media ready (stream {})", stream_id);

        // latest offer per sender, answered in first-arrival order,
        // each exactly once
        for (from, sdp) in self.pending_offers.drain() {
            self.answer_offer(from, sdp).await;
        }

        self.reconcile().await;
    }

    async fn handle_step(&mut self, step: StepComplete) {
        let StepComplete {
            remote_id,
            generation,
            outcome,
        } = step;

        let Some(link) = self.manager.get_mut(&remote_id) else {
            debug!("Dropping step completion for removed link {}", remote_id);
            return;
        };
        if link.generation() != generation {
            debug!("Dropping stale step completion for {}", remote_id);
            return;
        }

        match outcome {
            StepOutcome::OfferReady(sdp) => {
                if link.state() == NegotiationState::Offering {
                    link.set_state(NegotiationState::AwaitingAnswer);
                }
                if let Some(local) = self.local_id.clone() {
                    self.send(SignalingMessage::offer(local, remote_id, sdp));
                }
            }
            StepOutcome::AnswerReady(sdp) => {
                // state stays answering until the transport reports in
                if let Some(local) = self.local_id.clone() {
                    self.send(SignalingMessage::answer(local, remote_id, sdp));
                }
            }
            StepOutcome::AnswerApplied => {
                if link.state() == NegotiationState::AwaitingAnswer {
                    link.set_state(NegotiationState::Connecting);
                }
            }
            StepOutcome::Failed { stage, error } => {
                // absorbed: logged, never retried; the link stays in its
                // current state until reconciliation or teardown
                debug!(
                    "Absorbed negotiation failure ({}) for {}: {}",
                    stage, remote_id, error
                );
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            remote_id,
            generation,
            kind,
        } = event;

        let Some(link) = self.manager.get(&remote_id) else {
            debug!("Dropping observer event for removed link {}", remote_id);
            return;
        };
        if link.generation() != generation {
            debug!("Dropping stale observer event for {}", remote_id);
            return;
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(local) = self.local_id.clone() {
                    self.send(SignalingMessage::ice(local, remote_id, candidate));
                }
            }
            PeerEventKind::StateChanged(state) => self.handle_transport_state(remote_id, state),
            PeerEventKind::RemoteTrack(track) => {
                let stream_id = track.stream_id();
                debug!(
                    "Remote track {} (stream {}) from {}",
                    track.id(),
                    stream_id,
                    remote_id
                );
                self.manager.set_remote_stream(&remote_id, stream_id);
                self.emit(RoomEvent::RemoteTrack {
                    from: remote_id,
                    track,
                });
            }
        }
    }

    /// Fold transport observer reports into the negotiation state
    fn handle_transport_state(&mut self, remote_id: ClientId, state: RTCPeerConnectionState) {
        let Some(link) = self.manager.get_mut(&remote_id) else {
            return;
        };

        match state {
            RTCPeerConnectionState::Connected => {
                info!("Peer link to {} connected", remote_id);
                link.set_state(NegotiationState::Connected);
            }
            RTCPeerConnectionState::Failed => {
                warn!("Peer link to {} failed", remote_id);
                link.set_state(NegotiationState::Failed);
                // the stream record goes, the link stays; only the
                // reconciler removes links
                self.manager.clear_remote_stream(&remote_id);
            }
            RTCPeerConnectionState::Closed => {
                link.set_state(NegotiationState::Closed);
                self.manager.clear_remote_stream(&remote_id);
            }
            RTCPeerConnectionState::Disconnected => {
                // transient; ICE may recover on its own
                debug!("Peer link to {} disconnected", remote_id);
            }
            _ => {}
        }
    }

    async fn handle_command(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::SendChat(text) => {
                self.send_chat(text);
                false
            }
            RoomCommand::SetMic(enabled) => {
                self.gate.set_mic(enabled);
                false
            }
            RoomCommand::SetCam(enabled) => {
                self.gate.set_cam(enabled);
                false
            }
            RoomCommand::Leave(ack) => {
                self.shutdown(Some(ack)).await;
                true
            }
        }
    }

    fn send_chat(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(local) = self.local_id.clone() else {
            debug!("Dropping chat before a client id is assigned");
            return;
        };

        let display_name = self
            .config
            .display_name_trimmed()
            .map(str::to_string)
            .unwrap_or_else(|| self.registry.name_of(&local).to_string());

        let message = SignalingMessage::chat(local, &display_name, text);
        self.send(message.clone());

        // the relay never echoes back to the sender, so surface our own
        // line locally
        if let SignalingMessage::Chat {
            client_id,
            display_name,
            text,
            ts,
        } = message
        {
            self.emit(RoomEvent::Chat {
                from: client_id,
                display_name,
                text,
                ts,
            });
        }
    }

    async fn shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        info!("Leaving room");

        for link in self.manager.drain() {
            tokio::spawn(async move {
                if let Err(e) = link.close().await {
                    debug!("Error closing peer connection: {}", e);
                }
            });
        }

        self.gate.release();
        self.sink.close();
        self.status = ChannelStatus::Closed;
        self.publish_snapshot();

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn send(&self, message: SignalingMessage) {
        if let Err(e) = self.sink.send(&message) {
            debug!("Failed to send signaling message: {}", e);
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.room_events.send(event);
    }

    /// Publish the current room state on the watch channel
    fn publish_snapshot(&self) {
        let local = self.local_id.as_ref();

        let participants: Vec<ParticipantSnapshot> = self
            .registry
            .iter()
            .map(|p| ParticipantSnapshot {
                id: p.id.clone(),
                display_name: self.display_name_for(&p.id),
                is_self: Some(&p.id) == local,
            })
            .collect();

        let mut peers: Vec<PeerSnapshot> = self
            .manager
            .links()
            .map(|link| PeerSnapshot {
                remote_id: link.remote_id().clone(),
                state: link.state(),
                remote_stream_id: self
                    .manager
                    .remote_stream(link.remote_id())
                    .map(str::to_string),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        let _ = self.snapshot_tx.send(RoomSnapshot {
            status: self.status,
            local_id: self.local_id.clone(),
            participants,
            peers,
            media: self.gate.state().clone(),
            mic_enabled: self.gate.mic_enabled(),
            cam_enabled: self.gate.cam_enabled(),
        });
    }

    /// Our own name comes from config, everyone else's from the roster
    fn display_name_for(&self, id: &ClientId) -> String {
        if Some(id) == self.local_id.as_ref() {
            if let Some(name) = self.config.display_name_trimmed() {
                return name.to_string();
            }
        }
        self.registry.name_of(id).to_string()
    }
}
