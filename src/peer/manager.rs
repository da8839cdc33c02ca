//! Bookkeeping for the full set of peer links

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use super::link::{PeerEvent, PeerLink};
use crate::config::IceConfig;
use crate::signaling::protocol::ClientId;
use crate::{Error, Result};

/// Owns every live peer link, keyed by remote client id
///
/// At most one link exists per remote. Remote-stream records live next
/// to the links rather than inside them because a transport failure
/// drops the record while the link itself stays visible until the
/// reconciler removes it.
pub struct PeerManager {
    ice: IceConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    links: HashMap<ClientId, PeerLink>,
    remote_streams: HashMap<ClientId, String>,
    next_generation: u64,
}

impl PeerManager {
    pub fn new(ice: IceConfig, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            ice,
            events,
            links: HashMap::new(),
            remote_streams: HashMap::new(),
            next_generation: 0,
        }
    }

    /// The existing link for `remote`, or a freshly connected one
    pub async fn ensure(&mut self, remote: &ClientId) -> Result<&mut PeerLink> {
        if !self.links.contains_key(remote) {
            self.next_generation += 1;
            let link = PeerLink::connect(
                remote.clone(),
                self.next_generation,
                &self.ice,
                self.events.clone(),
            )
            .await?;
            self.links.insert(remote.clone(), link);
        }

        self.links
            .get_mut(remote)
            .ok_or_else(|| Error::PeerConnectionError(format!("Peer link for {} missing", remote)))
    }

    pub fn get(&self, remote: &ClientId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ClientId) -> Option<&mut PeerLink> {
        self.links.get_mut(remote)
    }

    pub fn contains(&self, remote: &ClientId) -> bool {
        self.links.contains_key(remote)
    }

    /// Remove the link and its stream record, returning the link so the
    /// caller can close it off-loop. Idempotent.
    pub fn take(&mut self, remote: &ClientId) -> Option<PeerLink> {
        self.remote_streams.remove(remote);
        self.links.remove(remote)
    }

    /// Record or replace the remote media stream for `remote`
    pub fn set_remote_stream(&mut self, remote: &ClientId, stream_id: String) {
        debug!("Recording remote stream {} for {}", stream_id, remote);
        self.remote_streams.insert(remote.clone(), stream_id);
    }

    /// Drop the stream record while keeping the link itself
    pub fn clear_remote_stream(&mut self, remote: &ClientId) {
        self.remote_streams.remove(remote);
    }

    pub fn remote_stream(&self, remote: &ClientId) -> Option<&str> {
        self.remote_streams.get(remote).map(String::as_str)
    }

    /// Remote ids with a live link
    pub fn remote_ids(&self) -> Vec<ClientId> {
        self.links.keys().cloned().collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Remove everything for shutdown, returning the links for closing
    pub fn drain(&mut self) -> Vec<PeerLink> {
        self.remote_streams.clear();
        self.links.drain().map(|(_, link)| link).collect()
    }
}
