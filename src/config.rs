//! Configuration types for room sessions

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Default public STUN endpoint used when no ICE servers are supplied
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Configuration for joining a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Base signaling server URL (ws:// or wss://), without the room path
    pub signaling_url: String,

    /// Room identifier, appended to the signaling URL as `/ws/{room}`
    pub room: String,

    /// Bearer token appended as a `token` query parameter when present.
    /// The token is passed through opaquely; the auth layer owns it.
    pub token: Option<String>,

    /// Local display name announced to other participants
    pub display_name: Option<String>,

    /// ICE server configuration
    pub ice: IceConfig,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServer>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            room: "lobby".to_string(),
            token: None,
            display_name: None,
            ice: IceConfig::default(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_URL.to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl RoomConfig {
    /// Create a configuration for the given signaling server and room
    pub fn new(signaling_url: &str, room: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            room: room.to_string(),
            ..Default::default()
        }
    }

    /// Set the bearer token
    ///
    /// Useful for chaining with `new()`.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Set the local display name
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.ice.stun_servers = stun_servers;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServer>) -> Self {
        self.ice.turn_servers = turn_servers;
        self
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a ws:// or wss:// URL
    /// - `room` is empty
    /// - `stun_servers` is empty
    pub fn validate(&self) -> Result<()> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.room.trim().is_empty() {
            return Err(Error::InvalidConfig("room must not be empty".to_string()));
        }

        if self.ice.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the full room URL: `{signaling_url}/ws/{room}`, with the token
    /// appended as a query parameter when one is configured.
    pub fn room_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig("Signaling URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("ws")
            .push(&self.room);

        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }

        Ok(url)
    }

    /// Local display name, trimmed; `None` when unset or blank
    pub fn display_name_trimmed(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
