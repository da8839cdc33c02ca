//! WebSocket signaling channel to the room relay

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use super::protocol::SignalingMessage;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Signaling channel lifecycle, as surfaced in the room snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Dialing the relay
    Connecting,
    /// Socket open, frames flowing
    Open,
    /// Socket closed cleanly
    Closed,
    /// Socket failed
    Error,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Open => "open",
            ChannelStatus::Closed => "closed",
            ChannelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inbound channel activity, delivered in strict arrival order
#[derive(Debug)]
pub enum ChannelEvent {
    /// One text frame from the relay
    Frame(String),

    /// The socket is gone. `error` carries the failure when the close was
    /// not clean. No reconnection is attempted; peer links stay as they
    /// are until the user leaves.
    Closed { error: Option<String> },
}

/// Outbound half of the signaling channel, as the engine sees it.
///
/// Sends are fire-and-forget: while the socket is not open they are
/// dropped, never queued or retried.
pub trait SignalSink: Send + Sync {
    /// Send a message, fire-and-forget
    fn send(&self, message: &SignalingMessage) -> Result<()>;

    /// Whether the socket is currently open
    fn is_open(&self) -> bool;

    /// Close the socket. Idempotent.
    fn close(&self);
}

/// Bidirectional message stream to the relay.
///
/// One writer task drains an unbounded queue into the socket; one reader
/// task forwards inbound frames as [`ChannelEvent`]s.
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Connect to the relay and start the pump tasks.
    ///
    /// Returns the channel plus the receiver inbound frames arrive on.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_task(write, rx, open.clone()));
        tokio::spawn(Self::reader_task(read, event_tx, open.clone()));

        Ok((Self { tx, open }, event_rx))
    }

    /// Writer task: drains queued frames into the WebSocket
    async fn writer_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        open: Arc<AtomicBool>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }

        open.store(false, Ordering::SeqCst);
        debug!("Signaling writer task terminated");
    }

    /// Reader task: forwards inbound frames until the socket goes away
    async fn reader_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        open: Arc<AtomicBool>,
    ) {
        let mut error = None;
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if events.send(ChannelEvent::Frame(text)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Signaling socket closed by the relay");
                    break;
                }
                Err(e) => {
                    error!("Signaling socket error: {}", e);
                    error = Some(e.to_string());
                    break;
                }
                _ => {}
            }
        }

        open.store(false, Ordering::SeqCst);
        let _ = events.send(ChannelEvent::Closed { error });
        debug!("Signaling reader task terminated");
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: &SignalingMessage) -> Result<()> {
        let json = message.to_json()?;

        if !self.is_open() {
            debug!("Dropping outbound signaling message, channel not open");
            return Ok(());
        }

        debug!("Sending signaling message: {}", json);
        if self.tx.send(Message::Text(json)).is_err() {
            debug!("Dropping outbound signaling message, writer task gone");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_status_display() {
        assert_eq!(ChannelStatus::Connecting.to_string(), "connecting");
        assert_eq!(ChannelStatus::Open.to_string(), "open");
        assert_eq!(ChannelStatus::Closed.to_string(), "closed");
        assert_eq!(ChannelStatus::Error.to_string(), "error");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_close_is_surfaced() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"welcome","clientId":"a3"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"type":"presence","action":"join","clientId":"b7"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let url = format!("ws://{}", addr);
        let (channel, mut events) = SignalingChannel::connect(&url).await.unwrap();
        assert!(channel.is_open());

        match events.recv().await {
            Some(ChannelEvent::Frame(text)) => assert!(text.contains("welcome")),
            other => panic!("expected welcome frame, got {:?}", other),
        }
        match events.recv().await {
            Some(ChannelEvent::Frame(text)) => assert!(text.contains("presence")),
            other => panic!("expected presence frame, got {:?}", other),
        }
        match events.recv().await {
            Some(ChannelEvent::Closed { error }) => assert!(error.is_none()),
            other => panic!("expected closed, got {:?}", other),
        }

        assert!(!channel.is_open());
        // Fire-and-forget: sends after the socket is gone are dropped, not errors
        channel.send(&SignalingMessage::profile("Ada")).unwrap();

        server.await.unwrap();
    }
}
