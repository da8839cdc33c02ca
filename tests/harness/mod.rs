//! In-process relay server for integration tests
//!
//! Speaks the same wire contract as a production relay: a `welcome`
//! carrying the assigned id, a `participants` snapshot that includes
//! the joiner, presence fan-out on join/leave, `profile` re-stamping,
//! and verbatim broadcast-except-sender for everything else. The relay
//! also logs every `webrtc` frame it fans out so tests can assert on
//! negotiation direction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use peermesh::RoomSnapshot;

/// One webrtc frame the relay fanned out
#[derive(Debug, Clone)]
pub struct RelayedWebrtc {
    /// Sending client, as known to the relay (not the claimed `from`)
    pub sender: String,
    pub action: String,
    pub to: Option<String>,
}

#[derive(Default)]
struct Room {
    clients: HashMap<String, mpsc::UnboundedSender<Message>>,
    names: HashMap<String, String>,
}

struct RelayState {
    rooms: Mutex<HashMap<String, Room>>,
    webrtc_log: Mutex<Vec<RelayedWebrtc>>,
}

/// In-process websocket relay bound to an ephemeral loopback port
pub struct RelayServer {
    addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind a listener and start accepting connections
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay listener");
        let addr = listener.local_addr().expect("relay listener addr");

        let state = Arc::new(RelayState {
            rooms: Mutex::new(HashMap::new()),
            webrtc_log: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(handle_connection(stream, state));
            }
        });

        Self { addr, state }
    }

    /// Base ws:// URL for client configurations
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every relayed webrtc frame so far, in relay order
    pub fn webrtc_log(&self) -> Vec<RelayedWebrtc> {
        self.state.webrtc_log.lock().unwrap().clone()
    }

    /// Client ids currently registered in `room`
    pub fn clients_in(&self, room: &str) -> Vec<String> {
        let rooms = self.state.rooms.lock().unwrap();
        rooms
            .get(room)
            .map(|r| r.clients.keys().cloned().collect())
            .unwrap_or_default()
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) {
    let mut path = String::new();
    let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let room_key = path
        .trim_start_matches("/ws/")
        .trim_matches('/')
        .to_string();
    let client_id = Uuid::new_v4().to_string();

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // everything for this client funnels through one queue, preserving
    // the welcome -> snapshot -> broadcast ordering
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    {
        let mut rooms = state.rooms.lock().unwrap();
        let room = rooms.entry(room_key.clone()).or_default();
        room.clients.insert(client_id.clone(), tx.clone());

        let participants: Vec<Value> = room
            .clients
            .keys()
            .map(|id| match room.names.get(id) {
                Some(name) => json!({ "id": id, "displayName": name }),
                None => json!({ "id": id }),
            })
            .collect();

        let _ = tx.send(text_frame(
            &json!({ "type": "welcome", "clientId": client_id }),
        ));
        let _ = tx.send(text_frame(
            &json!({ "type": "participants", "participants": participants }),
        ));
        broadcast_except(
            room,
            &client_id,
            &json!({
                "type": "presence",
                "action": "join",
                "clientId": client_id,
                "ts": chrono::Utc::now().to_rfc3339(),
            }),
        );
    }

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        handle_frame(&state, &room_key, &client_id, &text);
    }

    {
        let mut rooms = state.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(&room_key) {
            room.clients.remove(&client_id);
            room.names.remove(&client_id);
            broadcast_except(
                room,
                &client_id,
                &json!({
                    "type": "presence",
                    "action": "leave",
                    "clientId": client_id,
                    "ts": chrono::Utc::now().to_rfc3339(),
                }),
            );
            if room.clients.is_empty() {
                rooms.remove(&room_key);
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn handle_frame(state: &RelayState, room_key: &str, sender: &str, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        // relay-owned message types are never accepted from clients
        "welcome" | "participants" | "presence" => {}
        "profile" => {
            let name = value
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                return;
            }
            let mut rooms = state.rooms.lock().unwrap();
            let Some(room) = rooms.get_mut(room_key) else {
                return;
            };
            room.names.insert(sender.to_string(), name.clone());
            // re-stamped with the real sender so nobody can claim
            // another client's id
            broadcast_except(
                room,
                sender,
                &json!({ "type": "profile", "clientId": sender, "displayName": name }),
            );
        }
        _ => {
            if kind == "webrtc" {
                state.webrtc_log.lock().unwrap().push(RelayedWebrtc {
                    sender: sender.to_string(),
                    action: value
                        .get("action")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    to: value.get("to").and_then(Value::as_str).map(str::to_string),
                });
            }
            let rooms = state.rooms.lock().unwrap();
            let Some(room) = rooms.get(room_key) else {
                return;
            };
            // everything else passes through verbatim
            broadcast_raw_except(room, sender, text);
        }
    }
}

fn text_frame(value: &Value) -> Message {
    Message::Text(value.to_string())
}

fn broadcast_except(room: &Room, sender: &str, value: &Value) {
    broadcast_raw_except(room, sender, &value.to_string());
}

fn broadcast_raw_except(room: &Room, sender: &str, text: &str) {
    for (id, tx) in &room.clients {
        if id != sender {
            let _ = tx.send(Message::Text(text.to_string()));
        }
    }
}

/// Wait until `predicate` holds for the published room state
pub async fn wait_for<F>(
    rx: &mut watch::Receiver<RoomSnapshot>,
    timeout: Duration,
    mut predicate: F,
) -> bool
where
    F: FnMut(&RoomSnapshot) -> bool,
{
    if predicate(&rx.borrow()) {
        return true;
    }
    tokio::time::timeout(timeout, async {
        while rx.changed().await.is_ok() {
            if predicate(&rx.borrow()) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}
