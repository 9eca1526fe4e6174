/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Reference signaling relay: assigns session ids, tracks room membership
//! and forwards opaque signals between members of the same room.

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::{ClientMessage, ServerMessage};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub max_room_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8788)),
            max_room_size: 16,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Ok(bind) = std::env::var("MESHCALL_RELAY_BIND") {
            cfg.bind = bind.parse().context("MESHCALL_RELAY_BIND invalid")?;
        }
        if let Ok(max) = std::env::var("MESHCALL_RELAY_MAX_ROOM_SIZE") {
            cfg.max_room_size = max
                .trim()
                .parse::<usize>()
                .context("MESHCALL_RELAY_MAX_ROOM_SIZE invalid")?
                .max(1);
        }
        Ok(cfg)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members of the room being left, to be told `peer-left`.
    pub left: Vec<String>,
    /// Members already present in the joined room, in join order.
    pub existing: Vec<String>,
}

/// Room bookkeeping. Methods only mutate and report who to notify.
#[derive(Default)]
pub struct Rooms {
    members: HashMap<String, Vec<String>>,
    room_of: HashMap<String, String>,
}

impl Rooms {
    pub fn join(&mut self, session_id: &str, room_id: &str, max_room_size: usize) -> Result<JoinOutcome, String> {
        let occupied = self
            .members
            .get(room_id)
            .map(|m| m.iter().filter(|id| id.as_str() != session_id).count())
            .unwrap_or(0);
        if occupied >= max_room_size {
            return Err(format!("room {room_id} is full"));
        }
        let left = self.leave(session_id);
        let room = self.members.entry(room_id.to_string()).or_default();
        let existing = room.clone();
        room.push(session_id.to_string());
        self.room_of.insert(session_id.to_string(), room_id.to_string());
        Ok(JoinOutcome { left, existing })
    }

    /// Removes `session_id` from its room and returns the remaining members.
    pub fn leave(&mut self, session_id: &str) -> Vec<String> {
        let Some(room_id) = self.room_of.remove(session_id) else {
            return Vec::new();
        };
        let Some(room) = self.members.get_mut(&room_id) else {
            return Vec::new();
        };
        room.retain(|id| id != session_id);
        let remaining = room.clone();
        if remaining.is_empty() {
            self.members.remove(&room_id);
        }
        remaining
    }

    pub fn room_of(&self, session_id: &str) -> Option<&str> {
        self.room_of.get(session_id).map(String::as_str)
    }

    pub fn same_room(&self, a: &str, b: &str) -> bool {
        matches!((self.room_of(a), self.room_of(b)), (Some(x), Some(y)) if x == y)
    }

    pub fn room_count(&self) -> usize {
        self.members.len()
    }
}

type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<RelayConfig>,
    rooms: Arc<RwLock<Rooms>>,
    sessions: Arc<RwLock<HashMap<String, Outbox>>>,
}

impl AppState {
    pub fn new(cfg: RelayConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            rooms: Arc::new(RwLock::new(Rooms::default())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn send_to(&self, ids: &[String], msg: &ServerMessage) {
        let sessions = self.sessions.read().await;
        for id in ids {
            if let Some(tx) = sessions.get(id) {
                let _ = tx.send(msg.clone());
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
            info_span!("http", method = %req.method(), uri = %req.uri())
        }))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await.context("relay server")
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

fn random_id() -> String {
    let mut b = [0u8; 8];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

async fn handle_session(state: AppState, socket: WebSocket) {
    let session_id = random_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.sessions.write().await.insert(session_id.clone(), tx.clone());
    let _ = tx.send(ServerMessage::Welcome {
        self_id: session_id.clone(),
    });
    info!(%session_id, "session connected");

    let writer_id = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(v) => v,
                Err(e) => {
                    error!(session_id=%writer_id, "serialize frame failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(%session_id, "bad client frame: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("bad frame: {e}"),
                });
                continue;
            }
        };
        match msg {
            ClientMessage::Join { room_id } => handle_join(&state, &session_id, &room_id, &tx).await,
            ClientMessage::Signal { to, data } => route_signal(&state, &session_id, to, data, &tx).await,
        }
    }

    state.sessions.write().await.remove(&session_id);
    let remaining = state.rooms.write().await.leave(&session_id);
    state
        .send_to(
            &remaining,
            &ServerMessage::PeerLeft {
                peer_id: session_id.clone(),
            },
        )
        .await;
    drop(tx);
    let _ = writer.await;
    info!(%session_id, "session disconnected");
}

async fn handle_join(state: &AppState, session_id: &str, room_id: &str, tx: &Outbox) {
    let outcome = state.rooms.write().await.join(session_id, room_id, state.cfg.max_room_size);
    let JoinOutcome { left, existing } = match outcome {
        Ok(v) => v,
        Err(message) => {
            warn!(%session_id, %room_id, "join refused: {message}");
            let _ = tx.send(ServerMessage::Error { message });
            return;
        }
    };
    state
        .send_to(
            &left,
            &ServerMessage::PeerLeft {
                peer_id: session_id.to_string(),
            },
        )
        .await;
    let _ = tx.send(ServerMessage::Introduction {
        peers: existing.clone(),
    });
    state
        .send_to(
            &existing,
            &ServerMessage::PeerJoined {
                peer_id: session_id.to_string(),
            },
        )
        .await;
    info!(%session_id, %room_id, members = existing.len() + 1, "joined room");
}

async fn route_signal(state: &AppState, from: &str, to: String, data: serde_json::Value, tx: &Outbox) {
    if !state.rooms.read().await.same_room(from, &to) {
        debug!(%from, %to, "signal target not in room");
        let _ = tx.send(ServerMessage::Error {
            message: format!("peer {to} is not in your room"),
        });
        return;
    }
    let msg = ServerMessage::Signal {
        from: from.to_string(),
        to: to.clone(),
        data,
    };
    state.send_to(std::slice::from_ref(&to), &msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn join_reports_existing_members_in_order() {
        let mut rooms = Rooms::default();
        assert_eq!(rooms.join("a", "r", 16).unwrap().existing, ids(&[]));
        assert_eq!(rooms.join("b", "r", 16).unwrap().existing, ids(&["a"]));
        assert_eq!(rooms.join("c", "r", 16).unwrap().existing, ids(&["a", "b"]));
        assert!(rooms.same_room("a", "c"));
    }

    #[test]
    fn switching_rooms_leaves_the_old_one() {
        let mut rooms = Rooms::default();
        rooms.join("a", "r1", 16).unwrap();
        rooms.join("b", "r1", 16).unwrap();
        let out = rooms.join("b", "r2", 16).unwrap();
        assert_eq!(out.left, ids(&["a"]));
        assert!(out.existing.is_empty());
        assert_eq!(rooms.room_of("b"), Some("r2"));
        assert!(!rooms.same_room("a", "b"));
    }

    #[test]
    fn full_room_refuses_without_moving() {
        let mut rooms = Rooms::default();
        rooms.join("a", "r1", 1).unwrap();
        rooms.join("b", "r2", 1).unwrap();
        assert!(rooms.join("b", "r1", 1).is_err());
        assert_eq!(rooms.room_of("b"), Some("r2"));
    }

    #[test]
    fn last_leave_drops_the_room() {
        let mut rooms = Rooms::default();
        rooms.join("a", "r", 16).unwrap();
        rooms.join("b", "r", 16).unwrap();
        assert_eq!(rooms.leave("a"), ids(&["b"]));
        assert!(rooms.leave("b").is_empty());
        assert!(rooms.leave("b").is_empty());
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn unknown_sessions_are_never_in_the_same_room() {
        let rooms = Rooms::default();
        assert!(!rooms.same_room("x", "y"));
    }
}
