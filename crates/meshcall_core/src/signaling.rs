/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Websocket link to the signaling relay.

use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::{ClientMessage, ServerMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

use crate::connection::SignalSink;
use crate::error::{CallError, Result};

const PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomSession {
    pub self_id: Option<String>,
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RelayEvent {
    Introduction(Vec<String>),
    PeerJoined(String),
    PeerLeft(String),
    Signal {
        from: String,
        to: String,
        data: serde_json::Value,
    },
    Disconnected,
}

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>;

/// Cheap clone used by connections to push signals to the relay.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: Outbound,
}

impl SignalSink for SignalingHandle {
    fn send_signal(&self, target_id: &str, data: serde_json::Value) {
        let tx = self.outbound.lock().ok().and_then(|g| g.clone());
        let Some(tx) = tx else {
            debug!(to=%target_id, "signal dropped: relay not connected");
            return;
        };
        let msg = ClientMessage::Signal {
            to: target_id.to_string(),
            data,
        };
        if tx.send(msg).is_err() {
            debug!(to=%target_id, "signal dropped: relay writer gone");
        }
    }
}

pub struct SignalingClient {
    session_tx: watch::Sender<RoomSession>,
    outbound: Outbound,
    events: mpsc::Sender<RelayEvent>,
    connect_lock: tokio::sync::Mutex<()>,
    connect_timeout: Duration,
    /// Bumped on every connect; reader tasks of older sockets go quiet.
    epoch: Arc<AtomicU64>,
}

impl SignalingClient {
    pub fn new(events: mpsc::Sender<RelayEvent>, connect_timeout: Duration) -> Self {
        let (session_tx, _) = watch::channel(RoomSession::default());
        Self {
            session_tx,
            outbound: Arc::new(Mutex::new(None)),
            events,
            connect_lock: tokio::sync::Mutex::new(()),
            connect_timeout,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> SignalingHandle {
        SignalingHandle {
            outbound: self.outbound.clone(),
        }
    }

    pub fn session(&self) -> RoomSession {
        self.session_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSession> {
        self.session_tx.subscribe()
    }

    /// Opens the relay socket and joins `room_id`. No-op when already connected.
    pub async fn connect(&self, server_address: &str, room_id: &str) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        {
            let s = self.session_tx.borrow();
            if s.connected && s.self_id.is_some() {
                return Ok(());
            }
        }

        info!(url=%server_address, room=%room_id, "connecting to relay");
        let ws = match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(server_address)).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(CallError::SignalingUnreachable(e.to_string())),
            Err(_) => return Err(CallError::SignalingUnreachable("connect timeout".to_string())),
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session_rx = self.session_tx.subscribe();
        self.session_tx.send_replace(RoomSession {
            self_id: None,
            connected: true,
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(out_tx.clone());
        }

        // Writer: client frames, pings, and pong replies.
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let frame = tokio::select! {
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        match serde_json::to_string(&msg) {
                            Ok(json) => tungstenite::Message::Text(json),
                            Err(e) => {
                                error!("encode client message failed: {e}");
                                continue;
                            }
                        }
                    }
                    p = pong_rx.recv() => {
                        let Some(p) = p else { break };
                        tungstenite::Message::Pong(p)
                    }
                    _ = ping.tick() => tungstenite::Message::Ping(Vec::new()),
                };
                if let Err(e) = ws_tx.send(frame).await {
                    warn!("relay write failed: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader: relay frames -> session updates and relay events.
        {
            let session_tx = self.session_tx.clone();
            let outbound = self.outbound.clone();
            let events = self.events.clone();
            let current = self.epoch.clone();
            let is_current = move || current.load(Ordering::SeqCst) == epoch;
            tokio::spawn(async move {
                while let Some(msg) = ws_rx.next().await {
                    let text = match msg {
                        Ok(tungstenite::Message::Text(t)) => t,
                        Ok(tungstenite::Message::Ping(p)) => {
                            let _ = pong_tx.send(p);
                            continue;
                        }
                        Ok(tungstenite::Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("relay read failed: {e}");
                            break;
                        }
                    };
                    let msg: ServerMessage = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            error!("bad relay frame: {e}");
                            continue;
                        }
                    };
                    let event = match msg {
                        ServerMessage::Welcome { self_id } => {
                            if !is_current() {
                                break;
                            }
                            info!(%self_id, "relay assigned session id");
                            session_tx.send_modify(|s| s.self_id = Some(self_id));
                            continue;
                        }
                        ServerMessage::Introduction { peers } => RelayEvent::Introduction(peers),
                        ServerMessage::PeerJoined { peer_id } => RelayEvent::PeerJoined(peer_id),
                        ServerMessage::PeerLeft { peer_id } => RelayEvent::PeerLeft(peer_id),
                        ServerMessage::Signal { from, to, data } => RelayEvent::Signal { from, to, data },
                        ServerMessage::Error { message } => {
                            warn!("relay error: {message}");
                            continue;
                        }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                if !is_current() {
                    debug!("superseded relay socket closed");
                    return;
                }
                if let Ok(mut slot) = outbound.lock() {
                    *slot = None;
                }
                session_tx.send_replace(RoomSession::default());
                info!("relay connection closed");
                let _ = events.send(RelayEvent::Disconnected).await;
            });
        }

        let _ = out_tx.send(ClientMessage::Join {
            room_id: room_id.to_string(),
        });

        let welcomed = matches!(
            tokio::time::timeout(
                self.connect_timeout,
                session_rx.wait_for(|s| s.self_id.is_some() || !s.connected),
            )
            .await,
            Ok(Ok(ref s)) if s.self_id.is_some()
        );
        if !welcomed {
            self.disconnect();
            return Err(CallError::SignalingUnreachable(
                "relay did not assign a session id".to_string(),
            ));
        }
        Ok(())
    }

    /// Drops the writer, which closes the socket; the reader then reports `Disconnected`.
    /// The session is cleared right away so a following `connect` opens a new socket.
    pub fn disconnect(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            slot.take();
        }
        self.session_tx.send_replace(RoomSession::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts websocket clients and never sends a frame.
    async fn silent_relay() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    held.push(ws);
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn missing_welcome_leaves_client_retryable() {
        let url = silent_relay().await;
        let (tx, _rx) = mpsc::channel(8);
        let client = SignalingClient::new(tx, Duration::from_secs(1));

        let err = client.connect(&url, "room").await.unwrap_err();
        assert!(matches!(err, CallError::SignalingUnreachable(_)));
        assert_eq!(client.session(), RoomSession::default());

        // A retry must reach the relay again instead of short-circuiting.
        let err = client.connect(&url, "room").await.unwrap_err();
        assert!(matches!(err, CallError::SignalingUnreachable(_)));
        assert!(!client.session().connected);
        assert!(client.session().self_id.is_none());
    }

    #[tokio::test]
    async fn disconnect_clears_session_immediately() {
        let (tx, _rx) = mpsc::channel(8);
        let client = SignalingClient::new(tx, Duration::from_secs(1));
        client.session_tx.send_replace(RoomSession {
            self_id: Some("old".to_string()),
            connected: true,
        });
        client.disconnect();
        assert_eq!(client.session(), RoomSession::default());
    }
}
