/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Room membership state machine.
//!
//! Per remote id: `absent -> connecting -> connected -> closed`. The side
//! that finds the other in its introduction roster (the later joiner)
//! initiates; the side told by `peer-joined` answers. Roles come from relay
//! delivery order alone.
//!
//! Every registry mutation happens inside [`RoomMembership::run`], a single
//! task fed by relay events, connection events and handle commands.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, ConnectionEventKind, ConnectionEvents, ConnectionFactory};
use crate::error::CallError;
use crate::events::{MeshEvent, MeshEventKind};
use crate::registry::{InsertOutcome, PeerEntry, PeerRegistry, PeerSummary};
use crate::signaling::{RelayEvent, RoomSession};

pub enum MeshCommand {
    Snapshot { resp_tx: oneshot::Sender<Vec<PeerSummary>> },
}

pub struct RoomMembership {
    factory: Arc<dyn ConnectionFactory>,
    registry: PeerRegistry,
    session: watch::Receiver<RoomSession>,
    conn_tx: ConnectionEvents,
    events: mpsc::Sender<MeshEvent>,
}

impl RoomMembership {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        session: watch::Receiver<RoomSession>,
        events: mpsc::Sender<MeshEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                registry: PeerRegistry::new(),
                session,
                conn_tx,
                events,
            },
            conn_rx,
        )
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    fn self_id(&self) -> Option<String> {
        self.session.borrow().self_id.clone()
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Introduction(roster) => self.on_introduction(roster).await,
            RelayEvent::PeerJoined(id) => self.on_peer_joined(&id).await,
            RelayEvent::PeerLeft(id) => self.evict(&id, "peer left").await,
            RelayEvent::Signal { from, to, data } => self.on_signal(&from, &to, data).await,
            RelayEvent::Disconnected => {
                warn!(peers = self.registry.len(), "signaling lost; keeping established connections");
                self.emit(MeshEventKind::SignalingLost);
            }
        }
    }

    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent {
            remote_id,
            conn_id,
            kind,
        } = event;
        match kind {
            ConnectionEventKind::Connected => {
                if self.registry.mark_connected(&remote_id, conn_id) {
                    info!(remote_id=%remote_id, "peer connected");
                    self.emit(MeshEventKind::PeerConnected { remote_id });
                }
            }
            ConnectionEventKind::Stream(stream) => {
                if self.registry.set_remote_stream(&remote_id, conn_id, stream.clone()) {
                    debug!(remote_id=%remote_id, stream=%stream.id, tracks = stream.tracks.len(), "remote stream");
                    self.emit(MeshEventKind::PeerStream { remote_id, stream });
                }
            }
            ConnectionEventKind::Closed { reason } => {
                if self.registry.owns(&remote_id, conn_id) {
                    self.evict(&remote_id, &reason).await;
                } else {
                    debug!(remote_id=%remote_id, conn_id, "stale close ignored");
                }
            }
        }
    }

    async fn on_introduction(&mut self, roster: Vec<String>) {
        let me = self.self_id();
        info!(count = roster.len(), "room introduction");
        for id in roster {
            if me.as_deref() == Some(id.as_str()) || self.registry.contains(&id) {
                continue;
            }
            self.create_peer(&id, true).await;
        }
    }

    async fn on_peer_joined(&mut self, id: &str) {
        if self.self_id().as_deref() == Some(id) {
            return;
        }
        if self.registry.contains(id) {
            debug!(remote_id=%id, "duplicate join ignored");
            return;
        }
        self.create_peer(id, false).await;
    }

    async fn on_signal(&mut self, from: &str, to: &str, data: serde_json::Value) {
        let me = self.self_id();
        if me.as_deref() == Some(from) {
            return;
        }
        if let Some(me) = &me {
            if to != me {
                debug!(from=%from, to=%to, "signal for another session ignored");
                return;
            }
        }
        // The offer can outrun the peer-joined notification.
        if !self.registry.contains(from) && !self.create_peer(from, false).await {
            return;
        }
        if let Some(entry) = self.registry.get(from) {
            entry.connection.signal(data);
        }
    }

    async fn create_peer(&mut self, id: &str, is_initiator: bool) -> bool {
        let conn = match self.factory.create(id, is_initiator, self.conn_tx.clone()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(remote_id=%id, "{}", CallError::negotiation(id, e));
                return false;
            }
        };
        match self.registry.insert(PeerEntry::new(id, conn.clone(), is_initiator)) {
            InsertOutcome::Inserted => {
                info!(remote_id=%id, is_initiator, "peer connecting");
            }
            InsertOutcome::DuplicateIgnored => conn.close(),
        }
        true
    }

    async fn evict(&mut self, id: &str, reason: &str) {
        let Some(entry) = self.registry.remove(id) else {
            return;
        };
        entry.connection.close();
        info!(remote_id=%id, %reason, "peer removed");
        self.emit(MeshEventKind::PeerDisconnected {
            remote_id: id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Closes every connection and empties the registry.
    pub async fn close_all(&mut self) {
        for entry in self.registry.drain() {
            entry.connection.close();
            self.emit(MeshEventKind::PeerDisconnected {
                remote_id: entry.remote_id,
                reason: "left call".to_string(),
            });
        }
    }

    /// Never waits: a slow subscriber loses events instead of stalling the mesh.
    fn emit(&self, kind: MeshEventKind) {
        match self.events.try_send(MeshEvent::new(kind)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(kind=?ev.kind, "mesh event dropped: subscriber buffer full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("mesh event dropped: no subscriber"),
        }
    }

    pub async fn run(
        mut self,
        mut relay_rx: mpsc::Receiver<RelayEvent>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut cmd_rx: mpsc::Receiver<MeshCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                ev = relay_rx.recv() => {
                    let Some(ev) = ev else { break };
                    self.handle_relay_event(ev).await;
                }
                ev = conn_rx.recv() => {
                    let Some(ev) = ev else { break };
                    self.handle_connection_event(ev).await;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        MeshCommand::Snapshot { resp_tx } => {
                            let _ = resp_tx.send(self.registry.snapshot());
                        }
                    }
                }
            }
        }
        self.close_all().await;
        info!("mesh stopped");
    }
}
