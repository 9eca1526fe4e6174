/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::CallConfig;
use crate::connection::RtcConnectionFactory;
use crate::error::Result;
use crate::events::MeshEvent;
use crate::ice::normalize_ice_servers;
use crate::media::LocalStream;
use crate::membership::{MeshCommand, RoomMembership};
use crate::registry::PeerSummary;
use crate::signaling::{RoomSession, SignalingClient};

const RELAY_EVENT_BUFFER: usize = 256;

/// A joined room. Dropping it stops the mesh without waiting.
pub struct CallHandle {
    events: Option<mpsc::Receiver<MeshEvent>>,
    cmd_tx: mpsc::Sender<MeshCommand>,
    shutdown_tx: watch::Sender<bool>,
    signaling: Arc<SignalingClient>,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    /// The mesh event stream. There is one subscriber; later calls return `None`.
    /// The buffer holds `event_buffer` events; once full, new events are
    /// dropped with a warning rather than stalling the mesh.
    pub fn events(&mut self) -> Option<mpsc::Receiver<MeshEvent>> {
        self.events.take()
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(MeshCommand::Snapshot { resp_tx }).await.is_err() {
            return Vec::new();
        }
        resp_rx.await.unwrap_or_default()
    }

    pub fn session(&self) -> RoomSession {
        self.signaling.session()
    }

    /// Closes every peer connection, then the relay socket.
    pub async fn leave(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.signaling.disconnect();
        info!("left call");
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.signaling.disconnect();
    }
}

/// Connects to the relay, joins `config.room_id` and starts the mesh.
/// `stream` is attached to every peer connection created afterwards.
pub async fn join_call(config: &CallConfig, stream: Option<Arc<LocalStream>>) -> Result<CallHandle> {
    config.validate()?;
    let ice_servers = normalize_ice_servers(
        config.ice_servers_raw(),
        config.ice_username.as_deref(),
        config.ice_credential.as_deref(),
    );

    let (relay_tx, relay_rx) = mpsc::channel(RELAY_EVENT_BUFFER);
    let signaling = Arc::new(SignalingClient::new(relay_tx, config.connect_timeout()));
    let factory = Arc::new(RtcConnectionFactory::new(
        ice_servers,
        stream,
        Arc::new(signaling.handle()),
    )?);

    let (event_tx, event_rx) = mpsc::channel(config.event_buffer());
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mesh, conn_rx) = RoomMembership::new(factory, signaling.subscribe(), event_tx);
    let task = tokio::spawn(mesh.run(relay_rx, conn_rx, cmd_rx, shutdown_rx));

    let mut handle = CallHandle {
        events: Some(event_rx),
        cmd_tx,
        shutdown_tx,
        signaling,
        task: Some(task),
    };
    if let Err(e) = handle.signaling.connect(&config.signaling_url, &config.room_id).await {
        handle.stop().await;
        return Err(e);
    }
    info!(room=%config.room_id, self_id=?handle.session().self_id, "joined call");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;

    #[tokio::test]
    async fn unreachable_relay_fails_join() {
        // Port 9 (discard) is closed on any sane test host.
        let cfg = CallConfig {
            signaling_url: "ws://127.0.0.1:9/ws".to_string(),
            connect_timeout_secs: Some(1),
            ..CallConfig::default()
        };
        let err = join_call(&cfg, None).await.err().unwrap();
        assert!(matches!(err, CallError::SignalingUnreachable(_)));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_connecting() {
        let cfg = CallConfig {
            room_id: String::new(),
            ..CallConfig::default()
        };
        let err = join_call(&cfg, None).await.err().unwrap();
        assert!(matches!(err, CallError::Config(_)));
    }
}
