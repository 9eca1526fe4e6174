/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::connection::RemoteStream;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the UI layer hears about the mesh.
#[derive(Clone, Debug)]
pub enum MeshEventKind {
    PeerStream { remote_id: String, stream: RemoteStream },
    PeerConnected { remote_id: String },
    PeerDisconnected { remote_id: String, reason: String },
    /// The relay socket dropped. Existing peer connections are left alone.
    SignalingLost,
}

#[derive(Clone, Debug)]
pub struct MeshEvent {
    pub kind: MeshEventKind,
    pub ts_ms: u64,
}

impl MeshEvent {
    pub fn new(kind: MeshEventKind) -> Self {
        Self {
            kind,
            ts_ms: now_ms_u64(),
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match &self.kind {
            MeshEventKind::PeerStream { remote_id, .. }
            | MeshEventKind::PeerConnected { remote_id }
            | MeshEventKind::PeerDisconnected { remote_id, .. } => Some(remote_id),
            MeshEventKind::SignalingLost => None,
        }
    }
}
