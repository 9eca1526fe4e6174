/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{MeshConnection, RemoteStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    /// Only seen on entries handed back by `remove` or `drain`.
    Closed,
}

pub struct PeerEntry {
    pub remote_id: String,
    pub connection: Arc<dyn MeshConnection>,
    pub is_initiator: bool,
    pub state: PeerState,
    pub remote_stream: Option<RemoteStream>,
}

impl PeerEntry {
    pub fn new(remote_id: &str, connection: Arc<dyn MeshConnection>, is_initiator: bool) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            connection,
            is_initiator,
            state: PeerState::Connecting,
            remote_stream: None,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.connection.conn_id()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSummary {
    pub remote_id: String,
    pub is_initiator: bool,
    pub state: PeerState,
    pub has_stream: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A live entry already existed; the new one was discarded.
    DuplicateIgnored,
}

/// Who this participant is connected to. Keyed by remote session id.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PeerEntry) -> InsertOutcome {
        if self.contains(&entry.remote_id) {
            return InsertOutcome::DuplicateIgnored;
        }
        self.peers.insert(entry.remote_id.clone(), entry);
        InsertOutcome::Inserted
    }

    /// Stored entries are never `Closed`; closing means removal.
    pub fn contains(&self, remote_id: &str) -> bool {
        self.peers.contains_key(remote_id)
    }

    pub fn get(&self, remote_id: &str) -> Option<&PeerEntry> {
        self.peers.get(remote_id)
    }

    /// Whether the entry for `remote_id` is backed by connection `conn_id`.
    pub fn owns(&self, remote_id: &str, conn_id: u64) -> bool {
        self.peers.get(remote_id).is_some_and(|e| e.conn_id() == conn_id)
    }

    pub fn remove(&mut self, remote_id: &str) -> Option<PeerEntry> {
        let mut entry = self.peers.remove(remote_id)?;
        entry.state = PeerState::Closed;
        Some(entry)
    }

    pub fn mark_connected(&mut self, remote_id: &str, conn_id: u64) -> bool {
        match self.peers.get_mut(remote_id) {
            Some(e) if e.conn_id() == conn_id && e.state == PeerState::Connecting => {
                e.state = PeerState::Connected;
                true
            }
            _ => false,
        }
    }

    pub fn set_remote_stream(&mut self, remote_id: &str, conn_id: u64, stream: RemoteStream) -> bool {
        match self.peers.get_mut(remote_id) {
            Some(e) if e.conn_id() == conn_id => {
                e.remote_stream = Some(stream);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.peers.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<PeerSummary> {
        let mut out = self
            .peers
            .values()
            .map(|e| PeerSummary {
                remote_id: e.remote_id.clone(),
                is_initiator: e.is_initiator,
                state: e.state,
                has_stream: e.remote_stream.is_some(),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        out
    }

    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.peers
            .drain()
            .map(|(_, mut e)| {
                e.state = PeerState::Closed;
                e
            })
            .collect()
    }
}
