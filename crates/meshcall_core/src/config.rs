/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CallError, Result};
use crate::media::MediaConstraints;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// `ws://` or `wss://` address of the signaling relay.
    pub signaling_url: String,
    pub room_id: String,
    /// Comma-separated STUN/TURN urls. Bare `host:port` entries become TURN.
    pub ice_servers: Option<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    pub audio: Option<bool>,
    pub video: Option<bool>,
    /// Relay connect + welcome timeout. Clamped to 1..=60.
    pub connect_timeout_secs: Option<u64>,
    pub event_buffer: Option<usize>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8788/ws".to_string(),
            room_id: "lobby".to_string(),
            ice_servers: None,
            ice_username: None,
            ice_credential: None,
            audio: Some(true),
            video: Some(true),
            connect_timeout_secs: Some(10),
            event_buffer: Some(64),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// `MESHCALL_ICE_*` variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = get("MESHCALL_ICE_SERVERS") {
            self.ice_servers = Some(v);
        }
        if let Some(v) = get("MESHCALL_ICE_USERNAME") {
            self.ice_username = Some(v);
        }
        if let Some(v) = get("MESHCALL_ICE_CREDENTIAL") {
            self.ice_credential = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.signaling_url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(CallError::Config(format!("signaling_url must be ws:// or wss://, got {url:?}")));
        }
        if self.room_id.trim().is_empty() {
            return Err(CallError::Config("room_id is empty".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10).clamp(1, 60))
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer.unwrap_or(64).max(1)
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio.unwrap_or(true),
            video: self.video.unwrap_or(true),
        }
    }

    pub fn ice_servers_raw(&self) -> &str {
        self.ice_servers.as_deref().unwrap_or("")
    }
}
