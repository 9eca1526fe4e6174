/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Debug, Error)]
pub enum CallError {
    /// Neither audio+video nor audio-only capture could be opened.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("signaling relay unreachable: {0}")]
    SignalingUnreachable(String),

    /// Scoped to a single remote participant; never aborts the room session.
    #[error("negotiation with {remote_id} failed: {reason}")]
    PeerNegotiationFailed { remote_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("webrtc: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallError {
    pub fn negotiation(remote_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::PeerNegotiationFailed {
            remote_id: remote_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
