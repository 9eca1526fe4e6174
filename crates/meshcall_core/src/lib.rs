/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Full-mesh WebRTC calls coordinated through a websocket relay.

pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod ice;
pub mod media;
pub mod membership;
pub mod registry;
pub mod signaling;

pub use call::{join_call, CallHandle};
pub use config::CallConfig;
pub use error::{CallError, Result};
pub use events::{MeshEvent, MeshEventKind};
