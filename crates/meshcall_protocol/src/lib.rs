/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Frames sent by the relay to a connected participant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Session id assigned to this socket. Changes on every reconnect.
    Welcome { self_id: String },
    /// Members already in the room at join time, excluding the receiver.
    Introduction { peers: Vec<String> },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    Signal {
        from: String,
        to: String,
        data: serde_json::Value,
    },
    Error { message: String },
}

/// Frames sent by a participant to the relay.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join { room_id: String },
    Signal { to: String, data: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_messages_use_kebab_case_tags() {
        let msg = ServerMessage::PeerJoined {
            peer_id: "b".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({"type": "peer-joined", "peer_id": "b"}));
    }

    #[test]
    fn signal_payload_stays_opaque() {
        let text = r#"{"type":"signal","from":"a","to":"b","data":{"anything":[1,2,3]}}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        match msg {
            ServerMessage::Signal { from, to, data } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(data, json!({"anything": [1, 2, 3]}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_parses_from_client() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join","room_id":"movie-night"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                room_id: "movie-night".to_string()
            }
        );
    }
}
