/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use webrtc::ice_transport::ice_server::RTCIceServer;

pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

const KNOWN_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

fn is_turn(url: &str) -> bool {
    url.starts_with("turn:") || url.starts_with("turns:")
}

/// Bare `host:port` entries are treated as TURN servers. Known schemes are
/// lower-cased so `TURN:` and `turn:` classify the same way.
fn with_scheme(entry: &str) -> String {
    let lower = entry.to_ascii_lowercase();
    match KNOWN_SCHEMES.iter().find(|s| lower.starts_with(*s)) {
        Some(scheme) => format!("{scheme}{}", &entry[scheme.len()..]),
        None => format!("turn:{entry}"),
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Turns a comma-separated server list into one `RTCIceServer` per URL.
/// A public STUN server is appended whenever no TURN server was configured.
pub fn normalize_ice_servers(
    raw: &str,
    username: Option<&str>,
    credential: Option<&str>,
) -> Vec<RTCIceServer> {
    let username = non_empty(username);
    let credential = non_empty(credential);

    let mut out = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(with_scheme)
        .map(|url| {
            let turn = is_turn(&url);
            RTCIceServer {
                urls: vec![url],
                username: if turn { username.clone().unwrap_or_default() } else { String::new() },
                credential: if turn { credential.clone().unwrap_or_default() } else { String::new() },
                ..Default::default()
            }
        })
        .collect::<Vec<_>>();

    let has_turn = out.iter().any(|s| s.urls.iter().any(|u| is_turn(u)));
    let has_fallback = out.iter().any(|s| s.urls.iter().any(|u| u == FALLBACK_STUN_URL));
    if !has_turn && !has_fallback {
        out.push(RTCIceServer {
            urls: vec![FALLBACK_STUN_URL.to_string()],
            ..Default::default()
        });
    }
    out
}
