/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, Result};
use crate::media::LocalStream;

static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique id distinguishing successive connections to the same remote.
pub fn next_conn_id() -> u64 {
    CONN_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Outbound half of the signaling channel as seen by a connection.
pub trait SignalSink: Send + Sync {
    /// Fire-and-forget; delivery is whatever the transport provides.
    fn send_signal(&self, target_id: &str, data: serde_json::Value);
}

/// Negotiation blob carried inside relay `signal` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalPayload {
    Sdp { description: RTCSessionDescription },
    Candidate { candidate: RTCIceCandidateInit },
}

fn send_payload(sink: &dyn SignalSink, target_id: &str, payload: &SignalPayload) {
    match serde_json::to_value(payload) {
        Ok(v) => sink.send_signal(target_id, v),
        Err(e) => warn!(remote_id=%target_id, "encode signal payload failed: {e}"),
    }
}

/// Tracks received from one remote stream id.
#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    Connected,
    Stream(RemoteStream),
    Closed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub remote_id: String,
    pub conn_id: u64,
    pub kind: ConnectionEventKind,
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

/// One bidirectional media+data connection to a remote participant.
pub trait MeshConnection: Send + Sync {
    fn conn_id(&self) -> u64;
    fn is_initiator(&self) -> bool;
    /// Queues an inbound negotiation blob; blobs are applied in call order.
    fn signal(&self, data: serde_json::Value);
    /// Releases the connection. Safe to call more than once.
    fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Builds a connection with local tracks attached. Does not touch any registry.
    async fn create(
        &self,
        remote_id: &str,
        is_initiator: bool,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MeshConnection>>;
}

enum NegotiationCmd {
    Remote(serde_json::Value),
    Close,
}

pub struct RtcMeshConnection {
    conn_id: u64,
    remote_id: String,
    is_initiator: bool,
    cmd_tx: mpsc::UnboundedSender<NegotiationCmd>,
}

impl MeshConnection for RtcMeshConnection {
    fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    fn signal(&self, data: serde_json::Value) {
        if self.cmd_tx.send(NegotiationCmd::Remote(data)).is_err() {
            debug!(remote_id=%self.remote_id, "signal dropped: connection already released");
        }
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(NegotiationCmd::Close);
    }
}

/// Applies remote blobs to one peer connection strictly in arrival order.
struct Negotiator {
    remote_id: String,
    conn_id: u64,
    is_initiator: bool,
    pc: Arc<RTCPeerConnection>,
    sink: Arc<dyn SignalSink>,
    events: ConnectionEvents,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
}

impl Negotiator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NegotiationCmd>) {
        if self.is_initiator {
            if let Err(e) = self.send_offer().await {
                self.fail(e).await;
                return;
            }
        }
        while let Some(cmd) = rx.recv().await {
            match cmd {
                NegotiationCmd::Remote(data) => {
                    if let Err(e) = self.apply(data).await {
                        self.fail(e).await;
                        return;
                    }
                }
                NegotiationCmd::Close => break,
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!(remote_id=%self.remote_id, "peer connection close: {e}");
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        send_payload(&*self.sink, &self.remote_id, &SignalPayload::Sdp { description: offer });
        debug!(remote_id=%self.remote_id, "offer sent");
        Ok(())
    }

    async fn apply(&mut self, data: serde_json::Value) -> Result<()> {
        let payload: SignalPayload = match serde_json::from_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(remote_id=%self.remote_id, "ignoring malformed signal: {e}");
                return Ok(());
            }
        };
        match payload {
            SignalPayload::Sdp { description } => match description.sdp_type {
                RTCSdpType::Offer => {
                    self.pc.set_remote_description(description).await?;
                    self.remote_set = true;
                    self.flush_candidates().await;
                    let answer = self.pc.create_answer(None).await?;
                    self.pc.set_local_description(answer.clone()).await?;
                    send_payload(&*self.sink, &self.remote_id, &SignalPayload::Sdp { description: answer });
                    debug!(remote_id=%self.remote_id, "answer sent");
                }
                RTCSdpType::Answer | RTCSdpType::Pranswer => {
                    self.pc.set_remote_description(description).await?;
                    self.remote_set = true;
                    self.flush_candidates().await;
                }
                other => {
                    warn!(remote_id=%self.remote_id, "ignoring sdp of type {other}");
                }
            },
            SignalPayload::Candidate { candidate } => {
                if self.remote_set {
                    if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                        warn!(remote_id=%self.remote_id, "add_ice_candidate failed: {e}");
                    }
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        for c in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(c).await {
                warn!(remote_id=%self.remote_id, "buffered candidate rejected: {e}");
            }
        }
    }

    async fn fail(&self, err: CallError) {
        let err = CallError::negotiation(&self.remote_id, err);
        warn!(remote_id=%self.remote_id, "{err}");
        let _ = self.events.send(ConnectionEvent {
            remote_id: self.remote_id.clone(),
            conn_id: self.conn_id,
            kind: ConnectionEventKind::Closed {
                reason: err.to_string(),
            },
        });
        let _ = self.pc.close().await;
    }
}

/// `webrtc`-backed factory sharing one API instance across connections.
pub struct RtcConnectionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    local: Option<Arc<LocalStream>>,
    sink: Arc<dyn SignalSink>,
}

impl RtcConnectionFactory {
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        local: Option<Arc<LocalStream>>,
        sink: Arc<dyn SignalSink>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            local,
            sink,
        })
    }

    async fn attach_local_tracks(&self, pc: &RTCPeerConnection) -> Result<()> {
        let Some(stream) = &self.local else { return Ok(()) };
        for t in stream.tracks.iter().filter(|t| !t.is_stopped()) {
            let sender = pc.add_track(t.rtp_track()).await?;
            // Drain RTCP so interceptors keep running.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    fn wire_callbacks(&self, pc: &RTCPeerConnection, remote_id: &str, conn_id: u64, events: &ConnectionEvents) {
        // Trickle ICE from us -> remote.
        {
            let sink = self.sink.clone();
            let remote_id = remote_id.to_string();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => send_payload(&*sink, &remote_id, &SignalPayload::Candidate { candidate: init }),
                        Err(e) => warn!(remote_id=%remote_id, "candidate encode failed: {e}"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let remote_id = remote_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let kind = match st {
                    RTCPeerConnectionState::Connected => Some(ConnectionEventKind::Connected),
                    RTCPeerConnectionState::Failed => Some(ConnectionEventKind::Closed {
                        reason: "connection failed".to_string(),
                    }),
                    RTCPeerConnectionState::Closed => Some(ConnectionEventKind::Closed {
                        reason: "connection closed".to_string(),
                    }),
                    _ => None,
                };
                debug!(remote_id=%remote_id, state=%st, "peer connection state");
                if let Some(kind) = kind {
                    let _ = events.send(ConnectionEvent {
                        remote_id: remote_id.clone(),
                        conn_id,
                        kind,
                    });
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let remote_id = remote_id.to_string();
            let streams: Arc<tokio::sync::Mutex<HashMap<String, RemoteStream>>> =
                Arc::new(tokio::sync::Mutex::new(HashMap::new()));
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                    let events = events.clone();
                    let remote_id = remote_id.clone();
                    let streams = streams.clone();
                    Box::pin(async move {
                        let stream_id = track.stream_id().to_string();
                        let snapshot = {
                            let mut guard = streams.lock().await;
                            let s = guard.entry(stream_id.clone()).or_insert_with(|| RemoteStream {
                                id: stream_id,
                                tracks: Vec::new(),
                            });
                            s.tracks.push(track);
                            s.clone()
                        };
                        let _ = events.send(ConnectionEvent {
                            remote_id,
                            conn_id,
                            kind: ConnectionEventKind::Stream(snapshot),
                        });
                    })
                },
            ));
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        remote_id: &str,
        is_initiator: bool,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MeshConnection>> {
        let conn_id = next_conn_id();
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );

        // Tracks go in before any offer exists so the first offer advertises them.
        let prepared = async {
            self.attach_local_tracks(&pc).await?;
            if is_initiator {
                pc.create_data_channel("meshcall", None).await?;
            }
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(e) = prepared {
            let _ = pc.close().await;
            return Err(e);
        }

        self.wire_callbacks(&pc, remote_id, conn_id, &events);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator {
            remote_id: remote_id.to_string(),
            conn_id,
            is_initiator,
            pc,
            sink: self.sink.clone(),
            events,
            pending_candidates: Vec::new(),
            remote_set: false,
        };
        tokio::spawn(negotiator.run(cmd_rx));

        info!(remote_id=%remote_id, conn_id, is_initiator, "mesh connection created");
        Ok(Arc::new(RtcMeshConnection {
            conn_id,
            remote_id: remote_id.to_string(),
            is_initiator,
            cmd_tx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMediaController, MediaConstraints, SampleDevices};
    use std::time::Duration;

    struct ChannelSink(mpsc::UnboundedSender<(String, serde_json::Value)>);

    impl SignalSink for ChannelSink {
        fn send_signal(&self, target_id: &str, data: serde_json::Value) {
            let _ = self.0.send((target_id.to_string(), data));
        }
    }

    fn sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    async fn next_sdp(rx: &mut mpsc::UnboundedReceiver<(String, serde_json::Value)>) -> (String, RTCSessionDescription) {
        loop {
            let (to, data) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for sdp")
                .expect("sink closed");
            if let SignalPayload::Sdp { description } = serde_json::from_value(data).unwrap() {
                return (to, description);
            }
        }
    }

    async fn local_stream(camera: bool) -> Arc<LocalStream> {
        let mut ctl = LocalMediaController::new(Arc::new(SampleDevices {
            camera_available: camera,
        }));
        ctl.acquire(MediaConstraints::default()).await.unwrap()
    }

    #[test]
    fn candidate_payload_is_tagged() {
        let payload = SignalPayload::Candidate {
            candidate: RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
                ..Default::default()
            },
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["kind"], "candidate");
        assert!(v["candidate"]["candidate"].as_str().unwrap().contains("typ host"));
    }

    #[test]
    fn conn_ids_are_unique() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn initiator_offer_advertises_audio_only_stream() {
        let (sink, mut rx) = sink();
        let factory = RtcConnectionFactory::new(Vec::new(), Some(local_stream(false).await), sink).unwrap();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let conn = factory.create("b", true, ev_tx).await.unwrap();
        assert!(conn.is_initiator());

        let (to, offer) = next_sdp(&mut rx).await;
        assert_eq!(to, "b");
        assert_eq!(offer.sdp_type, RTCSdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));
        conn.close();
    }

    #[tokio::test]
    async fn responder_answers_forwarded_offer() {
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        let factory_a = RtcConnectionFactory::new(Vec::new(), Some(local_stream(true).await), sink_a).unwrap();
        let factory_b = RtcConnectionFactory::new(Vec::new(), Some(local_stream(true).await), sink_b).unwrap();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();

        let a_to_b = factory_a.create("b", true, ev_tx.clone()).await.unwrap();
        let b_to_a = factory_b.create("a", false, ev_tx).await.unwrap();

        let (_, offer) = next_sdp(&mut rx_a).await;
        assert!(offer.sdp.contains("m=video"));
        b_to_a.signal(serde_json::to_value(SignalPayload::Sdp { description: offer }).unwrap());

        let (to, answer) = next_sdp(&mut rx_b).await;
        assert_eq!(to, "a");
        assert_eq!(answer.sdp_type, RTCSdpType::Answer);
        a_to_b.signal(serde_json::to_value(SignalPayload::Sdp { description: answer }).unwrap());

        a_to_b.close();
        b_to_a.close();
    }

    #[tokio::test]
    async fn unparseable_offer_closes_with_negotiation_error() {
        let (sink, _rx) = sink();
        let factory = RtcConnectionFactory::new(Vec::new(), None, sink).unwrap();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let conn = factory.create("a", false, ev_tx).await.unwrap();

        conn.signal(serde_json::json!({
            "kind": "sdp",
            "description": {"type": "offer", "sdp": "not an sdp"},
        }));
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), ev_rx.recv())
                .await
                .expect("no close event")
                .expect("event channel closed");
            assert_eq!(ev.remote_id, "a");
            assert_eq!(ev.conn_id, conn.conn_id());
            if let ConnectionEventKind::Closed { reason } = ev.kind {
                assert!(reason.contains("negotiation with a failed"), "{reason}");
                break;
            }
        }
    }

    #[tokio::test]
    async fn candidate_before_offer_is_held_until_remote_description() {
        let (sink_a, mut rx_a) = sink();
        let factory_a = RtcConnectionFactory::new(Vec::new(), Some(local_stream(false).await), sink_a).unwrap();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let a_to_b = factory_a.create("b", true, ev_tx.clone()).await.unwrap();
        let (_, offer) = next_sdp(&mut rx_a).await;

        let (sink_b, mut rx_b) = sink();
        let factory_b = RtcConnectionFactory::new(Vec::new(), None, sink_b.clone()).unwrap();
        let pc = Arc::new(factory_b.api.new_peer_connection(RTCConfiguration::default()).await.unwrap());
        let mut negotiator = Negotiator {
            remote_id: "a".to_string(),
            conn_id: next_conn_id(),
            is_initiator: false,
            pc: pc.clone(),
            sink: sink_b,
            events: ev_tx,
            pending_candidates: Vec::new(),
            remote_set: false,
        };

        let early = SignalPayload::Candidate {
            candidate: RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                ..Default::default()
            },
        };
        negotiator.apply(serde_json::to_value(early).unwrap()).await.unwrap();
        assert_eq!(negotiator.pending_candidates.len(), 1);
        assert!(!negotiator.remote_set);
        assert!(rx_b.try_recv().is_err());

        negotiator
            .apply(serde_json::to_value(SignalPayload::Sdp { description: offer }).unwrap())
            .await
            .unwrap();
        assert!(negotiator.pending_candidates.is_empty());
        assert!(negotiator.remote_set);
        let (to, answer) = next_sdp(&mut rx_b).await;
        assert_eq!(to, "a");
        assert_eq!(answer.sdp_type, RTCSdpType::Answer);

        a_to_b.close();
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn signal_after_close_is_harmless() {
        let (sink, _rx) = sink();
        let factory = RtcConnectionFactory::new(Vec::new(), None, sink).unwrap();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let conn = factory.create("c", false, ev_tx).await.unwrap();
        conn.close();
        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.signal(serde_json::json!({"kind": "bogus"}));
    }
}
