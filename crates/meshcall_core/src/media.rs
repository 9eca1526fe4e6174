/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local camera/microphone stream and its mute toggles.
//!
//! Tracks are handed to every mesh connection by reference, so flipping
//! `enabled` here is immediately visible on all of them without any
//! renegotiation.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{CallError, Result};

/// Opus TOC byte for a 20ms CELT frame with no payload: decodes to silence.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

fn random_id() -> String {
    let mut b = [0u8; 8];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// The RTP-level track bound into peer connections.
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Pushes an encoded sample to every connection the track is attached to.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        if self.is_enabled() {
            self.track.write_sample(sample).await?;
            return Ok(());
        }
        match self.kind {
            TrackKind::Audio => {
                let silence = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE_FRAME),
                    duration: sample.duration,
                    ..Default::default()
                };
                self.track.write_sample(&silence).await?;
            }
            // Receivers keep the last frame until video is re-enabled.
            TrackKind::Video => {}
        }
        Ok(())
    }
}

pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream>;
}

/// Opus/VP8 sample tracks fed by the application with already-encoded media.
pub struct SampleDevices {
    pub camera_available: bool,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self {
            camera_available: true,
        }
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(CallError::MediaUnavailable("no media kind requested".to_string()));
        }
        if constraints.video && !self.camera_available {
            return Err(CallError::MediaUnavailable("no camera".to_string()));
        }
        let stream_id = format!("meshcall-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.clone(),
            );
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio, Arc::new(track))));
        }
        if constraints.video {
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            );
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, Arc::new(track))));
        }
        Ok(LocalStream { id: stream_id, tracks })
    }
}

pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    stream: Option<Arc<LocalStream>>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Opens the requested devices, falling back to audio-only when the
    /// full request is refused. Returns the held stream if one exists.
    pub async fn acquire(&mut self, constraints: MediaConstraints) -> Result<Arc<LocalStream>> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }
        let stream = match self.devices.open(constraints).await {
            Ok(s) => s,
            Err(e) if constraints.video => {
                warn!("audio+video capture refused, retrying audio-only: {e}");
                self.devices
                    .open(MediaConstraints::audio_only())
                    .await
                    .map_err(|e| CallError::MediaUnavailable(e.to_string()))?
            }
            Err(e) => return Err(CallError::MediaUnavailable(e.to_string())),
        };
        let stream = Arc::new(stream);
        for t in &stream.tracks {
            t.set_enabled(match t.kind() {
                TrackKind::Audio => self.audio_enabled,
                TrackKind::Video => self.video_enabled,
            });
        }
        info!(stream=%stream.id, tracks=stream.tracks.len(), "local media acquired");
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        self.apply(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        self.apply(TrackKind::Video, enabled);
    }

    fn apply(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.stream {
            for t in stream.tracks_of(kind) {
                t.set_enabled(enabled);
            }
        }
        debug!(?kind, enabled, "local track toggle");
    }

    /// Stops every track. Calling it again is a no-op.
    pub fn release(&mut self) {
        let Some(stream) = self.stream.take() else { return };
        for t in &stream.tracks {
            t.stop();
        }
        info!(stream=%stream.id, "local media released");
    }
}
