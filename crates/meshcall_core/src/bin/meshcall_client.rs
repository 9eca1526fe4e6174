/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use bytes::Bytes;
use meshcall_core::media::{LocalMediaController, LocalStream, SampleDevices, TrackKind, OPUS_SILENCE_FRAME};
use meshcall_core::{join_call, CallConfig, MeshEventKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use webrtc::media::Sample;

const AUDIO_FRAME: Duration = Duration::from_millis(20);

fn parse_config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("MESHCALL_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

fn load_config() -> Result<CallConfig> {
    let mut cfg = match parse_config_path()? {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
            CallConfig::from_json(&text).context("parse config")?
        }
        None => CallConfig::default(),
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

/// Keeps the audio track flowing with silent frames until shutdown.
fn start_audio_pump(stream: Arc<LocalStream>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(AUDIO_FRAME);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE_FRAME),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            for t in stream.tracks_of(TrackKind::Audio) {
                if let Err(e) = t.write_sample(&sample).await {
                    warn!("audio write failed: {e}");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = load_config()?;
    info!(url=%cfg.signaling_url, room=%cfg.room_id, "meshcall client starting");

    let mut media = LocalMediaController::new(Arc::new(SampleDevices::default()));
    let stream = media.acquire(cfg.constraints()).await.context("acquire local media")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    start_audio_pump(stream.clone(), shutdown_rx);

    let mut call = join_call(&cfg, Some(stream)).await.context("join call")?;
    let mut events = call.events().context("event stream already taken")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev.kind {
                    MeshEventKind::PeerConnected { remote_id } => info!(%remote_id, "peer connected"),
                    MeshEventKind::PeerStream { remote_id, stream } => {
                        info!(%remote_id, stream=%stream.id, tracks = stream.tracks.len(), "peer stream")
                    }
                    MeshEventKind::PeerDisconnected { remote_id, reason } => info!(%remote_id, %reason, "peer gone"),
                    MeshEventKind::SignalingLost => warn!("signaling lost; established peers stay up"),
                }
            }
        }
    }

    info!(peers = call.peers().await.len(), "leaving");
    call.leave().await;
    let _ = shutdown_tx.send(true);
    media.release();
    Ok(())
}
