// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand running the detector process: stream discovery, per-stream
//! pipelines, motion sessions.

use crate::backend::Opener;
use crate::config::Config;
use crate::manager::StreamManager;
use crate::recorder::RecordingIndex;
use base::clock::RealClocks;
use base::{bail, Error};
use bpaf::Bpaf;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs the stream detector: connects to every ready RTSP stream, segments
/// it into scratch, and records motion-triggered clips.
#[derive(Bpaf, Debug, Clone)]
#[bpaf(command("detector"))]
pub struct Args {}

pub fn run(_args: Args) -> Result<i32, Error> {
    let config = Config::from_env()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(async_run(config));

    // In the graceful path everything is already joined; in the immediate
    // path, don't wait for abandoned pipeline threads.
    rt.shutdown_background();
    result
}

async fn async_run(config: Config) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    use tokio::signal::unix::{signal, SignalKind};
    tokio::pin! {
        let int = signal(SignalKind::interrupt())?;
        let term = signal(SignalKind::terminate())?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

fn log_config(config: &Config) {
    info!("media server API:  {}", config.mediamtx.api_url());
    info!("scratch directory: {}", config.segment.output_dir.display());
    info!(
        "segments:          {:?} each, ring of {}",
        config.segment.duration, config.segment.max_segments
    );
    info!("recordings:        {}", config.recording.recordings_dir.display());
    info!(
        "pre/post-roll:     {:?} / {:?}",
        config.recording.pre_roll, config.recording.post_roll
    );
    info!(
        "motion:            pixel>{} area>={}% cooldown={} frames at {}x{}",
        config.motion.pixel_threshold,
        config.motion.area_threshold,
        config.motion.cooldown_frames,
        config.motion.detection_width,
        config.motion.detection_height
    );
    info!("discovery:         every {:?}", config.discovery_interval);
    if let Some(manual) = &config.manual_streams {
        info!("manual streams:    {}", manual.join(", "));
    }
    if config.verbose {
        info!("verbose logging enabled");
    }
}

async fn inner(config: Config, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let clocks = RealClocks {};
    info!("argus detector {}", env!("CARGO_PKG_VERSION"));
    log_config(&config);

    let store = Arc::new(db::Store::new(&config.database));
    // A dead store is not fatal here: segments still get copied, and the
    // lazy reconnect picks rows back up when it returns.
    if let Err(e) = super::connect_store(store.clone(), clocks).await {
        warn!(
            err = %e.chain(),
            "store unavailable; recordings will not be indexed until it returns"
        );
    }

    let opener = media_backend()?;
    let index: Arc<dyn RecordingIndex> = store.clone();
    let mut manager = StreamManager::new(
        clocks,
        config,
        opener,
        Some(store),
        index,
        shutdown_rx.clone(),
        None,
    )?;
    manager.start()?;
    info!("detector running; press Ctrl+C to stop");

    shutdown_rx.future().await;

    tokio::task::spawn_blocking(move || manager.stop())
        .await
        .expect("manager stop task panicked");
    info!("exiting");
    Ok(0)
}

#[cfg(feature = "backend-gstreamer")]
fn media_backend() -> Result<Arc<dyn Opener>, Error> {
    Ok(Arc::new(crate::backend::gst::GstOpener::new()?))
}

#[cfg(not(feature = "backend-gstreamer"))]
fn media_backend() -> Result<Arc<dyn Opener>, Error> {
    bail!(
        Unimplemented,
        msg("this build has no media backend; rebuild with --features backend-gstreamer")
    )
}
