// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fleet orchestration: discovery, reconciliation, health, scratch cleanup.
//!
//! Three loop threads run until shutdown: discovery (find streams, reconcile
//! pipelines, restart unhealthy ones), scratch cleanup (bound the tmpfs
//! ring), and the session monitor (post-roll timeouts). The manager favors
//! liveness of the fleet: any single stream's failure is logged and retried,
//! never propagated.
//!
//! The pipeline map lock guards only map mutation; pipelines are stopped and
//! built (which touches the store) outside it, and it is never held together
//! with the recorder's session lock.

use crate::backend::{Opener, Options};
use crate::config::Config;
use crate::discovery::{stream_key, Discoverer, StreamDescriptor};
use crate::motion::{CropRect, MotionDetector, MotionUpdate};
use crate::pipeline::{Environment, MotionCallback, SegmentClosedCallback, StreamPipeline};
use crate::recorder::{Recorder, RecordingIndex};
use base::clock::Clocks;
use base::{err, shutdown, Error, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_TICK: Duration = Duration::from_secs(1);
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const RTSP_LATENCY: Duration = Duration::from_millis(200);

/// Restart budget per pipeline; above this the stream needs an operator.
const MAX_PIPELINE_ERRORS: u32 = 5;

pub struct StreamManager<C: Clocks + Clone> {
    inner: Arc<Inner<C>>,
    loops: Vec<std::thread::JoinHandle<()>>,
}

struct Inner<C: Clocks + Clone> {
    clocks: C,
    config: Config,
    opener: Arc<dyn Opener>,
    discoverer: Discoverer,
    /// Camera metadata mirror; absent when the detector runs storeless.
    store: Option<Arc<db::Store>>,
    recorder: Arc<Recorder<C>>,
    pipelines: Mutex<HashMap<String, StreamPipeline<C>>>,
    shutdown_rx: shutdown::Receiver,
    /// User-visible motion hook, invoked after session bookkeeping.
    motion_hook: MotionCallback,
}

/// Default motion hook; the log-line contract other tooling scrapes.
fn log_motion(event: &crate::motion::MotionEvent) {
    info!(
        "[MOTION] stream={} file={}",
        event.stream_id,
        event.segment_file.display()
    );
}

impl<C: Clocks + Clone> StreamManager<C> {
    pub fn new(
        clocks: C,
        config: Config,
        opener: Arc<dyn Opener>,
        store: Option<Arc<db::Store>>,
        index: Arc<dyn RecordingIndex>,
        shutdown_rx: shutdown::Receiver,
        motion_hook: Option<MotionCallback>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.segment.output_dir)?;
        std::fs::create_dir_all(&config.recording.recordings_dir)?;
        let discoverer = Discoverer::new(&config.mediamtx.api_url(), config.manual_streams.clone())?;
        let recorder = Arc::new(Recorder::new(
            clocks.clone(),
            &config.recording.recordings_dir,
            config.recording.pre_roll,
            config.recording.post_roll,
            config.segment.duration,
            index,
        ));
        Ok(StreamManager {
            inner: Arc::new(Inner {
                clocks,
                config,
                opener,
                discoverer,
                store,
                recorder,
                pipelines: Mutex::new(HashMap::new()),
                shutdown_rx,
                motion_hook: motion_hook.unwrap_or_else(|| Arc::new(|e| log_motion(&e))),
            }),
            loops: Vec::new(),
        })
    }

    /// Starts the discovery, cleanup, and session monitor loops.
    pub fn start(&mut self) -> Result<(), Error> {
        info!("starting stream manager");
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(f)
                .map_err(|e| err!(Internal, msg("can't spawn {name} thread"), source(e)))
        };
        let inner = self.inner.clone();
        self.loops
            .push(spawn("discovery", Box::new(move || inner.discovery_loop()))?);
        let inner = self.inner.clone();
        self.loops
            .push(spawn("scratch-cleanup", Box::new(move || inner.cleanup_loop()))?);
        let inner = self.inner.clone();
        self.loops
            .push(spawn("session-monitor", Box::new(move || inner.session_loop()))?);
        Ok(())
    }

    /// Tears everything down. Call only after the shutdown channel has
    /// fired; the loop threads exit within one tick of it.
    pub fn stop(&mut self) {
        info!("stopping stream manager");
        for handle in self.loops.drain(..) {
            let _ = handle.join();
        }
        self.inner.recorder.end_all();
        let drained: Vec<(String, StreamPipeline<C>)> =
            self.inner.pipelines.lock().drain().collect();
        for (stream_id, mut pipeline) in drained {
            info!("stream={stream_id} stopping pipeline");
            pipeline.stop();
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.mark_streams_offline(&[]) {
                warn!(err = %e.chain(), "failed to mark streams offline");
            }
            store.close();
        }
        info!("stream manager stopped");
    }
}

impl<C: Clocks + Clone> Inner<C> {
    fn discovery_loop(&self) {
        info!("stream discovery loop started");
        loop {
            let discovered = self.discoverer.discover();
            // An empty cycle (media server down, nothing configured) must
            // not disturb existing pipelines or camera rows.
            if !discovered.is_empty() {
                self.update_streams(discovered);
            }
            self.check_pipeline_health();
            if self.shutdown_rx.wait_for(self.config.discovery_interval).is_err() {
                break;
            }
        }
        info!("stream discovery loop stopped");
    }

    fn cleanup_loop(&self) {
        info!("scratch cleanup loop started");
        loop {
            cleanup_scratch(
                &self.config.segment.output_dir,
                self.config.segment.max_segments,
            );
            if self.shutdown_rx.wait_for(CLEANUP_INTERVAL).is_err() {
                break;
            }
        }
        info!("scratch cleanup loop stopped");
    }

    fn session_loop(&self) {
        info!("session monitor loop started");
        loop {
            self.recorder.tick();
            if self.shutdown_rx.wait_for(SESSION_TICK).is_err() {
                break;
            }
        }
        info!("session monitor loop stopped");
    }

    /// Reconciles pipelines against a (non-empty) discovery result and
    /// mirrors camera metadata into the store.
    fn update_streams(&self, discovered: Vec<StreamDescriptor>) {
        if let Some(store) = &self.store {
            for d in &discovered {
                let upsert = db::StreamUpsert {
                    stream_id: d.stream_id.clone(),
                    name: Some(d.display_name.clone()),
                    source_type: d.source_type.clone(),
                    source_url: d.source_url.clone(),
                    ready: d.ready,
                    bytes_received: d.bytes_in.min(i64::MAX as u64) as i64,
                    bytes_sent: d.bytes_out.min(i64::MAX as u64) as i64,
                };
                if let Err(e) = store.upsert_stream(&upsert) {
                    warn!(err = %e.chain(), "stream={} metadata upsert failed", d.stream_id);
                }
            }
            let all_ids: Vec<String> = discovered.iter().map(|d| d.stream_id.clone()).collect();
            if let Err(e) = store.mark_streams_offline(&all_ids) {
                warn!(err = %e.chain(), "failed to mark undiscovered streams offline");
            }
        }

        let ready: HashSet<String> = discovered
            .iter()
            .filter(|d| d.ready)
            .map(|d| d.stream_id.clone())
            .collect();

        // Keep the map lock to map mutation only; stopping a pipeline can
        // block for seconds and building one reads the store.
        let (removed, to_add) = {
            let mut pipelines = self.pipelines.lock();
            let current: HashSet<String> = pipelines.keys().cloned().collect();
            let removed: Vec<(String, StreamPipeline<C>)> = current
                .difference(&ready)
                .filter_map(|id| pipelines.remove(id).map(|p| (id.clone(), p)))
                .collect();
            let to_add: Vec<String> = ready.difference(&current).cloned().collect();
            (removed, to_add)
        };

        for (stream_id, mut pipeline) in removed {
            info!("stream={stream_id} no longer ready, stopping pipeline");
            pipeline.stop();
            self.recorder.drop_stream(&stream_id);
        }

        for stream_id in to_add {
            info!("stream={stream_id} discovered");
            match self.build_and_start(&stream_id, 0) {
                Ok(pipeline) => {
                    self.pipelines.lock().insert(stream_id, pipeline);
                }
                Err(e) => {
                    error!(err = %e.chain(), "stream={stream_id} failed to start pipeline");
                }
            }
        }
    }

    /// Replaces pipelines that have died, up to the error budget.
    fn check_pipeline_health(&self) {
        let dead: Vec<(String, u32)> = self
            .pipelines
            .lock()
            .iter()
            .filter(|(_, p)| !p.is_running())
            .map(|(id, p)| (id.clone(), p.error_count()))
            .collect();
        for (stream_id, errors) in dead {
            let old = self.pipelines.lock().remove(&stream_id);
            if let Some(mut old) = old {
                old.stop();
            }
            if errors >= MAX_PIPELINE_ERRORS {
                error!("stream={stream_id} too many errors, removing pipeline");
                continue;
            }
            warn!("stream={stream_id} pipeline not running, attempting restart");
            if self.shutdown_rx.wait_for(RESTART_PAUSE).is_err() {
                return;
            }
            match self.build_and_start(&stream_id, errors) {
                Ok(pipeline) => {
                    self.pipelines.lock().insert(stream_id, pipeline);
                }
                Err(e) => {
                    error!(err = %e.chain(), "stream={stream_id} failed to restart pipeline");
                }
            }
        }
    }

    fn build_and_start(
        &self,
        stream_id: &str,
        initial_error_count: u32,
    ) -> Result<StreamPipeline<C>, Error> {
        let key = stream_key(stream_id);
        let raw_url = self.config.mediamtx.rtsp_url(stream_id);
        let url = Url::parse(&raw_url)
            .map_err(|e| err!(InvalidArgument, msg("bad stream url {raw_url}"), source(e)))?;
        let options = Options {
            latency: RTSP_LATENCY,
            frame_size: (
                self.config.motion.detection_width,
                self.config.motion.detection_height,
            ),
            segment_duration: self.config.segment.duration,
            scratch_dir: self.config.segment.output_dir.join(&key),
            filename_prefix: key,
        };

        let mut detector = MotionDetector::new(stream_id, &self.config.motion);
        self.apply_detector_overrides(stream_id, &mut detector);

        let on_motion: MotionCallback = {
            let recorder = self.recorder.clone();
            let hook = self.motion_hook.clone();
            let stream_id = stream_id.to_owned();
            Arc::new(move |event| {
                recorder.handle_motion(&event);
                // The user hook runs outside the session lock; a panic in it
                // must not take the stream down.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    hook(event);
                }));
                if result.is_err() {
                    warn!("stream={stream_id} motion callback panicked");
                }
            })
        };
        let on_segment_closed: SegmentClosedCallback = {
            let recorder = self.recorder.clone();
            Arc::new(move |stream_id, path, end_ts| {
                recorder.handle_segment_closed(stream_id, path, end_ts);
            })
        };

        let env = Environment {
            clocks: &self.clocks,
            opener: &self.opener,
        };
        let mut pipeline = StreamPipeline::new(
            &env,
            stream_id,
            url,
            options,
            detector,
            on_motion,
            on_segment_closed,
            initial_error_count,
        )?;
        pipeline.start()?;
        Ok(pipeline)
    }

    /// Applies per-stream overrides from the store, if present. Any store
    /// trouble means "run with configured defaults".
    fn apply_detector_overrides(&self, stream_id: &str, detector: &mut MotionDetector) {
        let Some(store) = &self.store else { return };
        let row = match store.detector_config(stream_id) {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                debug!(err = %e.chain(), "stream={stream_id} no detector overrides");
                return;
            }
        };
        let update = MotionUpdate {
            enabled: Some(row.enabled),
            sensitivity: row
                .sensitivity
                .and_then(|s| u8::try_from(s.clamp(0, 100)).ok()),
            area_threshold: None,
            crop: Some(row.crop.map(|(x1, y1, x2, y2)| CropRect { x1, y1, x2, y2 })),
        };
        if let Err(e) = detector.apply(&update) {
            warn!(err = %e.chain(), "stream={stream_id} invalid detector overrides ignored");
        }
    }
}

/// Bounds each stream's scratch directory to the newest `max_segments` `.ts`
/// files; 0 disables cleanup. Durable copies are unaffected.
fn cleanup_scratch(base: &Path, max_segments: usize) {
    if max_segments == 0 {
        return;
    }
    let stream_dirs = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot list scratch directory {}: {e}", base.display());
            return;
        }
    };
    for stream_dir in stream_dirs.flatten() {
        let path = stream_dir.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&path) else { continue };
        let mut segments: Vec<(std::time::SystemTime, std::path::PathBuf)> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "ts"))
            .filter_map(|e| {
                let mtime = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, e.path()))
            })
            .collect();
        segments.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, old) in segments.iter().skip(max_segments) {
            match std::fs::remove_file(old) {
                Ok(()) => debug!("cleaned up old segment {}", old.display()),
                Err(e) => warn!("failed to remove {}: {e}", old.display()),
            }
        }
    }
}
