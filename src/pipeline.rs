// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-stream ingest pipeline.
//!
//! One `StreamPipeline` per ready stream. A worker thread pulls events from
//! the media backend session: segment rollovers update the current-segment
//! pointer (synthesizing a close of the previous segment), tap frames feed
//! the stream's motion detector, and any backend error degrades the pipeline
//! so the manager's health pass can replace it. Motion events and segment
//! closes are handed to caller-supplied callbacks synchronously on the worker
//! thread; session bookkeeping is not this module's business.

use crate::backend::{Event, Opener, Options};
use crate::motion::{MotionDetector, MotionEvent};
use base::clock::Clocks;
use base::{bail, Error, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use url::Url;

/// How long `stop` waits for the worker to finish before abandoning it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type MotionCallback = Arc<dyn Fn(MotionEvent) + Send + Sync>;

/// Arguments: stream id, path of the closed segment, close wall-clock time.
pub type SegmentClosedCallback = Arc<dyn Fn(&str, &Path, SystemTime) + Send + Sync>;

/// Shared state that can be used by multiple `StreamPipeline` instances.
pub struct Environment<'a, C: Clocks + Clone> {
    pub clocks: &'a C,
    pub opener: &'a Arc<dyn Opener>,
}

struct Shared {
    running: AtomicBool,
    stop: AtomicBool,
    error_count: AtomicU32,
    current_segment: Mutex<Option<PathBuf>>,
}

pub struct StreamPipeline<C: Clocks + Clone> {
    stream_id: String,
    stream_key: String,
    url: Url,
    options: Options,
    clocks: C,
    opener: Arc<dyn Opener>,
    /// Moves into the worker on `start`.
    detector: Option<MotionDetector>,
    on_motion: MotionCallback,
    on_segment_closed: SegmentClosedCallback,
    shared: Arc<Shared>,
    worker: Option<(thread::JoinHandle<()>, mpsc::Receiver<()>)>,
}

impl<C: Clocks + Clone> StreamPipeline<C> {
    /// Builds a pipeline: allocates the scratch directory and takes ownership
    /// of the stream's motion detector. `initial_error_count` carries prior
    /// failures across a health-pass replacement; a successful connect resets
    /// it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: &Environment<C>,
        stream_id: &str,
        url: Url,
        options: Options,
        detector: MotionDetector,
        on_motion: MotionCallback,
        on_segment_closed: SegmentClosedCallback,
        initial_error_count: u32,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&options.scratch_dir)?;
        Ok(StreamPipeline {
            stream_id: stream_id.to_owned(),
            stream_key: crate::discovery::stream_key(stream_id),
            url,
            options,
            clocks: env.clocks.clone(),
            opener: env.opener.clone(),
            detector: Some(detector),
            on_motion,
            on_segment_closed,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                error_count: AtomicU32::new(initial_error_count),
                current_segment: Mutex::new(None),
            }),
            worker: None,
        })
    }

    /// Starts the worker thread. The RTSP connection is established
    /// asynchronously on it; connection failures surface through
    /// `is_running`/`error_count` for the manager's health pass.
    pub fn start(&mut self) -> Result<(), Error> {
        let detector = match self.detector.take() {
            Some(d) => d,
            None => bail!(FailedPrecondition, msg("pipeline already started")),
        };
        let (done_tx, done_rx) = mpsc::channel();
        let worker = Worker {
            stream_id: self.stream_id.clone(),
            stream_key: self.stream_key.clone(),
            url: self.url.clone(),
            options: self.options.clone(),
            clocks: self.clocks.clone(),
            opener: self.opener.clone(),
            detector,
            on_motion: self.on_motion.clone(),
            on_segment_closed: self.on_segment_closed.clone(),
            shared: self.shared.clone(),
        };
        self.shared.running.store(true, Ordering::SeqCst);
        let join = thread::Builder::new()
            .name(format!("p-{}", self.stream_key))
            .spawn(move || {
                let _done_tx = done_tx;
                worker.run();
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                Error::wrap(base::ErrorKind::Internal, e)
            })?;
        self.worker = Some((join, done_rx));
        info!(
            "stream={} pipeline started, connecting to {} ({:?} segments, {}x{} tap, {:?} jitter target)",
            self.stream_id,
            self.url,
            self.options.segment_duration,
            self.options.frame_size.0,
            self.options.frame_size.1,
            self.options.latency,
        );
        Ok(())
    }

    /// Requests a stop and waits up to [`STOP_JOIN_TIMEOUT`] for the worker.
    /// A worker that fails to finish in time is abandoned.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some((join, done_rx)) = self.worker.take() {
            match done_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
                // The worker holds the sender until it returns, so a
                // disconnect is the completion signal.
                Err(mpsc::RecvTimeoutError::Disconnected) | Ok(()) => {
                    let _ = join.join();
                    debug!("stream={} pipeline stopped", self.stream_id);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        "stream={} pipeline did not stop within {STOP_JOIN_TIMEOUT:?}; abandoning",
                        self.stream_id
                    );
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u32 {
        self.shared.error_count.load(Ordering::SeqCst)
    }

    pub fn current_segment(&self) -> Option<PathBuf> {
        self.shared.current_segment.lock().clone()
    }
}

struct Worker<C: Clocks + Clone> {
    stream_id: String,
    stream_key: String,
    url: Url,
    options: Options,
    clocks: C,
    opener: Arc<dyn Opener>,
    detector: MotionDetector,
    on_motion: MotionCallback,
    on_segment_closed: SegmentClosedCallback,
    shared: Arc<Shared>,
}

impl<C: Clocks + Clone> Worker<C> {
    fn run(mut self) {
        let label = format!("{}:{}", self.stream_key, self.url);
        let mut session = match self
            .opener
            .open(label, self.url.clone(), self.options.clone())
        {
            Ok(s) => {
                // Connected; prior failures no longer count.
                self.shared.error_count.store(0, Ordering::SeqCst);
                info!("stream={} connected", self.stream_id);
                s
            }
            Err(e) => {
                warn!(
                    err = %e.chain(),
                    "stream={} failed to open source", self.stream_id
                );
                self.shared.error_count.fetch_add(1, Ordering::SeqCst);
                self.shared.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        while !self.shared.stop.load(Ordering::SeqCst) {
            match session.next() {
                Ok(Event::SegmentOpened { path, index }) => self.segment_opened(path, index),
                Ok(Event::Frame {
                    data,
                    width,
                    height,
                    pts,
                }) => self.frame(&data, width, height, pts),
                Ok(Event::Warning { detail }) => {
                    warn!("stream={} {detail}", self.stream_id);
                }
                Ok(Event::Idle) => {}
                Err(e) => {
                    if self.shared.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(err = %e.chain(), "stream={} source failed", self.stream_id);
                    self.shared.error_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// The backend opened segment `index`; segment `index - 1` is complete.
    /// The close is synthesized before the current-segment pointer moves, so
    /// motion events never cite a segment that closed before their frame.
    fn segment_opened(&self, path: PathBuf, index: u32) {
        let previous = self.shared.current_segment.lock().clone();
        if let Some(previous) = previous {
            if previous.is_file() {
                let end_ts = self.clocks.realtime();
                (self.on_segment_closed)(&self.stream_id, &previous, end_ts);
            }
        }
        debug!("stream={} segment {index} -> {}", self.stream_id, path.display());
        *self.shared.current_segment.lock() = Some(path);
    }

    fn frame(&mut self, data: &[u8], width: u32, height: u32, pts: f64) {
        // Until the first rollover is reported, attribute frames to the
        // segmenter's initial output file.
        let segment = self.shared.current_segment.lock().clone().unwrap_or_else(|| {
            self.options
                .scratch_dir
                .join(format!("{}_000000.ts", self.stream_key))
        });
        if let Some(event) =
            self.detector
                .process_frame(data, width as usize, height as usize, &segment, pts)
        {
            (self.on_motion)(event);
        }
    }
}
