// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! GStreamer media backend.
//!
//! Element graph per stream, mirroring what the segmenter and tap need:
//!
//! ```text
//! rtspsrc -> rtph264depay -> h264parse -> tee
//!     tee -> queue -> splitmuxsink (mpegtsmux, no re-encode)
//!     tee -> queue(leaky) -> avdec_h264 -> videoscale -> capsfilter
//!         -> videoconvert -> capsfilter(GRAY8) -> appsink
//! ```
//!
//! GStreamer drives its own streaming threads; signals funnel into a bounded
//! channel that [`Session::next`] drains. Frames are sent with `try_send`
//! (the leaky queue upstream already drops stale video, and a full channel
//! just drops the newest frame); segment rollovers use a blocking send so
//! none is ever lost.

use super::{Event, Opener, Options, Session};
use base::{err, Error};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Bound on queued events between GStreamer's threads and the pipeline
/// worker. Generous for rollover signals, tight enough that frames can't
/// pile up behind a stalled detector.
const EVENT_QUEUE_DEPTH: usize = 16;

/// How long `next` waits before reporting [`Event::Idle`].
const IDLE_POLL: Duration = Duration::from_millis(250);

pub struct GstOpener;

impl GstOpener {
    pub fn new() -> Result<Self, Error> {
        gst::init().map_err(|e| err!(Internal, msg("GStreamer init failed"), source(e)))?;
        Ok(GstOpener)
    }
}

impl Opener for GstOpener {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Session>, Error> {
        let session = GstSession::build(&label, &url, &options)?;
        info!("{label}: pipeline playing");
        Ok(Box::new(session))
    }
}

fn make(factory: &str) -> Result<gst::Element, Error> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| err!(Internal, msg("no GStreamer element {factory}"), source(e)))
}

fn link_err(from: &str, to: &str) -> Error {
    err!(Internal, msg("can't link {from} -> {to}"))
}

struct GstSession {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
    events: mpsc::Receiver<Event>,
}

impl GstSession {
    fn build(label: &str, url: &Url, options: &Options) -> Result<Self, Error> {
        let (tx, events) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let pipeline = gst::Pipeline::builder().name(label).build();

        let rtspsrc = make("rtspsrc")?;
        rtspsrc.set_property("location", url.as_str());
        rtspsrc.set_property_from_str("protocols", "tcp");
        rtspsrc.set_property("latency", options.latency.as_millis() as u32);
        let rtph264depay = make("rtph264depay")?;
        let h264parse = make("h264parse")?;
        let tee = make("tee")?;

        // Segmenter branch: passthrough H.264 into rotating MPEG-TS files.
        let seg_queue = make("queue")?;
        seg_queue.set_property("max-size-buffers", 100u32);
        seg_queue.set_property("max-size-time", 2_000_000_000u64);
        let splitmuxsink = make("splitmuxsink")?;
        splitmuxsink.set_property(
            "max-size-time",
            options.segment_duration.as_nanos() as u64,
        );
        splitmuxsink.set_property("muxer-factory", "mpegtsmux");
        splitmuxsink.set_property(
            "location",
            options
                .scratch_dir
                .join(format!("{}_%06d.ts", options.filename_prefix))
                .to_string_lossy()
                .into_owned(),
        );

        // Tap branch: decode, downscale, grayscale. Leaky so live video
        // never backs up behind analysis.
        let tap_queue = make("queue")?;
        tap_queue.set_property("max-size-buffers", 5u32);
        tap_queue.set_property_from_str("leaky", "downstream");
        let avdec = make("avdec_h264")?;
        let videoscale = make("videoscale")?;
        let scale_filter = make("capsfilter")?;
        scale_filter.set_property(
            "caps",
            gst::Caps::builder("video/x-raw")
                .field("width", options.frame_size.0 as i32)
                .field("height", options.frame_size.1 as i32)
                .build(),
        );
        let videoconvert = make("videoconvert")?;
        let gray_filter = make("capsfilter")?;
        gray_filter.set_property(
            "caps",
            gst::Caps::builder("video/x-raw")
                .field("format", "GRAY8")
                .build(),
        );
        let appsink = gst_app::AppSink::builder()
            .max_buffers(2)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([
                &rtspsrc,
                &rtph264depay,
                &h264parse,
                &tee,
                &seg_queue,
                &splitmuxsink,
                &tap_queue,
                &avdec,
                &videoscale,
                &scale_filter,
                &videoconvert,
                &gray_filter,
                appsink.upcast_ref(),
            ])
            .map_err(|e| err!(Internal, msg("can't assemble pipeline"), source(e)))?;

        // rtspsrc pads appear once the stream is negotiated.
        let depay_weak = rtph264depay.downgrade();
        let pad_label = label.to_owned();
        rtspsrc.connect_pad_added(move |_, pad| {
            let Some(depay) = depay_weak.upgrade() else { return };
            let is_video = pad
                .current_caps()
                .map(|caps| caps.to_string().to_ascii_lowercase())
                .is_some_and(|caps| caps.contains("video") || caps.contains("h264"));
            if !is_video {
                return;
            }
            let sink = depay.static_pad("sink").expect("depay has a sink pad");
            if sink.is_linked() {
                return;
            }
            match pad.link(&sink) {
                Ok(_) => info!("{pad_label}: video pad linked"),
                Err(e) => warn!("{pad_label}: failed to link video pad: {e:?}"),
            }
        });

        gst::Element::link_many([&rtph264depay, &h264parse, &tee])
            .map_err(|_| link_err("rtph264depay", "tee"))?;

        let tee_seg = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| err!(Internal, msg("tee has no segment pad")))?;
        tee_seg
            .link(&seg_queue.static_pad("sink").expect("queue has a sink pad"))
            .map_err(|_| link_err("tee", "seg queue"))?;
        // splitmuxsink owns the muxer; H.264 goes straight to its request pad.
        let mux_video = splitmuxsink
            .request_pad_simple("video")
            .ok_or_else(|| err!(Internal, msg("splitmuxsink has no video pad")))?;
        seg_queue
            .static_pad("src")
            .expect("queue has a src pad")
            .link(&mux_video)
            .map_err(|_| link_err("seg queue", "splitmuxsink"))?;

        let tee_tap = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| err!(Internal, msg("tee has no tap pad")))?;
        tee_tap
            .link(&tap_queue.static_pad("sink").expect("queue has a sink pad"))
            .map_err(|_| link_err("tee", "tap queue"))?;
        gst::Element::link_many([
            &tap_queue,
            &avdec,
            &videoscale,
            &scale_filter,
            &videoconvert,
            &gray_filter,
            appsink.upcast_ref(),
        ])
        .map_err(|_| link_err("tap queue", "appsink"))?;

        // Segment naming doubles as the rollover signal: when splitmuxsink
        // asks where fragment N goes, fragment N-1 is done.
        let scratch = options.scratch_dir.clone();
        let prefix = options.filename_prefix.clone();
        let seg_tx = tx.clone();
        splitmuxsink.connect("format-location-full", false, move |args| {
            let index = args
                .get(1)
                .and_then(|v| v.get::<u32>().ok())
                .unwrap_or(0);
            let path: PathBuf = scratch.join(format!("{prefix}_{index:06}.ts"));
            let _ = seg_tx.send(Event::SegmentOpened {
                path: path.clone(),
                index,
            });
            Some(path.to_string_lossy().into_owned().to_value())
        });

        let frame_tx = tx;
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let s = caps.structure(0).ok_or(gst::FlowError::Error)?;
                    let width = s.get::<i32>("width").unwrap_or(0).max(0) as u32;
                    let height = s.get::<i32>("height").unwrap_or(0).max(0) as u32;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let pts = buffer
                        .pts()
                        .map(|t| t.nseconds() as f64 / 1e9)
                        .unwrap_or(0.0);
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    // Dropping a frame on a full channel is fine; motion
                    // detection only needs a recent pair.
                    let _ = frame_tx.try_send(Event::Frame {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        width,
                        height,
                        pts,
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| err!(Internal, msg("pipeline has no bus")))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| err!(Unavailable, msg("pipeline refused to play"), source(e)))?;
        debug!("{label}: elements linked, waiting for media");

        Ok(GstSession {
            pipeline,
            bus,
            events,
        })
    }
}

impl Session for GstSession {
    fn next(&mut self) -> Result<Event, Error> {
        // Bus problems take precedence over buffered media events.
        while let Some(message) = self.bus.pop() {
            match message.view() {
                gst::MessageView::Error(e) => {
                    return Err(err!(Unavailable, msg("{}", e.error())));
                }
                gst::MessageView::Eos(_) => {
                    return Err(err!(Unavailable, msg("end of stream")));
                }
                gst::MessageView::Warning(w) => {
                    return Ok(Event::Warning {
                        detail: w.error().to_string(),
                    });
                }
                _ => {}
            }
        }
        match self.events.recv_timeout(IDLE_POLL) {
            Ok(event) => Ok(event),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Event::Idle),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(err!(Unavailable, msg("pipeline signal sources gone")))
            }
        }
    }
}

impl Drop for GstSession {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("failed to tear down pipeline: {e:?}");
        }
    }
}
