// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Capability boundary around the media machinery.
//!
//! A backend connects to one RTSP source and runs two consumers on it: a
//! segmenter writing MPEG-TS files (no re-encode) into the stream's scratch
//! directory, and a tap decoding downscaled grayscale frames. Everything the
//! rest of the program knows about media arrives as an ordered stream of
//! [`Event`]s; no media library types cross this boundary.
//!
//! Ordering contract: `SegmentOpened` for segment *N* is delivered before any
//! `Frame` belonging to segment *N*. The pipeline turns each `SegmentOpened`
//! into a close of segment *N−1*.

use base::Error;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[cfg(feature = "backend-gstreamer")]
pub mod gst;

/// Parameters for opening one stream.
#[derive(Clone, Debug)]
pub struct Options {
    /// Jitter buffer target for the RTSP source. Transport is always TCP.
    pub latency: Duration,
    /// Target size for grayscale tap frames, `(width, height)`.
    pub frame_size: (u32, u32),
    /// Approximate duration of each MPEG-TS segment.
    pub segment_duration: Duration,
    /// Per-stream scratch directory the segmenter writes into.
    pub scratch_dir: PathBuf,
    /// Filename prefix; segments are `<prefix>_<NNNNNN>.ts`.
    pub filename_prefix: String,
}

/// One signal from the backend, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The segmenter started writing a new file. Implies the previous
    /// segment (if any) is complete on disk.
    SegmentOpened { path: PathBuf, index: u32 },
    /// One grayscale tap frame. The tap drops old frames under backpressure,
    /// so consumers may see gaps but never stale backlogs.
    Frame {
        data: Bytes,
        width: u32,
        height: u32,
        /// Presentation time, seconds.
        pts: f64,
    },
    /// A recoverable oddity worth logging.
    Warning { detail: String },
    /// Nothing happened within the backend's internal wait bound. Emitted so
    /// callers can observe stop requests while the source is quiet.
    Idle,
}

/// A live connection to one stream.
///
/// `next` must return within a bounded interval (emitting [`Event::Idle`]
/// when nothing is flowing); end of stream and fatal transport errors are
/// `Err`, after which the session is dead.
pub trait Session: Send {
    fn next(&mut self) -> Result<Event, Error>;
}

/// Opens RTSP streams. This is a trait for test injection.
pub trait Opener: Send + Sync {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Session>, Error>;
}

#[cfg(test)]
pub mod testutil {
    //! A deterministic scripted backend for pipeline and manager tests.

    use super::*;
    use base::{err, Mutex};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// What a [`ScriptedSession`] does once its script is exhausted.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ThenWhat {
        /// Report end of stream.
        End,
        /// Report [`Event::Idle`] forever (with a small real sleep so tests
        /// that wait for a stop request don't spin).
        Idle,
    }

    pub struct ScriptedSession {
        script: VecDeque<Result<Event, Error>>,
        then: ThenWhat,
    }

    impl ScriptedSession {
        pub fn new(script: Vec<Result<Event, Error>>, then: ThenWhat) -> Self {
            ScriptedSession {
                script: script.into(),
                then,
            }
        }
    }

    impl Session for ScriptedSession {
        fn next(&mut self) -> Result<Event, Error> {
            match self.script.pop_front() {
                Some(item) => item,
                None => match self.then {
                    ThenWhat::End => Err(err!(Unavailable, msg("end of scripted stream"))),
                    ThenWhat::Idle => {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        Ok(Event::Idle)
                    }
                },
            }
        }
    }

    /// Hands out scripted sessions in order; fails to open once they run out.
    pub struct ScriptedOpener {
        sessions: Mutex<VecDeque<ScriptedSession>>,
        opened: AtomicUsize,
        pub expect_url_prefix: Option<String>,
    }

    impl ScriptedOpener {
        pub fn new(sessions: Vec<ScriptedSession>) -> Arc<Self> {
            Arc::new(ScriptedOpener {
                sessions: Mutex::new(sessions.into()),
                opened: AtomicUsize::new(0),
                expect_url_prefix: None,
            })
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    impl Opener for ScriptedOpener {
        fn open(
            &self,
            _label: String,
            url: Url,
            _options: Options,
        ) -> Result<Box<dyn Session>, Error> {
            if let Some(prefix) = &self.expect_url_prefix {
                assert!(
                    url.as_str().starts_with(prefix),
                    "unexpected url {url}, wanted prefix {prefix}"
                );
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().pop_front() {
                Some(s) => Ok(Box::new(s)),
                None => Err(err!(Unavailable, msg("no more scripted sessions"))),
            }
        }
    }

    /// A frame whose every pixel has the given value.
    pub fn flat_frame(value: u8, width: u32, height: u32, pts: f64) -> Event {
        Event::Frame {
            data: Bytes::from(vec![value; (width * height) as usize]),
            width,
            height,
            pts,
        }
    }
}
