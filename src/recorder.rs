// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Motion-triggered recording sessions with pre/post-roll.
//!
//! The recorder owns, per stream, a bounded ring of recently closed scratch
//! segments and the (at most one) active recording session. Motion opens or
//! extends the session; segment closes land in the ring and, while a session
//! is active, get copied into the durable store; a periodic tick ends
//! sessions whose post-roll has elapsed.
//!
//! Only *closed* segments participate in pre-roll. The segment being written
//! when motion arrives is copied later through the segment-close path, so
//! nothing splices partial files.
//!
//! All map mutation and the copies themselves happen under one session lock.
//! Copying under the lock keeps a concurrent close from interleaving with a
//! pre-roll sweep; everything else the detector does (discovery, store
//! retries, inference) stays off this lock.

use crate::discovery::stream_key;
use crate::motion::MotionEvent;
use base::clock::Clocks;
use base::{err, Error, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Sink for durable recording rows. This is a trait for test injection; the
/// production impl is [`db::Store`].
pub trait RecordingIndex: Send + Sync {
    fn insert_recording(&self, recording: &db::RecordingToInsert) -> Result<(), Error>;
}

impl RecordingIndex for db::Store {
    fn insert_recording(&self, recording: &db::RecordingToInsert) -> Result<(), Error> {
        db::Store::insert_recording(self, recording)
    }
}

/// A finished scratch segment, remembered for pre-roll.
#[derive(Clone, Debug)]
pub struct ClosedSegment {
    pub path: PathBuf,
    /// Wall-clock time the close was observed.
    pub end_ts: SystemTime,
}

struct RecordingSession {
    last_motion: SystemTime,
    /// Source paths already copied; the at-most-once guard.
    copied: HashSet<PathBuf>,
}

#[derive(Default)]
struct StreamState {
    history: VecDeque<ClosedSegment>,
    session: Option<RecordingSession>,
}

pub struct Recorder<C: Clocks> {
    clocks: C,
    recordings_dir: PathBuf,
    pre_roll: Duration,
    post_roll: Duration,
    history_capacity: usize,
    index: Arc<dyn RecordingIndex>,
    /// The session lock: per-stream history ring + session slot.
    streams: Mutex<HashMap<String, StreamState>>,
}

impl<C: Clocks> Recorder<C> {
    pub fn new(
        clocks: C,
        recordings_dir: &Path,
        pre_roll: Duration,
        post_roll: Duration,
        segment_duration: Duration,
        index: Arc<dyn RecordingIndex>,
    ) -> Self {
        // Enough ring to cover the pre-roll window, with slack for closes
        // that lag their nominal boundary.
        let segments_per_pre_roll =
            pre_roll.as_secs().div_ceil(segment_duration.as_secs().max(1)) as usize;
        Recorder {
            clocks,
            recordings_dir: recordings_dir.to_owned(),
            pre_roll,
            post_roll,
            history_capacity: (segments_per_pre_roll + 3).max(5),
            index,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Motion handler: opens a session (with pre-roll sweep) or extends the
    /// active one.
    pub fn handle_motion(&self, event: &MotionEvent) {
        let now = self.clocks.realtime();
        let mut streams = self.streams.lock();
        let state = streams.entry(event.stream_id.clone()).or_default();
        match state.session.as_mut() {
            Some(session) => session.last_motion = now,
            None => {
                info!("[SESSION] stream={} Started recording", event.stream_id);
                let mut session = RecordingSession {
                    last_motion: now,
                    copied: HashSet::new(),
                };
                let cutoff = now.checked_sub(self.pre_roll).unwrap_or(SystemTime::UNIX_EPOCH);
                let eligible: Vec<PathBuf> = state
                    .history
                    .iter()
                    .filter(|seg| seg.end_ts >= cutoff)
                    .map(|seg| seg.path.clone())
                    .collect();
                for path in eligible {
                    self.copy_into_session(&event.stream_id, &path, &mut session);
                }
                state.session = Some(session);
            }
        }
    }

    /// Segment-close handler: records the segment in the ring and, if a
    /// session is active, copies it immediately.
    pub fn handle_segment_closed(&self, stream_id: &str, path: &Path, end_ts: SystemTime) {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream_id.to_owned()).or_default();
        state.history.push_back(ClosedSegment {
            path: path.to_owned(),
            end_ts,
        });
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }
        if let Some(session) = state.session.as_mut() {
            self.copy_into_session(stream_id, path, session);
        }
    }

    /// Ends every session whose post-roll has elapsed. Call roughly once per
    /// second.
    pub fn tick(&self) {
        let now = self.clocks.realtime();
        let mut streams = self.streams.lock();
        for (stream_id, state) in streams.iter_mut() {
            let expired = state.session.as_ref().is_some_and(|session| {
                now.duration_since(session.last_motion)
                    .is_ok_and(|quiet| quiet >= self.post_roll)
            });
            if expired {
                end_session(stream_id, state.session.take().expect("checked above"));
            }
        }
    }

    /// Forgets a stream entirely (reconciliation removed it), ending any
    /// active session.
    pub fn drop_stream(&self, stream_id: &str) {
        let mut streams = self.streams.lock();
        if let Some(mut state) = streams.remove(stream_id) {
            if let Some(session) = state.session.take() {
                end_session(stream_id, session);
            }
        }
    }

    /// Ends all sessions; used at shutdown so every start gets its end.
    pub fn end_all(&self) {
        let mut streams = self.streams.lock();
        for (stream_id, state) in streams.iter_mut() {
            if let Some(session) = state.session.take() {
                end_session(stream_id, session);
            }
        }
        streams.clear();
    }

    /// Copies one source segment into the session's durable layout:
    /// `<recordings_dir>/<stream_key>/<YYYYMMDD>/<stream_key>_<HHMMSS>[_<n>].ts`
    /// named after the source's mtime, via a `.tmp` sibling and atomic
    /// rename. Successful copies are marked in `copied` and indexed; failed
    /// ones stay unmarked so the next close retries them.
    fn copy_into_session(
        &self,
        stream_id: &str,
        source: &Path,
        session: &mut RecordingSession,
    ) -> bool {
        if session.copied.contains(source) {
            return true;
        }
        let mtime = match std::fs::metadata(source) {
            Ok(meta) if meta.is_file() => meta
                .modified()
                .unwrap_or_else(|_| self.clocks.realtime()),
            _ => return false,
        };
        // Copies run under the session lock; a slow disk here stalls the
        // whole stream's session handling, so make it visible.
        let _t = base::clock::TimerGuard::new(&self.clocks, || {
            format!("copying {}", source.display())
        });
        match self.copy_segment(stream_id, source, mtime) {
            Ok(dest) => {
                session.copied.insert(source.to_owned());
                debug!(
                    "stream={stream_id} copied segment {} -> {}",
                    source.display(),
                    dest.display()
                );
                true
            }
            Err(e) => {
                warn!(
                    err = %e.chain(),
                    "stream={stream_id} failed to copy segment {}", source.display()
                );
                false
            }
        }
    }

    fn copy_segment(
        &self,
        stream_id: &str,
        source: &Path,
        mtime: SystemTime,
    ) -> Result<PathBuf, Error> {
        let key = stream_key(stream_id);
        let (date, time) = local_date_time(mtime)?;
        let day_dir = self.recordings_dir.join(&key).join(&date);
        std::fs::create_dir_all(&day_dir)?;

        let mut dest = day_dir.join(format!("{key}_{time}.ts"));
        let mut n = 1;
        while dest.exists() {
            dest = day_dir.join(format!("{key}_{time}_{n}.ts"));
            n += 1;
        }

        let tmp = dest.with_extension("ts.tmp");
        let result = (|| -> Result<(), Error> {
            std::fs::copy(source, &tmp)?;
            // Keep the source's mtime on the durable copy.
            let f = std::fs::File::options().write(true).open(&tmp)?;
            f.set_modified(mtime)?;
            std::fs::rename(&tmp, &dest)?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        let filename = dest
            .file_name()
            .expect("dest has a file name")
            .to_string_lossy()
            .into_owned();
        let row = db::RecordingToInsert {
            stream_id: stream_id.to_owned(),
            filepath: format!("{key}/{date}/{filename}"),
            filename,
            recorded_at: mtime,
        };
        // The file on disk is authoritative; a failed insert is only logged.
        if let Err(e) = self.index.insert_recording(&row) {
            warn!(err = %e.chain(), "stream={stream_id} failed to index recording");
        }
        Ok(dest)
    }

    #[cfg(test)]
    pub(crate) fn active_session_count(&self) -> usize {
        self.streams
            .lock()
            .values()
            .filter(|s| s.session.is_some())
            .count()
    }

    #[cfg(test)]
    fn history_len(&self, stream_id: &str) -> usize {
        self.streams
            .lock()
            .get(stream_id)
            .map(|s| s.history.len())
            .unwrap_or(0)
    }
}

fn end_session(stream_id: &str, session: RecordingSession) {
    info!(
        "[SESSION] stream={stream_id} Ended recording ({} segments)",
        session.copied.len()
    );
}

/// Local-time `(YYYYMMDD, HHMMSS)` for naming a copy after its source mtime.
fn local_date_time(t: SystemTime) -> Result<(String, String), Error> {
    let ts = jiff::Timestamp::try_from(t)
        .map_err(|e| err!(OutOfRange, msg("segment mtime out of range"), source(e)))?;
    let zoned = ts.to_zoned(jiff::tz::TimeZone::system());
    Ok((
        zoned.strftime("%Y%m%d").to_string(),
        zoned.strftime("%H%M%S").to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PRE_ROLL: Duration = Duration::from_secs(5);
    const POST_ROLL: Duration = Duration::from_secs(5);
    const SEG_DUR: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeIndex {
        rows: Mutex<Vec<db::RecordingToInsert>>,
        fail: AtomicBool,
    }

    impl RecordingIndex for FakeIndex {
        fn insert_recording(&self, recording: &db::RecordingToInsert) -> Result<(), Error> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(err!(Unavailable, msg("store down")));
            }
            self.rows.lock().push(recording.clone());
            Ok(())
        }
    }

    struct Fixture {
        clocks: SimulatedClocks,
        index: Arc<FakeIndex>,
        recorder: Recorder<SimulatedClocks>,
        scratch: tempfile::TempDir,
        recordings: tempfile::TempDir,
        boot: SystemTime,
    }

    impl Fixture {
        fn new() -> Self {
            base::tracing_setup::install_for_tests();
            let boot = SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000);
            let clocks = SimulatedClocks::new(boot);
            let index = Arc::new(FakeIndex::default());
            let recordings = tempfile::tempdir().unwrap();
            let recorder = Recorder::new(
                clocks.clone(),
                recordings.path(),
                PRE_ROLL,
                POST_ROLL,
                SEG_DUR,
                index.clone(),
            );
            Fixture {
                clocks,
                index,
                recorder,
                scratch: tempfile::tempdir().unwrap(),
                recordings,
                boot,
            }
        }

        fn t(&self, secs: u64) -> SystemTime {
            self.boot + Duration::from_secs(secs)
        }

        /// Advances the simulated wall clock to `boot + secs`.
        fn advance_to(&self, secs: u64) {
            let now = self.clocks.realtime();
            let target = self.t(secs);
            self.clocks
                .sleep(target.duration_since(now).expect("time moves forward"));
        }

        /// Creates a scratch segment file and reports it closed at `t(secs)`.
        fn close_segment(&self, name: &str, secs: u64) -> PathBuf {
            let path = self.write_segment(name);
            self.recorder
                .handle_segment_closed("cam1", &path, self.t(secs));
            path
        }

        fn write_segment(&self, name: &str) -> PathBuf {
            let path = self.scratch.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            path
        }

        fn motion(&self, secs: u64) {
            self.advance_to(secs);
            self.recorder.handle_motion(&MotionEvent {
                stream_id: "cam1".to_owned(),
                segment_file: self.scratch.path().join("current.ts"),
                motion_pct: 42.0,
                timestamp: secs as f64,
            });
        }

        fn rows(&self) -> Vec<db::RecordingToInsert> {
            self.index.rows.lock().clone()
        }
    }

    #[test]
    fn single_motion_burst() {
        let f = Fixture::new();
        f.close_segment("cam1_000000.ts", 0);
        f.close_segment("cam1_000001.ts", 5);
        f.close_segment("cam1_000002.ts", 10);

        f.motion(12);
        assert_eq!(f.recorder.active_session_count(), 1);
        // Pre-roll window is [7, 12]: only the segment closed at t=10.
        assert_eq!(f.rows().len(), 1);

        // The segment closing mid-session is copied as it closes.
        f.advance_to(15);
        f.close_segment("cam1_000003.ts", 15);
        assert_eq!(f.rows().len(), 2);

        f.advance_to(16);
        f.recorder.tick();
        assert_eq!(f.recorder.active_session_count(), 1, "post-roll not elapsed");
        f.advance_to(17);
        f.recorder.tick();
        assert_eq!(f.recorder.active_session_count(), 0);
        assert_eq!(f.rows().len(), 2);
        assert!(f.rows().iter().all(|r| r.stream_id == "cam1"));
    }

    #[test]
    fn overlapping_motion_extends_single_session() {
        let f = Fixture::new();
        f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        f.motion(16);
        assert_eq!(f.recorder.active_session_count(), 1);

        f.advance_to(20);
        f.recorder.tick();
        assert_eq!(f.recorder.active_session_count(), 1, "quiet only since t=16");
        f.advance_to(21);
        f.recorder.tick();
        assert_eq!(f.recorder.active_session_count(), 0);
        // The pre-roll segment was copied once despite two motion events.
        assert_eq!(f.rows().len(), 1);
    }

    #[test]
    fn pre_roll_larger_than_history_copies_everything_available() {
        let boot = SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000);
        let clocks = SimulatedClocks::new(boot);
        let index = Arc::new(FakeIndex::default());
        let recordings = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(
            clocks.clone(),
            recordings.path(),
            Duration::from_secs(3600),
            POST_ROLL,
            SEG_DUR,
            index.clone(),
        );
        let scratch = tempfile::tempdir().unwrap();
        for (i, secs) in [(0u32, 0u64), (1, 5)] {
            let path = scratch.path().join(format!("cam1_{i:06}.ts"));
            std::fs::write(&path, b"x").unwrap();
            recorder.handle_segment_closed("cam1", &path, boot + Duration::from_secs(secs));
        }
        clocks.sleep(Duration::from_secs(12));
        recorder.handle_motion(&MotionEvent {
            stream_id: "cam1".to_owned(),
            segment_file: PathBuf::from("whatever.ts"),
            motion_pct: 10.0,
            timestamp: 12.0,
        });
        assert_eq!(index.rows.lock().len(), 2);
    }

    #[test]
    fn reclosing_copied_segment_is_a_no_op() {
        let f = Fixture::new();
        let seg = f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        assert_eq!(f.rows().len(), 1);
        f.recorder.handle_segment_closed("cam1", &seg, f.t(13));
        assert_eq!(f.rows().len(), 1, "no duplicate row");
        let day_dirs: Vec<_> = std::fs::read_dir(f.recordings.path().join("cam1"))
            .unwrap()
            .collect();
        let files: Vec<_> = std::fs::read_dir(day_dirs[0].as_ref().unwrap().path())
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1, "no duplicate file");
    }

    #[test]
    fn same_second_collision_gets_suffixed() {
        let f = Fixture::new();
        let a = f.write_segment("cam1_000000.ts");
        let b = f.write_segment("cam1_000001.ts");
        // Pin both sources to the same mtime second.
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for p in [&a, &b] {
            let file = std::fs::File::options().write(true).open(p).unwrap();
            file.set_modified(mtime).unwrap();
        }
        f.recorder.handle_segment_closed("cam1", &a, f.t(9));
        f.recorder.handle_segment_closed("cam1", &b, f.t(10));
        f.motion(12);
        let rows = f.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].filename.ends_with(".ts"));
        assert!(
            rows[1].filename.ends_with("_1.ts"),
            "collision suffix missing: {}",
            rows[1].filename
        );
        assert_eq!(rows[0].recorded_at, mtime);
        // Both durable files exist; nothing was overwritten.
        let rel = PathBuf::from(&rows[1].filepath);
        assert!(f.recordings.path().join(&rel).is_file());
    }

    #[test]
    fn missing_source_is_retried_on_next_close() {
        let f = Fixture::new();
        f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        let ghost = f.scratch.path().join("cam1_000001.ts");
        f.recorder.handle_segment_closed("cam1", &ghost, f.t(15));
        assert_eq!(f.rows().len(), 1, "missing source not copied");
        // The segmenter finishes the file late; the next close succeeds.
        std::fs::write(&ghost, b"late").unwrap();
        f.recorder.handle_segment_closed("cam1", &ghost, f.t(16));
        assert_eq!(f.rows().len(), 2);
    }

    #[test]
    fn index_failure_keeps_file_and_copy_mark() {
        let f = Fixture::new();
        f.index.fail.store(true, Ordering::SeqCst);
        let seg = f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        assert_eq!(f.rows().len(), 0);
        let day_root = f.recordings.path().join("cam1");
        assert!(day_root.is_dir(), "file copied despite store failure");
        // Still marked copied: a re-close doesn't produce a second file.
        f.index.fail.store(false, Ordering::SeqCst);
        f.recorder.handle_segment_closed("cam1", &seg, f.t(13));
        assert_eq!(f.rows().len(), 0);
    }

    #[test]
    fn history_ring_is_bounded() {
        let f = Fixture::new();
        // Capacity is max(5, ceil(5/5) + 3) = 5.
        for i in 0..8u64 {
            f.close_segment(&format!("cam1_{i:06}.ts"), i * 5);
        }
        assert_eq!(f.recorder.history_len("cam1"), 5);
    }

    #[test]
    fn drop_stream_ends_session_and_forgets_history() {
        let f = Fixture::new();
        f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        assert_eq!(f.recorder.active_session_count(), 1);
        f.recorder.drop_stream("cam1");
        assert_eq!(f.recorder.active_session_count(), 0);
        assert_eq!(f.recorder.history_len("cam1"), 0);
    }

    #[test]
    fn end_all_closes_every_stream() {
        let f = Fixture::new();
        f.close_segment("cam1_000000.ts", 10);
        f.motion(12);
        f.recorder.handle_motion(&MotionEvent {
            stream_id: "cam2".to_owned(),
            segment_file: PathBuf::from("x.ts"),
            motion_pct: 5.0,
            timestamp: 12.0,
        });
        assert_eq!(f.recorder.active_session_count(), 2);
        f.recorder.end_all();
        assert_eq!(f.recorder.active_session_count(), 0);
    }
}
