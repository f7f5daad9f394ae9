// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The analyser scheduler.
//!
//! Each poll loads the recordings that have no analysis row, builds one FIFO
//! per camera (already ordered by record time), and drains them round-robin
//! so a camera with a deep backlog can't starve the others. Every processed
//! recording gets exactly one analysis row: a parsed verdict, a
//! `json_parse_error` marker with the raw content, an
//! `inference_http_<status>` marker, or the error message of whatever else
//! went wrong. The row itself is the dedup key, so nothing is ever retried
//! once a row exists.

pub mod vllm;

use self::vllm::{InferenceClient, InferenceOutcome};
use base::clock::Clocks;
use base::{shutdown, Error};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the startup gate waits for the inference endpoint.
const READY_GATE_TIMEOUT: Duration = Duration::from_secs(300);
const READY_GATE_POLL: Duration = Duration::from_secs(5);

/// Store operations the scheduler needs. This is a trait for test injection;
/// the production impl is [`db::Store`].
pub trait PendingQueue: Send + Sync {
    fn list_pending(&self) -> Result<Vec<db::PendingRecording>, Error>;
    fn insert_analysis(&self, analysis: &db::AnalysisToInsert) -> Result<(), Error>;
}

impl PendingQueue for db::Store {
    fn list_pending(&self) -> Result<Vec<db::PendingRecording>, Error> {
        db::Store::list_pending(self)
    }

    fn insert_analysis(&self, analysis: &db::AnalysisToInsert) -> Result<(), Error> {
        db::Store::insert_analysis(self, analysis)
    }
}

/// The model's structured verdict. `danger_level` is clamped into `0..=10`
/// at insert; a missing level means 0.
#[derive(Debug, Deserialize, PartialEq)]
struct Verdict {
    description: Option<String>,
    #[serde(default)]
    danger: bool,
    #[serde(default)]
    danger_level: i32,
    danger_details: Option<String>,
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex is valid"))
}

/// Strips a surrounding triple-backtick fence (with or without a `json`
/// tag); models add one about half the time no matter what the prompt says.
fn clean_json_content(content: &str) -> &str {
    match fence_regex().captures(content) {
        Some(captures) => captures
            .get(1)
            .expect("fence regex has one capture group")
            .as_str()
            .trim(),
        None => content.trim(),
    }
}

pub struct Analyser<C: Clocks> {
    clocks: C,
    queue: Arc<dyn PendingQueue>,
    client: Arc<dyn InferenceClient>,
    /// `http://<host_ip>:<server_port>`; recordings are fetched through the
    /// companion HTTP surface, not the filesystem.
    recordings_base_url: String,
    poll_interval: Duration,
}

impl<C: Clocks> Analyser<C> {
    pub fn new(
        clocks: C,
        queue: Arc<dyn PendingQueue>,
        client: Arc<dyn InferenceClient>,
        recordings_base_url: String,
        poll_interval: Duration,
    ) -> Self {
        Analyser {
            clocks,
            queue,
            client,
            recordings_base_url,
            poll_interval,
        }
    }

    /// Blocks until the endpoint answers its model list or the gate times
    /// out; an unready endpoint only costs error rows, not a crash.
    pub fn wait_for_inference(&self, shutdown_rx: &shutdown::Receiver) {
        info!("waiting for inference endpoint to become ready");
        let deadline = self.clocks.monotonic() + READY_GATE_TIMEOUT;
        loop {
            if shutdown_rx.check().is_err() {
                return;
            }
            match self.client.ready() {
                Ok(()) => {
                    info!("inference endpoint is ready");
                    return;
                }
                Err(e) => debug!(err = %e.chain(), "inference endpoint not ready yet"),
            }
            if self.clocks.monotonic() >= deadline {
                warn!(
                    "inference endpoint not ready after {READY_GATE_TIMEOUT:?}, proceeding anyway"
                );
                return;
            }
            self.clocks.sleep(READY_GATE_POLL);
        }
    }

    /// Poll-process-sleep until shutdown.
    pub fn run(&self, shutdown_rx: &shutdown::Receiver) {
        info!("monitoring store for pending recordings");
        loop {
            let processed = self.pass(shutdown_rx);
            if processed > 0 {
                info!("processed {processed} recordings");
            }
            if shutdown_rx.wait_for(self.poll_interval).is_err() {
                break;
            }
        }
        info!("analyser loop stopped");
    }

    /// One poll pass: drain everything currently pending, round-robin across
    /// cameras. Returns the number of recordings processed.
    pub fn pass(&self, shutdown_rx: &shutdown::Receiver) -> usize {
        let pending = match self.queue.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(err = %e.chain(), "failed to list pending recordings");
                return 0;
            }
        };
        if pending.is_empty() {
            debug!("no pending recordings");
            return 0;
        }

        let mut per_camera: BTreeMap<String, VecDeque<db::PendingRecording>> = BTreeMap::new();
        for recording in pending {
            per_camera
                .entry(recording.stream_id.clone())
                .or_default()
                .push_back(recording);
        }
        for (camera, queue) in &per_camera {
            info!("camera {camera}: {} pending recordings", queue.len());
        }

        let mut processed = 0;
        loop {
            let mut any = false;
            for queue in per_camera.values_mut() {
                if shutdown_rx.check().is_err() {
                    return processed;
                }
                if let Some(recording) = queue.pop_front() {
                    self.process(&recording);
                    processed += 1;
                    any = true;
                }
            }
            if !any {
                return processed;
            }
        }
    }

    /// Dispatches one recording and writes its single analysis row.
    fn process(&self, recording: &db::PendingRecording) {
        info!(
            "processing recording {} ({})",
            recording.id, recording.filename
        );
        let video_url = format!(
            "{}/recordings/{}",
            self.recordings_base_url, recording.filepath
        );
        let analysis = match self.client.analyse(&video_url) {
            Ok(InferenceOutcome::Content(content)) => self.row_for_content(recording.id, content),
            Ok(InferenceOutcome::HttpError(status)) => {
                error!(
                    "recording {} inference failed with status {status}",
                    recording.id
                );
                db::AnalysisToInsert {
                    recording_id: recording.id,
                    error: Some(format!("inference_http_{status}")),
                    ..Default::default()
                }
            }
            Err(e) => {
                error!(err = %e.chain(), "recording {} inference dispatch failed", recording.id);
                db::AnalysisToInsert {
                    recording_id: recording.id,
                    error: Some(e.chain().to_string()),
                    ..Default::default()
                }
            }
        };
        if let Err(e) = self.queue.insert_analysis(&analysis) {
            // No row means the next poll retries this recording.
            warn!(err = %e.chain(), "recording {} analysis row not written", recording.id);
        }
    }

    fn row_for_content(&self, recording_id: i64, content: String) -> db::AnalysisToInsert {
        match serde_json::from_str::<Verdict>(clean_json_content(&content)) {
            Ok(verdict) => {
                info!(
                    "recording {recording_id} analysed: danger={} level={}",
                    verdict.danger, verdict.danger_level
                );
                db::AnalysisToInsert {
                    recording_id,
                    description: verdict.description,
                    danger: verdict.danger,
                    danger_level: verdict.danger_level.clamp(0, 10),
                    danger_details: verdict.danger_details,
                    raw_response: Some(content),
                    error: None,
                }
            }
            Err(e) => {
                error!("recording {recording_id} returned unparseable JSON: {e}");
                db::AnalysisToInsert {
                    recording_id,
                    raw_response: Some(content),
                    error: Some("json_parse_error".to_owned()),
                    ..Default::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use base::{err, Mutex};
    use std::time::SystemTime;

    /// Mimics the store's dedup-by-selection: a recording stops being
    /// pending once any analysis row exists for it.
    #[derive(Default)]
    struct FakeQueue {
        recordings: Mutex<Vec<db::PendingRecording>>,
        rows: Mutex<Vec<db::AnalysisToInsert>>,
    }

    impl PendingQueue for FakeQueue {
        fn list_pending(&self) -> Result<Vec<db::PendingRecording>, Error> {
            let rows = self.rows.lock();
            Ok(self
                .recordings
                .lock()
                .iter()
                .filter(|r| !rows.iter().any(|a| a.recording_id == r.id))
                .cloned()
                .collect())
        }

        fn insert_analysis(&self, analysis: &db::AnalysisToInsert) -> Result<(), Error> {
            self.rows.lock().push(analysis.clone());
            Ok(())
        }
    }

    struct FakeClient {
        outcomes: Mutex<VecDeque<Result<InferenceOutcome, Error>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeClient {
        fn new(outcomes: Vec<Result<InferenceOutcome, Error>>) -> Arc<Self> {
            Arc::new(FakeClient {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl InferenceClient for FakeClient {
        fn ready(&self) -> Result<(), Error> {
            Err(err!(Unavailable, msg("never ready")))
        }

        fn analyse(&self, video_url: &str) -> Result<InferenceOutcome, Error> {
            self.calls.lock().push(video_url.to_owned());
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(Ok(InferenceOutcome::Content("{}".to_owned())))
        }
    }

    fn recording(id: i64, stream: &str, name: &str) -> db::PendingRecording {
        db::PendingRecording {
            id,
            stream_id: stream.to_owned(),
            filename: name.to_owned(),
            filepath: format!("{stream}/20250101/{name}"),
        }
    }

    fn analyser(
        queue: Arc<FakeQueue>,
        client: Arc<FakeClient>,
    ) -> Analyser<SimulatedClocks> {
        base::tracing_setup::install_for_tests();
        Analyser::new(
            SimulatedClocks::new(SystemTime::UNIX_EPOCH),
            queue,
            client,
            "http://10.0.0.9:8080".to_owned(),
            Duration::from_secs(10),
        )
    }

    fn no_shutdown() -> (shutdown::Sender, shutdown::Receiver) {
        shutdown::channel()
    }

    #[test]
    fn fenced_verdict_is_parsed_and_recorded() {
        let queue = Arc::new(FakeQueue::default());
        queue
            .recordings
            .lock()
            .push(recording(1, "cam1", "cam1_120000.ts"));
        let content = "```json\n{\"description\":\"x\",\"danger\":true,\"danger_level\":3,\"danger_details\":\"\"}\n```";
        let client = FakeClient::new(vec![Ok(InferenceOutcome::Content(content.to_owned()))]);
        let (_tx, rx) = no_shutdown();
        assert_eq!(analyser(queue.clone(), client.clone()).pass(&rx), 1);

        let rows = queue.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description.as_deref(), Some("x"));
        assert!(rows[0].danger);
        assert_eq!(rows[0].danger_level, 3);
        assert_eq!(rows[0].danger_details.as_deref(), Some(""));
        assert_eq!(rows[0].raw_response.as_deref(), Some(content));
        assert_eq!(rows[0].error, None);
        assert_eq!(
            client.calls.lock()[0],
            "http://10.0.0.9:8080/recordings/cam1/20250101/cam1_120000.ts"
        );
    }

    #[test]
    fn http_error_writes_marker_row_and_is_not_retried() {
        let queue = Arc::new(FakeQueue::default());
        queue
            .recordings
            .lock()
            .push(recording(7, "cam1", "cam1_120000.ts"));
        let client = FakeClient::new(vec![Ok(InferenceOutcome::HttpError(503))]);
        let (_tx, rx) = no_shutdown();
        let a = analyser(queue.clone(), client.clone());
        assert_eq!(a.pass(&rx), 1);
        {
            let rows = queue.rows.lock();
            assert_eq!(rows[0].error.as_deref(), Some("inference_http_503"));
            assert_eq!(rows[0].description, None);
        }
        // The marker row removes it from the pending set.
        assert_eq!(a.pass(&rx), 0);
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[test]
    fn unparseable_content_preserves_raw_response() {
        let queue = Arc::new(FakeQueue::default());
        queue
            .recordings
            .lock()
            .push(recording(2, "cam1", "a.ts"));
        let client = FakeClient::new(vec![Ok(InferenceOutcome::Content(
            "the camera shows a cat".to_owned(),
        ))]);
        let (_tx, rx) = no_shutdown();
        analyser(queue.clone(), client).pass(&rx);
        let rows = queue.rows.lock();
        assert_eq!(rows[0].error.as_deref(), Some("json_parse_error"));
        assert_eq!(rows[0].raw_response.as_deref(), Some("the camera shows a cat"));
        assert_eq!(rows[0].danger_level, 0);
    }

    #[test]
    fn dispatch_error_writes_message_row() {
        let queue = Arc::new(FakeQueue::default());
        queue
            .recordings
            .lock()
            .push(recording(3, "cam1", "a.ts"));
        let client = FakeClient::new(vec![Err(err!(Unavailable, msg("connection refused")))]);
        let (_tx, rx) = no_shutdown();
        analyser(queue.clone(), client).pass(&rx);
        let rows = queue.rows.lock();
        assert!(rows[0].error.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn round_robin_across_cameras() {
        let queue = Arc::new(FakeQueue::default());
        {
            let mut recordings = queue.recordings.lock();
            recordings.push(recording(1, "camA", "a1.ts"));
            recordings.push(recording(2, "camA", "a2.ts"));
            recordings.push(recording(3, "camA", "a3.ts"));
            recordings.push(recording(4, "camB", "b1.ts"));
        }
        let client = FakeClient::new(vec![]);
        let (_tx, rx) = no_shutdown();
        assert_eq!(analyser(queue.clone(), client.clone()).pass(&rx), 4);
        let order: Vec<i64> = queue.rows.lock().iter().map(|r| r.recording_id).collect();
        assert_eq!(order, vec![1, 4, 2, 3], "one per camera per round");
    }

    #[test]
    fn drained_queue_is_a_no_op() {
        let queue = Arc::new(FakeQueue::default());
        queue.recordings.lock().push(recording(1, "cam1", "a.ts"));
        let client = FakeClient::new(vec![]);
        let (_tx, rx) = no_shutdown();
        let a = analyser(queue.clone(), client.clone());
        assert_eq!(a.pass(&rx), 1);
        assert_eq!(a.pass(&rx), 0);
        assert_eq!(a.pass(&rx), 0);
        assert_eq!(client.calls.lock().len(), 1, "no repeat inference calls");
    }

    #[test]
    fn out_of_range_danger_level_is_clamped() {
        let queue = Arc::new(FakeQueue::default());
        queue.recordings.lock().push(recording(1, "cam1", "a.ts"));
        let client = FakeClient::new(vec![Ok(InferenceOutcome::Content(
            "{\"description\":\"d\",\"danger\":true,\"danger_level\":42}".to_owned(),
        ))]);
        let (_tx, rx) = no_shutdown();
        analyser(queue.clone(), client).pass(&rx);
        assert_eq!(queue.rows.lock()[0].danger_level, 10);
    }

    #[test]
    fn ready_gate_times_out_and_proceeds() {
        let queue = Arc::new(FakeQueue::default());
        let client = FakeClient::new(vec![]);
        let (_tx, rx) = no_shutdown();
        let a = analyser(queue, client);
        // SimulatedClocks advance on sleep, so the 300 s gate elapses
        // immediately in test time; returning at all is the assertion.
        a.wait_for_inference(&rx);
        assert!(a.clocks.monotonic() >= READY_GATE_TIMEOUT);
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(clean_json_content("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(clean_json_content("  {\"a\":1} \n"), "{\"a\":1}");
        assert_eq!(clean_json_content("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_content("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(
            clean_json_content("noise before ```json {\"a\":1}``` noise after"),
            "{\"a\":1}"
        );
    }
}
