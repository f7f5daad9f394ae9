// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Environment-driven configuration for both processes.
//!
//! All knobs come from environment variables with production defaults, so a
//! bare `argus detector` inside the compose network does the right thing.
//! Anything unparseable is an `InvalidArgument` error at startup; nothing is
//! re-read later.

use base::{bail, err, Error};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Media server connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediamtxConfig {
    pub host: String,
    pub api_port: u16,
    pub rtsp_port: u16,
}

impl MediamtxConfig {
    /// Base URL of the discovery HTTP API.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.api_port)
    }

    /// RTSP URL for a given stream path.
    pub fn rtsp_url(&self, stream_id: &str) -> String {
        format!("rtsp://{}:{}/{stream_id}", self.host, self.rtsp_port)
    }
}

/// MPEG-TS scratch segmentation settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Scratch directory for segments; expected to be tmpfs-backed.
    pub output_dir: PathBuf,
    pub duration: Duration,
    /// Per-stream scratch ring size; 0 disables cleanup.
    pub max_segments: usize,
}

/// Motion detection defaults; per-stream store overrides may refine these.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionConfig {
    pub pixel_threshold: u8,
    pub area_threshold: f32,
    pub cooldown_frames: u32,
    pub detection_width: u32,
    pub detection_height: u32,
}

/// Motion-triggered recording settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingConfig {
    pub recordings_dir: PathBuf,
    pub pre_roll: Duration,
    pub post_roll: Duration,
}

/// Inference dispatch + recordings HTTP surface settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyserConfig {
    pub vllm_api_url: Url,
    pub vllm_model: String,
    pub server_port: u16,
    pub poll_interval: Duration,
    /// Host IP used in recording URLs handed to the inference endpoint.
    /// `None` means autodetect at startup.
    pub host_ip: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub mediamtx: MediamtxConfig,
    pub segment: SegmentConfig,
    pub motion: MotionConfig,
    pub recording: RecordingConfig,
    pub database: db::ConnectOptions,
    pub analyser: AnalyserConfig,
    /// Manual stream list; overrides API discovery when set.
    pub manual_streams: Option<Vec<String>>,
    pub discovery_interval: Duration,
    pub verbose: bool,
}

fn parsed<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| err!(InvalidArgument, msg("bad {name}={raw:?}: {e}"))),
    }
}

fn string(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.to_owned())
}

fn flag(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn secs(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<Duration, Error> {
    Ok(Duration::from_secs(parsed(lookup, name, default)?))
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(&|name| std::env::var(name).ok())
    }

    /// Test seam: like `from_env` but with an arbitrary variable source.
    pub fn from_vars(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let manual_streams = lookup("RTSP_STREAMS").and_then(|raw| {
            let streams: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            if streams.is_empty() {
                None
            } else {
                Some(streams)
            }
        });

        let segment_duration = secs(lookup, "SEGMENT_DURATION", 5)?;
        if segment_duration.is_zero() {
            bail!(InvalidArgument, msg("SEGMENT_DURATION must be at least 1"));
        }
        let area_threshold: f32 = parsed(lookup, "MOTION_AREA_THRESHOLD", 1.0)?;
        if !(0.0..=100.0).contains(&area_threshold) {
            bail!(
                InvalidArgument,
                msg("MOTION_AREA_THRESHOLD must be within 0..=100, got {area_threshold}")
            );
        }
        let detection_width = parsed(lookup, "MOTION_DETECTION_WIDTH", 320)?;
        let detection_height = parsed(lookup, "MOTION_DETECTION_HEIGHT", 240)?;
        if detection_width == 0 || detection_height == 0 {
            bail!(InvalidArgument, msg("motion detection size must be nonzero"));
        }

        let raw_vllm = string(
            lookup,
            "VLLM_API_URL",
            "http://localhost:8000/v1/chat/completions",
        );
        let vllm_api_url = Url::parse(&raw_vllm)
            .map_err(|e| err!(InvalidArgument, msg("bad VLLM_API_URL={raw_vllm:?}"), source(e)))?;

        Ok(Config {
            mediamtx: MediamtxConfig {
                host: string(lookup, "MEDIAMTX_HOST", "mediamtx"),
                api_port: parsed(lookup, "MEDIAMTX_API_PORT", 9997)?,
                rtsp_port: parsed(lookup, "MEDIAMTX_RTSP_PORT", 8554)?,
            },
            segment: SegmentConfig {
                output_dir: string(lookup, "SEGMENT_OUTPUT_DIR", "/dev/shm/segments").into(),
                duration: segment_duration,
                max_segments: parsed(lookup, "MAX_SEGMENTS", 20)?,
            },
            motion: MotionConfig {
                pixel_threshold: parsed(lookup, "MOTION_PIXEL_THRESHOLD", 25)?,
                area_threshold,
                cooldown_frames: parsed(lookup, "MOTION_COOLDOWN_FRAMES", 30)?,
                detection_width,
                detection_height,
            },
            recording: RecordingConfig {
                recordings_dir: string(lookup, "RECORDINGS_DIR", "/recordings").into(),
                pre_roll: secs(lookup, "PRE_ROLL_SECONDS", 5)?,
                post_roll: secs(lookup, "POST_ROLL_SECONDS", 5)?,
            },
            database: db::ConnectOptions {
                host: string(lookup, "DB_HOST", "db"),
                port: parsed(lookup, "DB_PORT", 5432)?,
                dbname: string(lookup, "DB_NAME", "argus"),
                user: string(lookup, "DB_USER", "user"),
                password: string(lookup, "DB_PASSWORD", "password"),
            },
            analyser: AnalyserConfig {
                vllm_api_url,
                vllm_model: string(lookup, "VLLM_MODEL", "Qwen/Qwen3-VL-8B-Instruct-FP8"),
                server_port: parsed(lookup, "SERVER_PORT", 8080)?,
                poll_interval: secs(lookup, "POLL_INTERVAL", 10)?,
                host_ip: lookup("HOST_IP").filter(|ip| !ip.is_empty()),
            },
            manual_streams,
            discovery_interval: secs(lookup, "DISCOVERY_INTERVAL", 30)?,
            verbose: flag(lookup, "VERBOSE"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(&move |name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.mediamtx.api_url(), "http://mediamtx:9997");
        assert_eq!(c.mediamtx.rtsp_url("live/cam1"), "rtsp://mediamtx:8554/live/cam1");
        assert_eq!(c.segment.duration, Duration::from_secs(5));
        assert_eq!(c.segment.max_segments, 20);
        assert_eq!(c.motion.pixel_threshold, 25);
        assert_eq!(c.recording.post_roll, Duration::from_secs(5));
        assert_eq!(c.manual_streams, None);
        assert!(!c.verbose);
        assert_eq!(c.analyser.host_ip, None);
    }

    #[test]
    fn manual_stream_list() {
        let c = cfg(&[("RTSP_STREAMS", " cam1, live/cam2 ,,")]).unwrap();
        assert_eq!(
            c.manual_streams,
            Some(vec!["cam1".to_owned(), "live/cam2".to_owned()])
        );
    }

    #[test]
    fn empty_stream_list_means_discovery() {
        let c = cfg(&[("RTSP_STREAMS", " , ")]).unwrap();
        assert_eq!(c.manual_streams, None);
    }

    #[test]
    fn overrides() {
        let c = cfg(&[
            ("MEDIAMTX_HOST", "10.0.0.2"),
            ("SEGMENT_DURATION", "2"),
            ("MAX_SEGMENTS", "0"),
            ("VERBOSE", "TRUE"),
            ("HOST_IP", "192.168.1.5"),
        ])
        .unwrap();
        assert_eq!(c.mediamtx.host, "10.0.0.2");
        assert_eq!(c.segment.duration, Duration::from_secs(2));
        assert_eq!(c.segment.max_segments, 0);
        assert!(c.verbose);
        assert_eq!(c.analyser.host_ip.as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn bad_number_fails_fast() {
        cfg(&[("MEDIAMTX_API_PORT", "lots")]).unwrap_err();
        cfg(&[("SEGMENT_DURATION", "0")]).unwrap_err();
        cfg(&[("MOTION_AREA_THRESHOLD", "250")]).unwrap_err();
        cfg(&[("VLLM_API_URL", "not a url")]).unwrap_err();
    }
}
