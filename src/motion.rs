// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame-differencing motion detection.
//!
//! One detector instance per stream, fed downscaled grayscale frames by the
//! stream's pipeline. Motion is the percentage of pixels whose absolute
//! difference from the previous frame strictly exceeds the pixel threshold;
//! an event fires when that percentage reaches the area threshold and the
//! per-stream cooldown has elapsed.

use crate::config::MotionConfig;
use base::{bail, Error};
use std::path::PathBuf;

/// A detected motion event, as handed to the manager's motion handler.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionEvent {
    pub stream_id: String,
    /// The segment being written when the motion was seen.
    pub segment_file: PathBuf,
    /// Percentage of the (cropped) frame that changed, `0.0..=100.0`.
    pub motion_pct: f32,
    /// Presentation time of the frame, seconds.
    pub timestamp: f64,
}

/// Detection region, in pixels of the downscaled frame. Corners are clamped
/// to the frame bounds at use, so stale rects from the store can't panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Runtime-applicable settings changes. `crop: Some(None)` clears the rect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionUpdate {
    pub enabled: Option<bool>,
    pub sensitivity: Option<u8>,
    pub area_threshold: Option<f32>,
    pub crop: Option<Option<CropRect>>,
}

/// `sensitivity` 0..=100 maps to a pixel threshold of 50..=5: more sensitive
/// means a smaller difference counts as change, floored at 5 to keep sensor
/// noise from counting.
fn threshold_for_sensitivity(sensitivity: u8) -> u8 {
    (50u8.saturating_sub(sensitivity / 2)).max(5)
}

struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

pub struct MotionDetector {
    stream_id: String,
    pixel_threshold: u8,
    area_threshold: f32,
    cooldown_frames: u32,
    crop: Option<CropRect>,
    enabled: bool,

    previous: Option<Frame>,
    frames_since_motion: u32,
    frame_count: u64,
}

impl MotionDetector {
    pub fn new(stream_id: &str, config: &MotionConfig) -> Self {
        MotionDetector {
            stream_id: stream_id.to_owned(),
            pixel_threshold: config.pixel_threshold,
            area_threshold: config.area_threshold,
            cooldown_frames: config.cooldown_frames,
            crop: None,
            enabled: true,
            previous: None,
            // Allow an immediate first detection.
            frames_since_motion: config.cooldown_frames,
            frame_count: 0,
        }
    }

    /// Applies a settings change. Changing the crop rect or disabling the
    /// detector discards the previous frame so the next comparison doesn't
    /// diff across the discontinuity.
    pub fn apply(&mut self, update: &MotionUpdate) -> Result<(), Error> {
        if let Some(sensitivity) = update.sensitivity {
            if sensitivity > 100 {
                bail!(
                    InvalidArgument,
                    msg("sensitivity must be within 0..=100, got {sensitivity}")
                );
            }
            self.pixel_threshold = threshold_for_sensitivity(sensitivity);
        }
        if let Some(area_threshold) = update.area_threshold {
            if !(0.0..=100.0).contains(&area_threshold) {
                bail!(
                    InvalidArgument,
                    msg("area threshold must be within 0..=100, got {area_threshold}")
                );
            }
            self.area_threshold = area_threshold;
        }
        if let Some(crop) = update.crop {
            if crop != self.crop {
                self.crop = crop;
                self.previous = None;
            }
        }
        if let Some(enabled) = update.enabled {
            if enabled != self.enabled {
                self.enabled = enabled;
                if !enabled {
                    self.previous = None;
                }
            }
        }
        Ok(())
    }

    /// Clears state, e.g. after a stream reconnect. The cooldown is armed so
    /// the next qualifying frame can fire immediately.
    pub fn reset(&mut self) {
        self.previous = None;
        self.frames_since_motion = self.cooldown_frames;
        self.frame_count = 0;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Processes one grayscale frame (`width * height` bytes). Returns an
    /// event iff this frame triggers one. Malformed or unusable frames are
    /// skipped, never an error.
    pub fn process_frame(
        &mut self,
        frame_data: &[u8],
        width: usize,
        height: usize,
        current_segment: &std::path::Path,
        timestamp: f64,
    ) -> Option<MotionEvent> {
        if !self.enabled {
            return None;
        }
        self.frame_count += 1;
        self.frames_since_motion = self.frames_since_motion.saturating_add(1);

        if width == 0 || height == 0 || frame_data.len() != width * height {
            return None;
        }
        let current = match self.crop {
            None => Frame {
                width,
                height,
                data: frame_data.to_vec(),
            },
            Some(rect) => extract_crop(frame_data, width, height, rect)?,
        };

        let previous = match self.previous.take() {
            None => {
                self.previous = Some(current);
                return None;
            }
            Some(p) => p,
        };
        if previous.width != current.width || previous.height != current.height {
            self.previous = Some(current);
            return None;
        }

        let threshold = i16::from(self.pixel_threshold);
        let changed = current
            .data
            .iter()
            .zip(&previous.data)
            .filter(|&(&c, &p)| (i16::from(c) - i16::from(p)).abs() > threshold)
            .count();
        let total = current.data.len();
        let motion_pct = if total > 0 {
            changed as f32 / total as f32 * 100.0
        } else {
            0.0
        };
        self.previous = Some(current);

        if motion_pct >= self.area_threshold && self.frames_since_motion >= self.cooldown_frames {
            self.frames_since_motion = 0;
            return Some(MotionEvent {
                stream_id: self.stream_id.clone(),
                segment_file: current_segment.to_owned(),
                motion_pct,
                timestamp,
            });
        }
        None
    }
}

/// Copies the clamped crop region out of the frame. `None` if the clamped
/// region is empty.
fn extract_crop(data: &[u8], width: usize, height: usize, rect: CropRect) -> Option<Frame> {
    let clamp = |v: i32, hi: usize| (v.max(0) as usize).min(hi);
    let x1 = clamp(rect.x1, width);
    let y1 = clamp(rect.y1, height);
    let x2 = clamp(rect.x2, width).max(x1);
    let y2 = clamp(rect.y2, height).max(y1);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let mut cropped = Vec::with_capacity((x2 - x1) * (y2 - y1));
    for row in y1..y2 {
        cropped.extend_from_slice(&data[row * width + x1..row * width + x2]);
    }
    Some(Frame {
        width: x2 - x1,
        height: y2 - y1,
        data: cropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const W: usize = 8;
    const H: usize = 6;

    fn config() -> MotionConfig {
        MotionConfig {
            pixel_threshold: 25,
            area_threshold: 10.0,
            cooldown_frames: 3,
            detection_width: W as u32,
            detection_height: H as u32,
        }
    }

    fn seg() -> &'static Path {
        Path::new("/tmp/seg_000001.ts")
    }

    fn flat(value: u8) -> Vec<u8> {
        vec![value; W * H]
    }

    #[test]
    fn first_frame_never_fires() {
        let mut d = MotionDetector::new("cam1", &config());
        assert_eq!(d.process_frame(&flat(0), W, H, seg(), 0.0), None);
    }

    #[test]
    fn full_frame_change_fires_with_details() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        let e = d.process_frame(&flat(200), W, H, seg(), 0.5).unwrap();
        assert_eq!(e.stream_id, "cam1");
        assert_eq!(e.segment_file, seg());
        assert!(e.motion_pct > 99.0);
        assert_eq!(e.timestamp, 0.5);
    }

    #[test]
    fn change_below_pixel_threshold_is_ignored() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(100), W, H, seg(), 0.0);
        // 25 is not *strictly* greater than the threshold of 25.
        assert_eq!(d.process_frame(&flat(125), W, H, seg(), 0.1), None);
        assert!(d.process_frame(&flat(151), W, H, seg(), 0.2).is_some());
    }

    #[test]
    fn area_threshold_counts_cropped_area() {
        let mut d = MotionDetector::new("cam1", &config());
        d.apply(&MotionUpdate {
            crop: Some(Some(CropRect { x1: 0, y1: 0, x2: 4, y2: 3 })),
            ..Default::default()
        })
        .unwrap();
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        // Change two pixels inside the 12-pixel crop: 16.7% of the crop but
        // only 4% of the full frame. It must fire against the crop area.
        let mut frame = flat(0);
        frame[0] = 255;
        frame[1] = 255;
        let e = d.process_frame(&frame, W, H, seg(), 0.0).unwrap();
        assert!((e.motion_pct - 2.0 / 12.0 * 100.0).abs() < 0.01);
    }

    #[test]
    fn cooldown_suppresses_consecutive_events() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        assert!(d.process_frame(&flat(255), W, H, seg(), 0.0).is_some());
        // Alternate between values so every frame is a full change.
        assert_eq!(d.process_frame(&flat(0), W, H, seg(), 0.0), None);
        assert_eq!(d.process_frame(&flat(255), W, H, seg(), 0.0), None);
        // Third frame after the event satisfies cooldown_frames = 3.
        assert!(d.process_frame(&flat(0), W, H, seg(), 0.0).is_some());
    }

    #[test]
    fn shape_change_restarts_comparison() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        assert_eq!(d.process_frame(&vec![255; 16], 4, 4, seg(), 0.0), None);
        // The 4x4 frame became the new baseline.
        assert!(d.process_frame(&vec![0; 16], 4, 4, seg(), 0.0).is_some());
    }

    #[test]
    fn bad_buffer_length_is_skipped() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        assert_eq!(d.process_frame(&[0u8; 3], W, H, seg(), 0.0), None);
        assert_eq!(d.process_frame(&flat(0), 0, 0, seg(), 0.0), None);
    }

    #[test]
    fn zero_area_crop_never_fires_or_panics() {
        let mut d = MotionDetector::new("cam1", &config());
        d.apply(&MotionUpdate {
            crop: Some(Some(CropRect { x1: 5, y1: 5, x2: 5, y2: 5 })),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.process_frame(&flat(0), W, H, seg(), 0.0), None);
        assert_eq!(d.process_frame(&flat(255), W, H, seg(), 0.0), None);
    }

    #[test]
    fn out_of_bounds_crop_is_clamped() {
        let mut d = MotionDetector::new("cam1", &config());
        d.apply(&MotionUpdate {
            crop: Some(Some(CropRect { x1: -10, y1: -10, x2: 1000, y2: 1000 })),
            ..Default::default()
        })
        .unwrap();
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        assert!(d.process_frame(&flat(255), W, H, seg(), 0.0).is_some());
    }

    #[test]
    fn crop_change_discards_baseline() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        d.apply(&MotionUpdate {
            crop: Some(Some(CropRect { x1: 0, y1: 0, x2: 4, y2: 4 })),
            ..Default::default()
        })
        .unwrap();
        // First frame after the change is a new baseline, not a diff.
        assert_eq!(d.process_frame(&flat(255), W, H, seg(), 0.0), None);
    }

    #[test]
    fn disabled_detector_is_inert() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        d.apply(&MotionUpdate {
            enabled: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.process_frame(&flat(255), W, H, seg(), 0.0), None);
        assert_eq!(d.frame_count(), 1, "disabled frames aren't counted");
        // Re-enabling starts from a fresh baseline.
        d.apply(&MotionUpdate {
            enabled: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.process_frame(&flat(0), W, H, seg(), 0.0), None);
    }

    #[test]
    fn reset_arms_immediate_detection() {
        let mut d = MotionDetector::new("cam1", &config());
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        assert!(d.process_frame(&flat(255), W, H, seg(), 0.0).is_some());
        d.reset();
        d.process_frame(&flat(0), W, H, seg(), 0.0);
        // One frame after reset: cooldown must not block.
        assert!(d.process_frame(&flat(255), W, H, seg(), 0.0).is_some());
    }

    #[test]
    fn sensitivity_mapping() {
        assert_eq!(threshold_for_sensitivity(0), 50);
        assert_eq!(threshold_for_sensitivity(50), 25);
        assert_eq!(threshold_for_sensitivity(100), 5);
        assert_eq!(threshold_for_sensitivity(95), 5);
    }

    #[test]
    fn invalid_settings_error_at_apply_time() {
        let mut d = MotionDetector::new("cam1", &config());
        d.apply(&MotionUpdate {
            sensitivity: Some(101),
            ..Default::default()
        })
        .unwrap_err();
        d.apply(&MotionUpdate {
            area_threshold: Some(-1.0),
            ..Default::default()
        })
        .unwrap_err();
    }
}
