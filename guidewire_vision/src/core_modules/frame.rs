// THEORY:
// A `Frame` is one segmentation mask as it arrives from the upstream predictor,
// paired with the acquisition metadata the tracker needs: when it was acquired,
// how many millimetres one pixel spans, and where the scanner reported the slice
// to be. Frames are plain data; the tracker never keeps one past a single cycle.

use crate::error::{Result, TrackingError};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// A scan-plane position in scanner device coordinates, in millimetres.
/// x is side-to-side, z is forward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlicePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SlicePosition {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// True when every axis is strictly closer than `tolerance_mm` to `target`.
    pub fn within(&self, target: &SlicePosition, tolerance_mm: f64) -> bool {
        (self.x - target.x).abs() < tolerance_mm
            && (self.y - target.y).abs() < tolerance_mm
            && (self.z - target.z).abs() < tolerance_mm
    }
}

impl fmt::Display for SlicePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2}) mm", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub acquired_at: Instant,
    /// Voxel column size; converts pixel distances to millimetres.
    pub mm_per_px: f64,
    /// Slice position the scanner reported at acquisition time, if known.
    pub slice_position: Option<SlicePosition>,
}

impl FrameMetadata {
    pub fn new(frame_id: u64, mm_per_px: f64) -> Self {
        Self {
            frame_id,
            acquired_at: Instant::now(),
            mm_per_px,
            slice_position: None,
        }
    }

    pub fn with_slice_position(mut self, position: SlicePosition) -> Self {
        self.slice_position = Some(position);
        self
    }

    pub fn latency(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(image: GrayImage, metadata: FrameMetadata) -> Self {
        Self { image, metadata }
    }

    /// Builds a frame from raw 16-bit scanner samples (row-major), scaling by
    /// the frame maximum into the 8-bit range.
    pub fn from_raw16(width: u32, height: u32, samples: &[u16], metadata: FrameMetadata) -> Result<Self> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(TrackingError::MalformedFrame(format!(
                "expected {expected} samples for {width}x{height}, got {}",
                samples.len()
            )));
        }

        let max = samples.iter().copied().max().unwrap_or(0);
        let data: Vec<u8> = if max == 0 {
            vec![0; expected]
        } else {
            samples
                .iter()
                .map(|&v| (v as f64 / max as f64 * 255.0) as u8)
                .collect()
        };

        let image = GrayImage::from_raw(width, height, data).ok_or_else(|| {
            TrackingError::MalformedFrame(format!("buffer does not fit {width}x{height}"))
        })?;
        Ok(Self::new(image, metadata))
    }

    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.image.dimensions();
        if width == 0 || height == 0 {
            return Err(TrackingError::MalformedFrame(format!(
                "frame {} has empty dimensions {width}x{height}",
                self.metadata.frame_id
            )));
        }
        let scale = self.metadata.mm_per_px;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(TrackingError::MalformedFrame(format!(
                "frame {} has invalid mm_per_px {scale}",
                self.metadata.frame_id
            )));
        }
        Ok(())
    }
}
