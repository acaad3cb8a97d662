// THEORY:
// `TrackingConfig` is the one bag of tunables shared by every stage. It can be
// built three ways: `Default` (the values the tracker was tuned with), a JSON
// file (`from_json_file`), or the command line, since the struct is also a
// `clap::Args` that binaries flatten into their own argument parser.
//
// Each stage borrows the fields it needs; nothing here is global, so several
// tracking sessions with different settings can coexist in one process.

use crate::error::{Result, TrackingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Denoising filter applied before thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BlurKind {
    Median,
    Gaussian,
}

/// How per-track movement is folded into one motion estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MotionAggregation {
    /// The single above-threshold track with the largest movement.
    Dominant,
    /// Mean of all above-threshold movement vectors.
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, clap::Args)]
#[serde(default)]
pub struct TrackingConfig {
    // Centroid extraction.
    #[arg(long, value_enum, default_value_t = BlurKind::Median)]
    pub blur: BlurKind,
    /// Blur kernel edge length in pixels. Even values are rounded up.
    #[arg(long, default_value_t = 7)]
    pub blur_kernel: u32,
    /// Pixels strictly brighter than this are marker foreground.
    #[arg(long, default_value_t = 200)]
    pub threshold: u8,

    // Association.
    /// Pixels. Detections further than this from a track never match it.
    #[arg(long, default_value_t = 15.0)]
    pub max_association_radius: f64,
    /// Consecutive misses a track survives.
    #[arg(long, default_value_t = 5)]
    pub stale_track_limit: u32,
    /// Pixels. Movement at or below this is jitter.
    #[arg(long, default_value_t = 2.0)]
    pub movement_threshold: f64,
    #[arg(long, value_enum, default_value_t = MotionAggregation::Dominant)]
    pub aggregation: MotionAggregation,

    // Scan-plane following.
    /// Start with slice following enabled.
    #[arg(long)]
    pub follow_guidewire: bool,
    /// Millimetres, per axis.
    #[arg(long, default_value_t = 3.0)]
    pub convergence_tolerance_mm: f64,
    #[arg(long, default_value_t = 5000)]
    pub convergence_timeout_ms: u64,
    #[arg(long, default_value_t = 100)]
    pub convergence_poll_ms: u64,
    #[arg(long, default_value_t = 100)]
    pub max_convergence_polls: u32,

    // Worker loop.
    #[arg(long, default_value_t = 250)]
    pub recv_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            blur: BlurKind::Median,
            blur_kernel: 7,
            threshold: 200,
            max_association_radius: 15.0,
            stale_track_limit: 5,
            movement_threshold: 2.0,
            aggregation: MotionAggregation::Dominant,
            follow_guidewire: false,
            convergence_tolerance_mm: 3.0,
            convergence_timeout_ms: 5000,
            convergence_poll_ms: 100,
            max_convergence_polls: 100,
            recv_timeout_ms: 250,
        }
    }
}

impl TrackingConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: TrackingConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blur_kernel == 0 {
            return Err(TrackingError::Config("blur_kernel must be at least 1".into()));
        }
        if !(self.max_association_radius.is_finite() && self.max_association_radius > 0.0) {
            return Err(TrackingError::Config(format!(
                "max_association_radius must be positive, got {}",
                self.max_association_radius
            )));
        }
        if !(self.movement_threshold.is_finite() && self.movement_threshold >= 0.0) {
            return Err(TrackingError::Config(format!(
                "movement_threshold must be non-negative, got {}",
                self.movement_threshold
            )));
        }
        if !(self.convergence_tolerance_mm.is_finite() && self.convergence_tolerance_mm >= 0.0) {
            return Err(TrackingError::Config(format!(
                "convergence_tolerance_mm must be non-negative, got {}",
                self.convergence_tolerance_mm
            )));
        }
        if self.max_convergence_polls == 0 {
            return Err(TrackingError::Config("max_convergence_polls must be at least 1".into()));
        }
        Ok(())
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }

    pub fn convergence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.convergence_poll_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}
