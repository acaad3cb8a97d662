// THEORY:
// The `pipeline` module is the synchronous, single-frame API of the tracker.
// One call to `process` runs the whole per-frame chain:
//
//   validate -> extract centroids -> registry step -> motion estimate -> overlay
//
// and returns a `Report`. It never moves the scanner itself; whoever owns the
// pipeline (the tracking worker, a replay tool, a test) decides what to do with
// the motion estimate. Per-frame trouble is absorbed here: a malformed frame is
// logged and reported as `Skipped`, and tracking state is left untouched.

use crate::config::TrackingConfig;
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::frame::Frame;
use crate::core_modules::tracker::TrackerRegistry;
use crate::error::Result;
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::centroid::{Centroid, Motion};
pub use crate::core_modules::track::Track;
pub use crate::core_modules::tracker::MotionEstimate;

/// Flattened artifact positions for downstream visualisation. Last value wins;
/// consumers get a copy, never a live track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactSnapshot {
    pub frame_id: u64,
    /// `(x_mm, y_mm)` per detected centroid, in extraction order.
    pub artifact_coordinates_mm: Vec<(f64, f64)>,
}

impl ArtifactSnapshot {
    pub fn from_centroids(frame_id: u64, centroids: &[Centroid], mm_per_px: f64) -> Self {
        Self {
            frame_id,
            artifact_coordinates_mm: centroids
                .iter()
                .map(|c| (c.x as f64 * mm_per_px, c.y as f64 * mm_per_px))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Everything one processed frame produced.
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub frame_id: u64,
    pub mm_per_px: f64,
    pub centroids: Vec<Centroid>,
    pub artifacts: ArtifactSnapshot,
    pub motion: Option<MotionEstimate>,
    /// Snapshot of the dominant track, if any.
    pub dominant: Option<Track>,
    pub live_tracks: usize,
    pub overlay: RgbImage,
    pub status: String,
}

#[derive(Debug, Clone)]
pub enum Report {
    /// The frame failed validation and was dropped.
    Skipped { frame_id: u64, reason: String },
    NoGuidewireDetected(FrameAnalysis),
    NoMovement(FrameAnalysis),
    Movement(FrameAnalysis),
}

impl Report {
    pub fn analysis(&self) -> Option<&FrameAnalysis> {
        match self {
            Report::Skipped { .. } => None,
            Report::NoGuidewireDetected(a) | Report::NoMovement(a) | Report::Movement(a) => Some(a),
        }
    }

    pub fn motion(&self) -> Option<&MotionEstimate> {
        self.analysis().and_then(|a| a.motion.as_ref())
    }

    pub fn status_line(&self) -> String {
        match self {
            Report::Skipped { frame_id, reason } => format!("Frame {frame_id} skipped: {reason}"),
            _ => self.analysis().map(|a| a.status.clone()).unwrap_or_default(),
        }
    }
}

/// The main, top-level struct for per-frame tracking.
pub struct TrackingPipeline {
    config: TrackingConfig,
    registry: TrackerRegistry,
    frames_processed: u64,
}

impl TrackingPipeline {
    pub fn new(config: TrackingConfig) -> Result<Self> {
        config.validate()?;
        let registry = TrackerRegistry::from_config(&config);
        Ok(Self {
            config,
            registry,
            frames_processed: 0,
        })
    }

    pub fn process(&mut self, frame: &Frame) -> Report {
        let frame_id = frame.metadata.frame_id;

        // Stage 0: Validation
        if let Err(err) = frame.validate() {
            warn!(frame_id, %err, "skipping frame");
            return Report::Skipped {
                frame_id,
                reason: err.to_string(),
            };
        }

        // Stage 1: Centroid Extraction
        let extraction = blob_detector::extract_centroids(&frame.image, &self.config);
        let mm_per_px = frame.metadata.mm_per_px;
        let artifacts = ArtifactSnapshot::from_centroids(frame_id, &extraction.centroids, mm_per_px);

        // Stage 2: Association & Aggregation
        let outcome = self
            .registry
            .step(extraction.centroids.clone(), self.config.movement_threshold);

        // Stage 3: Diagnostic Overlay
        let overlay = self.registry.render_overlay(&extraction.mask);

        self.frames_processed += 1;
        let status = outcome.status_line();
        debug!(
            frame_id,
            centroids = extraction.centroids.len(),
            live = outcome.live_tracks,
            latency_ms = frame.metadata.latency().as_secs_f64() * 1000.0,
            "{status}"
        );

        let analysis = FrameAnalysis {
            frame_id,
            mm_per_px,
            centroids: extraction.centroids,
            artifacts,
            motion: outcome.motion,
            dominant: outcome.dominant,
            live_tracks: outcome.live_tracks,
            overlay,
            status,
        };

        if analysis.live_tracks == 0 {
            Report::NoGuidewireDetected(analysis)
        } else if analysis.motion.is_none() {
            Report::NoMovement(analysis)
        } else {
            Report::Movement(analysis)
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    /// Needed by the scan-plane controller, which clears tracks after a move.
    pub fn registry_mut(&mut self) -> &mut TrackerRegistry {
        &mut self.registry
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}
