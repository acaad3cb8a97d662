// THEORY:
// A single error type for the whole library. Most per-frame trouble (no
// detections, a lost track) is not an error at all and never reaches this enum.
// What does reach it falls in two groups: frame-level problems that the pipeline
// logs and skips, and scan-plane problems that are surfaced to the operator.

use crate::core_modules::frame::SlicePosition;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrackingError>;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("scan plane rejected move to {target}: {reason}")]
    MoveRejected {
        target: SlicePosition,
        reason: String,
        value_set: Option<SlicePosition>,
    },

    #[error("scan plane did not reach {target} within {waited:?} ({polls} polls)")]
    ConvergenceTimeout {
        target: SlicePosition,
        waited: Duration,
        polls: u32,
    },

    #[error("scan plane did not answer {operation} within {waited:?}")]
    ScannerUnresponsive {
        operation: &'static str,
        waited: Duration,
    },

    #[error("a scan plane move is already in flight")]
    MoveInFlight,

    #[error("scan plane interface failure: {0}")]
    Interface(String),

    #[error("tracking cancelled")]
    Cancelled,

    #[error("tracking worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackingError {
    /// Errors that belong on the operator's display rather than only in the log.
    pub fn is_scan_plane_failure(&self) -> bool {
        matches!(
            self,
            TrackingError::MoveRejected { .. }
                | TrackingError::ConvergenceTimeout { .. }
                | TrackingError::ScannerUnresponsive { .. }
                | TrackingError::MoveInFlight
                | TrackingError::Interface(_)
        )
    }
}
