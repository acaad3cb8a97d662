// THEORY:
// This file is the main entry point for the `guidewire_vision` library crate.
// It tracks the bright artifacts that passive markers on a guidewire leave in
// segmented interventional MRI frames, and turns their motion into scan-plane
// moves.
//
// Layers, leaves first:
// 1.  `core_modules::blob_detector` finds marker centroids in one mask.
// 2.  `core_modules::track` / `core_modules::tracker` give those centroids
//     persistent identities and a per-frame motion estimate.
// 3.  `core_modules::scan_plane` converts motion to millimetres and moves the
//     slice through a narrow scanner interface.
// 4.  `pipeline` runs one frame end to end; `tracking_worker` runs the pipeline
//     in real time on a tokio task with latest-wins inputs and outputs.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod tracking_worker;

pub use config::TrackingConfig;
pub use error::{Result, TrackingError};
