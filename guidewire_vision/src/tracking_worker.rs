// THEORY:
// The tracking worker is the real-time shell around `TrackingPipeline`. One tokio
// task owns the pipeline and the scan-plane controller and runs frames strictly
// one after another; nothing else ever touches a `Track`.
//
// Key architectural principles:
// 1.  **Latest frame wins**: frames arrive on an mpsc channel, but before each
//     cycle the worker drains whatever queued up and keeps only the newest. A
//     control loop gains nothing from processing stale frames in order.
// 2.  **Single-slot outputs**: results are published on `watch` channels. A
//     display reads the latest overlay whenever it likes; a slow reader never
//     backs up the tracker.
// 3.  **Explicit control state**: stop, pause and follow-guidewire are channels
//     owned by one session (`TrackingControl`), not process-wide flags, so
//     sessions and tests stay isolated.
// 4.  **Responsive shutdown**: frame receives time out after `recv_timeout` and
//     race the stop signal; a convergence wait watches the same signal. Stopping
//     drops every publish sender when the task returns.

use crate::config::TrackingConfig;
use crate::core_modules::frame::Frame;
use crate::core_modules::scan_plane::{ScanPlaneController, ScanPlaneInterface, wants_move};
use crate::error::{Result, TrackingError};
use crate::pipeline::{ArtifactSnapshot, Motion, MotionEstimate, Report, TrackingPipeline};
use image::RgbImage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the display side sees of one processed frame. A copy, never live state.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub frame_id: u64,
    pub overlay: Arc<RgbImage>,
    pub artifacts: ArtifactSnapshot,
    pub motion: Option<MotionEstimate>,
    pub status: String,
}

/// Counters returned when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    /// Frames dropped because a newer one was already queued.
    pub frames_conflated: u64,
    pub moves_completed: u64,
    pub moves_failed: u64,
}

/// Session control. Cheap to clone and hand to a UI.
#[derive(Clone)]
pub struct TrackingControl {
    stop: Arc<watch::Sender<bool>>,
    paused: Arc<watch::Sender<bool>>,
    follow_guidewire: Arc<watch::Sender<bool>>,
}

impl TrackingControl {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn set_follow_guidewire(&self, follow: bool) {
        self.follow_guidewire.send_replace(follow);
    }

    pub fn is_following(&self) -> bool {
        *self.follow_guidewire.borrow()
    }
}

pub struct TrackingHandle {
    control: TrackingControl,
    published: watch::Receiver<Option<PublishedFrame>>,
    move_status: watch::Receiver<Option<String>>,
    task: JoinHandle<WorkerSummary>,
}

impl TrackingHandle {
    pub fn control(&self) -> TrackingControl {
        self.control.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PublishedFrame>> {
        self.published.clone()
    }

    pub fn move_status(&self) -> watch::Receiver<Option<String>> {
        self.move_status.clone()
    }

    pub fn latest(&self) -> Option<PublishedFrame> {
        self.published.borrow().clone()
    }

    /// Signals the worker to exit and waits for it.
    pub async fn stop(self) -> Result<WorkerSummary> {
        self.control.stop();
        self.join().await
    }

    /// Waits for the worker to exit on its own (stop signal or closed source).
    pub async fn join(self) -> Result<WorkerSummary> {
        Ok(self.task.await?)
    }
}

/// Starts the tracking worker on the current tokio runtime.
///
/// Without a scanner the worker only tracks; with one it also follows the
/// guidewire whenever follow mode is on.
pub fn spawn_tracking_worker(
    config: TrackingConfig,
    frames: mpsc::Receiver<Frame>,
    scanner: Option<Arc<dyn ScanPlaneInterface>>,
) -> Result<TrackingHandle> {
    let pipeline = TrackingPipeline::new(config.clone())?;
    let controller = scanner.map(|s| ScanPlaneController::new(s, &config));

    let (stop_tx, stop_rx) = watch::channel(false);
    let (paused_tx, paused_rx) = watch::channel(false);
    let (follow_tx, follow_rx) = watch::channel(config.follow_guidewire);
    let (published_tx, published_rx) = watch::channel(None);
    let (move_tx, move_rx) = watch::channel(None);

    let worker = Worker {
        config,
        pipeline,
        controller,
        frames,
        stop: stop_rx,
        paused: paused_rx,
        follow_guidewire: follow_rx,
        published: published_tx,
        move_status: move_tx,
        summary: WorkerSummary::default(),
    };
    let task = tokio::spawn(worker.run());

    Ok(TrackingHandle {
        control: TrackingControl {
            stop: Arc::new(stop_tx),
            paused: Arc::new(paused_tx),
            follow_guidewire: Arc::new(follow_tx),
        },
        published: published_rx,
        move_status: move_rx,
        task,
    })
}

struct Worker {
    config: TrackingConfig,
    pipeline: TrackingPipeline,
    controller: Option<ScanPlaneController>,
    frames: mpsc::Receiver<Frame>,
    stop: watch::Receiver<bool>,
    paused: watch::Receiver<bool>,
    follow_guidewire: watch::Receiver<bool>,
    published: watch::Sender<Option<PublishedFrame>>,
    move_status: watch::Sender<Option<String>>,
    summary: WorkerSummary,
}

impl Worker {
    async fn run(mut self) -> WorkerSummary {
        info!("tracking worker started");
        let recv_timeout = self.config.recv_timeout();

        loop {
            if *self.stop.borrow() {
                break;
            }

            let frame = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
                received = tokio::time::timeout(recv_timeout, self.frames.recv()) => match received {
                    Err(_) => continue,
                    Ok(None) => {
                        info!("frame source closed");
                        break;
                    }
                    Ok(Some(frame)) => frame,
                },
            };
            let frame = self.newest(frame);

            if *self.paused.borrow() {
                debug!(frame_id = frame.metadata.frame_id, "paused, dropping frame");
                continue;
            }

            let report = self.pipeline.process(&frame);
            self.publish(&report);

            if let Some(motion) = report.motion().map(|m| m.vector_px) {
                if self.should_move(&motion) && self.follow(motion, frame.metadata.mm_per_px).await {
                    break;
                }
            }
        }

        info!(summary = ?self.summary, "tracking worker stopped");
        self.summary
    }

    fn newest(&mut self, mut frame: Frame) -> Frame {
        while let Ok(newer) = self.frames.try_recv() {
            self.summary.frames_conflated += 1;
            frame = newer;
        }
        frame
    }

    fn publish(&mut self, report: &Report) {
        match report.analysis() {
            None => self.summary.frames_skipped += 1,
            Some(analysis) => {
                self.summary.frames_processed += 1;
                self.published.send_replace(Some(PublishedFrame {
                    frame_id: analysis.frame_id,
                    overlay: Arc::new(analysis.overlay.clone()),
                    artifacts: analysis.artifacts.clone(),
                    motion: analysis.motion.clone(),
                    status: analysis.status.clone(),
                }));
            }
        }
    }

    fn should_move(&self, motion: &Motion) -> bool {
        self.controller.is_some()
            && *self.follow_guidewire.borrow()
            && wants_move(motion, self.config.movement_threshold)
    }

    /// Runs one scan-plane move. Returns true when the worker was cancelled meanwhile.
    async fn follow(&mut self, motion: Motion, mm_per_px: f64) -> bool {
        let Some(controller) = self.controller.as_mut() else {
            return false;
        };

        let result = controller
            .request_move(motion, mm_per_px, self.pipeline.registry_mut(), &mut self.stop)
            .await;

        let status = match result {
            Ok(outcome) => {
                self.summary.moves_completed += 1;
                outcome.status_line()
            }
            Err(TrackingError::Cancelled) => return true,
            Err(err) => {
                self.summary.moves_failed += 1;
                warn!(%err, "scan plane move failed");
                format!("Move failed: {err}")
            }
        };
        self.move_status.send_replace(Some(status));
        false
    }
}
