// THEORY:
// The scan-plane controller closes the loop between the tracker and the MRI
// scanner. It converts the pixel motion estimate into millimetres with the
// frame's voxel size, asks the scanner to shift the slice by that amount, and
// then waits until the scanner reports the slice has arrived.
//
// Key architectural principles:
// 1.  **Narrow scanner seam**: the scanner is reached only through
//     `ScanPlaneInterface` (read position, set position). Vendor SDKs,
//     simulators and test doubles all plug in behind it.
// 2.  **Fixed axis mapping**: image x moves the slice side-to-side (device x),
//     image y moves it forward (device z). Device y is never touched.
// 3.  **Bounded wait**: one deadline covers every scanner call of a move (the
//     position read, the set request and each convergence poll), and each call
//     races the cancellation signal. Polling is also capped by a maximum count.
//     An unresponsive scanner ends in `ScannerUnresponsive` or
//     `ConvergenceTimeout`, never a hang.
// 4.  **Stale pixels**: once the slice moved (or might have), every pixel
//     position the tracker remembers is meaningless, so the registry is cleared
//     on convergence and on timeout alike.
// 5.  **One move at a time**: a request while another is in flight is rejected
//     with `MoveInFlight`. The worker awaits each move to completion and conflates
//     incoming frames meanwhile, so a queue would only replay stale motion.

use crate::config::TrackingConfig;
use crate::core_modules::centroid::Motion;
use crate::core_modules::frame::SlicePosition;
use crate::core_modules::tracker::TrackerRegistry;
use crate::error::{Result, TrackingError};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scanner reply to a set-position request.
#[derive(Debug, Clone, PartialEq)]
pub struct SetSliceResponse {
    pub success: bool,
    pub reason: String,
    /// The value the scanner says it applied, if it reports one.
    pub value_set: Option<SlicePosition>,
}

/// The two scanner operations the tracker depends on.
pub trait ScanPlaneInterface: Send + Sync {
    fn slice_position(&self) -> BoxFuture<'_, Result<SlicePosition>>;
    fn set_slice_position(&self, target: SlicePosition) -> BoxFuture<'_, Result<SetSliceResponse>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    MoveRequested,
    AwaitingConvergence,
    Converged,
    TimedOut,
}

impl ControllerState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ControllerState::MoveRequested | ControllerState::AwaitingConvergence)
    }
}

/// A completed move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub target: SlicePosition,
    pub reached: SlicePosition,
    /// Side-to-side (device x) shift in millimetres.
    pub side_to_side_mm: f64,
    /// Forward (device z) shift in millimetres.
    pub forward_mm: f64,
    pub response: SetSliceResponse,
    pub polls: u32,
    pub elapsed: Duration,
}

impl MoveOutcome {
    pub fn status_line(&self) -> String {
        let value_set = self
            .response
            .value_set
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "Move({:.2},{:.2}): {}, {}, valueSet: {}",
            self.forward_mm, self.side_to_side_mm, self.response.success, self.response.reason, value_set
        )
    }
}

/// True when a motion estimate is large enough to justify moving the slice.
pub fn wants_move(motion: &Motion, movement_threshold: f64) -> bool {
    motion.l1() > movement_threshold
}

/// Target position for a pixel-space motion, with the fixed axis mapping.
pub fn target_for(current: SlicePosition, motion_px: Motion, mm_per_px: f64) -> SlicePosition {
    let mm = motion_px.scaled(mm_per_px);
    SlicePosition::new(current.x + mm.dx, current.y, current.z + mm.dy)
}

pub struct ScanPlaneController {
    link: ScannerLink,
    state: ControllerState,
}

/// The scanner plus the limits every call to it runs under.
struct ScannerLink {
    scanner: Arc<dyn ScanPlaneInterface>,
    tolerance_mm: f64,
    timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

/// Puts the controller back to `Idle` if a move is dropped mid-flight.
struct InFlight<'a> {
    state: &'a mut ControllerState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.state.is_in_flight() {
            *self.state = ControllerState::Idle;
        }
    }
}

impl ScanPlaneController {
    pub fn new(scanner: Arc<dyn ScanPlaneInterface>, config: &TrackingConfig) -> Self {
        Self {
            link: ScannerLink {
                scanner,
                tolerance_mm: config.convergence_tolerance_mm,
                timeout: config.convergence_timeout(),
                poll_interval: config.convergence_poll_interval(),
                max_polls: config.max_convergence_polls,
            },
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Moves the slice by `motion_px` and waits for the scanner to get there.
    ///
    /// Every scanner call shares one deadline and watches `cancel`. On success
    /// and on timeout the registry is cleared. A rejection leaves it untouched
    /// and is not retried. Dropping the returned future leaves the controller
    /// `Idle`.
    pub async fn request_move(
        &mut self,
        motion_px: Motion,
        mm_per_px: f64,
        registry: &mut TrackerRegistry,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<MoveOutcome> {
        if self.state.is_in_flight() {
            return Err(TrackingError::MoveInFlight);
        }
        let mut in_flight = InFlight {
            state: &mut self.state,
        };
        *in_flight.state = ControllerState::MoveRequested;

        let result = self
            .link
            .run_move(&mut in_flight, motion_px, mm_per_px, registry, cancel)
            .await;
        *in_flight.state = match &result {
            Ok(_) => ControllerState::Converged,
            Err(TrackingError::ConvergenceTimeout { .. } | TrackingError::ScannerUnresponsive { .. }) => {
                ControllerState::TimedOut
            }
            Err(_) => ControllerState::Idle,
        };
        result
    }
}

impl ScannerLink {
    async fn run_move(
        &self,
        in_flight: &mut InFlight<'_>,
        motion_px: Motion,
        mm_per_px: f64,
        registry: &mut TrackerRegistry,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<MoveOutcome> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let unresponsive = |operation| TrackingError::ScannerUnresponsive {
            operation,
            waited: started.elapsed(),
        };

        let current = bounded(self.scanner.slice_position(), deadline, cancel)
            .await?
            .ok_or_else(|| unresponsive("the position read"))?;
        let target = target_for(current, motion_px, mm_per_px);
        let mm = motion_px.scaled(mm_per_px);

        info!(%current, %target, dx_mm = mm.dx, dz_mm = mm.dy, "requesting scan plane move");
        let Some(response) = bounded(self.scanner.set_slice_position(target), deadline, cancel).await? else {
            // The request may have gone through; the tracked pixels are stale either way.
            registry.reset();
            let err = unresponsive("the move request");
            warn!(%err, "giving up on scan plane move");
            return Err(err);
        };
        if !response.success {
            warn!(%target, reason = %response.reason, "scan plane move rejected");
            return Err(TrackingError::MoveRejected {
                target,
                reason: response.reason,
                value_set: response.value_set,
            });
        }

        *in_flight.state = ControllerState::AwaitingConvergence;
        match self.await_convergence(target, started, deadline, cancel).await {
            Ok((reached, polls)) => {
                registry.reset();
                let elapsed = started.elapsed();
                info!(%reached, polls, ?elapsed, "scan plane converged");
                Ok(MoveOutcome {
                    target,
                    reached,
                    side_to_side_mm: mm.dx,
                    forward_mm: mm.dy,
                    response,
                    polls,
                    elapsed,
                })
            }
            Err(err @ TrackingError::ConvergenceTimeout { .. }) => {
                // Position is unknown now; whatever the tracker remembers is stale.
                registry.reset();
                warn!(%err, "giving up on scan plane convergence");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn await_convergence(
        &self,
        target: SlicePosition,
        started: Instant,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(SlicePosition, u32)> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut polls = 0u32;

        let timed_out = |polls: u32| TrackingError::ConvergenceTimeout {
            target,
            waited: started.elapsed(),
            polls,
        };

        loop {
            if *cancel.borrow() {
                return Err(TrackingError::Cancelled);
            }
            if polls >= self.max_polls {
                return Err(timed_out(polls));
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(TrackingError::Cancelled);
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => return Err(timed_out(polls)),
            }

            polls += 1;
            match bounded(self.scanner.slice_position(), deadline, cancel).await {
                Ok(None) => return Err(timed_out(polls)),
                Err(TrackingError::Cancelled) => return Err(TrackingError::Cancelled),
                Err(err) => warn!(%err, polls, "slice position read failed"),
                Ok(Some(position)) => {
                    debug!(%position, %target, polls, "convergence poll");
                    if position.within(&target, self.tolerance_mm) {
                        return Ok((position, polls));
                    }
                }
            }
        }
    }
}

/// Runs one scanner call under the move deadline, racing the cancel signal.
/// `Ok(None)` means the deadline passed first.
async fn bounded<T>(
    call: BoxFuture<'_, Result<T>>,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Option<T>> {
    if *cancel.borrow() {
        return Err(TrackingError::Cancelled);
    }
    let call = tokio::time::timeout_at(deadline, call);
    tokio::pin!(call);

    loop {
        tokio::select! {
            answered = &mut call => return match answered {
                Err(_) => Ok(None),
                Ok(result) => result.map(Some),
            },
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(TrackingError::Cancelled);
                }
            }
        }
    }
}

/// An in-memory scanner. The slice arrives at a requested target after a
/// configurable number of position reads.
pub struct SimulatedScanPlane {
    state: Mutex<SimulatedState>,
}

struct SimulatedState {
    position: SlicePosition,
    pending: Option<(SlicePosition, u32)>,
    settle_polls: u32,
    rejection: Option<String>,
    unresponsive: bool,
    requests: Vec<SlicePosition>,
}

impl SimulatedScanPlane {
    pub fn new(position: SlicePosition) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                position,
                pending: None,
                settle_polls: 1,
                rejection: None,
                unresponsive: false,
                requests: Vec::new(),
            }),
        }
    }

    /// Number of position reads before a requested move shows up.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.lock().settle_polls = polls;
        self
    }

    /// Every set request is refused with `reason`.
    pub fn rejecting(self, reason: impl Into<String>) -> Self {
        self.lock().rejection = Some(reason.into());
        self
    }

    /// Accepts set requests but the slice never moves.
    pub fn unresponsive(self) -> Self {
        self.lock().unresponsive = true;
        self
    }

    pub fn position(&self) -> SlicePosition {
        self.lock().position
    }

    pub fn requests(&self) -> Vec<SlicePosition> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ScanPlaneInterface for SimulatedScanPlane {
    fn slice_position(&self) -> BoxFuture<'_, Result<SlicePosition>> {
        let mut state = self.lock();
        if let Some((target, remaining)) = state.pending {
            if remaining <= 1 {
                state.position = target;
                state.pending = None;
            } else {
                state.pending = Some((target, remaining - 1));
            }
        }
        future::ready(Ok(state.position)).boxed()
    }

    fn set_slice_position(&self, target: SlicePosition) -> BoxFuture<'_, Result<SetSliceResponse>> {
        let mut state = self.lock();
        state.requests.push(target);
        let response = match state.rejection.clone() {
            Some(reason) => SetSliceResponse {
                success: false,
                reason,
                value_set: None,
            },
            None => {
                if !state.unresponsive {
                    state.pending = Some((target, state.settle_polls));
                }
                SetSliceResponse {
                    success: true,
                    reason: "ok".to_string(),
                    value_set: Some(target),
                }
            }
        };
        future::ready(Ok(response)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::centroid::Centroid;

    fn fast_config() -> TrackingConfig {
        TrackingConfig {
            convergence_timeout_ms: 200,
            convergence_poll_ms: 5,
            max_convergence_polls: 100,
            ..TrackingConfig::default()
        }
    }

    fn busy_registry() -> TrackerRegistry {
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![Centroid::new(10, 10), Centroid::new(40, 40)], 2.0);
        registry
    }

    fn close(a: &SlicePosition, b: &SlicePosition) -> bool {
        a.within(b, 1e-9)
    }

    #[test]
    fn pixel_motion_maps_to_x_and_z() {
        let origin = SlicePosition::default();
        let target = target_for(origin, Motion::new(5.0, 0.0), 1.2);
        assert!(close(&target, &SlicePosition::new(6.0, 0.0, 0.0)));

        let target = target_for(SlicePosition::new(1.0, 2.0, 3.0), Motion::new(0.0, -2.0), 0.5);
        assert!(close(&target, &SlicePosition::new(1.0, 2.0, 2.0)));
    }

    #[test]
    fn move_gate_uses_l1_norm() {
        assert!(wants_move(&Motion::new(1.5, 1.0), 2.0));
        assert!(!wants_move(&Motion::new(1.0, 1.0), 2.0));
    }

    #[tokio::test]
    async fn converges_and_clears_tracks() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()).with_settle_polls(3));
        let mut controller = ScanPlaneController::new(scanner.clone(), &fast_config());
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let outcome = controller
            .request_move(Motion::new(5.0, 0.0), 1.2, &mut registry, &mut stop_rx)
            .await
            .expect("move should converge");

        assert!(close(&outcome.target, &SlicePosition::new(6.0, 0.0, 0.0)));
        assert!(close(&outcome.reached, &outcome.target));
        assert_eq!(outcome.polls, 3);
        assert_eq!(scanner.requests().len(), 1);
        assert!(registry.is_empty());
        assert_eq!(controller.state(), ControllerState::Converged);
        assert!(outcome.status_line().starts_with("Move(0.00,6.00): true"));
    }

    #[tokio::test]
    async fn rejection_is_reported_without_waiting() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()).rejecting("no control"));
        let mut controller = ScanPlaneController::new(scanner.clone(), &fast_config());
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = controller
            .request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, TrackingError::MoveRejected { ref reason, .. } if reason == "no control"));
        assert_eq!(registry.len(), 2);
        assert_eq!(scanner.requests().len(), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn unresponsive_scanner_times_out() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()).unresponsive());
        let mut controller = ScanPlaneController::new(scanner, &fast_config());
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = controller
            .request_move(Motion::new(0.0, 10.0), 1.0, &mut registry, &mut stop_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, TrackingError::ConvergenceTimeout { .. }));
        assert!(registry.is_empty());
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }

    #[tokio::test]
    async fn poll_budget_bounds_the_wait() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()).unresponsive());
        let config = TrackingConfig {
            convergence_timeout_ms: 60_000,
            convergence_poll_ms: 1,
            max_convergence_polls: 4,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(scanner, &config);
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = controller
            .request_move(Motion::new(0.0, 10.0), 1.0, &mut registry, &mut stop_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::ConvergenceTimeout { polls: 4, .. }));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_wait() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()).unresponsive());
        let config = TrackingConfig {
            convergence_timeout_ms: 60_000,
            convergence_poll_ms: 5,
            max_convergence_polls: 100_000,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(scanner, &config);
        let mut registry = busy_registry();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = stop_tx.send(true);
        });

        let err = controller
            .request_move(Motion::new(10.0, 0.0), 1.0, &mut registry, &mut stop_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::Cancelled));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    /// Never answers either call.
    struct SilentScanner;

    impl ScanPlaneInterface for SilentScanner {
        fn slice_position(&self) -> BoxFuture<'_, Result<SlicePosition>> {
            future::pending().boxed()
        }

        fn set_slice_position(&self, _target: SlicePosition) -> BoxFuture<'_, Result<SetSliceResponse>> {
            future::pending().boxed()
        }
    }

    /// Answers position reads but never answers a move request.
    struct DeafScanner;

    impl ScanPlaneInterface for DeafScanner {
        fn slice_position(&self) -> BoxFuture<'_, Result<SlicePosition>> {
            future::ready(Ok(SlicePosition::default())).boxed()
        }

        fn set_slice_position(&self, _target: SlicePosition) -> BoxFuture<'_, Result<SetSliceResponse>> {
            future::pending().boxed()
        }
    }

    #[tokio::test]
    async fn silent_scanner_hits_the_deadline() {
        let config = TrackingConfig {
            convergence_timeout_ms: 100,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(Arc::new(SilentScanner), &config);
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            controller.request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx),
        )
        .await
        .expect("request must not hang")
        .unwrap_err();

        assert!(matches!(err, TrackingError::ScannerUnresponsive { .. }));
        assert!(err.is_scan_plane_failure());
        // Nothing was sent, so the tracks are still valid.
        assert_eq!(registry.len(), 2);
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }

    #[tokio::test]
    async fn unanswered_move_request_clears_tracks() {
        let config = TrackingConfig {
            convergence_timeout_ms: 100,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(Arc::new(DeafScanner), &config);
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            controller.request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx),
        )
        .await
        .expect("request must not hang")
        .unwrap_err();

        assert!(matches!(err, TrackingError::ScannerUnresponsive { .. }));
        assert!(registry.is_empty());
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_reaches_a_silent_scanner() {
        let config = TrackingConfig {
            convergence_timeout_ms: 60_000,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(Arc::new(SilentScanner), &config);
        let mut registry = busy_registry();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stop_tx.send(true);
        });

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            controller.request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx),
        )
        .await
        .expect("request must not hang")
        .unwrap_err();

        assert!(matches!(err, TrackingError::Cancelled));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn dropped_request_leaves_the_controller_idle() {
        let config = TrackingConfig {
            convergence_timeout_ms: 60_000,
            ..TrackingConfig::default()
        };
        let mut controller = ScanPlaneController::new(Arc::new(SilentScanner), &config);
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            controller.request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(controller.state(), ControllerState::Idle);

        // A later request is not refused as in flight.
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()));
        controller.link.scanner = scanner.clone();
        let outcome = controller
            .request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx)
            .await;
        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(scanner.requests().len(), 1);
    }

    #[tokio::test]
    async fn second_request_while_in_flight_is_rejected() {
        let scanner = Arc::new(SimulatedScanPlane::new(SlicePosition::default()));
        let mut controller = ScanPlaneController::new(scanner.clone(), &fast_config());
        controller.state = ControllerState::AwaitingConvergence;
        let mut registry = busy_registry();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = controller
            .request_move(Motion::new(5.0, 0.0), 1.0, &mut registry, &mut stop_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::MoveInFlight));
        assert!(scanner.requests().is_empty());
    }
}
