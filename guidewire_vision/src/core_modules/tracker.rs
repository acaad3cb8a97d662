// THEORY:
// The `tracker` module adds object permanence. It takes the stateless centroid
// list of one frame and associates it with the tracks it remembers from earlier
// frames. This is the data association problem, solved greedily.
//
// Key architectural principles:
// 1.  **Exclusive ownership**: the `TrackerRegistry` owns every `Track`. Callers
//     only ever see clones (the dominant track snapshot) or read-only borrows.
// 2.  **Deterministic greedy matching**: tracks are offered the remaining
//     candidate pool in ascending id order and a claimed centroid leaves the pool
//     at once. This is not a globally optimal assignment; two markers crossing
//     within one frame can swap identities. With fewer than ten markers the
//     O(tracks x candidates) cost is what matters.
// 3.  **Lifecycle**: a frame's step is match, prune, spawn, aggregate, always in
//     that order.
//     - **Birth**: every centroid left unclaimed starts a new track.
//     - **Tracking**: a matched track moves and resets its miss count.
//     - **Death**: a track whose miss count exceeds the stale limit is removed.
// 4.  **Motion estimate**: only tracks moving more than the movement threshold
//     count, so stationary jitter never moves the scan plane.

use crate::config::{MotionAggregation, TrackingConfig};
use crate::core_modules::centroid::{Centroid, Motion};
use crate::core_modules::track::Track;
use image::{GrayImage, Rgb, RgbImage};
use serde::Serialize;
use std::collections::BTreeMap;

/// The per-frame motion result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionEstimate {
    /// Pixels per frame.
    pub vector_px: Motion,
    /// Number of tracks above the movement threshold.
    pub contributing_tracks: usize,
    /// The above-threshold track with the largest movement.
    pub dominant_id: u64,
}

/// What one call to `step` produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub dominant: Option<Track>,
    pub motion: Option<MotionEstimate>,
    pub live_tracks: usize,
    pub spawned: usize,
    pub pruned: usize,
}

impl StepOutcome {
    /// The line shown on the operator display for this frame.
    pub fn status_line(&self) -> String {
        match (&self.motion, self.live_tracks) {
            (_, 0) => "No guidewire detected.".to_string(),
            (None, n) => format!("({n}) No movement detected"),
            (Some(motion), n) => format!(
                "({n}) Move: {:.2} | {:.2} (px)",
                motion.vector_px.dx, motion.vector_px.dy
            ),
        }
    }
}

pub struct TrackerRegistry {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    max_association_radius: f64,
    stale_track_limit: u32,
    aggregation: MotionAggregation,
    last_motion: Option<MotionEstimate>,
}

impl TrackerRegistry {
    pub fn new(max_association_radius: f64, stale_track_limit: u32) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 0,
            max_association_radius,
            stale_track_limit,
            aggregation: MotionAggregation::Dominant,
            last_motion: None,
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        let mut registry = Self::new(config.max_association_radius, config.stale_track_limit);
        registry.aggregation = config.aggregation;
        registry
    }

    pub fn with_aggregation(mut self, aggregation: MotionAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Runs one frame of association. Must not be called concurrently; frame N+1
    /// starts only after frame N returned.
    pub fn step(&mut self, candidates: Vec<Centroid>, movement_threshold: f64) -> StepOutcome {
        let mut pool = candidates;

        // --- 1. Matching ---
        for track in self.tracks.values_mut() {
            if track.update(&pool) {
                let claimed = track.current_position();
                if let Some(index) = pool.iter().position(|c| *c == claimed) {
                    pool.remove(index);
                }
            }
        }

        // --- 2. Pruning ---
        let before = self.tracks.len();
        let limit = self.stale_track_limit;
        self.tracks.retain(|_, track| track.missed_update_count() <= limit);
        let pruned = before - self.tracks.len();

        // --- 3. Birth ---
        let spawned = pool.len();
        for centroid in pool {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(id, Track::new(id, centroid, self.max_association_radius));
        }

        // --- 4. Aggregation ---
        let dominant = self.dominant_track(movement_threshold).cloned();
        let motion = dominant.as_ref().map(|d| self.estimate_motion(d, movement_threshold));
        self.last_motion = motion.clone();

        if pruned > 0 || spawned > 0 {
            tracing::debug!(spawned, pruned, live = self.tracks.len(), "track set changed");
        }

        StepOutcome {
            dominant,
            motion,
            live_tracks: self.tracks.len(),
            spawned,
            pruned,
        }
    }

    /// The live track with the largest movement above `movement_threshold`.
    /// Ties go to the lower id.
    pub fn dominant_track(&self, movement_threshold: f64) -> Option<&Track> {
        let mut best: Option<&Track> = None;
        for track in self.tracks.values() {
            let magnitude = track.movement_vector().magnitude();
            if magnitude <= movement_threshold {
                continue;
            }
            if best.is_none_or(|b| magnitude > b.movement_vector().magnitude()) {
                best = Some(track);
            }
        }
        best
    }

    fn estimate_motion(&self, dominant: &Track, movement_threshold: f64) -> MotionEstimate {
        let moving: Vec<Motion> = self
            .tracks
            .values()
            .map(|t| t.movement_vector())
            .filter(|m| m.magnitude() > movement_threshold)
            .collect();

        let vector_px = match self.aggregation {
            MotionAggregation::Dominant => dominant.movement_vector(),
            MotionAggregation::Mean => {
                let n = moving.len() as f64;
                let (sx, sy) = moving.iter().fold((0.0, 0.0), |(sx, sy), m| (sx + m.dx, sy + m.dy));
                Motion::new(sx / n, sy / n)
            }
        };

        MotionEstimate {
            vector_px,
            contributing_tracks: moving.len(),
            dominant_id: dominant.id(),
        }
    }

    /// Drops every track. Ids keep counting so an old id never comes back.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.last_motion = None;
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn last_motion(&self) -> Option<&MotionEstimate> {
        self.last_motion.as_ref()
    }

    /// Draws every trajectory on top of the binarized mask. Display only.
    pub fn render_overlay(&self, mask: &GrayImage) -> RgbImage {
        let mut canvas = RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
            let v = mask.get_pixel(x, y).0[0];
            Rgb([v, v, v])
        });

        for track in self.tracks.values() {
            let color = Rgb(track.display_color());
            let trajectory = track.trajectory();
            if trajectory.len() >= 2 {
                draw_disc(&mut canvas, track.initial_position(), 4, color);
                draw_disc(&mut canvas, track.current_position(), 4, color);
            }
            for point in trajectory {
                draw_disc(&mut canvas, *point, 2, color);
            }
        }
        canvas
    }
}

fn draw_disc(canvas: &mut RgbImage, center: Centroid, radius: i32, color: Rgb<u8>) {
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (x, y) = (center.x + dx, center.y + dy);
            if x >= 0 && y >= 0 && x < width && y < height {
                canvas.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 2.0;

    fn c(x: i32, y: i32) -> Centroid {
        Centroid::new(x, y)
    }

    #[test]
    fn spawns_one_track_per_unclaimed_candidate() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        let outcome = registry.step(vec![c(10, 10), c(50, 50)], THRESHOLD);

        assert_eq!(outcome.spawned, 2);
        assert_eq!(registry.len(), 2);
        let tracks: Vec<&Track> = registry.tracks().collect();
        assert_ne!(tracks[0].id(), tracks[1].id());
        assert_eq!(tracks[0].initial_position(), c(10, 10));
        assert_eq!(tracks[1].initial_position(), c(50, 50));
        assert!(outcome.dominant.is_none());
    }

    #[test]
    fn end_to_end_lifecycle() {
        let mut registry = TrackerRegistry::new(15.0, 5);

        registry.step(vec![c(100, 100)], THRESHOLD);
        assert_eq!(registry.get(0).unwrap().initial_position(), c(100, 100));

        registry.step(vec![c(103, 101)], THRESHOLD);
        let a = registry.get(0).unwrap();
        assert_eq!(a.current_position(), c(103, 101));
        assert_eq!(a.movement_vector(), Motion::new(3.0, 1.0));

        registry.step(vec![], THRESHOLD);
        assert_eq!(registry.get(0).unwrap().missed_update_count(), 1);

        // Frames 4 to 7: still alive with five misses.
        for _ in 4..=7 {
            registry.step(vec![], THRESHOLD);
        }
        assert_eq!(registry.get(0).unwrap().missed_update_count(), 5);

        // Frame 8: sixth miss, gone before frame 9 starts.
        let outcome = registry.step(vec![], THRESHOLD);
        assert_eq!(outcome.pruned, 1);
        assert!(registry.get(0).is_none());
        assert_eq!(outcome.status_line(), "No guidewire detected.");
    }

    #[test]
    fn one_detection_is_claimed_by_the_lowest_id() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![c(0, 0), c(10, 0)], THRESHOLD);

        // Both tracks are within radius of (5, 0).
        registry.step(vec![c(5, 0)], THRESHOLD);
        assert_eq!(registry.get(0).unwrap().current_position(), c(5, 0));
        assert_eq!(registry.get(0).unwrap().missed_update_count(), 0);
        assert_eq!(registry.get(1).unwrap().current_position(), c(10, 0));
        assert_eq!(registry.get(1).unwrap().missed_update_count(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn identical_inputs_give_identical_assignments() {
        let frames = vec![
            vec![c(10, 10), c(20, 10), c(30, 10)],
            vec![c(15, 10), c(25, 10), c(35, 12)],
            vec![c(18, 10), c(22, 10)],
            vec![c(20, 10), c(40, 10)],
        ];

        let run = || {
            let mut registry = TrackerRegistry::new(15.0, 5);
            for frame in &frames {
                registry.step(frame.clone(), THRESHOLD);
            }
            registry
                .tracks()
                .map(|t| (t.id(), t.trajectory().to_vec()))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    fn registry_with_movements(movements: &[(i32, i32)]) -> TrackerRegistry {
        let mut registry = TrackerRegistry::new(15.0, 5);
        let start: Vec<Centroid> = (0..movements.len() as i32).map(|i| c(i * 100, 0)).collect();
        registry.step(start.clone(), THRESHOLD);
        let moved: Vec<Centroid> = start
            .iter()
            .zip(movements)
            .map(|(p, (dx, dy))| c(p.x + dx, p.y + dy))
            .collect();
        registry.step(moved, THRESHOLD);
        registry
    }

    #[test]
    fn dominant_is_the_largest_movement_above_threshold() {
        // Magnitudes 1.0, 3.0 and 2.0 px.
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![c(0, 0), c(200, 0), c(400, 0)], THRESHOLD);
        let outcome = registry.step(vec![c(1, 0), c(203, 0), c(402, 0)], THRESHOLD);
        assert_eq!(outcome.dominant.as_ref().map(|t| t.id()), Some(1));
        assert_eq!(outcome.motion.as_ref().map(|m| m.contributing_tracks), Some(1));

        assert!(registry.dominant_track(3.0).is_none());
        assert_eq!(registry.dominant_track(1.5).map(|t| t.id()), Some(1));
    }

    #[test]
    fn still_tracks_report_no_movement() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![c(0, 0), c(200, 0)], THRESHOLD);
        let outcome = registry.step(vec![c(0, 1), c(200, 0)], THRESHOLD);
        assert!(outcome.dominant.is_none());
        assert_eq!(outcome.status_line(), "(2) No movement detected");
    }

    #[test]
    fn no_dominant_when_everything_is_at_or_below_threshold() {
        let registry = registry_with_movements(&[(1, 0), (2, 0), (0, 2)]);
        assert!(registry.dominant_track(2.0).is_none());
        assert!(registry.last_motion().is_none());
    }

    #[test]
    fn dominant_ties_go_to_the_lower_id() {
        let registry = registry_with_movements(&[(4, 0), (0, 4)]);
        assert_eq!(registry.dominant_track(2.0).map(|t| t.id()), Some(0));
    }

    #[test]
    fn mean_aggregation_averages_moving_tracks() {
        let mut registry = TrackerRegistry::new(15.0, 5).with_aggregation(MotionAggregation::Mean);
        registry.step(vec![c(0, 0), c(100, 0), c(200, 0)], THRESHOLD);
        let outcome = registry.step(vec![c(4, 0), c(106, 0), c(201, 0)], THRESHOLD);

        assert_eq!(outcome.status_line(), "(3) Move: 5.00 | 0.00 (px)");
        let motion = outcome.motion.expect("two tracks move");
        assert_eq!(motion.vector_px, Motion::new(5.0, 0.0));
        assert_eq!(motion.contributing_tracks, 2);
        assert_eq!(motion.dominant_id, 1);
    }

    #[test]
    fn reset_keeps_counting_ids() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![c(1, 1), c(50, 50)], THRESHOLD);
        registry.reset();
        assert!(registry.is_empty());
        registry.step(vec![c(1, 1)], THRESHOLD);
        assert_eq!(registry.tracks().next().map(|t| t.id()), Some(2));
    }

    #[test]
    fn empty_registry_without_candidates_is_a_no_op() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        let outcome = registry.step(vec![], THRESHOLD);
        assert_eq!(outcome.live_tracks, 0);
        assert_eq!(registry.next_id(), 0);
        assert_eq!(outcome.status_line(), "No guidewire detected.");
    }

    #[test]
    fn overlay_marks_trajectory_endpoints() {
        let mut registry = TrackerRegistry::new(15.0, 5);
        registry.step(vec![c(10, 10)], THRESHOLD);
        registry.step(vec![c(20, 10)], THRESHOLD);

        let overlay = registry.render_overlay(&GrayImage::new(32, 32));
        let color = Rgb(registry.get(0).unwrap().display_color());
        assert_eq!(overlay.dimensions(), (32, 32));
        assert_eq!(*overlay.get_pixel(10, 10), color);
        assert_eq!(*overlay.get_pixel(24, 10), color);
    }
}
