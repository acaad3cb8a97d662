// THEORY:
// A `Track` is one marker artifact believed to persist across frames. Where a
// `Centroid` is a snapshot, a `Track` is a memory: it keeps the position it was
// born at, every position it has been matched to since, and how far it moved on
// its last match.
//
// Key rules:
// 1.  **Bounded nearest neighbour**: on each update the closest candidate wins,
//     but only if it lies within `max_association_radius` (inclusive). Among
//     equidistant candidates the one offered first wins.
// 2.  **Step-to-step movement**: the movement vector is `current - previous`,
//     recomputed on every match and left as it was on a miss. A marker held
//     still off-centre therefore reports no movement.
// 3.  **Miss counting**: an update without a match bumps `missed_update_count`;
//     a match resets it. Removal is the registry's decision, not the track's.

use crate::core_modules::centroid::{Centroid, Motion};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    id: u64,
    initial_position: Centroid,
    current_position: Centroid,
    /// Every position ever associated, oldest first. Never empty.
    trajectory: Vec<Centroid>,
    movement_vector: Motion,
    missed_update_count: u32,
    max_association_radius: f64,
    /// Random RGB colour for the overlay only.
    display_color: [u8; 3],
}

impl Track {
    pub fn new(id: u64, position: Centroid, max_association_radius: f64) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            id,
            initial_position: position,
            current_position: position,
            trajectory: vec![position],
            movement_vector: Motion::ZERO,
            missed_update_count: 0,
            max_association_radius,
            display_color: [rng.r#gen(), rng.r#gen(), rng.r#gen()],
        }
    }

    /// Offers this frame's remaining candidates. Returns true if one was claimed;
    /// the caller removes `current_position()` from its pool in that case.
    pub fn update(&mut self, candidates: &[Centroid]) -> bool {
        match self.nearest_within_radius(candidates) {
            Some(index) => {
                let previous = self.current_position;
                self.current_position = candidates[index];
                self.trajectory.push(self.current_position);
                self.movement_vector = self.current_position - previous;
                self.missed_update_count = 0;
                true
            }
            None => {
                self.missed_update_count += 1;
                false
            }
        }
    }

    fn nearest_within_radius(&self, candidates: &[Centroid]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let dist = self.current_position.distance(candidate);
            if dist > self.max_association_radius {
                continue;
            }
            if best.is_none_or(|(_, best_dist)| dist < best_dist) {
                best = Some((i, dist));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn initial_position(&self) -> Centroid {
        self.initial_position
    }

    pub fn current_position(&self) -> Centroid {
        self.current_position
    }

    pub fn trajectory(&self) -> &[Centroid] {
        &self.trajectory
    }

    pub fn movement_vector(&self) -> Motion {
        self.movement_vector
    }

    /// Displacement from the birth position; used by the overlay endpoints.
    pub fn displacement(&self) -> Motion {
        self.current_position - self.initial_position
    }

    pub fn missed_update_count(&self) -> u32 {
        self.missed_update_count
    }

    pub fn max_association_radius(&self) -> f64 {
        self.max_association_radius
    }

    pub fn display_color(&self) -> [u8; 3] {
        self.display_color
    }
}
