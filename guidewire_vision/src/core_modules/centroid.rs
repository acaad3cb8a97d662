// THEORY:
// The vocabulary types of the tracking layer. A `Centroid` is a bare detection:
// a pixel coordinate produced fresh every frame with no identity of its own.
// Identity only exists once a `Track` claims the centroid. `Motion` is a
// displacement in pixel space, used both for a single track's movement and for
// the aggregated estimate that drives the scan plane.

use serde::{Deserialize, Serialize};
use std::ops::Sub;

/// Integer pixel coordinate of a detected blob's center of mass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Centroid {
    pub x: i32,
    pub y: i32,
}

impl Centroid {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Plain Euclidean distance in pixel space.
    pub fn distance(&self, other: &Centroid) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        dx.hypot(dy)
    }
}

impl Sub for Centroid {
    type Output = Motion;

    fn sub(self, rhs: Centroid) -> Motion {
        Motion::new((self.x - rhs.x) as f64, (self.y - rhs.y) as f64)
    }
}

/// A displacement in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Motion {
    pub dx: f64,
    pub dy: f64,
}

impl Motion {
    pub const ZERO: Motion = Motion { dx: 0.0, dy: 0.0 };

    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    pub fn magnitude(&self) -> f64 {
        self.dx.hypot(self.dy)
    }

    /// Sum of absolute components; the gate used before requesting a move.
    pub fn l1(&self) -> f64 {
        self.dx.abs() + self.dy.abs()
    }

    pub fn scaled(&self, factor: f64) -> Motion {
        Motion::new(self.dx * factor, self.dy * factor)
    }
}
