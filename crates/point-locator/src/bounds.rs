//! Axis-aligned bounding boxes and grid sizing.
//!
//! The bucket grid covers the bounding box of the input points. Two details
//! matter more than they look:
//!
//! - A zero-extent axis (planar or linear point sets, or a single point)
//!   would produce a zero bucket width and divide-by-zero bucket addressing.
//!   Degenerate axes are silently padded to a minimal nonzero extent; this
//!   is a normalization, not an error.
//! - The automatic division computation targets an average number of points
//!   per bucket and distributes divisions proportionally to the box aspect
//!   ratio, then scales them down uniformly if the product would exceed the
//!   configured bucket cap.

use nalgebra::Point3;

/// Relative padding applied to degenerate (zero-extent) axes, as a fraction
/// of the largest extent. Falls back to an absolute pad for point-like boxes.
const DEGENERATE_PAD_FRACTION: f64 = 1e-4;
const DEGENERATE_PAD_ABSOLUTE: f64 = 0.5;

/// An axis-aligned box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    min: [f64; 3],
    max: [f64; 3],
}

impl BoundingBox {
    /// An inverted box that unions as the identity.
    #[inline]
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    /// Construct from explicit corners.
    ///
    /// Axes where `max < min` are treated as empty on that axis.
    #[inline]
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self {
            min: [min.x, min.y, min.z],
            max: [max.x, max.y, max.z],
        }
    }

    /// Minimum corner.
    #[inline]
    pub fn min(&self) -> Point3<f64> {
        Point3::new(self.min[0], self.min[1], self.min[2])
    }

    /// Maximum corner.
    #[inline]
    pub fn max(&self) -> Point3<f64> {
        Point3::new(self.max[0], self.max[1], self.max[2])
    }

    /// Whether the box contains at least one point (no inverted axis).
    #[inline]
    pub fn is_valid(&self) -> bool {
        (0..3).all(|a| self.min[a] <= self.max[a])
    }

    /// Grow to include `x`.
    #[inline]
    pub fn add_point(&mut self, x: &[f64; 3]) {
        for a in 0..3 {
            if x[a] < self.min[a] {
                self.min[a] = x[a];
            }
            if x[a] > self.max[a] {
                self.max[a] = x[a];
            }
        }
    }

    /// Grow to include another box.
    #[inline]
    pub fn union(&mut self, other: &BoundingBox) {
        for a in 0..3 {
            if other.min[a] < self.min[a] {
                self.min[a] = other.min[a];
            }
            if other.max[a] > self.max[a] {
                self.max[a] = other.max[a];
            }
        }
    }

    /// Extent along each axis.
    #[inline]
    pub fn lengths(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Length of the box diagonal.
    #[inline]
    pub fn diagonal(&self) -> f64 {
        let l = self.lengths();
        (l[0] * l[0] + l[1] * l[1] + l[2] * l[2]).sqrt()
    }

    /// Whether `x` lies inside or on the boundary.
    #[inline]
    pub fn contains(&self, x: &[f64; 3]) -> bool {
        (0..3).all(|a| x[a] >= self.min[a] && x[a] <= self.max[a])
    }

    /// Minimum corner as a raw array (internal addressing).
    #[inline]
    pub(crate) fn min_raw(&self) -> [f64; 3] {
        self.min
    }

    /// Squared distance from `x` to the box; zero inside.
    pub fn distance2_to_point(&self, x: &[f64; 3]) -> f64 {
        let mut deltas = [0.0f64; 3];
        let mut inside = true;
        for a in 0..3 {
            if x[a] < self.min[a] {
                deltas[a] = self.min[a] - x[a];
                inside = false;
            } else if x[a] > self.max[a] {
                deltas[a] = x[a] - self.max[a];
                inside = false;
            }
        }
        if inside {
            return 0.0;
        }
        deltas[0] * deltas[0] + deltas[1] * deltas[1] + deltas[2] * deltas[2]
    }

    /// Pad zero-extent axes so every axis has a strictly positive extent.
    ///
    /// Returns true if any axis was padded.
    pub(crate) fn pad_degenerate_axes(&mut self) -> bool {
        let lengths = self.lengths();
        let max_extent = lengths.iter().cloned().fold(0.0f64, f64::max);
        let pad = if max_extent > 0.0 {
            max_extent * DEGENERATE_PAD_FRACTION
        } else {
            DEGENERATE_PAD_ABSOLUTE
        };
        let mut padded = false;
        for a in 0..3 {
            if lengths[a] <= 0.0 {
                self.min[a] -= pad * 0.5;
                self.max[a] += pad * 0.5;
                padded = true;
            }
        }
        padded
    }

    /// Distribute `target_buckets` divisions across the axes in proportion
    /// to the box aspect ratio, each clamped to at least 1.
    ///
    /// Call [`pad_degenerate_axes`](Self::pad_degenerate_axes) first; all
    /// extents must be strictly positive.
    pub(crate) fn compute_divisions(&self, target_buckets: usize) -> [usize; 3] {
        let lengths = self.lengths();
        debug_assert!(lengths.iter().all(|&l| l > 0.0));

        let geometric_mean = (lengths[0] * lengths[1] * lengths[2]).cbrt();
        let per_axis = (target_buckets.max(1) as f64).cbrt();

        let mut divisions = [1usize; 3];
        for a in 0..3 {
            let d = (per_axis * lengths[a] / geometric_mean).round() as isize;
            divisions[a] = d.max(1) as usize;
        }
        divisions
    }
}

/// Scale divisions down uniformly (preserving aspect ratio) until their
/// product fits under `max_buckets`.
pub(crate) fn clamp_divisions(mut divisions: [usize; 3], max_buckets: usize) -> [usize; 3] {
    let product = |d: &[usize; 3]| d[0].saturating_mul(d[1]).saturating_mul(d[2]);
    while product(&divisions) > max_buckets.max(1) {
        let factor = (max_buckets as f64 / product(&divisions) as f64).cbrt();
        let mut changed = false;
        for a in 0..3 {
            let scaled = ((divisions[a] as f64) * factor).floor() as usize;
            let scaled = scaled.max(1);
            if scaled < divisions[a] {
                divisions[a] = scaled;
                changed = true;
            }
        }
        if !changed {
            // All axes already at 1, or rounding refuses to shrink further.
            break;
        }
    }
    divisions
}
