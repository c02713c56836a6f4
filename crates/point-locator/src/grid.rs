//! The bucket grid: a uniform subdivision of the point bounding box.
//!
//! Construction is the classic two-pass counting sort. Each point's bucket
//! index is computed in parallel (this is where the float math lives), then
//! bucket populations are accumulated, prefix-summed into offsets, and the
//! point ids scattered into one contiguous array grouped by bucket. The
//! scatter runs serially in ascending point-id order, so the id order
//! within a bucket is deterministic across runs and thread counts.
//!
//! Once built the grid is immutable; queries and merging only read it,
//! which is what makes concurrent query calls safe without locks.

use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use nalgebra::Point3;
use rayon::prelude::*;
use tracing::debug;

use crate::bounds::BoundingBox;
use crate::error::{LocatorError, LocatorResult};
use crate::ids::GridId;
use crate::points::{Coord, CoordView};
use crate::progress::AbortChecker;

pub(crate) struct BucketGrid<'a, T: Coord, I: GridId> {
    pub(crate) points: CoordView<'a, T>,
    pub(crate) bounds: BoundingBox,
    pub(crate) divisions: [usize; 3],
    pub(crate) h: [f64; 3],
    inv_h: [f64; 3],
    origin: [f64; 3],
    pub(crate) num_buckets: usize,
    /// Offset of each bucket's id run in `map`; length `num_buckets + 1`.
    offsets: Vec<I>,
    /// Point ids grouped by bucket, ascending id within each bucket.
    map: Vec<I>,
}

impl<'a, T: Coord, I: GridId> BucketGrid<'a, T, I> {
    /// Bucket all points. `bounds` must already have strictly positive
    /// extents on every axis (see [`BoundingBox::pad_degenerate_axes`]).
    pub(crate) fn build(
        points: CoordView<'a, T>,
        bounds: BoundingBox,
        divisions: [usize; 3],
        abort: &mut AbortChecker<'_>,
    ) -> LocatorResult<Self> {
        let num_points = points.len();
        let num_buckets = divisions[0] * divisions[1] * divisions[2];
        let lengths = bounds.lengths();

        let mut h = [0.0f64; 3];
        let mut inv_h = [0.0f64; 3];
        for a in 0..3 {
            h[a] = lengths[a] / divisions[a] as f64;
            inv_h[a] = 1.0 / h[a];
        }

        let mut grid = Self {
            points,
            bounds,
            divisions,
            h,
            inv_h,
            origin: bounds.min_raw(),
            num_buckets,
            offsets: Vec::new(),
            map: Vec::new(),
        };

        // Phase 1: bucket index per point, in parallel.
        let mut bucket_of: Vec<I> = Vec::new();
        {
            let grid_ref = &grid;
            (0..num_points)
                .into_par_iter()
                .map(|i| I::from_usize(grid_ref.bucket_index(&grid_ref.points.get(i))))
                .collect_into_vec(&mut bucket_of);
        }
        if abort.check_now() {
            return Err(LocatorError::Aborted { operation: "build" });
        }

        // Phase 2: bucket populations, relaxed atomic increments.
        let counts: Vec<AtomicUsize> = (0..num_buckets).map(|_| AtomicUsize::new(0)).collect();
        bucket_of.par_iter().for_each(|b| {
            counts[b.index()].fetch_add(1, Ordering::Relaxed);
        });
        if abort.check_now() {
            return Err(LocatorError::Aborted { operation: "build" });
        }

        // Phase 3: prefix sum into offsets.
        let mut offsets = Vec::with_capacity(num_buckets + 1);
        let mut running = 0usize;
        for count in &counts {
            offsets.push(I::from_usize(running));
            running += count.load(Ordering::Relaxed);
        }
        offsets.push(I::from_usize(running));
        debug_assert_eq!(running, num_points);

        // Phase 4: scatter ids in ascending order so the id order within a
        // bucket is deterministic.
        let mut cursors: Vec<usize> = offsets[..num_buckets]
            .iter()
            .map(|offset| offset.index())
            .collect();
        let mut map = vec![I::ZERO; num_points];
        for (point, bucket) in bucket_of.iter().enumerate() {
            if abort.check(point) {
                return Err(LocatorError::Aborted { operation: "build" });
            }
            let slot = &mut cursors[bucket.index()];
            map[*slot] = I::from_usize(point);
            *slot += 1;
        }

        grid.offsets = offsets;
        grid.map = map;

        debug!(
            points = num_points,
            buckets = num_buckets,
            divisions = ?divisions,
            "bucketed points"
        );
        Ok(grid)
    }

    #[inline]
    pub(crate) fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Grid coordinates of the bucket containing `x`, clamped per axis to
    /// the valid range. Points on the max boundary land in the last bucket;
    /// out-of-bounds positions land in the nearest boundary bucket.
    #[inline]
    pub(crate) fn bucket_indices(&self, x: &[f64; 3]) -> [usize; 3] {
        let mut ijk = [0usize; 3];
        for a in 0..3 {
            let t = ((x[a] - self.origin[a]) * self.inv_h[a]) as i64;
            let hi = self.divisions[a] as i64 - 1;
            ijk[a] = t.clamp(0, hi) as usize;
        }
        ijk
    }

    #[inline]
    pub(crate) fn linear_index(&self, ijk: &[usize; 3]) -> usize {
        ijk[0] + self.divisions[0] * (ijk[1] + self.divisions[1] * ijk[2])
    }

    #[inline]
    pub(crate) fn bucket_index(&self, x: &[f64; 3]) -> usize {
        self.linear_index(&self.bucket_indices(x))
    }

    /// Decompose a linear bucket index into grid coordinates.
    #[inline]
    pub(crate) fn bucket_ijk(&self, bucket: usize) -> [usize; 3] {
        let i = bucket % self.divisions[0];
        let rest = bucket / self.divisions[0];
        let j = rest % self.divisions[1];
        let k = rest / self.divisions[1];
        [i, j, k]
    }

    #[inline]
    pub(crate) fn num_points_in_bucket(&self, bucket: usize) -> usize {
        self.offsets[bucket + 1].index() - self.offsets[bucket].index()
    }

    /// Point ids resident in a bucket, ascending.
    #[inline]
    pub(crate) fn bucket_points(&self, bucket: usize) -> &[I] {
        &self.map[self.offsets[bucket].index()..self.offsets[bucket + 1].index()]
    }

    /// The bucket a point was assigned to. Recomputed from its coordinates;
    /// bucket assignment is a pure function of position, so this matches
    /// the build-time assignment exactly.
    #[inline]
    pub(crate) fn bucket_of_point(&self, point: usize) -> usize {
        self.bucket_index(&self.points.get(point))
    }

    /// Largest shell level needed to cover the whole grid from `ijk`.
    #[inline]
    pub(crate) fn max_shell_level(&self, ijk: &[usize; 3]) -> usize {
        let mut level = 0usize;
        for a in 0..3 {
            level = level.max(ijk[a]).max(self.divisions[a] - 1 - ijk[a]);
        }
        level
    }

    /// Collect the buckets at exactly Chebyshev distance `level` from
    /// `ijk` (the shell), clipped to the grid.
    pub(crate) fn shell_neighbors(
        &self,
        ijk: &[usize; 3],
        level: usize,
        out: &mut Vec<[usize; 3]>,
    ) {
        out.clear();
        if level == 0 {
            out.push(*ijk);
            return;
        }

        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for a in 0..3 {
            lo[a] = ijk[a].saturating_sub(level);
            hi[a] = (ijk[a] + level).min(self.divisions[a] - 1);
        }

        let level = level as isize;
        let center = [ijk[0] as isize, ijk[1] as isize, ijk[2] as isize];
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    let on_shell = (i as isize - center[0]).abs() == level
                        || (j as isize - center[1]).abs() == level
                        || (k as isize - center[2]).abs() == level;
                    if on_shell {
                        out.push([i, j, k]);
                    }
                }
            }
        }
    }

    /// Clamped bucket footprint of the box `x ± dist`.
    #[inline]
    pub(crate) fn footprint(&self, x: &[f64; 3], dist: f64) -> ([usize; 3], [usize; 3]) {
        let lo = self.bucket_indices(&[x[0] - dist, x[1] - dist, x[2] - dist]);
        let hi = self.bucket_indices(&[x[0] + dist, x[1] + dist, x[2] + dist]);
        (lo, hi)
    }

    /// Buckets within `dist` of `x` that lie outside the Chebyshev box of
    /// radius `level` around `center` (which has already been searched).
    pub(crate) fn overlapping_buckets(
        &self,
        x: &[f64; 3],
        dist: f64,
        center: &[usize; 3],
        level: usize,
        out: &mut Vec<[usize; 3]>,
    ) {
        out.clear();
        let (lo, hi) = self.footprint(x, dist);
        let level = level as isize;
        let c = [center[0] as isize, center[1] as isize, center[2] as isize];
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    let outside = (i as isize - c[0]).abs() > level
                        || (j as isize - c[1]).abs() > level
                        || (k as isize - c[2]).abs() > level;
                    if outside {
                        out.push([i, j, k]);
                    }
                }
            }
        }
    }

    /// Like [`overlapping_buckets`](Self::overlapping_buckets), but for the
    /// shrinking-radius schedule: returns only the footprint growth since
    /// the previous call (tracked in `prev_lo`/`prev_hi`), skips empty
    /// buckets, and returns nothing when the footprint did not change.
    pub(crate) fn overlapping_buckets_grow(
        &self,
        x: &[f64; 3],
        dist: f64,
        prev_lo: &mut [usize; 3],
        prev_hi: &mut [usize; 3],
        out: &mut Vec<[usize; 3]>,
    ) {
        out.clear();
        let (lo, hi) = self.footprint(x, dist);
        if lo == *prev_lo && hi == *prev_hi {
            return;
        }

        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                let in_prev_jk = j >= prev_lo[1] && j <= prev_hi[1] && k >= prev_lo[2] && k <= prev_hi[2];
                let mut i = lo[0];
                while i <= hi[0] {
                    if in_prev_jk && i == prev_lo[0] {
                        // Skip the span already visited on a previous pass.
                        i = prev_hi[0] + 1;
                        continue;
                    }
                    if self.num_points_in_bucket(self.linear_index(&[i, j, k])) > 0 {
                        out.push([i, j, k]);
                    }
                    i += 1;
                }
            }
        }

        *prev_lo = lo;
        *prev_hi = hi;
    }

    /// Squared distance from `x` to a bucket's box; zero inside.
    pub(crate) fn distance2_to_bucket(&self, x: &[f64; 3], ijk: &[usize; 3]) -> f64 {
        let mut d2 = 0.0f64;
        for a in 0..3 {
            let lo = self.origin[a] + ijk[a] as f64 * self.h[a];
            let hi = lo + self.h[a];
            let delta = if x[a] < lo {
                lo - x[a]
            } else if x[a] > hi {
                x[a] - hi
            } else {
                0.0
            };
            d2 += delta * delta;
        }
        d2
    }

    /// Boundary quads separating occupied buckets from empty space.
    ///
    /// Debug/visualization aid: corner points are deduplicated on the
    /// bucket lattice, quads index into the returned point list.
    pub(crate) fn representation(&self) -> (Vec<Point3<f64>>, Vec<[u32; 4]>) {
        let mut corners: HashMap<[usize; 3], u32> = HashMap::new();
        let mut points: Vec<Point3<f64>> = Vec::new();
        let mut quads: Vec<[u32; 4]> = Vec::new();

        let mut corner_id = |lattice: [usize; 3], points: &mut Vec<Point3<f64>>| -> u32 {
            *corners.entry(lattice).or_insert_with(|| {
                let id = points.len() as u32;
                points.push(Point3::new(
                    self.origin[0] + lattice[0] as f64 * self.h[0],
                    self.origin[1] + lattice[1] as f64 * self.h[1],
                    self.origin[2] + lattice[2] as f64 * self.h[2],
                ));
                id
            })
        };

        // Emit the face of bucket `ijk` on the negative side of `axis` at
        // lattice plane `plane`.
        let mut emit = |ijk: [usize; 3], axis: usize, plane: usize, points: &mut Vec<Point3<f64>>| {
            let (u, v) = match axis {
                0 => (1, 2),
                1 => (0, 2),
                _ => (0, 1),
            };
            let mut corner = ijk;
            corner[axis] = plane;
            let mut quad = [0u32; 4];
            for (slot, &(du, dv)) in [(0usize, 0usize), (1, 0), (1, 1), (0, 1)].iter().enumerate() {
                let mut c = corner;
                c[u] = ijk[u] + du;
                c[v] = ijk[v] + dv;
                quad[slot] = corner_id(c, points);
            }
            quads.push(quad);
        };

        for bucket in 0..self.num_buckets {
            let occupied = self.num_points_in_bucket(bucket) > 0;
            if !occupied {
                continue;
            }
            let ijk = self.bucket_ijk(bucket);
            for axis in 0..3 {
                // Negative-side face: boundary of the grid, or an empty neighbor.
                let emit_low = if ijk[axis] == 0 {
                    true
                } else {
                    let mut nei = ijk;
                    nei[axis] -= 1;
                    self.num_points_in_bucket(self.linear_index(&nei)) == 0
                };
                if emit_low {
                    emit(ijk, axis, ijk[axis], &mut points);
                }

                // Positive-side face, same rule.
                let emit_high = if ijk[axis] == self.divisions[axis] - 1 {
                    true
                } else {
                    let mut nei = ijk;
                    nei[axis] += 1;
                    self.num_points_in_bucket(self.linear_index(&nei)) == 0
                };
                if emit_high {
                    emit(ijk, axis, ijk[axis] + 1, &mut points);
                }
            }
        }

        (points, quads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::AbortChecker;

    fn build_grid<'a>(
        data: &'a [f64],
        divisions: [usize; 3],
    ) -> BucketGrid<'a, f64, i32> {
        let view = CoordView::new(data);
        let mut bounds = crate::points::PointBuffer::F64(data).compute_bounds().unwrap();
        bounds.pad_degenerate_axes();
        BucketGrid::build(view, bounds, divisions, &mut AbortChecker::new(None)).unwrap()
    }

    #[test]
    fn test_every_point_in_exactly_one_bucket() {
        let data: Vec<f64> = (0..60).map(|i| (i as f64 * 0.37).sin() * 10.0).collect();
        let grid = build_grid(&data, [3, 4, 2]);

        let mut seen = vec![0usize; grid.num_points()];
        for bucket in 0..grid.num_buckets {
            for id in grid.bucket_points(bucket) {
                seen[id.index()] += 1;
                assert_eq!(grid.bucket_of_point(id.index()), bucket);
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_intra_bucket_order_is_ascending() {
        let data: Vec<f64> = (0..90).map(|i| (i as f64 * 0.53).cos() * 4.0).collect();
        let grid = build_grid(&data, [2, 2, 2]);
        for bucket in 0..grid.num_buckets {
            let ids = grid.bucket_points(bucket);
            assert!(ids.windows(2).all(|w| w[0].index() < w[1].index()));
        }
    }

    #[test]
    fn test_max_boundary_clamps_to_last_bucket() {
        let data = [0.0f64, 0.0, 0.0, 10.0, 10.0, 10.0];
        let grid = build_grid(&data, [4, 4, 4]);
        // The max corner point must land in the last bucket, not one past it.
        assert_eq!(grid.bucket_indices(&[10.0, 10.0, 10.0]), [3, 3, 3]);
        assert_eq!(grid.bucket_indices(&[-5.0, 50.0, 5.0])[0], 0);
        assert_eq!(grid.bucket_indices(&[-5.0, 50.0, 5.0])[1], 3);
    }

    #[test]
    fn test_shell_neighbor_counts() {
        let data: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let grid = build_grid(&data, [5, 5, 5]);
        let mut out = Vec::new();

        grid.shell_neighbors(&[2, 2, 2], 0, &mut out);
        assert_eq!(out.len(), 1);

        // Full interior shell at level 1: 3^3 - 1.
        grid.shell_neighbors(&[2, 2, 2], 1, &mut out);
        assert_eq!(out.len(), 26);

        // Corner shell is clipped.
        grid.shell_neighbors(&[0, 0, 0], 1, &mut out);
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn test_distance2_to_bucket() {
        let data = [0.0f64, 0.0, 0.0, 8.0, 8.0, 8.0];
        let grid = build_grid(&data, [4, 4, 4]);
        // Inside its own bucket.
        let ijk = grid.bucket_indices(&[1.0, 1.0, 1.0]);
        assert_eq!(grid.distance2_to_bucket(&[1.0, 1.0, 1.0], &ijk), 0.0);
        // One bucket width (2.0) away along x.
        let d2 = grid.distance2_to_bucket(&[1.0, 1.0, 1.0], &[2, 0, 0]);
        assert!((d2 - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_representation_single_occupied_bucket() {
        // All points in one bucket: its box contributes exactly 6 quads.
        let data = [1.0f64, 1.0, 1.0, 1.1, 1.1, 1.1];
        let view = CoordView::new(&data);
        let mut bounds = BoundingBox::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(8.0, 8.0, 8.0),
        );
        bounds.pad_degenerate_axes();
        let grid: BucketGrid<'_, f64, i32> =
            BucketGrid::build(view, bounds, [4, 4, 4], &mut AbortChecker::new(None)).unwrap();
        let (points, quads) = grid.representation();
        assert_eq!(quads.len(), 6);
        assert_eq!(points.len(), 8);
    }
}
