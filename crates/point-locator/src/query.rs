//! Ring-expansion queries over a built bucket grid.
//!
//! All queries are read-only and safe to issue concurrently from many
//! threads once the grid is built. Distances are compared squared
//! throughout; a square root is taken only where the API returns a radius.
//!
//! The closest-point searches expand outward in Chebyshev shells of
//! buckets. Finding a candidate in shell L does not prove it is the
//! closest (a nearer point can sit in a neighboring bucket just across a
//! bucket wall), so every search finishes with an overlapping-bucket pass
//! bounded by the best distance found so far. The start bucket is clamped
//! into the grid, which also makes queries from far outside the bounds
//! correct: the shells simply grow from the nearest boundary bucket.

use nalgebra::Point3;

use crate::grid::BucketGrid;
use crate::ids::GridId;
use crate::points::{distance2, Coord};
use crate::PointId;

/// Result of [`StaticPointLocator::intersect_with_line`](crate::StaticPointLocator::intersect_with_line).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineHit {
    /// Id of the intersected point.
    pub point_id: PointId,
    /// Parametric coordinate of the hit along the segment, in `[0, 1]`.
    pub t: f64,
    /// Position on the segment closest to the point.
    pub line_point: Point3<f64>,
    /// The point's own position.
    pub point: Point3<f64>,
}

impl<'a, T: Coord, I: GridId> BucketGrid<'a, T, I> {
    #[inline]
    fn scan_bucket_closest(
        &self,
        ijk: &[usize; 3],
        x: &[f64; 3],
        closest: &mut Option<PointId>,
        min_d2: &mut f64,
    ) {
        for id in self.bucket_points(self.linear_index(ijk)) {
            let d2 = distance2(x, &self.points.get(id.index()));
            if d2 < *min_d2 {
                *min_d2 = d2;
                *closest = Some(id.index() as PointId);
            }
        }
    }

    /// Id of the point closest to `x`, or `None` on an empty grid.
    ///
    /// Ties at equal squared distance resolve to the point encountered
    /// first in scan order (ascending id within a bucket).
    pub(crate) fn find_closest_point(&self, x: &[f64; 3]) -> Option<PointId> {
        if self.num_points() == 0 {
            return None;
        }

        let ijk = self.bucket_indices(x);
        let max_level = self.max_shell_level(&ijk);
        let mut shell: Vec<[usize; 3]> = Vec::new();

        let mut closest = None;
        let mut min_d2 = f64::INFINITY;
        let mut completed = 0usize;
        for level in 0..=max_level {
            self.shell_neighbors(&ijk, level, &mut shell);
            for nei in &shell {
                self.scan_bucket_closest(nei, x, &mut closest, &mut min_d2);
            }
            completed = level;
            if closest.is_some() {
                break;
            }
        }

        // The first hit's shell does not bound the true closest point;
        // sweep every bucket the best-distance sphere still touches.
        if min_d2 > 0.0 {
            self.overlapping_buckets(x, min_d2.sqrt(), &ijk, completed, &mut shell);
            for nei in &shell {
                self.scan_bucket_closest(nei, x, &mut closest, &mut min_d2);
            }
        }

        closest
    }

    /// Closest point within `radius` of `x` and its squared distance.
    ///
    /// Searches a shrinking-radius schedule: as better candidates appear
    /// the effective search radius contracts, and each schedule step only
    /// visits the footprint growth over the previous step.
    pub(crate) fn find_closest_point_within_radius(
        &self,
        radius: f64,
        x: &[f64; 3],
    ) -> Option<(PointId, f64)> {
        if self.num_points() == 0 || radius < 0.0 {
            return None;
        }

        let radius2 = radius * radius;
        let ijk = self.bucket_indices(x);
        let mut shell: Vec<[usize; 3]> = Vec::new();

        // Slightly above radius² so candidates just outside the radius
        // never register and never inflate the search footprint.
        let mut closest = None;
        let mut min_d2 = 1.01 * radius2;
        self.scan_bucket_closest(&ijk, x, &mut closest, &mut min_d2);

        let mut refined_radius = if min_d2 < radius2 {
            min_d2.sqrt()
        } else {
            radius
        };
        let mut refined_radius2 = refined_radius * refined_radius;

        // There is no point searching beyond the far side of the data.
        let diagonal = self.bounds.diagonal();
        if diagonal > 0.0 {
            let max_distance = self.bounds.distance2_to_point(x).sqrt() + diagonal;
            if refined_radius > max_distance {
                refined_radius = max_distance;
                refined_radius2 = max_distance * max_distance;
            }
        }

        let mut radius_level = 1usize;
        for a in 0..3 {
            let levels = ((refined_radius / self.h[a]) as usize).min(self.divisions[a] / 2);
            radius_level = radius_level.max(levels);
        }

        // Growing-footprint schedule: step the search radius up towards
        // refined_radius, shrinking the schedule whenever a better
        // candidate contracts the radius.
        let mut prev_lo = ijk;
        let mut prev_hi = ijk;
        let mut step = radius_level;
        while step >= 1 {
            let current_radius = refined_radius;
            self.overlapping_buckets_grow(
                x,
                refined_radius / step as f64,
                &mut prev_lo,
                &mut prev_hi,
                &mut shell,
            );

            for nei in &shell {
                if self.distance2_to_bucket(x, nei) < refined_radius2 {
                    for id in self.bucket_points(self.linear_index(nei)) {
                        let d2 = distance2(x, &self.points.get(id.index()));
                        if d2 < min_d2 {
                            min_d2 = d2;
                            closest = Some(id.index() as PointId);
                            refined_radius = min_d2.sqrt();
                            refined_radius2 = min_d2;
                        }
                    }
                }
            }

            // Contract the remaining schedule in proportion to the radius
            // improvement; the final step (full footprint) always runs.
            if refined_radius < current_radius && step > 2 {
                let contracted =
                    ((step as f64) * (refined_radius / current_radius)) as usize + 1;
                step = contracted.max(2);
            }
            step -= 1;
        }

        match closest {
            Some(id) if min_d2 <= radius2 => Some((id, min_d2)),
            _ => None,
        }
    }

    /// Collect at least `n` candidates around `x` (a superset of the true
    /// n-nearest), sorted by squared distance then id.
    fn collect_n_candidates(&self, n: usize, x: &[f64; 3]) -> Vec<(f64, PointId)> {
        let mut candidates: Vec<(f64, PointId)> = Vec::with_capacity(n.max(16));
        if n == 0 || self.num_points() == 0 {
            return candidates;
        }

        let ijk = self.bucket_indices(x);
        let max_level = self.max_shell_level(&ijk);
        let mut shell: Vec<[usize; 3]> = Vec::new();

        // Expand shells until n candidates accumulate. max_d2 tracks the
        // worst of the first n; farther points only join if they beat it.
        let mut max_d2 = 0.0f64;
        let mut completed = 0usize;
        for level in 0..=max_level {
            self.shell_neighbors(&ijk, level, &mut shell);
            for nei in &shell {
                for id in self.bucket_points(self.linear_index(nei)) {
                    let d2 = distance2(x, &self.points.get(id.index()));
                    if candidates.len() < n {
                        max_d2 = max_d2.max(d2);
                        candidates.push((d2, id.index() as PointId));
                    } else if d2 <= max_d2 {
                        candidates.push((d2, id.index() as PointId));
                    }
                }
            }
            completed = level;
            if candidates.len() >= n {
                break;
            }
        }

        // Shells proved nothing about buckets just outside the visited
        // box; pick up anything the max_d2 sphere still touches.
        if candidates.len() >= n && max_d2 > 0.0 {
            self.overlapping_buckets(x, max_d2.sqrt(), &ijk, completed, &mut shell);
            for nei in &shell {
                for id in self.bucket_points(self.linear_index(nei)) {
                    let d2 = distance2(x, &self.points.get(id.index()));
                    if d2 <= max_d2 {
                        candidates.push((d2, id.index() as PointId));
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates
    }

    /// The `n` points closest to `x`, nearest first.
    ///
    /// Returns fewer than `n` ids when the point set is smaller than `n`.
    pub(crate) fn find_closest_n_points(&self, n: usize, x: &[f64; 3]) -> Vec<PointId> {
        let mut candidates = self.collect_n_candidates(n, x);
        candidates.truncate(n);
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// Like [`find_closest_n_points`](Self::find_closest_n_points), but
    /// includes every point tied at the n-th distance and returns the
    /// bounding radius of the result.
    pub(crate) fn find_closest_n_bounded_points(
        &self,
        n: usize,
        x: &[f64; 3],
    ) -> (Vec<PointId>, f64) {
        let candidates = self.collect_n_candidates(n, x);
        if candidates.is_empty() {
            return (Vec::new(), 0.0);
        }

        let cutoff = if candidates.len() <= n {
            candidates.len()
        } else {
            let bound = candidates[n - 1].0;
            let mut end = n;
            while end < candidates.len() && candidates[end].0 == bound {
                end += 1;
            }
            end
        };

        let bound_d2 = candidates[cutoff - 1].0;
        let ids = candidates[..cutoff].iter().map(|&(_, id)| id).collect();
        (ids, bound_d2.sqrt())
    }

    /// All points within `radius` of `x` (inclusive), in no particular
    /// order. Every bucket the sphere's bounding box touches is visited;
    /// there is no early termination.
    pub(crate) fn find_points_within_radius(
        &self,
        radius: f64,
        x: &[f64; 3],
        out: &mut Vec<PointId>,
    ) {
        out.clear();
        if self.num_points() == 0 || radius < 0.0 {
            return;
        }

        let radius2 = radius * radius;
        let (lo, hi) = self.footprint(x, radius);
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    for id in self.bucket_points(self.linear_index(&[i, j, k])) {
                        let d2 = distance2(x, &self.points.get(id.index()));
                        if d2 <= radius2 {
                            out.push(id.index() as PointId);
                        }
                    }
                }
            }
        }
    }

    /// March the segment `a0 → a1` through the grid and return the point
    /// within `tol` of the segment with the smallest parametric
    /// coordinate.
    pub(crate) fn intersect_with_line(
        &self,
        a0: &[f64; 3],
        a1: &[f64; 3],
        tol: f64,
    ) -> Option<LineHit> {
        if self.num_points() == 0 || tol < 0.0 {
            return None;
        }

        let ray = [a1[0] - a0[0], a1[1] - a0[1], a1[2] - a0[2]];
        let len2 = ray[0] * ray[0] + ray[1] * ray[1] + ray[2] * ray[2];
        if len2 == 0.0 {
            // Degenerate segment: a plain radius query at a0.
            return self.find_closest_point_within_radius(tol, a0).map(|(id, _)| {
                let p = self.points.get(id as usize);
                LineHit {
                    point_id: id,
                    t: 0.0,
                    line_point: Point3::new(a0[0], a0[1], a0[2]),
                    point: Point3::new(p[0], p[1], p[2]),
                }
            });
        }

        // Clip the parametric range against the bounds inflated by tol.
        let min = self.bounds.min();
        let max = self.bounds.max();
        let mut t_enter = 0.0f64;
        let mut t_exit = 1.0f64;
        for a in 0..3 {
            let lo = [min.x, min.y, min.z][a] - tol;
            let hi = [max.x, max.y, max.z][a] + tol;
            if ray[a] == 0.0 {
                if a0[a] < lo || a0[a] > hi {
                    return None;
                }
            } else {
                let mut t0 = (lo - a0[a]) / ray[a];
                let mut t1 = (hi - a0[a]) / ray[a];
                if t0 > t1 {
                    std::mem::swap(&mut t0, &mut t1);
                }
                t_enter = t_enter.max(t0);
                t_exit = t_exit.min(t1);
                if t_enter > t_exit {
                    return None;
                }
            }
        }

        let tol2 = tol * tol;
        let t_slack = tol / len2.sqrt();

        // Neighborhood reach around the marched bucket covering the
        // tolerance tube.
        let mut pad = [0usize; 3];
        for a in 0..3 {
            pad[a] = (tol / self.h[a]).ceil() as usize;
        }

        let entry = [
            a0[0] + t_enter * ray[0],
            a0[1] + t_enter * ray[1],
            a0[2] + t_enter * ray[2],
        ];
        let mut ijk = self.bucket_indices(&entry);

        // DDA stepping state.
        let mut step = [0isize; 3];
        let mut t_max = [f64::INFINITY; 3];
        let mut t_delta = [f64::INFINITY; 3];
        let origin = self.bounds.min();
        let origin = [origin.x, origin.y, origin.z];
        for a in 0..3 {
            if ray[a] > 0.0 {
                step[a] = 1;
                let boundary = origin[a] + (ijk[a] as f64 + 1.0) * self.h[a];
                t_max[a] = (boundary - a0[a]) / ray[a];
                t_delta[a] = self.h[a] / ray[a];
            } else if ray[a] < 0.0 {
                step[a] = -1;
                let boundary = origin[a] + ijk[a] as f64 * self.h[a];
                t_max[a] = (boundary - a0[a]) / ray[a];
                t_delta[a] = -self.h[a] / ray[a];
            }
            // The entry position may sit outside the grid (clipping uses
            // tol-inflated bounds) with the ray moving away from it; the
            // crossing is then behind the entry and never happens.
            if t_max[a] < t_enter {
                t_max[a] = f64::INFINITY;
            }
        }

        let mut visited = vec![false; self.num_buckets];
        let mut best: Option<(f64, f64, PointId)> = None; // (t, d2, id)
        let mut entry_t = t_enter;

        loop {
            // Examine the unvisited neighborhood of the current bucket.
            let lo = [
                ijk[0].saturating_sub(pad[0]),
                ijk[1].saturating_sub(pad[1]),
                ijk[2].saturating_sub(pad[2]),
            ];
            let hi = [
                (ijk[0] + pad[0]).min(self.divisions[0] - 1),
                (ijk[1] + pad[1]).min(self.divisions[1] - 1),
                (ijk[2] + pad[2]).min(self.divisions[2] - 1),
            ];
            for k in lo[2]..=hi[2] {
                for j in lo[1]..=hi[1] {
                    for i in lo[0]..=hi[0] {
                        let bucket = self.linear_index(&[i, j, k]);
                        if visited[bucket] {
                            continue;
                        }
                        visited[bucket] = true;
                        for id in self.bucket_points(bucket) {
                            let p = self.points.get(id.index());
                            let (d2, t) = point_segment_distance2(&p, a0, &ray, len2);
                            if d2 <= tol2 {
                                let hit = (t, d2, id.index() as PointId);
                                if best.map_or(true, |b| hit < b) {
                                    best = Some(hit);
                                }
                            }
                        }
                    }
                }
            }

            // Past the best hit (plus tube slack): nothing ahead can win.
            if let Some((best_t, _, _)) = best {
                if entry_t > best_t + t_slack {
                    break;
                }
            }

            // Advance to the next bucket along the nearest crossing.
            let axis = if t_max[0] < t_max[1] {
                if t_max[0] < t_max[2] {
                    0
                } else {
                    2
                }
            } else if t_max[1] < t_max[2] {
                1
            } else {
                2
            };
            let crossing = t_max[axis];
            if !crossing.is_finite() || crossing > t_exit {
                break;
            }
            let next = ijk[axis] as isize + step[axis];
            if next < 0 || next >= self.divisions[axis] as isize {
                // The marched bucket stays clamped at this edge; only the
                // other axes can still advance.
                t_max[axis] = f64::INFINITY;
                continue;
            }
            ijk[axis] = next as usize;
            entry_t = crossing;
            t_max[axis] += t_delta[axis];
        }

        best.map(|(t, _, id)| {
            let p = self.points.get(id as usize);
            LineHit {
                point_id: id,
                t,
                line_point: Point3::new(
                    a0[0] + t * ray[0],
                    a0[1] + t * ray[1],
                    a0[2] + t * ray[2],
                ),
                point: Point3::new(p[0], p[1], p[2]),
            }
        })
    }
}

/// Squared distance from `p` to the segment `a0 + t*ray`, `t` clamped to
/// `[0, 1]`, plus the clamped parameter.
#[inline]
fn point_segment_distance2(p: &[f64; 3], a0: &[f64; 3], ray: &[f64; 3], len2: f64) -> (f64, f64) {
    let dx = [p[0] - a0[0], p[1] - a0[1], p[2] - a0[2]];
    let t = ((dx[0] * ray[0] + dx[1] * ray[1] + dx[2] * ray[2]) / len2).clamp(0.0, 1.0);
    let q = [
        a0[0] + t * ray[0],
        a0[1] + t * ray[1],
        a0[2] + t * ray[2],
    ];
    (distance2(p, &q), t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{CoordView, PointBuffer};
    use crate::progress::AbortChecker;

    fn build_grid<'a>(data: &'a [f64], divisions: [usize; 3]) -> BucketGrid<'a, f64, i32> {
        let view = CoordView::new(data);
        let mut bounds = PointBuffer::F64(data).compute_bounds().unwrap();
        bounds.pad_degenerate_axes();
        BucketGrid::build(view, bounds, divisions, &mut AbortChecker::new(None)).unwrap()
    }

    fn brute_force_closest(data: &[f64], x: &[f64; 3]) -> (PointId, f64) {
        let mut best = (0i64, f64::INFINITY);
        for i in 0..data.len() / 3 {
            let p = [data[3 * i], data[3 * i + 1], data[3 * i + 2]];
            let d2 = distance2(x, &p);
            if d2 < best.1 {
                best = (i as PointId, d2);
            }
        }
        best
    }

    fn pseudo_random_cloud(n: usize, scale: f64) -> Vec<f64> {
        // Deterministic scatter, irrational rotations.
        (0..3 * n)
            .map(|i| {
                let v = (i as f64 * 0.754_877_666 + (i as f64 * 0.569_840_29).sin()).fract();
                v.abs() * scale
            })
            .collect()
    }

    #[test]
    fn test_closest_point_matches_brute_force() {
        let data = pseudo_random_cloud(150, 10.0);
        let grid = build_grid(&data, [5, 4, 3]);
        for x in [
            [5.0, 5.0, 5.0],
            [0.1, 9.8, 3.3],
            [10.0, 0.0, 10.0],
            [4.99, 5.01, 2.0],
        ] {
            let expected = brute_force_closest(&data, &x);
            let got = grid.find_closest_point(&x).unwrap();
            let got_d2 = distance2(&x, &grid.points.get(got as usize));
            assert_eq!(got_d2, expected.1, "query {x:?}");
        }
    }

    #[test]
    fn test_closest_point_far_outside_bounds() {
        let data = pseudo_random_cloud(80, 10.0);
        let grid = build_grid(&data, [4, 4, 4]);
        for x in [[-50.0, -50.0, -50.0], [500.0, 5.0, 5.0], [5.0, -3.0, 90.0]] {
            let expected = brute_force_closest(&data, &x);
            let got = grid.find_closest_point(&x).unwrap();
            let got_d2 = distance2(&x, &grid.points.get(got as usize));
            assert_eq!(got_d2, expected.1, "query {x:?}");
        }
    }

    #[test]
    fn test_within_radius_bounded() {
        let data = pseudo_random_cloud(100, 10.0);
        let grid = build_grid(&data, [4, 4, 4]);
        let x = [5.0, 5.0, 5.0];
        let (expected_id, expected_d2) = brute_force_closest(&data, &x);

        // Radius generously above the closest distance finds it.
        let (id, d2) = grid
            .find_closest_point_within_radius(expected_d2.sqrt() + 1.0, &x)
            .unwrap();
        assert_eq!(d2, expected_d2);
        let _ = (id, expected_id); // ids may differ only on exact ties

        // Radius below the closest distance finds nothing.
        let tight = expected_d2.sqrt() * 0.5;
        assert!(grid.find_closest_point_within_radius(tight, &x).is_none());
    }

    #[test]
    fn test_points_within_radius_matches_brute_force() {
        let data = pseudo_random_cloud(120, 8.0);
        let grid = build_grid(&data, [4, 3, 5]);
        let x = [4.0, 4.0, 4.0];
        let radius = 2.5;

        let mut result = Vec::new();
        grid.find_points_within_radius(radius, &x, &mut result);
        result.sort_unstable();

        let mut expected: Vec<PointId> = (0..data.len() / 3)
            .filter(|&i| {
                distance2(&x, &[data[3 * i], data[3 * i + 1], data[3 * i + 2]]) <= radius * radius
            })
            .map(|i| i as PointId)
            .collect();
        expected.sort_unstable();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_n_closest_sorted_and_sized() {
        let data = pseudo_random_cloud(60, 5.0);
        let grid = build_grid(&data, [3, 3, 3]);
        let x = [2.5, 2.5, 2.5];

        let ids = grid.find_closest_n_points(10, &x);
        assert_eq!(ids.len(), 10);
        let dists: Vec<f64> = ids
            .iter()
            .map(|&id| distance2(&x, &grid.points.get(id as usize)))
            .collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));

        // Asking for more than exist returns everything.
        assert_eq!(grid.find_closest_n_points(1000, &x).len(), 60);
    }

    #[test]
    fn test_intersect_with_line_finds_on_axis_point() {
        // Points on the x axis at integer positions.
        let data: Vec<f64> = (0..10).flat_map(|i| [i as f64, 0.0, 0.0]).collect();
        let grid = build_grid(&data, [5, 1, 1]);

        // Segment from (-1, 0.05, 0) to (20, 0.05, 0) passes near all of
        // them; the hit must be the one with the smallest t: point 0.
        let hit = grid
            .intersect_with_line(&[-1.0, 0.05, 0.0], &[20.0, 0.05, 0.0], 0.1)
            .unwrap();
        assert_eq!(hit.point_id, 0);
        assert!(hit.t > 0.0 && hit.t < 0.1);

        // A segment that stays far from every point misses.
        assert!(grid
            .intersect_with_line(&[-1.0, 5.0, 5.0], &[20.0, 5.0, 5.0], 0.1)
            .is_none());
    }
}
