//! Tolerance-based point merging over a built bucket grid.
//!
//! Merging produces a merge map: `map[i]` is the id of the representative
//! point `i` was merged into, with representatives mapping to themselves
//! (`map[map[i]] == map[i]` always holds on output). Merging is greedy and
//! directional (larger ids merge into smaller ids) rather than a full
//! clustering pass.
//!
//! Three paths exist:
//!
//! - **Exact** (`tolerance == 0`): only bit-identical coordinates merge.
//!   Coincident points always share a bucket (bucket assignment is a pure
//!   function of position), so each point scans only its own bucket. Every
//!   point's slot is written independently; the pass is embarrassingly
//!   parallel and trivially deterministic.
//! - **Point order** (`tolerance > 0`): a single serial sweep in ascending
//!   id order. Slowest, but the result is defined purely by point ids;
//!   the reference ordering when strict reproducibility against other
//!   tools matters.
//! - **Bin order** (`tolerance > 0`, the default): buckets are partitioned
//!   into eight parity classes (`i&1`, `j&1`, `k&1` of the bucket index).
//!   Classes are processed one after another; within a class, buckets fan
//!   out in parallel, claims are collected per thread and applied in a
//!   canonical sorted order between classes. Every read during a class
//!   observes the map as it stood when the class began, so the result
//!   depends only on the grid, never on thread count or scheduling. The
//!   result may differ from point order; that difference is part of the
//!   contract, not a defect.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::debug;

use crate::error::{LocatorError, LocatorResult};
use crate::grid::BucketGrid;
use crate::ids::GridId;
use crate::points::Coord;
use crate::progress::{AbortCallback, AbortChecker};
use crate::PointId;

/// How points are visited when merging with a nonzero tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub enum TraversalOrder {
    /// Checkerboard bucket traversal: parallel, deterministic for a given
    /// grid. The default.
    #[default]
    BinOrder,
    /// Ascending point-id traversal: serial, deterministic by ids alone.
    PointOrder,
}

/// Sentinel for a point not yet visited by a merge pass.
const UNMERGED: PointId = -1;

/// Points per parallel work chunk in the exact-merge pass.
const EXACT_CHUNK: usize = 4096;

impl<'a, T: Coord, I: GridId> BucketGrid<'a, T, I> {
    /// Fill `map` with the merge map for `tolerance`, using `order` when
    /// the tolerance is nonzero. `map` length must equal the point count.
    pub(crate) fn merge_points(
        &self,
        tolerance: f64,
        order: TraversalOrder,
        map: &mut [PointId],
        callback: Option<&AbortCallback>,
    ) -> LocatorResult<()> {
        debug_assert_eq!(map.len(), self.num_points());
        if tolerance <= 0.0 {
            self.merge_exact_by(|_, _| true, map, callback)?;
        } else {
            match order {
                TraversalOrder::PointOrder => {
                    self.merge_close_point_order(tolerance, map, callback)?
                }
                TraversalOrder::BinOrder => self.merge_close_bin_order(tolerance, map, callback)?,
            }
        }
        debug!(tolerance, ?order, points = map.len(), "merged points");
        Ok(())
    }

    /// Exact merge constrained by a per-point data equality predicate:
    /// points merge only when both coordinates and data match.
    pub(crate) fn merge_points_with_data<D: PartialEq + Sync>(
        &self,
        data: &[D],
        map: &mut [PointId],
        callback: Option<&AbortCallback>,
    ) -> LocatorResult<()> {
        debug_assert_eq!(map.len(), self.num_points());
        self.merge_exact_by(|a, b| data[a] == data[b], map, callback)
    }

    /// Exact-coincidence merge. Each point's representative is the lowest
    /// id in its bucket with bit-identical coordinates (and a matching
    /// data predicate); each map slot is computed independently.
    fn merge_exact_by<F>(
        &self,
        matches: F,
        map: &mut [PointId],
        callback: Option<&AbortCallback>,
    ) -> LocatorResult<()>
    where
        F: Fn(usize, usize) -> bool + Sync,
    {
        let aborted = AtomicBool::new(false);
        map.par_chunks_mut(EXACT_CHUNK)
            .enumerate()
            .for_each(|(chunk_index, chunk)| {
                if aborted.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(cb) = callback {
                    if !cb() {
                        aborted.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                let base = chunk_index * EXACT_CHUNK;
                for (offset, slot) in chunk.iter_mut().enumerate() {
                    let point = base + offset;
                    let raw = self.points.get_raw(point);
                    let mut representative = point;
                    for id in self.bucket_points(self.bucket_of_point(point)) {
                        let other = id.index();
                        if other >= point {
                            // Ids ascend within a bucket; no earlier
                            // candidate remains.
                            break;
                        }
                        if self.points.get_raw(other) == raw && matches(point, other) {
                            representative = other;
                            break;
                        }
                    }
                    *slot = representative as PointId;
                }
            });

        if aborted.load(Ordering::Relaxed) {
            return Err(LocatorError::Aborted { operation: "merge" });
        }
        Ok(())
    }

    /// Serial greedy sweep in ascending point id. A point that is still
    /// unclaimed becomes a representative and claims every unclaimed (or
    /// higher-claimed) point above it within the tolerance.
    fn merge_close_point_order(
        &self,
        tolerance: f64,
        map: &mut [PointId],
        callback: Option<&AbortCallback>,
    ) -> LocatorResult<()> {
        map.fill(UNMERGED);
        let mut abort = AbortChecker::new(callback);
        let mut nearby: Vec<PointId> = Vec::with_capacity(128);

        for point in 0..self.num_points() {
            if abort.check(point) {
                return Err(LocatorError::Aborted { operation: "merge" });
            }
            if map[point] >= 0 {
                continue;
            }
            map[point] = point as PointId;
            let p = self.points.get(point);
            self.find_points_within_radius(tolerance, &p, &mut nearby);
            for &near in &nearby {
                if (point as PointId) < near {
                    let current = map[near as usize];
                    if current < 0 || (point as PointId) < current {
                        map[near as usize] = point as PointId;
                    }
                }
            }
        }
        Ok(())
    }

    /// Checkerboard merge: eight parity classes of buckets, processed in
    /// class order. Claims within a class are proposed against the map as
    /// it stood at the start of the class and applied in sorted order
    /// afterwards, so scheduling cannot influence the outcome.
    fn merge_close_bin_order(
        &self,
        tolerance: f64,
        map: &mut [PointId],
        callback: Option<&AbortCallback>,
    ) -> LocatorResult<()> {
        map.fill(UNMERGED);

        let mut buckets_by_color: [Vec<usize>; 8] = Default::default();
        for bucket in 0..self.num_buckets {
            if self.num_points_in_bucket(bucket) == 0 {
                continue;
            }
            let ijk = self.bucket_ijk(bucket);
            let color = (ijk[0] & 1) | ((ijk[1] & 1) << 1) | ((ijk[2] & 1) << 2);
            buckets_by_color[color].push(bucket);
        }

        let aborted = AtomicBool::new(false);
        for buckets in &buckets_by_color {
            // Reads during this class observe the pre-class map.
            let snapshot: &[PointId] = map;
            let mut proposals: Vec<(PointId, PointId)> = buckets
                .par_iter()
                .fold(
                    || (Vec::new(), Vec::new()),
                    |(mut acc, mut nearby), &bucket| {
                        if aborted.load(Ordering::Relaxed) {
                            return (acc, nearby);
                        }
                        if let Some(cb) = callback {
                            if !cb() {
                                aborted.store(true, Ordering::Relaxed);
                                return (acc, nearby);
                            }
                        }
                        for id in self.bucket_points(bucket) {
                            let point = id.index();
                            if snapshot[point] >= 0 {
                                continue;
                            }
                            acc.push((point as PointId, point as PointId));
                            let p = self.points.get(point);
                            self.find_points_within_radius(tolerance, &p, &mut nearby);
                            for &near in &nearby {
                                if (point as PointId) < near {
                                    let current = snapshot[near as usize];
                                    if current < 0 || (point as PointId) < current {
                                        acc.push((near, point as PointId));
                                    }
                                }
                            }
                        }
                        (acc, nearby)
                    },
                )
                .map(|(acc, _)| acc)
                .reduce(Vec::new, |mut a, mut b| {
                    a.append(&mut b);
                    a
                });
            if aborted.load(Ordering::Relaxed) {
                return Err(LocatorError::Aborted { operation: "merge" });
            }

            // Canonical application order: per target, the lowest claimer
            // wins; later (larger) claims fail the comparison below.
            proposals.sort_unstable();
            for (target, representative) in proposals {
                let current = map[target as usize];
                if current < 0 || representative < current {
                    map[target as usize] = representative;
                }
            }
        }

        // Same-class claims can chain (a claims b while c claims a);
        // flatten so representatives map to themselves. Chains strictly
        // decrease, so this terminates.
        for i in 0..map.len() {
            let mut root = map[i];
            while map[root as usize] != root {
                root = map[root as usize];
            }
            map[i] = root;
        }
        Ok(())
    }
}

/// Build the compacted renumbering that mesh-cleaning filters apply after
/// merging: representatives receive consecutive new ids in ascending old-id
/// order, merged points inherit their representative's new id.
///
/// Returns the old→new map and the number of unique representatives.
pub fn compact_merge_map(merge_map: &[PointId]) -> (Vec<PointId>, usize) {
    let mut new_ids = vec![0 as PointId; merge_map.len()];
    let mut next = 0 as PointId;
    for (i, &rep) in merge_map.iter().enumerate() {
        if rep == i as PointId {
            new_ids[i] = next;
            next += 1;
        }
    }
    for (i, &rep) in merge_map.iter().enumerate() {
        if rep != i as PointId {
            new_ids[i] = new_ids[rep as usize];
        }
    }
    (new_ids, next as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{CoordView, PointBuffer};

    fn build_grid<'a>(data: &'a [f64], divisions: [usize; 3]) -> BucketGrid<'a, f64, i32> {
        let view = CoordView::new(data);
        let mut bounds = PointBuffer::F64(data).compute_bounds().unwrap();
        bounds.pad_degenerate_axes();
        BucketGrid::build(view, bounds, divisions, &mut AbortChecker::new(None)).unwrap()
    }

    fn assert_idempotent(map: &[PointId]) {
        for (i, &rep) in map.iter().enumerate() {
            assert!(rep >= 0, "point {i} unassigned");
            assert_eq!(map[rep as usize], rep, "representative of {i} not a root");
        }
    }

    #[test]
    fn test_exact_merge_only_identical_coordinates() {
        // Three distinct positions; the first is duplicated twice.
        let data = [
            1.0f64, 2.0, 3.0, //
            4.0, 5.0, 6.0, //
            1.0, 2.0, 3.0, //
            1.0, 2.0, 3.0, //
            4.0, 5.0, 6.0 + 1e-15,
        ];
        let grid = build_grid(&data, [2, 2, 2]);
        let mut map = vec![0; 5];
        grid.merge_points(0.0, TraversalOrder::BinOrder, &mut map, None)
            .unwrap();

        assert_eq!(map, vec![0, 1, 0, 0, 4]);
        assert_idempotent(&map);
    }

    #[test]
    fn test_exact_merge_with_data_predicate() {
        // Same position, differing data: must stay separate.
        let data = [0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let grid = build_grid(&data, [1, 1, 1]);
        let labels = [7u32, 7, 9];
        let mut map = vec![0; 3];
        grid.merge_points_with_data(&labels, &mut map, None).unwrap();
        assert_eq!(map, vec![0, 0, 2]);
    }

    #[test]
    fn test_point_order_claims_lowest_id() {
        // Pairs of points within tolerance of each other.
        let data = [
            0.0f64, 0.0, 0.0, //
            0.0, 0.0, 1e-8, //
            5.0, 5.0, 5.0, //
            5.0, 5.0 + 1e-8, 5.0,
        ];
        let grid = build_grid(&data, [2, 2, 2]);
        let mut map = vec![0; 4];
        grid.merge_points(1e-6, TraversalOrder::PointOrder, &mut map, None)
            .unwrap();
        assert_eq!(map, vec![0, 0, 2, 2]);
        assert_idempotent(&map);
    }

    #[test]
    fn test_bin_order_is_deterministic() {
        let data: Vec<f64> = (0..300)
            .map(|i| ((i as f64 * 0.618_033_98).fract() * 20.0))
            .collect();
        let grid = build_grid(&data, [4, 4, 4]);

        let mut first = vec![0; 100];
        grid.merge_points(0.5, TraversalOrder::BinOrder, &mut first, None)
            .unwrap();
        assert_idempotent(&first);

        for _ in 0..5 {
            let mut again = vec![0; 100];
            grid.merge_points(0.5, TraversalOrder::BinOrder, &mut again, None)
                .unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_zero_tolerance_keeps_distinct_points() {
        let data = [0.0f64, 0.0, 0.0, 1e-300, 0.0, 0.0];
        let grid = build_grid(&data, [1, 1, 1]);
        let mut map = vec![0; 2];
        grid.merge_points(0.0, TraversalOrder::PointOrder, &mut map, None)
            .unwrap();
        assert_eq!(map, vec![0, 1]);
    }

    #[test]
    fn test_compact_merge_map() {
        let merge_map = vec![0, 0, 2, 2, 0, 5];
        let (new_ids, count) = compact_merge_map(&merge_map);
        assert_eq!(count, 3);
        assert_eq!(new_ids, vec![0, 0, 1, 1, 0, 2]);
    }

    #[test]
    fn test_merge_abort() {
        let data: Vec<f64> = (0..3000).map(|i| i as f64 * 0.01).collect();
        let grid = build_grid(&data, [4, 4, 4]);
        let mut map = vec![0; 1000];
        let cb: AbortCallback = Box::new(|| false);
        let err = grid
            .merge_points(0.1, TraversalOrder::BinOrder, &mut map, Some(&cb))
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Aborted);
    }
}
