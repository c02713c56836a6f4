//! The public locator facade.
//!
//! [`StaticPointLocator`] wraps the monomorphized bucket grids behind a
//! non-generic API: callers hand it a borrowed coordinate buffer, configure
//! it through validated setters, build once, then query from as many
//! threads as they like. Ids are always `i64` at this boundary regardless
//! of the internal id width.
//!
//! The locator is *static*: it has no incremental insertion. It is built
//! in one shot against a snapshot of the points and rebuilt only when the
//! caller marks the points modified (an explicit revision counter, checked
//! by [`build`](StaticPointLocator::build)).

use nalgebra::Point3;
use tracing::{debug, info, warn};

use crate::bounds::{clamp_divisions, BoundingBox};
use crate::error::{LocatorError, LocatorResult};
use crate::grid::BucketGrid;
use crate::ids::{needs_wide_ids, GridId};
use crate::merge::TraversalOrder;
use crate::points::{CoordView, PointBuffer};
use crate::progress::{AbortCallback, AbortChecker};
use crate::query::LineHit;
use crate::PointId;

/// Default target for the average number of points per bucket.
pub const DEFAULT_POINTS_PER_BUCKET: usize = 5;

/// Default cap on the total bucket count.
pub const DEFAULT_MAX_NUMBER_OF_BUCKETS: i64 = i32::MAX as i64;

/// Smallest accepted bucket cap; anything lower degenerates the grid.
const MIN_MAX_NUMBER_OF_BUCKETS: i64 = 1000;

/// Locator configuration.
///
/// All fields have working defaults; most callers never touch them.
///
/// # Example
///
/// ```
/// use point_locator::LocatorParams;
///
/// let params = LocatorParams {
///     points_per_bucket: 10, // coarser grid, less memory
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct LocatorParams {
    /// Target average number of points per bucket when divisions are
    /// computed automatically. Default: 5.
    pub points_per_bucket: usize,

    /// Manual grid divisions per axis, each at least 1. `None` (the
    /// default) computes divisions from the point count and the bounds
    /// aspect ratio.
    pub divisions: Option<[usize; 3]>,

    /// Upper bound on the total bucket count. Divisions are scaled down
    /// uniformly (preserving aspect ratio) to fit. Default: `i32::MAX`.
    pub max_number_of_buckets: i64,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            points_per_bucket: DEFAULT_POINTS_PER_BUCKET,
            divisions: None,
            max_number_of_buckets: DEFAULT_MAX_NUMBER_OF_BUCKETS,
        }
    }
}

impl LocatorParams {
    /// Validate every field, in the same way the locator's setters do.
    pub fn validate(&self) -> LocatorResult<()> {
        if self.points_per_bucket == 0 {
            return Err(LocatorError::InvalidPointsPerBucket);
        }
        if let Some(divisions) = self.divisions {
            if divisions.iter().any(|&d| d < 1) {
                return Err(LocatorError::InvalidDivisions { divisions });
            }
        }
        if self.max_number_of_buckets < MIN_MAX_NUMBER_OF_BUCKETS {
            return Err(LocatorError::InvalidMaxBuckets {
                requested: self.max_number_of_buckets,
                floor: MIN_MAX_NUMBER_OF_BUCKETS,
            });
        }
        Ok(())
    }
}

/// The four grid instantiations: coordinate precision × id width.
///
/// An enum rather than trait objects so query inner loops stay
/// monomorphized; the branch happens once per call, not per point.
enum GridVariant<'a> {
    F32Narrow(BucketGrid<'a, f32, i32>),
    F32Wide(BucketGrid<'a, f32, i64>),
    F64Narrow(BucketGrid<'a, f64, i32>),
    F64Wide(BucketGrid<'a, f64, i64>),
}

macro_rules! with_grid {
    ($variant:expr, $g:ident => $body:expr) => {
        match $variant {
            GridVariant::F32Narrow($g) => $body,
            GridVariant::F32Wide($g) => $body,
            GridVariant::F64Narrow($g) => $body,
            GridVariant::F64Wide($g) => $body,
        }
    };
}

#[inline]
fn xyz(p: &Point3<f64>) -> [f64; 3] {
    [p.x, p.y, p.z]
}

/// A uniform-grid spatial index over a borrowed point buffer.
///
/// Build once, query concurrently, merge, release. Queries on an unbuilt
/// (or empty) locator are not errors; they return `None` or empty results,
/// because spatial absence is a normal outcome.
///
/// # Example
///
/// ```
/// use nalgebra::Point3;
/// use point_locator::{PointBuffer, StaticPointLocator};
///
/// let coords: Vec<f64> = vec![
///     0.0, 0.0, 0.0, //
///     1.0, 0.0, 0.0, //
///     0.0, 2.0, 0.0,
/// ];
/// let mut locator = StaticPointLocator::new(PointBuffer::F64(&coords));
/// locator.build().unwrap();
///
/// let id = locator.find_closest_point(&Point3::new(0.9, 0.1, 0.0));
/// assert_eq!(id, Some(1));
/// ```
pub struct StaticPointLocator<'a> {
    points: PointBuffer<'a>,
    params: LocatorParams,
    bounds_hint: Option<BoundingBox>,
    abort_callback: Option<AbortCallback>,
    grid: Option<GridVariant<'a>>,
    large_ids: bool,
    points_revision: u64,
    built_revision: Option<u64>,
}

impl<'a> StaticPointLocator<'a> {
    /// Create an unbuilt locator over `points` with default parameters.
    pub fn new(points: PointBuffer<'a>) -> Self {
        Self {
            points,
            params: LocatorParams::default(),
            bounds_hint: None,
            abort_callback: None,
            grid: None,
            large_ids: false,
            points_revision: 0,
            built_revision: None,
        }
    }

    /// Create an unbuilt locator with explicit parameters.
    pub fn with_params(points: PointBuffer<'a>, params: LocatorParams) -> LocatorResult<Self> {
        params.validate()?;
        let mut locator = Self::new(points);
        locator.params = params;
        Ok(locator)
    }

    /// Current configuration.
    pub fn params(&self) -> &LocatorParams {
        &self.params
    }

    /// Number of input points.
    pub fn num_points(&self) -> usize {
        self.points.num_points()
    }

    // ------------------------------------------------------------------
    // Configuration. Each setter validates and, on error, leaves the
    // previous value in place.
    // ------------------------------------------------------------------

    /// Set the target average number of points per bucket (automatic
    /// division mode).
    pub fn set_points_per_bucket(&mut self, points_per_bucket: usize) -> LocatorResult<()> {
        if points_per_bucket == 0 {
            return Err(LocatorError::InvalidPointsPerBucket);
        }
        self.params.points_per_bucket = points_per_bucket;
        Ok(())
    }

    /// Set manual grid divisions; every axis must be at least 1.
    pub fn set_divisions(&mut self, divisions: [usize; 3]) -> LocatorResult<()> {
        if divisions.iter().any(|&d| d < 1) {
            return Err(LocatorError::InvalidDivisions { divisions });
        }
        self.params.divisions = Some(divisions);
        Ok(())
    }

    /// Return to automatic division computation.
    pub fn set_automatic_divisions(&mut self) {
        self.params.divisions = None;
    }

    /// Cap the total bucket count; must be at least 1000.
    pub fn set_max_number_of_buckets(&mut self, max_number_of_buckets: i64) -> LocatorResult<()> {
        if max_number_of_buckets < MIN_MAX_NUMBER_OF_BUCKETS {
            return Err(LocatorError::InvalidMaxBuckets {
                requested: max_number_of_buckets,
                floor: MIN_MAX_NUMBER_OF_BUCKETS,
            });
        }
        self.params.max_number_of_buckets = max_number_of_buckets;
        Ok(())
    }

    /// Supply pre-computed bounds to skip the bounds scan on build. The
    /// bounds must contain every point.
    pub fn set_bounds_hint(&mut self, bounds: Option<BoundingBox>) {
        self.bounds_hint = bounds;
    }

    /// Install or clear the cooperative abort callback polled during
    /// build and merge.
    pub fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort_callback = callback;
    }

    // ------------------------------------------------------------------
    // Lifecycle.
    // ------------------------------------------------------------------

    /// Record that the underlying coordinate buffer changed; the next
    /// [`build`](Self::build) will rebuild instead of short-circuiting.
    pub fn mark_points_modified(&mut self) {
        self.points_revision += 1;
    }

    /// Whether the locator reflects the current points revision.
    pub fn is_built(&self) -> bool {
        self.built_revision == Some(self.points_revision)
    }

    /// Build the search structure, unless it is already current.
    pub fn build(&mut self) -> LocatorResult<()> {
        if self.is_built() {
            return Ok(());
        }
        self.force_build()
    }

    /// Build unconditionally, discarding any existing structure. On error
    /// the previous structure is left untouched.
    pub fn force_build(&mut self) -> LocatorResult<()> {
        self.points.validate()?;

        let num_points = self.points.num_points();
        if num_points == 0 {
            warn!("building locator over zero points; all queries will miss");
            self.grid = None;
            self.large_ids = false;
            self.built_revision = Some(self.points_revision);
            return Ok(());
        }

        let bounds = match self.bounds_hint {
            Some(bounds) => Some(bounds),
            None => self.points.compute_bounds(),
        };
        let Some(mut bounds) = bounds.filter(|b| b.is_valid()) else {
            warn!("locator bounds are invalid; building an empty grid");
            self.grid = None;
            self.large_ids = false;
            self.built_revision = Some(self.points_revision);
            return Ok(());
        };
        if bounds.pad_degenerate_axes() {
            debug!("padded degenerate bounds axes to nonzero extent");
        }

        let max_buckets = self.params.max_number_of_buckets as usize;
        let divisions = match self.params.divisions {
            Some(divisions) => divisions,
            None => {
                let target = (num_points / self.params.points_per_bucket).clamp(1, max_buckets);
                bounds.compute_divisions(target)
            }
        };
        let divisions = clamp_divisions(divisions, max_buckets);
        let num_buckets = divisions[0] * divisions[1] * divisions[2];

        let wide = needs_wide_ids(num_points, num_buckets);
        let mut abort = AbortChecker::new(self.abort_callback.as_ref());
        let grid = match (self.points, wide) {
            (PointBuffer::F32(data), false) => GridVariant::F32Narrow(BucketGrid::build(
                CoordView::new(data),
                bounds,
                divisions,
                &mut abort,
            )?),
            (PointBuffer::F32(data), true) => GridVariant::F32Wide(BucketGrid::build(
                CoordView::new(data),
                bounds,
                divisions,
                &mut abort,
            )?),
            (PointBuffer::F64(data), false) => GridVariant::F64Narrow(BucketGrid::build(
                CoordView::new(data),
                bounds,
                divisions,
                &mut abort,
            )?),
            (PointBuffer::F64(data), true) => GridVariant::F64Wide(BucketGrid::build(
                CoordView::new(data),
                bounds,
                divisions,
                &mut abort,
            )?),
        };

        self.grid = Some(grid);
        self.large_ids = wide;
        self.built_revision = Some(self.points_revision);
        info!(
            points = num_points,
            buckets = num_buckets,
            divisions = ?divisions,
            large_ids = wide,
            "built point locator"
        );
        Ok(())
    }

    /// Release the search structure and return to the unbuilt state.
    pub fn free_search_structure(&mut self) {
        self.grid = None;
        self.large_ids = false;
        self.built_revision = None;
    }

    // ------------------------------------------------------------------
    // Introspection.
    // ------------------------------------------------------------------

    /// Whether the built grid uses 64-bit internal ids.
    pub fn large_ids(&self) -> bool {
        self.large_ids
    }

    /// Total bucket count of the built grid, 0 if unbuilt or empty.
    pub fn number_of_buckets(&self) -> usize {
        self.grid
            .as_ref()
            .map_or(0, |grid| with_grid!(grid, g => g.num_buckets))
    }

    /// Grid divisions of the built grid.
    pub fn divisions(&self) -> Option<[usize; 3]> {
        self.grid
            .as_ref()
            .map(|grid| with_grid!(grid, g => g.divisions))
    }

    /// Bucket edge lengths of the built grid.
    pub fn spacing(&self) -> Option<[f64; 3]> {
        self.grid.as_ref().map(|grid| with_grid!(grid, g => g.h))
    }

    /// Bounds the built grid covers (after degenerate-axis padding).
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.grid
            .as_ref()
            .map(|grid| with_grid!(grid, g => g.bounds))
    }

    /// Number of points in a bucket of the built grid.
    pub fn number_of_points_in_bucket(&self, bucket: usize) -> usize {
        self.grid
            .as_ref()
            .map_or(0, |grid| with_grid!(grid, g => g.num_points_in_bucket(bucket)))
    }

    /// Copy the point ids resident in `bucket` into `out`.
    pub fn bucket_ids(&self, bucket: usize, out: &mut Vec<PointId>) {
        out.clear();
        if let Some(grid) = &self.grid {
            with_grid!(grid, g => {
                out.extend(g.bucket_points(bucket).iter().map(|id| id.index() as PointId));
            });
        }
    }

    /// Linear index of the bucket containing `x` (clamped into the grid).
    pub fn bucket_index(&self, x: &Point3<f64>) -> Option<usize> {
        self.grid
            .as_ref()
            .map(|grid| with_grid!(grid, g => g.bucket_index(&xyz(x))))
    }

    /// Boundary quads separating occupied buckets from empty space, for
    /// debugging and visualization.
    pub fn generate_representation(&self) -> Option<(Vec<Point3<f64>>, Vec<[u32; 4]>)> {
        self.grid
            .as_ref()
            .map(|grid| with_grid!(grid, g => g.representation()))
    }

    // ------------------------------------------------------------------
    // Queries. All read-only and safe to call concurrently once built.
    // ------------------------------------------------------------------

    /// Id of the point closest to `x`. `None` if unbuilt or empty.
    ///
    /// When several points are exactly equidistant the winner is the one
    /// encountered first in scan order; callers must not rely on a
    /// particular winner among exact ties.
    pub fn find_closest_point(&self, x: &Point3<f64>) -> Option<PointId> {
        self.grid
            .as_ref()
            .and_then(|grid| with_grid!(grid, g => g.find_closest_point(&xyz(x))))
    }

    /// Closest point within `radius` of `x`, with its squared distance.
    pub fn find_closest_point_within_radius(
        &self,
        radius: f64,
        x: &Point3<f64>,
    ) -> Option<(PointId, f64)> {
        self.grid.as_ref().and_then(
            |grid| with_grid!(grid, g => g.find_closest_point_within_radius(radius, &xyz(x))),
        )
    }

    /// The `n` points closest to `x`, sorted nearest first. Returns fewer
    /// than `n` when the point set is smaller.
    pub fn find_closest_n_points(&self, n: usize, x: &Point3<f64>) -> Vec<PointId> {
        self.grid
            .as_ref()
            .map_or_else(Vec::new, |grid| {
                with_grid!(grid, g => g.find_closest_n_points(n, &xyz(x)))
            })
    }

    /// Like [`find_closest_n_points`](Self::find_closest_n_points) but
    /// includes every point tied at the n-th distance, and returns the
    /// bounding radius of the result.
    pub fn find_closest_n_bounded_points(
        &self,
        n: usize,
        x: &Point3<f64>,
    ) -> (Vec<PointId>, f64) {
        self.grid.as_ref().map_or_else(
            || (Vec::new(), 0.0),
            |grid| with_grid!(grid, g => g.find_closest_n_bounded_points(n, &xyz(x))),
        )
    }

    /// All points within `radius` of `x` (inclusive), unordered, into
    /// `out`. `out` is cleared first.
    pub fn find_points_within_radius(&self, radius: f64, x: &Point3<f64>, out: &mut Vec<PointId>) {
        match &self.grid {
            Some(grid) => {
                with_grid!(grid, g => g.find_points_within_radius(radius, &xyz(x), out))
            }
            None => out.clear(),
        }
    }

    /// Point within `tol` of the segment `a0 → a1` with the smallest
    /// parametric coordinate along it.
    pub fn intersect_with_line(
        &self,
        a0: &Point3<f64>,
        a1: &Point3<f64>,
        tol: f64,
    ) -> Option<LineHit> {
        self.grid
            .as_ref()
            .and_then(|grid| with_grid!(grid, g => g.intersect_with_line(&xyz(a0), &xyz(a1), tol)))
    }

    // ------------------------------------------------------------------
    // Merging.
    // ------------------------------------------------------------------

    /// Compute the merge map for `tolerance` (see [`TraversalOrder`] for
    /// the ordering contract) and return it.
    pub fn merge_points(
        &self,
        tolerance: f64,
        order: TraversalOrder,
    ) -> LocatorResult<Vec<PointId>> {
        let mut map = vec![0 as PointId; self.points.num_points()];
        self.merge_points_into(tolerance, order, &mut map)?;
        Ok(map)
    }

    /// Fill a caller-allocated merge map; its length must equal the point
    /// count.
    pub fn merge_points_into(
        &self,
        tolerance: f64,
        order: TraversalOrder,
        map: &mut [PointId],
    ) -> LocatorResult<()> {
        if tolerance < 0.0 {
            return Err(LocatorError::NegativeTolerance { tolerance });
        }
        if map.len() != self.points.num_points() {
            return Err(LocatorError::MergeMapLengthMismatch {
                map_length: map.len(),
                point_count: self.points.num_points(),
            });
        }
        match &self.grid {
            Some(grid) => with_grid!(
                grid,
                g => g.merge_points(tolerance, order, map, self.abort_callback.as_ref())
            ),
            None if self.built_revision.is_some() => Ok(()), // built over zero points
            None => Err(LocatorError::NotBuilt {
                operation: "merge_points",
            }),
        }
    }

    /// Merge only points with bit-identical coordinates *and* equal
    /// per-point data. `data` must hold exactly one value per point.
    pub fn merge_points_with_data<D: PartialEq + Sync>(
        &self,
        data: &[D],
    ) -> LocatorResult<Vec<PointId>> {
        if data.len() != self.points.num_points() {
            return Err(LocatorError::DataLengthMismatch {
                data_length: data.len(),
                point_count: self.points.num_points(),
            });
        }
        let mut map = vec![0 as PointId; self.points.num_points()];
        match &self.grid {
            Some(grid) => {
                with_grid!(
                    grid,
                    g => g.merge_points_with_data(data, &mut map, self.abort_callback.as_ref())
                )?;
                Ok(map)
            }
            None if self.built_revision.is_some() => Ok(map),
            None => Err(LocatorError::NotBuilt {
                operation: "merge_points_with_data",
            }),
        }
    }
}
