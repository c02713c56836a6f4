//! Borrowed coordinate buffers.
//!
//! The locator does not own point data. It operates on a contiguous,
//! interleaved x,y,z buffer in either single or double precision, borrowed
//! for the lifetime of the locator. Coordinates are immutable for the
//! duration of a build; when the caller mutates the underlying data it must
//! bump the locator's revision (see
//! [`StaticPointLocator::mark_points_modified`](crate::StaticPointLocator::mark_points_modified)).
//!
//! Only `f32` and `f64` coordinates exist; anything else must be converted
//! by the caller up front rather than silently coerced here.

use nalgebra::Point3;
use rayon::prelude::*;

use crate::bounds::BoundingBox;
use crate::error::{LocatorError, LocatorResult};

/// A borrowed, interleaved N×3 coordinate buffer.
#[derive(Debug, Clone, Copy)]
pub enum PointBuffer<'a> {
    /// Single-precision coordinates.
    F32(&'a [f32]),
    /// Double-precision coordinates.
    F64(&'a [f64]),
}

impl<'a> PointBuffer<'a> {
    /// Number of points in the buffer (raw length divided by 3).
    #[inline]
    pub fn num_points(&self) -> usize {
        match self {
            PointBuffer::F32(data) => data.len() / 3,
            PointBuffer::F64(data) => data.len() / 3,
        }
    }

    /// Whether the buffer holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_points() == 0
    }

    /// Fetch a point as double precision.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[inline]
    pub fn get(&self, index: usize) -> Point3<f64> {
        let [x, y, z] = match self {
            PointBuffer::F32(data) => CoordView::new(data).get(index),
            PointBuffer::F64(data) => CoordView::new(data).get(index),
        };
        Point3::new(x, y, z)
    }

    /// Check that the raw buffer length is a multiple of 3.
    pub fn validate(&self) -> LocatorResult<()> {
        let length = match self {
            PointBuffer::F32(data) => data.len(),
            PointBuffer::F64(data) => data.len(),
        };
        if length % 3 != 0 {
            return Err(LocatorError::MalformedBuffer { length });
        }
        Ok(())
    }

    /// Compute the tight axis-aligned bounding box of all points.
    ///
    /// Returns `None` for an empty buffer. Runs in parallel over chunks of
    /// the buffer.
    pub fn compute_bounds(&self) -> Option<BoundingBox> {
        match self {
            PointBuffer::F32(data) => CoordView::new(data).compute_bounds(),
            PointBuffer::F64(data) => CoordView::new(data).compute_bounds(),
        }
    }
}

/// Coordinate scalar: the precision axis of the grid's monomorphization.
pub(crate) trait Coord: Copy + PartialEq + Send + Sync + 'static {
    fn as_f64(self) -> f64;
}

impl Coord for f32 {
    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Coord for f64 {
    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

/// Typed view over an interleaved coordinate slice.
///
/// This is the form the monomorphized grid holds on to, so the per-point
/// fetch in query inner loops compiles down to three loads and (for `f32`)
/// three widenings, with no enum dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoordView<'a, T> {
    data: &'a [T],
}

impl<'a, T: Coord> CoordView<'a, T> {
    #[inline]
    pub(crate) fn new(data: &'a [T]) -> Self {
        Self { data }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.data.len() / 3
    }

    /// Point coordinates widened to f64.
    #[inline]
    pub(crate) fn get(&self, index: usize) -> [f64; 3] {
        let o = 3 * index;
        [
            self.data[o].as_f64(),
            self.data[o + 1].as_f64(),
            self.data[o + 2].as_f64(),
        ]
    }

    /// Point coordinates in native precision, for bit-exact comparisons.
    #[inline]
    pub(crate) fn get_raw(&self, index: usize) -> [T; 3] {
        let o = 3 * index;
        [self.data[o], self.data[o + 1], self.data[o + 2]]
    }

    fn compute_bounds(&self) -> Option<BoundingBox> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let view = *self;
        Some(
            (0..n)
                .into_par_iter()
                .fold(BoundingBox::empty, |mut bounds, i| {
                    bounds.add_point(&view.get(i));
                    bounds
                })
                .reduce(BoundingBox::empty, |mut a, b| {
                    a.union(&b);
                    a
                }),
        )
    }
}

/// Squared Euclidean distance between two positions.
#[inline]
pub(crate) fn distance2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_points() {
        let data = [0.0f64, 0.0, 0.0, 1.0, 2.0, 3.0];
        let buffer = PointBuffer::F64(&data);
        assert_eq!(buffer.num_points(), 2);
        assert_eq!(buffer.get(1), Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_validate_rejects_ragged_buffer() {
        let data = [0.0f32, 1.0, 2.0, 3.0];
        let buffer = PointBuffer::F32(&data);
        assert!(matches!(
            buffer.validate(),
            Err(LocatorError::MalformedBuffer { length: 4 })
        ));
    }

    #[test]
    fn test_compute_bounds() {
        let data = [0.0f64, 0.0, 0.0, 10.0, -2.0, 5.0, 3.0, 7.0, -1.0];
        let bounds = PointBuffer::F64(&data).compute_bounds().unwrap();
        assert_eq!(bounds.min(), Point3::new(0.0, -2.0, -1.0));
        assert_eq!(bounds.max(), Point3::new(10.0, 7.0, 5.0));
    }

    #[test]
    fn test_compute_bounds_empty() {
        let data: [f64; 0] = [];
        assert!(PointBuffer::F64(&data).compute_bounds().is_none());
    }

    #[test]
    fn test_f32_widening_is_exact() {
        let data = [1.5f32, 2.25, -0.125];
        let view = CoordView::new(&data);
        assert_eq!(view.get(0), [1.5, 2.25, -0.125]);
    }
}
