//! Static point location and tolerance-based point merging.
//!
//! This crate provides the spatial core used by mesh-cleaning and
//! point-cloud pipelines: a uniform-grid bucket index over a borrowed
//! coordinate buffer, a family of nearest-neighbor queries, and a
//! deterministic parallel point-merge pass that maps every point to a
//! representative within a tolerance.
//!
//! # Features
//!
//! - **One-shot build**: the index is built once per point-set revision
//!   with a parallel counting-sort pass; there is no incremental insertion
//! - **Queries**: closest point, closest point within a radius, n closest
//!   (optionally with distance-tied extras), all points within a radius,
//!   and segment intersection against a tolerance tube
//! - **Merging**: exact (bit-identical) and tolerance-based point merging
//!   with two deterministic traversal orders, feeding the compacted
//!   renumbering that cleaning filters apply afterwards
//! - **Scales**: internal storage switches between 32- and 64-bit ids
//!   automatically; coordinates may be `f32` or `f64`
//!
//! # Quick Start
//!
//! ```
//! use nalgebra::Point3;
//! use point_locator::{PointBuffer, StaticPointLocator, TraversalOrder};
//!
//! // Interleaved x,y,z coordinates, borrowed by the locator.
//! let coords: Vec<f64> = vec![
//!     0.0, 0.0, 0.0, //
//!     1.0, 1.0, 1.0, //
//!     1.0, 1.0, 1.0, // exact duplicate of point 1
//!     5.0, 5.0, 5.0,
//! ];
//!
//! let mut locator = StaticPointLocator::new(PointBuffer::F64(&coords));
//! locator.build().unwrap();
//!
//! // Nearest neighbor.
//! let nearest = locator.find_closest_point(&Point3::new(4.0, 4.0, 4.0));
//! assert_eq!(nearest, Some(3));
//!
//! // Merge exact duplicates: point 2 collapses onto point 1.
//! let merge_map = locator.merge_points(0.0, TraversalOrder::default()).unwrap();
//! assert_eq!(merge_map, vec![0, 1, 1, 3]);
//! ```
//!
//! # Concurrency
//!
//! Building takes `&mut self`; every query takes `&self`. Once built the
//! grid is immutable, so queries may run concurrently from any number of
//! threads without locks; the borrow checker enforces that no build
//! overlaps them. Merging is internally parallel (rayon) and its
//! [`TraversalOrder::BinOrder`] result is identical for any thread count.
//!
//! # Not-found is not an error
//!
//! Queries return `None` or empty lists when nothing qualifies, including
//! on a locator built over zero points. Errors ([`LocatorError`]) are
//! reserved for misconfiguration, malformed inputs, and cancelled
//! operations.

pub mod bounds;
pub mod error;
mod grid;
mod ids;
mod locator;
mod merge;
mod points;
mod progress;
mod query;

/// A point id at the public API boundary. Internal storage may be 32-bit
/// (see [`StaticPointLocator::large_ids`]); the API always widens.
pub type PointId = i64;

pub use bounds::BoundingBox;
pub use error::{ErrorCode, LocatorError, LocatorResult};
pub use locator::{
    LocatorParams, StaticPointLocator, DEFAULT_MAX_NUMBER_OF_BUCKETS, DEFAULT_POINTS_PER_BUCKET,
};
pub use merge::{compact_merge_map, TraversalOrder};
pub use points::PointBuffer;
pub use progress::AbortCallback;
pub use query::LineHit;
