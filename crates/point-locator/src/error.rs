//! Error types for locator operations with rich diagnostics.
//!
//! This module provides comprehensive error handling with:
//! - Machine-readable error codes for programmatic handling
//! - Rich context (which parameter, what value, what was expected)
//! - Recovery suggestions for common issues
//! - Terminal display via miette
//!
//! # Error Codes
//!
//! Each error has a unique code in the format `LOC-XXXX`:
//! - `LOC-1xxx`: Configuration errors (rejected before any state changes)
//! - `LOC-2xxx`: Input errors (malformed point buffers, mismatched arrays)
//! - `LOC-3xxx`: Operation errors (merge on an unbuilt locator, cancellation)
//!
//! Note that "not found" is never an error anywhere in this crate: spatial
//! absence is a normal query outcome and is expressed as `None` or an empty
//! result list.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for locator operations.
pub type LocatorResult<T> = Result<T, LocatorError>;

/// Machine-readable error codes for locator operations.
///
/// Codes follow the pattern `LOC-XXXX` where:
/// - 1xxx = Configuration errors
/// - 2xxx = Input errors
/// - 3xxx = Operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Configuration errors (1xxx)
    /// LOC-1001: A grid division is less than 1
    InvalidDivisions = 1001,
    /// LOC-1002: Maximum bucket count is below the supported floor
    InvalidMaxBuckets = 1002,
    /// LOC-1003: Points-per-bucket target is zero
    InvalidPointsPerBucket = 1003,

    // Input errors (2xxx)
    /// LOC-2001: Coordinate buffer length is not a multiple of 3
    MalformedBuffer = 2001,
    /// LOC-2002: Per-point data array length does not match the point count
    DataLengthMismatch = 2002,
    /// LOC-2003: Caller-provided merge map has the wrong length
    MergeMapLengthMismatch = 2003,

    // Operation errors (3xxx)
    /// LOC-3001: Operation requires a built locator
    NotBuilt = 3001,
    /// LOC-3002: Operation cancelled by the abort callback
    Aborted = 3002,
    /// LOC-3003: Merge tolerance is negative
    NegativeTolerance = 3003,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `LOC-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidDivisions => "LOC-1001",
            ErrorCode::InvalidMaxBuckets => "LOC-1002",
            ErrorCode::InvalidPointsPerBucket => "LOC-1003",
            ErrorCode::MalformedBuffer => "LOC-2001",
            ErrorCode::DataLengthMismatch => "LOC-2002",
            ErrorCode::MergeMapLengthMismatch => "LOC-2003",
            ErrorCode::NotBuilt => "LOC-3001",
            ErrorCode::Aborted => "LOC-3002",
            ErrorCode::NegativeTolerance => "LOC-3003",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during locator configuration, build, or merge.
///
/// Configuration errors are rejected at configuration time with no side
/// effects: the previous valid configuration is retained. Build failures
/// leave the locator in its previous (or empty) state; a partially built
/// grid is never observable.
#[derive(Debug, Error, Diagnostic)]
pub enum LocatorError {
    /// A manual grid division is less than 1.
    #[error("invalid divisions {divisions:?}: every axis must be at least 1")]
    #[diagnostic(
        code(locator::config::invalid_divisions),
        help("Provide divisions >= 1 on each axis, or switch to automatic division computation.")
    )]
    InvalidDivisions { divisions: [usize; 3] },

    /// The maximum bucket count is below the supported floor.
    #[error("invalid maximum bucket count {requested}: must be at least {floor}")]
    #[diagnostic(
        code(locator::config::invalid_max_buckets),
        help(
            "The bucket cap bounds memory use; values below the floor would degenerate the grid. \
             Use the default (i32::MAX) unless memory is constrained."
        )
    )]
    InvalidMaxBuckets { requested: i64, floor: i64 },

    /// The points-per-bucket target is zero.
    #[error("invalid points-per-bucket target: must be at least 1")]
    #[diagnostic(
        code(locator::config::invalid_points_per_bucket),
        help("The default of 5 points per bucket is a good balance for most point sets.")
    )]
    InvalidPointsPerBucket,

    /// The coordinate buffer length is not a multiple of 3.
    #[error("malformed coordinate buffer: length {length} is not a multiple of 3")]
    #[diagnostic(
        code(locator::input::malformed_buffer),
        help("Point buffers are interleaved x,y,z triples; check how the buffer was assembled.")
    )]
    MalformedBuffer { length: usize },

    /// A per-point data array does not match the point count.
    #[error("data array length {data_length} does not match point count {point_count}")]
    #[diagnostic(
        code(locator::input::data_length_mismatch),
        help("merge_points_with_data requires exactly one data value per point.")
    )]
    DataLengthMismatch {
        data_length: usize,
        point_count: usize,
    },

    /// A caller-provided merge map has the wrong length.
    #[error("merge map length {map_length} does not match point count {point_count}")]
    #[diagnostic(
        code(locator::input::merge_map_length_mismatch),
        help("Allocate the merge map with exactly one entry per input point.")
    )]
    MergeMapLengthMismatch {
        map_length: usize,
        point_count: usize,
    },

    /// The operation requires a built locator.
    #[error("locator has not been built: call build() before {operation}")]
    #[diagnostic(
        code(locator::op::not_built),
        help("Merging consumes the bucket grid; queries on an unbuilt locator simply return empty.")
    )]
    NotBuilt { operation: &'static str },

    /// The operation was cancelled by the abort callback.
    #[error("{operation} cancelled by abort callback")]
    #[diagnostic(
        code(locator::op::aborted),
        help("The locator is left in its previous state; rebuild to retry.")
    )]
    Aborted { operation: &'static str },

    /// A negative merge tolerance was supplied.
    #[error("negative merge tolerance {tolerance}")]
    #[diagnostic(
        code(locator::op::negative_tolerance),
        help("Tolerance is an absolute distance in world units; use 0.0 for exact merging.")
    )]
    NegativeTolerance { tolerance: f64 },
}

impl LocatorError {
    /// Get the machine-readable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            LocatorError::InvalidDivisions { .. } => ErrorCode::InvalidDivisions,
            LocatorError::InvalidMaxBuckets { .. } => ErrorCode::InvalidMaxBuckets,
            LocatorError::InvalidPointsPerBucket => ErrorCode::InvalidPointsPerBucket,
            LocatorError::MalformedBuffer { .. } => ErrorCode::MalformedBuffer,
            LocatorError::DataLengthMismatch { .. } => ErrorCode::DataLengthMismatch,
            LocatorError::MergeMapLengthMismatch { .. } => ErrorCode::MergeMapLengthMismatch,
            LocatorError::NotBuilt { .. } => ErrorCode::NotBuilt,
            LocatorError::Aborted { .. } => ErrorCode::Aborted,
            LocatorError::NegativeTolerance { .. } => ErrorCode::NegativeTolerance,
        }
    }

    /// Whether this error is a configuration error (LOC-1xxx).
    pub fn is_configuration_error(&self) -> bool {
        (self.code() as i32) < 2000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            LocatorError::InvalidDivisions {
                divisions: [0, 1, 1]
            }
            .code()
            .as_str(),
            "LOC-1001"
        );
        assert_eq!(
            LocatorError::MalformedBuffer { length: 7 }.code().as_str(),
            "LOC-2001"
        );
        assert_eq!(
            LocatorError::Aborted { operation: "build" }.code().as_str(),
            "LOC-3002"
        );
    }

    #[test]
    fn test_configuration_errors_are_classified() {
        assert!(LocatorError::InvalidPointsPerBucket.is_configuration_error());
        assert!(!LocatorError::NotBuilt { operation: "merge" }.is_configuration_error());
    }

    #[test]
    fn test_display_contains_context() {
        let err = LocatorError::DataLengthMismatch {
            data_length: 10,
            point_count: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("12"));
    }
}
