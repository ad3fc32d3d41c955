// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;

/// Errors that can occur during mesh construction, input validation, or I/O.
#[derive(Debug)]
pub enum RaytraceError {
    /// Slowness vector length does not match the node count.
    SlownessSizeMismatch {
        /// Number of nodes in the mesh.
        expected: usize,
        /// Length of the slowness vector provided.
        got: usize,
    },
    /// Slowness value is not positive and finite.
    InvalidSlowness {
        /// The node index of the invalid value.
        index: usize,
        /// The invalid value.
        value: f64,
    },
    /// A source or receiver point lies outside the mesh.
    PointOutsideMesh {
        /// Position of the point in its input list.
        index: usize,
        /// The point coordinates.
        coord: Vec<f64>,
    },
    /// Source radius is negative.
    NegativeSourceRadius(f64),
    /// A positive source radius contains no mesh node.
    EmptySourceRadius {
        /// The radius that was searched.
        radius: f64,
    },
    /// Thread index is not smaller than the thread count fixed at construction.
    ThreadOutOfRange {
        /// The thread index requested.
        thread: usize,
        /// The number of per-thread state columns available.
        nthreads: usize,
    },
    /// Two input vectors that must have equal lengths disagree.
    InputSizeMismatch {
        /// Which pair of inputs disagrees.
        what: &'static str,
        /// Length of the first input.
        expected: usize,
        /// Length of the second input.
        got: usize,
    },
    /// The mesh connectivity is unusable.
    InvalidMesh {
        /// Explanation of what is wrong.
        reason: String,
    },
    /// A mesh file could not be parsed.
    Parse {
        /// 1-based line number where parsing failed.
        line: usize,
        /// Explanation of what is wrong.
        reason: String,
    },
    /// I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for RaytraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaytraceError::SlownessSizeMismatch { expected, got } => {
                write!(
                    f,
                    "slowness vector of incompatible size: mesh has {} nodes, got {} values",
                    expected, got
                )
            }
            RaytraceError::InvalidSlowness { index, value } => {
                write!(
                    f,
                    "invalid slowness at node {}: {} (must be positive and finite)",
                    index, value
                )
            }
            RaytraceError::PointOutsideMesh { index, coord } => {
                write!(f, "point no {} outside the grid: {:?}", index + 1, coord)
            }
            RaytraceError::NegativeSourceRadius(r) => {
                write!(f, "negative source radius: {}", r)
            }
            RaytraceError::EmptySourceRadius { radius } => {
                write!(f, "no nodes found within source radius {}", radius)
            }
            RaytraceError::ThreadOutOfRange { thread, nthreads } => {
                write!(
                    f,
                    "thread index {} out of range: mesh was built for {} threads",
                    thread, nthreads
                )
            }
            RaytraceError::InputSizeMismatch {
                what,
                expected,
                got,
            } => {
                write!(f, "{}: expected {} entries, got {}", what, expected, got)
            }
            RaytraceError::InvalidMesh { reason } => {
                write!(f, "invalid mesh: {}", reason)
            }
            RaytraceError::Parse { line, reason } => {
                write!(f, "parse error at line {}: {}", line, reason)
            }
            RaytraceError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for RaytraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RaytraceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RaytraceError {
    fn from(e: std::io::Error) -> Self {
        RaytraceError::Io(e)
    }
}

/// Convenience type alias for Results with RaytraceError.
pub type Result<T> = std::result::Result<T, RaytraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_slowness_size_mismatch() {
        let e = RaytraceError::SlownessSizeMismatch {
            expected: 10,
            got: 7,
        };
        assert_eq!(
            e.to_string(),
            "slowness vector of incompatible size: mesh has 10 nodes, got 7 values"
        );
    }

    #[test]
    fn display_point_outside_mesh() {
        let e = RaytraceError::PointOutsideMesh {
            index: 2,
            coord: vec![1.5, -0.5],
        };
        assert_eq!(e.to_string(), "point no 3 outside the grid: [1.5, -0.5]");
    }

    #[test]
    fn display_empty_source_radius() {
        let e = RaytraceError::EmptySourceRadius { radius: 0.2 };
        assert_eq!(e.to_string(), "no nodes found within source radius 0.2");
    }

    #[test]
    fn display_thread_out_of_range() {
        let e = RaytraceError::ThreadOutOfRange {
            thread: 4,
            nthreads: 2,
        };
        assert_eq!(
            e.to_string(),
            "thread index 4 out of range: mesh was built for 2 threads"
        );
    }

    #[test]
    fn display_invalid_slowness() {
        let e = RaytraceError::InvalidSlowness {
            index: 5,
            value: -0.5,
        };
        assert_eq!(
            e.to_string(),
            "invalid slowness at node 5: -0.5 (must be positive and finite)"
        );
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let e: RaytraceError = io_err.into();
        assert!(matches!(e, RaytraceError::Io(_)));
        assert!(e.to_string().contains("test"));
    }

    #[test]
    fn display_parse() {
        let e = RaytraceError::Parse {
            line: 12,
            reason: "expected 3 node indices".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "parse error at line 12: expected 3 node indices"
        );
    }
}
