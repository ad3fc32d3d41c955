// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! A fast-marching eikonal solver and ray-path tracer for unstructured
//! simplicial meshes.
//!
//! This library computes first-arrival traveltimes of a wavefront through an
//! inhomogeneous isotropic medium discretized by triangles (2D) or
//! tetrahedra (3D), solving |∇T|·s = 1 with a narrow-band fast-marching
//! sweep and a local wavefront solver with obtuse-angle correction. Ray
//! paths are reconstructed from receivers back to sources by walking against
//! the recovered time gradient.

#![warn(missing_docs)]

/// Error types for the library.
pub mod error;
/// Points, vector operations, and point-in-simplex tests.
pub mod geometry;
/// Least-squares gradient recovery over node stars.
pub mod gradient;
/// Inverse-distance interpolation.
pub mod interp;
/// Traveltime dumps, VTK export, and Gmsh mesh reading.
pub mod io;
/// Local eikonal updates for triangles and tetrahedra.
pub mod local;
/// Node store, elements, adjacency, and virtual-node registry.
pub mod mesh;

mod marching;
mod raypath;

pub use crate::error::{RaytraceError, Result};
pub use crate::geometry::{Point2, Point3};
pub use crate::mesh::{TetMesh, TriMesh};
