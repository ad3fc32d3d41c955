// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::HashMap;
use std::f64::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{RaytraceError, Result};
use crate::geometry::{
    inside_tet, inside_triangle_2d, project_to_triangle, Coord, Point2, Point3, SMALL,
};
use crate::interp;

/// Sentinel for an unset predecessor node or cell.
pub const NO_PARENT: u32 = u32::MAX;

/// Per-thread mutable node state: tentative traveltimes and predecessors.
///
/// Traveltimes are f64 bits in atomic u64 cells so the mesh can be borrowed
/// immutably during a solve and shared across per-source worker threads.
/// Within one thread index there is no contention; the atomics only make the
/// aliasing sound.
#[derive(Debug)]
struct ThreadColumn {
    tt: Box<[AtomicU64]>,
    parent_node: Box<[AtomicU32]>,
    parent_cell: Box<[AtomicU32]>,
}

impl ThreadColumn {
    fn new(num_nodes: usize) -> Self {
        ThreadColumn {
            tt: (0..num_nodes)
                .map(|_| AtomicU64::new(f64::INFINITY.to_bits()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            parent_node: (0..num_nodes)
                .map(|_| AtomicU32::new(NO_PARENT))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            parent_cell: (0..num_nodes)
                .map(|_| AtomicU32::new(NO_PARENT))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn reinit(&self) {
        for t in self.tt.iter() {
            t.store(f64::INFINITY.to_bits(), Ordering::Relaxed);
        }
        for p in self.parent_node.iter() {
            p.store(NO_PARENT, Ordering::Relaxed);
        }
        for p in self.parent_cell.iter() {
            p.store(NO_PARENT, Ordering::Relaxed);
        }
    }
}

/// Primary-node storage shared by the 2D and 3D meshes: coordinates, per-node
/// slowness, owner (element) lists, and per-thread traveltime state.
#[derive(Debug)]
pub struct NodeStore<P> {
    coords: Vec<P>,
    slowness: Vec<f64>,
    owners: Vec<Vec<u32>>,
    n_primary: u32,
    columns: Vec<ThreadColumn>,
}

impl<P: Coord> NodeStore<P> {
    fn new(coords: Vec<P>, nthreads: usize) -> Self {
        let n = coords.len();
        let nthreads = nthreads.max(1);
        NodeStore {
            slowness: vec![0.0; n],
            owners: vec![Vec::new(); n],
            n_primary: n as u32,
            columns: (0..nthreads).map(|_| ThreadColumn::new(n)).collect(),
            coords,
        }
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    /// True when the store holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Number of primary nodes (mesh vertices).
    pub fn n_primary(&self) -> u32 {
        self.n_primary
    }

    /// True when the node is a mesh vertex.
    pub fn is_primary(&self, node: u32) -> bool {
        node < self.n_primary
    }

    /// Number of per-thread state columns.
    pub fn n_threads(&self) -> usize {
        self.columns.len()
    }

    /// Coordinate of a node.
    pub fn coord(&self, node: u32) -> P {
        self.coords[node as usize]
    }

    /// Slowness at a node.
    pub fn slowness_at(&self, node: u32) -> f64 {
        self.slowness[node as usize]
    }

    /// Element indices owning a node.
    pub fn owners(&self, node: u32) -> &[u32] {
        &self.owners[node as usize]
    }

    /// Tentative traveltime of a node for a thread.
    pub fn traveltime(&self, node: u32, thread: usize) -> f64 {
        f64::from_bits(self.columns[thread].tt[node as usize].load(Ordering::Relaxed))
    }

    /// Predecessor (node, cell) of a node for a thread; `NO_PARENT` when unset.
    pub fn parents(&self, node: u32, thread: usize) -> (u32, u32) {
        let col = &self.columns[thread];
        (
            col.parent_node[node as usize].load(Ordering::Relaxed),
            col.parent_cell[node as usize].load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_traveltime(&self, node: u32, thread: usize, tt: f64) {
        self.columns[thread].tt[node as usize].store(tt.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn set_parents(&self, node: u32, thread: usize, parent: u32, cell: u32) {
        let col = &self.columns[thread];
        col.parent_node[node as usize].store(parent, Ordering::Relaxed);
        col.parent_cell[node as usize].store(cell, Ordering::Relaxed);
    }

    /// Reset traveltimes and predecessors of one thread column to their
    /// pristine state (+inf, unset).
    pub fn reinit(&self, thread: usize) {
        self.columns[thread].reinit();
    }

    /// Index of the node coincident with `p`, if any.
    pub(crate) fn find_coincident(&self, p: &P) -> Option<u32> {
        self.coords
            .iter()
            .position(|q| q.coincides(p, SMALL))
            .map(|n| n as u32)
    }

    fn push_owner(&mut self, node: u32, cell: u32) {
        self.owners[node as usize].push(cell);
    }

    fn set_slowness_uniform(&mut self, s: f64) -> Result<()> {
        if !s.is_finite() || s <= 0.0 {
            return Err(RaytraceError::InvalidSlowness { index: 0, value: s });
        }
        self.slowness.fill(s);
        Ok(())
    }

    fn set_slowness_vec(&mut self, s: &[f64]) -> Result<()> {
        if s.len() != self.coords.len() {
            return Err(RaytraceError::SlownessSizeMismatch {
                expected: self.coords.len(),
                got: s.len(),
            });
        }
        for (index, &value) in s.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(RaytraceError::InvalidSlowness { index, value });
            }
        }
        self.slowness.copy_from_slice(s);
        Ok(())
    }
}

/// A triangular element: node indices, precomputed edge lengths and interior
/// angles, and an optional physical-entity tag carried through to output.
///
/// `l[k]` is the length of the edge opposite vertex `k`; `a[k]` is the
/// interior angle at vertex `k`.
#[derive(Debug, Clone)]
pub struct Triangle {
    /// Node indices.
    pub i: [u32; 3],
    /// Edge lengths, `l[k]` opposite vertex `k`.
    pub l: [f64; 3],
    /// Interior angles at each vertex.
    pub a: [f64; 3],
    /// Physical-entity tag (0 when untagged).
    pub physical_entity: i32,
}

impl Triangle {
    fn with_geometry(i: [u32; 3], physical_entity: i32, coords: &[Point2]) -> Self {
        let p = [
            coords[i[0] as usize],
            coords[i[1] as usize],
            coords[i[2] as usize],
        ];
        let l = [
            p[1].distance(p[2]),
            p[0].distance(p[2]),
            p[0].distance(p[1]),
        ];
        let a = [
            law_of_cosines(l[1], l[2], l[0]),
            law_of_cosines(l[0], l[2], l[1]),
            law_of_cosines(l[0], l[1], l[2]),
        ];
        Triangle {
            i,
            l,
            a,
            physical_entity,
        }
    }
}

/// A tetrahedral element: node indices, precomputed edge lengths, per-face
/// interior angles, and an optional physical-entity tag.
///
/// `l[k]` follows the edge order (0,1),(0,2),(0,3),(1,2),(1,3),(2,3).
/// `face_a[k]` holds the planar angles of the face opposite vertex `k`, at
/// that face's vertices in ascending local order.
#[derive(Debug, Clone)]
pub struct Tetrahedron {
    /// Node indices.
    pub i: [u32; 4],
    /// Edge lengths in the order (0,1),(0,2),(0,3),(1,2),(1,3),(2,3).
    pub l: [f64; 6],
    /// Planar angles of the face opposite each vertex.
    pub face_a: [[f64; 3]; 4],
    /// Physical-entity tag (0 when untagged).
    pub physical_entity: i32,
}

/// Local vertex triples of the face opposite each tetrahedron vertex,
/// in ascending order.
pub(crate) const TET_FACES: [[usize; 3]; 4] = [[1, 2, 3], [0, 2, 3], [0, 1, 3], [0, 1, 2]];

impl Tetrahedron {
    fn with_geometry(i: [u32; 4], physical_entity: i32, coords: &[Point3]) -> Self {
        let p = [
            coords[i[0] as usize],
            coords[i[1] as usize],
            coords[i[2] as usize],
            coords[i[3] as usize],
        ];
        let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
        let mut l = [0.0; 6];
        for (k, (m, n)) in pairs.iter().enumerate() {
            l[k] = p[*m].distance(p[*n]);
        }
        let mut face_a = [[0.0; 3]; 4];
        for (k, f) in TET_FACES.iter().enumerate() {
            let e = [
                p[f[1]].distance(p[f[2]]),
                p[f[0]].distance(p[f[2]]),
                p[f[0]].distance(p[f[1]]),
            ];
            face_a[k] = [
                law_of_cosines(e[1], e[2], e[0]),
                law_of_cosines(e[0], e[2], e[1]),
                law_of_cosines(e[0], e[1], e[2]),
            ];
        }
        Tetrahedron {
            i,
            l,
            face_a,
            physical_entity,
        }
    }

    /// Length of the edge between local vertices `m` and `n`.
    pub fn edge(&self, m: usize, n: usize) -> f64 {
        const EDGE_OF: [[usize; 4]; 4] = [
            [usize::MAX, 0, 1, 2],
            [0, usize::MAX, 3, 4],
            [1, 3, usize::MAX, 5],
            [2, 4, 5, usize::MAX],
        ];
        self.l[EDGE_OF[m][n]]
    }
}

/// Interior angle opposite side `c` in a triangle with sides (a, b, c).
fn law_of_cosines(a: f64, b: f64, c: f64) -> f64 {
    ((a * a + b * b - c * c) / (2.0 * a * b)).clamp(-1.0, 1.0).acos()
}

/// An unfolded support for the obtuse vertex of a triangle: the two nodes the
/// local solver substitutes for the opposing edge, with cached side lengths
/// `e = [a, b, c]` and angles `a = [at C, at node1-side, at node2-side]`.
#[derive(Debug, Clone)]
pub struct VirtualNode {
    /// First supporting node.
    pub node1: u32,
    /// Second supporting node.
    pub node2: u32,
    /// Angles of the unfolded support triangle.
    pub a: [f64; 3],
    /// Side lengths of the unfolded support triangle.
    pub e: [f64; 3],
}

/// Common owners of two nodes, optionally excluding one cell.
fn shared_owners<P: Coord>(store: &NodeStore<P>, n0: u32, n1: u32, exclude: Option<u32>) -> Vec<u32> {
    let mut out = Vec::new();
    for &c in store.owners(n0) {
        if Some(c) != exclude && store.owners(n1).contains(&c) {
            out.push(c);
        }
    }
    out
}

/// An unstructured triangle mesh in the x-z plane with a node-attached
/// slowness field, ready for fast-marching traveltime computation.
#[derive(Debug)]
pub struct TriMesh {
    pub(crate) store: NodeStore<Point2>,
    triangles: Vec<Triangle>,
    neighbors: Vec<Vec<u32>>,
    virtual_nodes: HashMap<u32, VirtualNode>,
    pub(crate) source_radius: f64,
}

impl TriMesh {
    /// Build a mesh from node coordinates and triangle connectivity.
    ///
    /// # Parameters
    /// - `nodes`: vertex coordinates; the index is the node's identity
    /// - `triangles`: node-index triples
    /// - `nthreads`: number of independent per-thread state columns (>= 1)
    ///
    /// # Errors
    /// Returns an error if an element references a node out of range or the
    /// mesh is empty.
    pub fn new(nodes: Vec<Point2>, triangles: &[[u32; 3]], nthreads: usize) -> Result<Self> {
        let tagged: Vec<([u32; 3], i32)> = triangles.iter().map(|&i| (i, 0)).collect();
        Self::new_tagged(nodes, &tagged, nthreads)
    }

    /// Build a mesh from nodes and triangles carrying physical-entity tags.
    pub fn new_tagged(
        nodes: Vec<Point2>,
        triangles: &[([u32; 3], i32)],
        nthreads: usize,
    ) -> Result<Self> {
        validate_connectivity(nodes.len(), triangles.iter().map(|(i, _)| &i[..]))?;
        let mut store = NodeStore::new(nodes, nthreads);
        let elems: Vec<Triangle> = triangles
            .iter()
            .map(|&(i, pe)| Triangle::with_geometry(i, pe, &store.coords))
            .collect();
        for (c, tri) in elems.iter().enumerate() {
            for &n in &tri.i {
                store.push_owner(n, c as u32);
            }
        }
        let neighbors = build_neighbors(&store, elems.len());
        let mut mesh = TriMesh {
            store,
            triangles: elems,
            neighbors,
            virtual_nodes: HashMap::new(),
            source_radius: 0.0,
        };
        mesh.process_obtuse();
        Ok(mesh)
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.store.len()
    }

    /// Number of primary nodes (mesh vertices).
    pub fn n_primary_nodes(&self) -> usize {
        self.store.n_primary() as usize
    }

    /// Number of triangles.
    pub fn n_cells(&self) -> usize {
        self.triangles.len()
    }

    /// Node coordinate.
    pub fn node(&self, n: u32) -> Point2 {
        self.store.coord(n)
    }

    /// Slowness at a node.
    pub fn slowness_at(&self, n: u32) -> f64 {
        self.store.slowness_at(n)
    }

    /// Traveltime at a node for a thread.
    pub fn traveltime(&self, n: u32, thread: usize) -> f64 {
        self.store.traveltime(n, thread)
    }

    /// A triangle by index.
    pub fn triangle(&self, c: u32) -> &Triangle {
        &self.triangles[c as usize]
    }

    /// All triangles.
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Node indices of a cell (the neighbors table).
    pub fn neighbors(&self, cell: u32) -> &[u32] {
        &self.neighbors[cell as usize]
    }

    /// The virtual-node entry for a triangle, if the obtuse-processing pass
    /// created one.
    pub fn virtual_node(&self, cell: u32) -> Option<&VirtualNode> {
        self.virtual_nodes.get(&cell)
    }

    /// Number of virtual-node entries.
    pub fn n_virtual_nodes(&self) -> usize {
        self.virtual_nodes.len()
    }

    /// Smallest x over all nodes.
    pub fn x_min(&self) -> f64 {
        self.store.coords.iter().map(|p| p.x).fold(f64::INFINITY, f64::min)
    }

    /// Largest x over all nodes.
    pub fn x_max(&self) -> f64 {
        self.store.coords.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max)
    }

    /// Smallest z over all nodes.
    pub fn z_min(&self) -> f64 {
        self.store.coords.iter().map(|p| p.z).fold(f64::INFINITY, f64::min)
    }

    /// Largest z over all nodes.
    pub fn z_max(&self) -> f64 {
        self.store.coords.iter().map(|p| p.z).fold(f64::NEG_INFINITY, f64::max)
    }

    /// Set a uniform slowness on every node.
    pub fn set_slowness_uniform(&mut self, s: f64) -> Result<()> {
        self.store.set_slowness_uniform(s)
    }

    /// Set per-node slowness; the vector length must match the node count.
    pub fn set_slowness(&mut self, s: &[f64]) -> Result<()> {
        self.store.set_slowness_vec(s)
    }

    /// Set the source seeding radius (0 disables radius seeding).
    pub fn set_source_radius(&mut self, r: f64) -> Result<()> {
        if r < 0.0 || !r.is_finite() {
            return Err(RaytraceError::NegativeSourceRadius(r));
        }
        self.source_radius = r;
        Ok(())
    }

    /// Index of the cell containing `p`, by linear scan.
    pub fn cell_of(&self, p: Point2) -> Option<u32> {
        for (c, tri) in self.triangles.iter().enumerate() {
            let a = self.store.coord(tri.i[0]);
            let b = self.store.coord(tri.i[1]);
            let cc = self.store.coord(tri.i[2]);
            if inside_triangle_2d(p, a, b, cc) {
                return Some(c as u32);
            }
        }
        None
    }

    /// Verify that every point lies on a node or inside a cell.
    pub fn check_points(&self, pts: &[Point2]) -> Result<()> {
        for (index, p) in pts.iter().enumerate() {
            if self.store.find_coincident(p).is_none() && self.cell_of(*p).is_none() {
                return Err(RaytraceError::PointOutsideMesh {
                    index,
                    coord: p.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Interpolated slowness at an off-node point inside `cell`.
    pub fn compute_slowness(&self, p: Point2, cell: u32) -> f64 {
        let samples: Vec<(Point2, f64)> = self
            .neighbors(cell)
            .iter()
            .filter(|&&n| self.store.is_primary(n))
            .map(|&n| (self.store.coord(n), self.store.slowness_at(n)))
            .collect();
        interp::inverse_distance(&p, &samples)
    }

    /// Traveltime at an arbitrary receiver point: the node value when `rx`
    /// is a node, otherwise the minimum over the containing cell's vertices
    /// of T(v) plus a slowness-averaged leg to `rx`.
    pub fn traveltime_at(&self, rx: Point2, thread: usize) -> f64 {
        if let Some(n) = self.store.find_coincident(&rx) {
            return self.store.traveltime(n, thread);
        }
        let cell = match self.cell_of(rx) {
            Some(c) => c,
            None => return f64::INFINITY,
        };
        let slo = self.compute_slowness(rx, cell);
        let mut best = f64::INFINITY;
        for &v in self.neighbors(cell) {
            let dt = 0.5 * (slo + self.store.slowness_at(v)) * self.store.coord(v).distance(rx);
            let t = self.store.traveltime(v, thread) + dt;
            if t < best {
                best = t;
            }
        }
        best
    }

    /// The two-ring node star around a cell: the cell's nodes plus every node
    /// of every cell owning one of them, deduplicated.
    pub fn neighbor_star(&self, cell: u32) -> Vec<u32> {
        let mut star = Vec::new();
        for &n in self.neighbors(cell) {
            star.push(n);
            for &oc in self.store.owners(n) {
                star.extend_from_slice(self.neighbors(oc));
            }
        }
        star.sort_unstable();
        star.dedup();
        star
    }

    /// Snap points onto the mesh: each point moves to the plane of its
    /// closest triangle (by centroid distance) via barycentric projection.
    pub fn project_points(&self, pts: &mut [Point2]) {
        let lift = |p: Point2| Point3::new(p.x, 0.0, p.z);
        let centroids: Vec<Point2> = self
            .triangles
            .iter()
            .map(|t| {
                (self.store.coord(t.i[0]) + self.store.coord(t.i[1]) + self.store.coord(t.i[2]))
                    / 3.0
            })
            .collect();
        for p in pts.iter_mut() {
            let mut i_min = 0;
            let mut d_min = p.distance(centroids[0]);
            for (i, c) in centroids.iter().enumerate().skip(1) {
                let d = p.distance(*c);
                if d < d_min {
                    d_min = d;
                    i_min = i;
                }
            }
            let t = &self.triangles[i_min];
            let q = project_to_triangle(
                lift(*p),
                lift(self.store.coord(t.i[0])),
                lift(self.store.coord(t.i[1])),
                lift(self.store.coord(t.i[2])),
            );
            *p = Point2::new(q.x, q.z);
        }
    }

    /// Reset one thread's traveltimes and predecessors.
    pub fn reinit(&self, thread: usize) {
        self.store.reinit(thread);
    }

    /// Average slowness over a cell's vertices.
    pub(crate) fn cell_slowness(&self, cell: u32) -> f64 {
        let nn = self.neighbors(cell);
        nn.iter().map(|&n| self.store.slowness_at(n)).sum::<f64>() / nn.len() as f64
    }

    /// Precompute unfolded supports for every triangle with an obtuse
    /// interior angle, by adopting a vertex of the neighbor across the edge
    /// opposite the obtuse vertex. Edge triangles with no neighbor are left
    /// uncorrected and fall back to the edge-limited update.
    fn process_obtuse(&mut self) {
        for ntri in 0..self.triangles.len() as u32 {
            for n in 0..3 {
                if self.triangles[ntri as usize].a[n] <= FRAC_PI_2 {
                    continue;
                }
                let i0 = self.triangles[ntri as usize].i[n];
                let i1 = self.triangles[ntri as usize].i[(n + 1) % 3];
                let i2 = self.triangles[ntri as usize].i[(n + 2) % 3];

                let opposite = shared_owners(&self.store, i1, i2, Some(ntri));
                let opposite = match opposite.first() {
                    Some(&c) => c,
                    None => continue,
                };

                // the opposite triangle's vertex distinct from the shared edge
                let i3 = match self.triangles[opposite as usize]
                    .i
                    .iter()
                    .copied()
                    .find(|&v| v != i1 && v != i2)
                {
                    Some(v) => v,
                    None => continue,
                };

                let d = |m: u32, n2: u32| self.store.coord(m).distance(self.store.coord(n2));

                // keep i1 and try replacing i2 with i3
                let mut node1 = i1;
                let mut node2 = i3;
                let mut a = d(i1, i3);
                let mut b = d(i0, i3);
                let mut c = d(i0, i1);
                let mut a0 = law_of_cosines(b, c, a);

                if a0 > FRAC_PI_2 {
                    // still obtuse: replace i1 instead of i2 with i3
                    node1 = i3;
                    node2 = i2;
                    a = d(i2, i3);
                    b = d(i0, i2);
                    c = d(i0, i3);
                    a0 = law_of_cosines(b, c, a);
                }

                let vn = VirtualNode {
                    node1,
                    node2,
                    a: [a0, law_of_cosines(c, a, b), law_of_cosines(a, b, c)],
                    e: [a, b, c],
                };
                self.virtual_nodes.insert(ntri, vn);
            }
        }
    }
}

/// An unstructured tetrahedral mesh with a node-attached slowness field,
/// ready for fast-marching traveltime computation.
pub struct TetMesh {
    pub(crate) store: NodeStore<Point3>,
    tetrahedra: Vec<Tetrahedron>,
    neighbors: Vec<Vec<u32>>,
    pub(crate) source_radius: f64,
}

impl TetMesh {
    /// Build a mesh from node coordinates and tetrahedron connectivity.
    ///
    /// # Errors
    /// Returns an error if an element references a node out of range or the
    /// mesh is empty.
    pub fn new(nodes: Vec<Point3>, tetrahedra: &[[u32; 4]], nthreads: usize) -> Result<Self> {
        let tagged: Vec<([u32; 4], i32)> = tetrahedra.iter().map(|&i| (i, 0)).collect();
        Self::new_tagged(nodes, &tagged, nthreads)
    }

    /// Build a mesh from nodes and tetrahedra carrying physical-entity tags.
    pub fn new_tagged(
        nodes: Vec<Point3>,
        tetrahedra: &[([u32; 4], i32)],
        nthreads: usize,
    ) -> Result<Self> {
        validate_connectivity(nodes.len(), tetrahedra.iter().map(|(i, _)| &i[..]))?;
        let mut store = NodeStore::new(nodes, nthreads);
        let elems: Vec<Tetrahedron> = tetrahedra
            .iter()
            .map(|&(i, pe)| Tetrahedron::with_geometry(i, pe, &store.coords))
            .collect();
        for (c, tet) in elems.iter().enumerate() {
            for &n in &tet.i {
                store.push_owner(n, c as u32);
            }
        }
        let neighbors = build_neighbors(&store, elems.len());
        Ok(TetMesh {
            store,
            tetrahedra: elems,
            neighbors,
            source_radius: 0.0,
        })
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.store.len()
    }

    /// Number of primary nodes (mesh vertices).
    pub fn n_primary_nodes(&self) -> usize {
        self.store.n_primary() as usize
    }

    /// Number of tetrahedra.
    pub fn n_cells(&self) -> usize {
        self.tetrahedra.len()
    }

    /// Node coordinate.
    pub fn node(&self, n: u32) -> Point3 {
        self.store.coord(n)
    }

    /// Slowness at a node.
    pub fn slowness_at(&self, n: u32) -> f64 {
        self.store.slowness_at(n)
    }

    /// Traveltime at a node for a thread.
    pub fn traveltime(&self, n: u32, thread: usize) -> f64 {
        self.store.traveltime(n, thread)
    }

    /// A tetrahedron by index.
    pub fn tetrahedron(&self, c: u32) -> &Tetrahedron {
        &self.tetrahedra[c as usize]
    }

    /// All tetrahedra.
    pub fn tetrahedra(&self) -> &[Tetrahedron] {
        &self.tetrahedra
    }

    /// Node indices of a cell (the neighbors table).
    pub fn neighbors(&self, cell: u32) -> &[u32] {
        &self.neighbors[cell as usize]
    }

    /// Set a uniform slowness on every node.
    pub fn set_slowness_uniform(&mut self, s: f64) -> Result<()> {
        self.store.set_slowness_uniform(s)
    }

    /// Set per-node slowness; the vector length must match the node count.
    pub fn set_slowness(&mut self, s: &[f64]) -> Result<()> {
        self.store.set_slowness_vec(s)
    }

    /// Set the source seeding radius (0 disables radius seeding).
    pub fn set_source_radius(&mut self, r: f64) -> Result<()> {
        if r < 0.0 || !r.is_finite() {
            return Err(RaytraceError::NegativeSourceRadius(r));
        }
        self.source_radius = r;
        Ok(())
    }

    /// Index of the cell containing `p`, by linear scan.
    pub fn cell_of(&self, p: Point3) -> Option<u32> {
        for (c, tet) in self.tetrahedra.iter().enumerate() {
            let v: Vec<Point3> = tet.i.iter().map(|&n| self.store.coord(n)).collect();
            if inside_tet(p, v[0], v[1], v[2], v[3]) {
                return Some(c as u32);
            }
        }
        None
    }

    /// Verify that every point lies on a node or inside a cell.
    pub fn check_points(&self, pts: &[Point3]) -> Result<()> {
        for (index, p) in pts.iter().enumerate() {
            if self.store.find_coincident(p).is_none() && self.cell_of(*p).is_none() {
                return Err(RaytraceError::PointOutsideMesh {
                    index,
                    coord: p.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Interpolated slowness at an off-node point inside `cell`.
    pub fn compute_slowness(&self, p: Point3, cell: u32) -> f64 {
        let samples: Vec<(Point3, f64)> = self
            .neighbors(cell)
            .iter()
            .filter(|&&n| self.store.is_primary(n))
            .map(|&n| (self.store.coord(n), self.store.slowness_at(n)))
            .collect();
        interp::inverse_distance(&p, &samples)
    }

    /// Traveltime at an arbitrary receiver point (see [`TriMesh::traveltime_at`]).
    pub fn traveltime_at(&self, rx: Point3, thread: usize) -> f64 {
        if let Some(n) = self.store.find_coincident(&rx) {
            return self.store.traveltime(n, thread);
        }
        let cell = match self.cell_of(rx) {
            Some(c) => c,
            None => return f64::INFINITY,
        };
        let slo = self.compute_slowness(rx, cell);
        let mut best = f64::INFINITY;
        for &v in self.neighbors(cell) {
            let dt = 0.5 * (slo + self.store.slowness_at(v)) * self.store.coord(v).distance(rx);
            let t = self.store.traveltime(v, thread) + dt;
            if t < best {
                best = t;
            }
        }
        best
    }

    /// The two-ring node star around a cell (see [`TriMesh::neighbor_star`]).
    pub fn neighbor_star(&self, cell: u32) -> Vec<u32> {
        let mut star = Vec::new();
        for &n in self.neighbors(cell) {
            star.push(n);
            for &oc in self.store.owners(n) {
                star.extend_from_slice(self.neighbors(oc));
            }
        }
        star.sort_unstable();
        star.dedup();
        star
    }

    /// Reset one thread's traveltimes and predecessors.
    pub fn reinit(&self, thread: usize) {
        self.store.reinit(thread);
    }

    /// Average slowness over a cell's vertices.
    pub(crate) fn cell_slowness(&self, cell: u32) -> f64 {
        let nn = self.neighbors(cell);
        nn.iter().map(|&n| self.store.slowness_at(n)).sum::<f64>() / nn.len() as f64
    }
}

/// Cells sharing the edge (i0, i1), excluding `exclude`.
pub(crate) fn cells_on_edge_2d(mesh: &TriMesh, i0: u32, i1: u32, exclude: Option<u32>) -> Vec<u32> {
    shared_owners(&mesh.store, i0, i1, exclude)
}

/// Cells sharing the face (i0, i1, i2), excluding `exclude`.
pub(crate) fn cells_on_face_3d(
    mesh: &TetMesh,
    face: [u32; 3],
    exclude: Option<u32>,
) -> Vec<u32> {
    let mut out = Vec::new();
    for &c in mesh.store.owners(face[0]) {
        if Some(c) != exclude
            && mesh.store.owners(face[1]).contains(&c)
            && mesh.store.owners(face[2]).contains(&c)
        {
            out.push(c);
        }
    }
    out
}

fn validate_connectivity<'a>(
    n_nodes: usize,
    elements: impl Iterator<Item = &'a [u32]>,
) -> Result<()> {
    if n_nodes == 0 {
        return Err(RaytraceError::InvalidMesh {
            reason: "mesh has no nodes".to_string(),
        });
    }
    let mut n_elems = 0usize;
    for (c, elem) in elements.enumerate() {
        n_elems += 1;
        for &n in elem {
            if n as usize >= n_nodes {
                return Err(RaytraceError::InvalidMesh {
                    reason: format!(
                        "element {} references node {} but the mesh has {} nodes",
                        c, n, n_nodes
                    ),
                });
            }
        }
    }
    if n_elems == 0 {
        return Err(RaytraceError::InvalidMesh {
            reason: "mesh has no elements".to_string(),
        });
    }
    Ok(())
}

/// Index the nodes common to each cell from the owner lists.
fn build_neighbors<P: Coord>(store: &NodeStore<P>, n_cells: usize) -> Vec<Vec<u32>> {
    let mut neighbors: Vec<Vec<u32>> = vec![Vec::new(); n_cells];
    for n in 0..store.len() as u32 {
        for &c in store.owners(n) {
            neighbors[c as usize].push(n);
        }
    }
    neighbors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> TriMesh {
        let nodes = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        TriMesh::new(nodes, &[[0, 1, 2], [0, 2, 3]], 1).unwrap()
    }

    fn unit_tet() -> TetMesh {
        let nodes = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ];
        TetMesh::new(nodes, &[[0, 1, 2, 3]], 1).unwrap()
    }

    #[test]
    fn owners_and_neighbors() {
        let mesh = unit_square();
        assert_eq!(mesh.n_nodes(), 4);
        assert_eq!(mesh.n_cells(), 2);
        // node 0 and node 2 belong to both triangles
        assert_eq!(mesh.store.owners(0), &[0, 1]);
        assert_eq!(mesh.store.owners(2), &[0, 1]);
        assert_eq!(mesh.store.owners(1), &[0]);
        assert_eq!(mesh.neighbors(0), &[0, 1, 2]);
        assert_eq!(mesh.neighbors(1), &[0, 2, 3]);
    }

    #[test]
    fn triangle_geometry_consistent() {
        let mesh = unit_square();
        for tri in mesh.triangles() {
            // angles sum to pi
            let sum: f64 = tri.a.iter().sum();
            assert!((sum - std::f64::consts::PI).abs() < 1e-12);
            // edge lengths match vertex coordinates
            for k in 0..3 {
                let p = mesh.node(tri.i[(k + 1) % 3]);
                let q = mesh.node(tri.i[(k + 2) % 3]);
                assert!((tri.l[k] - p.distance(q)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn tet_geometry_consistent() {
        let mesh = unit_tet();
        let tet = mesh.tetrahedron(0);
        assert!((tet.edge(0, 1) - 1.0).abs() < 1e-12);
        assert!((tet.edge(1, 2) - 2.0_f64.sqrt()).abs() < 1e-12);
        for f in 0..4 {
            let sum: f64 = tet.face_a[f].iter().sum();
            assert!((sum - std::f64::consts::PI).abs() < 1e-12);
        }
    }

    #[test]
    fn cell_of_finds_containing_triangle() {
        let mesh = unit_square();
        assert_eq!(mesh.cell_of(Point2::new(0.75, 0.25)), Some(0));
        assert_eq!(mesh.cell_of(Point2::new(0.25, 0.75)), Some(1));
        assert_eq!(mesh.cell_of(Point2::new(1.5, 0.5)), None);
    }

    #[test]
    fn check_points_rejects_outside() {
        let mesh = unit_square();
        assert!(mesh.check_points(&[Point2::new(0.5, 0.5)]).is_ok());
        let err = mesh.check_points(&[Point2::new(2.0, 2.0)]).unwrap_err();
        assert!(matches!(
            err,
            RaytraceError::PointOutsideMesh { index: 0, .. }
        ));
    }

    #[test]
    fn slowness_setters_validate() {
        let mut mesh = unit_square();
        mesh.set_slowness_uniform(2.0).unwrap();
        assert_eq!(mesh.slowness_at(3), 2.0);

        let err = mesh.set_slowness(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            RaytraceError::SlownessSizeMismatch {
                expected: 4,
                got: 2
            }
        ));

        let err = mesh.set_slowness(&[1.0, 2.0, -1.0, 1.0]).unwrap_err();
        assert!(matches!(
            err,
            RaytraceError::InvalidSlowness { index: 2, .. }
        ));
    }

    #[test]
    fn acute_mesh_has_no_virtual_nodes() {
        let mesh = unit_square();
        assert_eq!(mesh.n_virtual_nodes(), 0);
    }

    #[test]
    fn obtuse_triangle_gets_virtual_node() {
        // triangle 0 is sharply obtuse at node 2; triangle 1 provides the
        // unfolded support across the shared edge (0, 1)
        let nodes = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(5.0, 0.1),
            Point2::new(5.0, -5.0),
        ];
        let mesh = TriMesh::new(nodes, &[[0, 1, 2], [0, 1, 3]], 1).unwrap();
        assert_eq!(mesh.n_virtual_nodes(), 1);
        let vn = mesh.virtual_node(0).expect("entry for obtuse triangle");
        // the adopted vertex is triangle 1's third node
        assert!(vn.node1 == 3 || vn.node2 == 3);
        // support triangle is acute at the update vertex
        assert!(vn.a[0] <= FRAC_PI_2);
        // cached side lengths agree with the node coordinates
        let c = mesh.node(2);
        let p1 = mesh.node(vn.node1);
        let p2 = mesh.node(vn.node2);
        assert!((vn.e[0] - p1.distance(p2)).abs() < 1e-12);
        assert!((vn.e[1] - c.distance(p2)).abs() < 1e-12);
        assert!((vn.e[2] - c.distance(p1)).abs() < 1e-12);
    }

    #[test]
    fn obtuse_boundary_triangle_left_uncorrected() {
        let nodes = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(5.0, 0.1),
        ];
        let mesh = TriMesh::new(nodes, &[[0, 1, 2]], 1).unwrap();
        assert_eq!(mesh.n_virtual_nodes(), 0);
    }

    #[test]
    fn traveltime_at_node_is_exact() {
        let mesh = unit_square();
        mesh.store.set_traveltime(2, 0, 1.5);
        assert_eq!(mesh.traveltime_at(Point2::new(1.0, 1.0), 0), 1.5);
    }

    #[test]
    fn traveltime_at_interior_point_bounded() {
        let mut mesh = unit_square();
        mesh.set_slowness_uniform(1.0).unwrap();
        for n in 0..4 {
            mesh.store.set_traveltime(n, 0, 1.0);
        }
        let t = mesh.traveltime_at(Point2::new(0.6, 0.3), 0);
        // 1.0 plus a positive leg, bounded by 1.0 + diagonal
        assert!(t > 1.0 && t < 1.0 + 2.0_f64.sqrt());
    }

    #[test]
    fn reinit_restores_infinity() {
        let mesh = unit_square();
        mesh.store.set_traveltime(1, 0, 0.25);
        mesh.store.set_parents(1, 0, 0, 0);
        mesh.reinit(0);
        assert!(mesh.traveltime(1, 0).is_infinite());
        assert_eq!(mesh.store.parents(1, 0), (NO_PARENT, NO_PARENT));
    }

    #[test]
    fn invalid_connectivity_rejected() {
        let nodes = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)];
        let err = TriMesh::new(nodes, &[[0, 1, 7]], 1).unwrap_err();
        assert!(matches!(err, RaytraceError::InvalidMesh { .. }));

        let err = TriMesh::new(vec![], &[], 1).unwrap_err();
        assert!(matches!(err, RaytraceError::InvalidMesh { .. }));
    }

    #[test]
    fn negative_source_radius_rejected() {
        let mut mesh = unit_square();
        assert!(matches!(
            mesh.set_source_radius(-1.0),
            Err(RaytraceError::NegativeSourceRadius(_))
        ));
        mesh.set_source_radius(0.5).unwrap();
    }

    #[test]
    fn project_points_snaps_to_plane() {
        let mesh = unit_square();
        let mut pts = [Point2::new(0.3, 0.2)];
        mesh.project_points(&mut pts);
        // already in-plane points stay put
        assert!(pts[0].close_to(Point2::new(0.3, 0.2), 1e-12));
    }

    #[test]
    fn tet_cell_of_and_slowness() {
        let mut mesh = unit_tet();
        mesh.set_slowness_uniform(2.0).unwrap();
        assert_eq!(mesh.cell_of(Point3::new(0.1, 0.1, 0.1)), Some(0));
        assert_eq!(mesh.cell_of(Point3::new(1.0, 1.0, 1.0)), None);
        let s = mesh.compute_slowness(Point3::new(0.1, 0.1, 0.1), 0);
        assert!((s - 2.0).abs() < 1e-12);
    }

    #[test]
    fn extents() {
        let mesh = unit_square();
        assert_eq!(mesh.x_min(), 0.0);
        assert_eq!(mesh.x_max(), 1.0);
        assert_eq!(mesh.z_min(), 0.0);
        assert_eq!(mesh.z_max(), 1.0);
    }
}
