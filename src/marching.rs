// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Fast-marching propagation: narrow-band heap, source seeding, and the
//! `raytrace` facade on both mesh types.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use log::debug;

use crate::error::{RaytraceError, Result};
use crate::geometry::{Coord, Point2, Point3};
use crate::local;
use crate::mesh::{NodeStore, TetMesh, TriMesh};
use crate::raypath;

/// One tentative entry of the narrow band. Entries are compared by
/// traveltime only; the heap is a min-heap with lazy deletion, so a node may
/// appear more than once and stale entries are skipped on pop.
struct BandEntry {
    tt: f64,
    node: u32,
}

impl PartialEq for BandEntry {
    fn eq(&self, other: &Self) -> bool {
        self.tt == other.tt && self.node == other.node
    }
}

impl Eq for BandEntry {}

impl PartialOrd for BandEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for BandEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed so BinaryHeap pops the smallest traveltime first
        other
            .tt
            .partial_cmp(&self.tt)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// The min-priority narrow band of tentative nodes.
pub(crate) struct NarrowBand {
    heap: BinaryHeap<BandEntry>,
}

impl NarrowBand {
    fn new() -> Self {
        NarrowBand {
            heap: BinaryHeap::new(),
        }
    }

    fn push(&mut self, tt: f64, node: u32) {
        self.heap.push(BandEntry { tt, node });
    }

    fn pop(&mut self) -> Option<(f64, u32)> {
        self.heap.pop().map(|e| (e.tt, e.node))
    }
}

/// The seam between the dimension-agnostic engine and the two mesh types.
pub(crate) trait MarchMesh {
    /// Point type of the mesh.
    type Point: Coord;

    fn store(&self) -> &NodeStore<Self::Point>;
    fn neighbors_of(&self, cell: u32) -> &[u32];
    fn cell_containing(&self, p: &Self::Point) -> Option<u32>;
    /// Average slowness over a cell's vertices.
    fn cell_slowness_avg(&self, cell: u32) -> f64;
    /// Interpolated slowness at an off-node point inside `cell`.
    fn slowness_near(&self, p: &Self::Point, cell: u32) -> f64;
    fn source_radius(&self) -> f64;
    /// Run the local eikonal solver for one vertex.
    fn local_update(&self, vertex: u32, thread: usize);
}

impl MarchMesh for TriMesh {
    type Point = Point2;

    fn store(&self) -> &NodeStore<Point2> {
        &self.store
    }

    fn neighbors_of(&self, cell: u32) -> &[u32] {
        self.neighbors(cell)
    }

    fn cell_containing(&self, p: &Point2) -> Option<u32> {
        self.cell_of(*p)
    }

    fn cell_slowness_avg(&self, cell: u32) -> f64 {
        self.cell_slowness(cell)
    }

    fn slowness_near(&self, p: &Point2, cell: u32) -> f64 {
        self.compute_slowness(*p, cell)
    }

    fn source_radius(&self) -> f64 {
        self.source_radius
    }

    fn local_update(&self, vertex: u32, thread: usize) {
        local::update_triangle_vertex(self, vertex, thread);
    }
}

impl MarchMesh for TetMesh {
    type Point = Point3;

    fn store(&self) -> &NodeStore<Point3> {
        &self.store
    }

    fn neighbors_of(&self, cell: u32) -> &[u32] {
        self.neighbors(cell)
    }

    fn cell_containing(&self, p: &Point3) -> Option<u32> {
        self.cell_of(*p)
    }

    fn cell_slowness_avg(&self, cell: u32) -> f64 {
        self.cell_slowness(cell)
    }

    fn slowness_near(&self, p: &Point3, cell: u32) -> f64 {
        self.compute_slowness(*p, cell)
    }

    fn source_radius(&self) -> f64 {
        self.source_radius
    }

    fn local_update(&self, vertex: u32, thread: usize) {
        local::update_tet_vertex(self, vertex, thread);
    }
}

/// Seed the narrow band from the source list: coincident-node sources take
/// t0 directly; in-cell sources relax the containing cell's vertices; a
/// positive source radius (single source only) relaxes every node within it.
fn init_band<M: MarchMesh>(
    mesh: &M,
    tx: &[M::Point],
    t0: &[f64],
    band: &mut NarrowBand,
    in_band: &mut [bool],
    frozen: &mut [bool],
    thread: usize,
) -> Result<()> {
    let store = mesh.store();
    let radius = mesh.source_radius();

    for (ns, txp) in tx.iter().enumerate() {
        if let Some(nn) = store.find_coincident(txp) {
            store.set_traveltime(nn, thread, t0[ns]);
            band.push(t0[ns], nn);
            in_band[nn as usize] = true;
            frozen[nn as usize] = true;

            if tx.len() != 1 {
                continue;
            }
            if radius == 0.0 {
                // relax the direct neighbors right away, freezing them too
                for &cell in store.owners(nn) {
                    for &neib in mesh.neighbors_of(cell) {
                        if neib == nn {
                            continue;
                        }
                        let dt = 0.5
                            * (store.slowness_at(nn) + store.slowness_at(neib))
                            * store.coord(nn).dist(&store.coord(neib));
                        if t0[ns] + dt < store.traveltime(neib, thread) {
                            store.set_traveltime(neib, thread, t0[ns] + dt);
                            store.set_parents(neib, thread, nn, cell);
                            if !in_band[neib as usize] {
                                band.push(t0[ns] + dt, neib);
                                in_band[neib as usize] = true;
                                frozen[neib as usize] = true;
                            }
                        }
                    }
                }
            } else {
                // average slowness of the cells touching the source node
                let owners = store.owners(nn);
                let slown = owners
                    .iter()
                    .map(|&c| mesh.cell_slowness_avg(c))
                    .sum::<f64>()
                    / owners.len() as f64;
                let mut added = 0usize;
                for no in 0..store.len() as u32 {
                    if no == nn {
                        continue;
                    }
                    let d = store.coord(nn).dist(&store.coord(no));
                    if d <= radius {
                        let dt = d * slown;
                        if t0[ns] + dt < store.traveltime(no, thread) {
                            store.set_traveltime(no, thread, t0[ns] + dt);
                            store.set_parents(no, thread, nn, crate::mesh::NO_PARENT);
                            if !in_band[no as usize] {
                                band.push(t0[ns] + dt, no);
                                in_band[no as usize] = true;
                                frozen[no as usize] = true;
                                added += 1;
                            }
                        }
                    }
                }
                debug!("found {} nodes around Tx point", added);
            }
        } else {
            let cell = match mesh.cell_containing(txp) {
                Some(c) => c,
                None => {
                    return Err(RaytraceError::PointOutsideMesh {
                        index: ns,
                        coord: txp.to_vec(),
                    })
                }
            };
            if radius == 0.0 || tx.len() != 1 {
                // relax every vertex of the containing cell
                let slo = mesh.slowness_near(txp, cell);
                for &neib in mesh.neighbors_of(cell) {
                    let dt = 0.5
                        * (slo + store.slowness_at(neib))
                        * store.coord(neib).dist(txp);
                    if t0[ns] + dt < store.traveltime(neib, thread) {
                        store.set_traveltime(neib, thread, t0[ns] + dt);
                        store.set_parents(neib, thread, crate::mesh::NO_PARENT, cell);
                        if !in_band[neib as usize] {
                            band.push(t0[ns] + dt, neib);
                            in_band[neib as usize] = true;
                            frozen[neib as usize] = true;
                        }
                    }
                }
            } else {
                // look inside the source radius, with the containing cell's
                // average slowness
                let slown = mesh.cell_slowness_avg(cell);
                let mut added = 0usize;
                for no in 0..store.len() as u32 {
                    let d = store.coord(no).dist(txp);
                    if d <= radius {
                        let dt = d * slown;
                        if t0[ns] + dt < store.traveltime(no, thread) {
                            store.set_traveltime(no, thread, t0[ns] + dt);
                            store.set_parents(no, thread, crate::mesh::NO_PARENT, cell);
                            if !in_band[no as usize] {
                                band.push(t0[ns] + dt, no);
                                in_band[no as usize] = true;
                                frozen[no as usize] = true;
                                added += 1;
                            }
                        }
                    }
                }
                if added == 0 {
                    return Err(RaytraceError::EmptySourceRadius { radius });
                }
                debug!("found {} nodes around Tx point", added);
            }
        }
    }
    Ok(())
}

/// Drain the narrow band: pop the earliest tentative node, freeze it, and
/// relax the not-yet-frozen vertices of every cell it belongs to.
fn propagate<M: MarchMesh>(
    mesh: &M,
    band: &mut NarrowBand,
    in_band: &mut [bool],
    frozen: &mut [bool],
    thread: usize,
) {
    let store = mesh.store();
    while let Some((_, src)) = band.pop() {
        if !in_band[src as usize] {
            continue; // stale entry
        }
        in_band[src as usize] = false;
        frozen[src as usize] = true;

        for &cell in store.owners(src) {
            for &v in mesh.neighbors_of(cell) {
                if v == src || frozen[v as usize] {
                    continue;
                }
                let before = store.traveltime(v, thread);
                mesh.local_update(v, thread);
                let after = store.traveltime(v, thread);
                if !in_band[v as usize] {
                    band.push(after, v);
                    in_band[v as usize] = true;
                } else if after < before {
                    band.push(after, v);
                }
            }
        }
    }
}

/// Validate inputs, reset the thread column, and run seeding + propagation.
fn solve<M: MarchMesh>(mesh: &M, tx: &[M::Point], t0: &[f64], thread: usize) -> Result<()> {
    let store = mesh.store();
    if thread >= store.n_threads() {
        return Err(RaytraceError::ThreadOutOfRange {
            thread,
            nthreads: store.n_threads(),
        });
    }
    if tx.len() != t0.len() {
        return Err(RaytraceError::InputSizeMismatch {
            what: "source and t0 vectors",
            expected: tx.len(),
            got: t0.len(),
        });
    }
    store.reinit(thread);

    let mut band = NarrowBand::new();
    let mut in_band = vec![false; store.len()];
    let mut frozen = vec![false; store.len()];
    init_band(mesh, tx, t0, &mut band, &mut in_band, &mut frozen, thread)?;
    propagate(mesh, &mut band, &mut in_band, &mut frozen, thread);
    Ok(())
}

fn check_tx_rx<M: MarchMesh>(mesh: &M, tx: &[M::Point], rx_lists: &[&[M::Point]]) -> Result<()>
where
    M: CheckPoints,
{
    mesh.check_pts(tx)?;
    for rx in rx_lists {
        mesh.check_pts(rx)?;
    }
    Ok(())
}

/// Point-validation seam shared by the facade methods.
pub(crate) trait CheckPoints: MarchMesh {
    fn check_pts(&self, pts: &[Self::Point]) -> Result<()>;
}

impl CheckPoints for TriMesh {
    fn check_pts(&self, pts: &[Point2]) -> Result<()> {
        self.check_points(pts)
    }
}

impl CheckPoints for TetMesh {
    fn check_pts(&self, pts: &[Point3]) -> Result<()> {
        self.check_points(pts)
    }
}

impl TriMesh {
    /// Compute traveltimes from the sources `(tx, t0)` to every receiver.
    ///
    /// # Parameters
    /// - `tx`: source points (all inside the mesh)
    /// - `t0`: prescribed arrival time of each source
    /// - `rx`: receiver points (all inside the mesh)
    /// - `thread`: per-thread state column to use, `< nthreads`
    ///
    /// # Errors
    /// Returns an error on invalid inputs (§ error module); partial ray-path
    /// failures do not occur here since no paths are traced.
    pub fn raytrace(
        &self,
        tx: &[Point2],
        t0: &[f64],
        rx: &[Point2],
        thread: usize,
    ) -> Result<Vec<f64>> {
        check_tx_rx(self, tx, &[rx])?;
        solve(self, tx, t0, thread)?;
        Ok(rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
    }

    /// Compute traveltimes and ray paths from the sources to every receiver.
    ///
    /// Each path is a polyline from the receiver back to a source. A
    /// receiver whose path cannot be traced keeps a valid traveltime and
    /// gets a single-point path `[rx]`.
    pub fn raytrace_with_paths(
        &self,
        tx: &[Point2],
        t0: &[f64],
        rx: &[Point2],
        thread: usize,
    ) -> Result<(Vec<f64>, Vec<Vec<Point2>>)> {
        check_tx_rx(self, tx, &[rx])?;
        solve(self, tx, t0, thread)?;
        let tt = rx.iter().map(|&r| self.traveltime_at(r, thread)).collect();
        let paths = rx
            .iter()
            .map(|&r| raypath::trace_2d(self, tx, r, thread))
            .collect();
        Ok((tt, paths))
    }

    /// Compute traveltimes for several receiver lists in one propagation.
    pub fn raytrace_multi(
        &self,
        tx: &[Point2],
        t0: &[f64],
        rx_lists: &[Vec<Point2>],
        thread: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let lists: Vec<&[Point2]> = rx_lists.iter().map(|l| l.as_slice()).collect();
        check_tx_rx(self, tx, &lists)?;
        solve(self, tx, t0, thread)?;
        Ok(rx_lists
            .iter()
            .map(|rx| rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
            .collect())
    }

    /// Compute traveltimes and ray paths for several receiver lists in one
    /// propagation.
    #[allow(clippy::type_complexity)]
    pub fn raytrace_multi_with_paths(
        &self,
        tx: &[Point2],
        t0: &[f64],
        rx_lists: &[Vec<Point2>],
        thread: usize,
    ) -> Result<(Vec<Vec<f64>>, Vec<Vec<Vec<Point2>>>)> {
        let lists: Vec<&[Point2]> = rx_lists.iter().map(|l| l.as_slice()).collect();
        check_tx_rx(self, tx, &lists)?;
        solve(self, tx, t0, thread)?;
        let tt = rx_lists
            .iter()
            .map(|rx| rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
            .collect();
        let paths = rx_lists
            .iter()
            .map(|rx| {
                rx.iter()
                    .map(|&r| raypath::trace_2d(self, tx, r, thread))
                    .collect()
            })
            .collect();
        Ok((tt, paths))
    }
}

impl TetMesh {
    /// Compute traveltimes from the sources `(tx, t0)` to every receiver.
    /// See [`TriMesh::raytrace`].
    pub fn raytrace(
        &self,
        tx: &[Point3],
        t0: &[f64],
        rx: &[Point3],
        thread: usize,
    ) -> Result<Vec<f64>> {
        check_tx_rx(self, tx, &[rx])?;
        solve(self, tx, t0, thread)?;
        Ok(rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
    }

    /// Compute traveltimes and ray paths from the sources to every receiver.
    /// See [`TriMesh::raytrace_with_paths`].
    pub fn raytrace_with_paths(
        &self,
        tx: &[Point3],
        t0: &[f64],
        rx: &[Point3],
        thread: usize,
    ) -> Result<(Vec<f64>, Vec<Vec<Point3>>)> {
        check_tx_rx(self, tx, &[rx])?;
        solve(self, tx, t0, thread)?;
        let tt = rx.iter().map(|&r| self.traveltime_at(r, thread)).collect();
        let paths = rx
            .iter()
            .map(|&r| raypath::trace_3d(self, tx, r, thread))
            .collect();
        Ok((tt, paths))
    }

    /// Compute traveltimes for several receiver lists in one propagation.
    pub fn raytrace_multi(
        &self,
        tx: &[Point3],
        t0: &[f64],
        rx_lists: &[Vec<Point3>],
        thread: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let lists: Vec<&[Point3]> = rx_lists.iter().map(|l| l.as_slice()).collect();
        check_tx_rx(self, tx, &lists)?;
        solve(self, tx, t0, thread)?;
        Ok(rx_lists
            .iter()
            .map(|rx| rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
            .collect())
    }

    /// Compute traveltimes and ray paths for several receiver lists in one
    /// propagation.
    #[allow(clippy::type_complexity)]
    pub fn raytrace_multi_with_paths(
        &self,
        tx: &[Point3],
        t0: &[f64],
        rx_lists: &[Vec<Point3>],
        thread: usize,
    ) -> Result<(Vec<Vec<f64>>, Vec<Vec<Vec<Point3>>>)> {
        let lists: Vec<&[Point3]> = rx_lists.iter().map(|l| l.as_slice()).collect();
        check_tx_rx(self, tx, &lists)?;
        solve(self, tx, t0, thread)?;
        let tt = rx_lists
            .iter()
            .map(|rx| rx.iter().map(|&r| self.traveltime_at(r, thread)).collect())
            .collect();
        let paths = rx_lists
            .iter()
            .map(|rx| {
                rx.iter()
                    .map(|&r| raypath::trace_3d(self, tx, r, thread))
                    .collect()
            })
            .collect();
        Ok((tt, paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_pops_in_nondecreasing_order() {
        let mut band = NarrowBand::new();
        band.push(3.0, 0);
        band.push(1.0, 1);
        band.push(2.0, 2);
        band.push(1.0, 3);
        let mut prev = f64::NEG_INFINITY;
        while let Some((tt, _)) = band.pop() {
            assert!(tt >= prev);
            prev = tt;
        }
    }

    fn square_strip_mesh(n: usize) -> TriMesh {
        // (n+1) x 2 nodes, unit squares split into triangle pairs
        let mut nodes = Vec::new();
        for i in 0..=n {
            nodes.push(Point2::new(i as f64, 0.0));
            nodes.push(Point2::new(i as f64, 1.0));
        }
        let mut tris = Vec::new();
        for i in 0..n as u32 {
            let a = 2 * i;
            let b = 2 * i + 1;
            let c = 2 * i + 2;
            let d = 2 * i + 3;
            tris.push([a, b, c]);
            tris.push([b, d, c]);
        }
        TriMesh::new(nodes, &tris, 2).unwrap()
    }

    #[test]
    fn strip_traveltimes_close_to_distance() {
        let mut mesh = square_strip_mesh(8);
        mesh.set_slowness_uniform(1.0).unwrap();
        let tx = [Point2::new(0.0, 0.0)];
        let rx: Vec<Point2> = (0..=8).map(|i| Point2::new(i as f64, 0.0)).collect();
        let tt = mesh.raytrace(&tx, &[0.0], &rx, 0).unwrap();
        for (i, &t) in tt.iter().enumerate() {
            let d = i as f64;
            assert!(t >= d - 1e-12, "rx {}: {} < {}", i, t, d);
            // the strip forces near-axial propagation; allow first-order error
            assert!(t <= d * 1.1 + 1e-12, "rx {}: {} vs {}", i, t, d);
        }
    }

    #[test]
    fn source_fidelity_on_node() {
        let mut mesh = square_strip_mesh(4);
        mesh.set_slowness_uniform(1.0).unwrap();
        let tx = [Point2::new(2.0, 0.0)];
        let tt = mesh.raytrace(&tx, &[1.5], &[Point2::new(2.0, 0.0)], 0).unwrap();
        assert_eq!(tt[0], 1.5);
    }

    #[test]
    fn thread_out_of_range_rejected() {
        let mut mesh = square_strip_mesh(2);
        mesh.set_slowness_uniform(1.0).unwrap();
        let err = mesh
            .raytrace(&[Point2::new(0.0, 0.0)], &[0.0], &[Point2::new(1.0, 0.0)], 7)
            .unwrap_err();
        assert!(matches!(err, RaytraceError::ThreadOutOfRange { .. }));
    }

    #[test]
    fn tx_t0_mismatch_rejected() {
        let mut mesh = square_strip_mesh(2);
        mesh.set_slowness_uniform(1.0).unwrap();
        let err = mesh
            .raytrace(
                &[Point2::new(0.0, 0.0)],
                &[0.0, 1.0],
                &[Point2::new(1.0, 0.0)],
                0,
            )
            .unwrap_err();
        assert!(matches!(err, RaytraceError::InputSizeMismatch { .. }));
    }

    #[test]
    fn tx_outside_mesh_rejected() {
        let mut mesh = square_strip_mesh(2);
        mesh.set_slowness_uniform(1.0).unwrap();
        let err = mesh
            .raytrace(&[Point2::new(-5.0, 0.0)], &[0.0], &[Point2::new(1.0, 0.0)], 0)
            .unwrap_err();
        assert!(matches!(err, RaytraceError::PointOutsideMesh { .. }));
    }

    #[test]
    fn threads_are_independent() {
        let mut mesh = square_strip_mesh(4);
        mesh.set_slowness_uniform(1.0).unwrap();
        let rx = [Point2::new(4.0, 0.0)];
        let t_a = mesh.raytrace(&[Point2::new(0.0, 0.0)], &[0.0], &rx, 0).unwrap();
        let t_b = mesh.raytrace(&[Point2::new(4.0, 1.0)], &[0.0], &rx, 1).unwrap();
        // thread 0 still holds the first solve
        assert!((mesh.traveltime_at(rx[0], 0) - t_a[0]).abs() < 1e-15);
        assert!(t_b[0] < t_a[0]);
    }

    #[test]
    fn in_cell_source_seeds_cell_vertices() {
        let mut mesh = square_strip_mesh(2);
        mesh.set_slowness_uniform(1.0).unwrap();
        let tx = [Point2::new(0.3, 0.3)];
        let tt = mesh
            .raytrace(&tx, &[0.0], &[Point2::new(0.0, 0.0)], 0)
            .unwrap();
        let d = tx[0].distance(Point2::new(0.0, 0.0));
        assert!((tt[0] - d).abs() < 1e-12);
    }

    #[test]
    fn empty_source_radius_is_fatal() {
        let mut mesh = square_strip_mesh(2);
        mesh.set_slowness_uniform(1.0).unwrap();
        mesh.set_source_radius(1e-4).unwrap();
        let err = mesh
            .raytrace(&[Point2::new(0.3, 0.3)], &[0.0], &[Point2::new(0.0, 0.0)], 0)
            .unwrap_err();
        assert!(matches!(err, RaytraceError::EmptySourceRadius { .. }));
    }
}
