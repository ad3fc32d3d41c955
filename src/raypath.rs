// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Receiver-to-source ray paths: walk against the recovered time gradient
//! through the mesh, edge to edge (2D) or face to face (3D).
//!
//! Tracing degrades gracefully: any step that cannot find an admissible
//! continuation resets the path to the bare receiver and logs a warning; the
//! receiver's traveltime stays valid.

use log::warn;

use crate::geometry::{Point2, Point3, SMALL};
use crate::gradient::{self, Kernel2, Kernel3};
use crate::mesh::{cells_on_edge_2d, cells_on_face_3d, TetMesh, TriMesh};

/// Distance at which the walk counts as having reached a source.
const MIN_DIST: f64 = SMALL;

fn sign(x: f64) -> i32 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Gradient of the time field over a cell's two-ring star, high-order when
/// the star is rich enough, first-order on the bare cell otherwise.
fn cell_gradient_2d(mesh: &TriMesh, cell: u32, thread: usize) -> Option<Point2> {
    let star = mesh.neighbor_star(cell);
    let samples: Vec<(Point2, f64)> = star
        .iter()
        .map(|&n| (mesh.node(n), mesh.traveltime(n, thread)))
        .collect();
    if samples.len() >= 5 {
        gradient::recover_gradient_2d(Kernel2::HighOrder, &samples)
    } else {
        let cell_samples: Vec<(Point2, f64)> = mesh
            .neighbors(cell)
            .iter()
            .map(|&n| (mesh.node(n), mesh.traveltime(n, thread)))
            .collect();
        gradient::recover_gradient_2d(Kernel2::Linear, &cell_samples)
    }
}

fn cell_gradient_3d(mesh: &TetMesh, cell: u32, anchor: Point3, thread: usize) -> Option<Point3> {
    let star = mesh.neighbor_star(cell);
    let samples: Vec<(Point3, f64)> = star
        .iter()
        .map(|&n| (mesh.node(n), mesh.traveltime(n, thread)))
        .collect();
    if samples.len() >= 9 {
        gradient::recover_gradient_3d(Kernel3::HighOrder, &samples, anchor)
    } else {
        gradient::recover_gradient_3d(Kernel3::Recentred, &samples, anchor)
    }
}

/// Cells containing both edge nodes, stepping away from the cell that owns
/// `node_no`. On a boundary edge the single cell is returned.
fn find_next_cell1(mesh: &TriMesh, i0: u32, i1: u32, node_no: u32) -> Option<u32> {
    let cells = cells_on_edge_2d(mesh, i0, i1, None);
    if cells.len() == 1 {
        return Some(cells[0]);
    }
    for &nc in mesh.store.owners(node_no) {
        if nc == cells[0] {
            return Some(cells[1]);
        } else if nc == cells[1] {
            return Some(cells[0]);
        }
    }
    None
}

/// The other cell sharing edge (i0, i1). On a boundary edge the single cell
/// is returned.
fn find_next_cell2(mesh: &TriMesh, i0: u32, i1: u32, cell_no: u32) -> Option<u32> {
    let cells = cells_on_edge_2d(mesh, i0, i1, None);
    if cells.len() == 1 {
        return Some(cells[0]);
    }
    if cell_no == cells[0] {
        Some(cells[1])
    } else if cell_no == cells[1] {
        Some(cells[0])
    } else {
        None
    }
}

/// Intersection of the gradient ray from `curr_pt` with the edge (i0, i1).
/// When the ray is parallel to one of the two edges from `curr_pt` to an
/// endpoint, `curr_pt` snaps to that endpoint and `true` is returned.
fn find_intersection(mesh: &TriMesh, i0: u32, i1: u32, g: Point2, curr_pt: &mut Point2) -> bool {
    let p0 = mesh.node(i0);
    let p1 = mesh.node(i1);

    let (m2, b2) = if g.x == 0.0 {
        (f64::INFINITY, curr_pt.x)
    } else {
        let m = g.z / g.x;
        (m, curr_pt.z - m * curr_pt.x)
    };

    // is the gradient parallel to either edge through curr_pt
    let den = p0.x - curr_pt.x;
    let m1 = if den == 0.0 {
        f64::INFINITY
    } else {
        (p0.z - curr_pt.z) / den
    };
    if m1 == m2 {
        *curr_pt = p0;
        return true;
    }

    let den = p1.x - curr_pt.x;
    let m1 = if den == 0.0 {
        f64::INFINITY
    } else {
        (p1.z - curr_pt.z) / den
    };
    if m1 == m2 {
        *curr_pt = p1;
        return true;
    }

    // opposing edge segment
    let den = p1.x - p0.x;
    let (m1, b1) = if den == 0.0 {
        (f64::INFINITY, p1.x)
    } else {
        let m = (p1.z - p0.z) / den;
        (m, p1.z - m * p1.x)
    };

    *curr_pt = line_intersection(m1, b1, m2, b2);
    false
}

/// Intersection point of two lines in slope-intercept form, where an
/// infinite slope carries the x-intercept instead.
fn line_intersection(m1: f64, b1: f64, m2: f64, b2: f64) -> Point2 {
    if m1 == f64::INFINITY {
        let x = b1;
        Point2::new(x, m2 * x + b2)
    } else if m2 == f64::INFINITY {
        let x = b2;
        Point2::new(x, m1 * x + b1)
    } else {
        let x = (b2 - b1) / (m1 - m2);
        Point2::new(x, m2 * x + b2)
    }
}

/// Trace the ray path from receiver `rx` back to one of the sources.
/// Returns the polyline from `rx` to the source, or `[rx]` on failure.
pub(crate) fn trace_2d(mesh: &TriMesh, tx: &[Point2], rx: Point2, thread: usize) -> Vec<Point2> {
    let mut r_data = vec![rx];
    for t in tx {
        if rx.close_to(*t, MIN_DIST) {
            return r_data;
        }
    }

    let tx_node: Vec<Option<u32>> = tx.iter().map(|t| mesh.store.find_coincident(t)).collect();
    let tx_cell: Vec<Option<u32>> = tx
        .iter()
        .zip(&tx_node)
        .map(|(t, n)| if n.is_none() { mesh.cell_of(*t) } else { None })
        .collect();

    let mut curr_pt = rx;
    let mut on_node = false;
    let mut node_no = 0u32;
    let mut cell_no = 0u32;
    if let Some(n) = mesh.store.find_coincident(&rx) {
        node_no = n;
        on_node = true;
    } else {
        match mesh.cell_of(rx) {
            Some(c) => cell_no = c,
            None => return fail_2d(rx),
        }
    }
    let mut on_edge = false;
    let mut edge_nodes = [0u32; 2];

    let max_steps = 16 * mesh.n_cells() + 64;
    for _ in 0..max_steps {
        // reached a source?
        for (i, t) in tx.iter().enumerate() {
            if curr_pt.close_to(*t, MIN_DIST) {
                return r_data;
            }
            let arrived = if on_node {
                match tx_node[i] {
                    Some(tn) => mesh
                        .store
                        .owners(node_no)
                        .iter()
                        .any(|c| mesh.store.owners(tn).contains(c)),
                    None => tx_cell[i]
                        .map(|tc| mesh.store.owners(node_no).contains(&tc))
                        .unwrap_or(false),
                }
            } else {
                match tx_node[i] {
                    Some(tn) => mesh.store.owners(tn).contains(&cell_no),
                    None => tx_cell[i] == Some(cell_no),
                }
            };
            if arrived {
                r_data.push(*t);
                return r_data;
            }
        }

        if on_node {
            // find the cell whose gradient crosses its opposing edge
            let mut grads: Vec<Point2> = Vec::new();
            let mut found = false;

            'cells: for pass in 0..2 {
                let avg = if pass == 1 {
                    if grads.is_empty() {
                        break;
                    }
                    let mut g = Point2::default();
                    for gr in &grads {
                        g = g + *gr;
                    }
                    Some((g / grads.len() as f64).normalized())
                } else {
                    None
                };

                for &nc in mesh.store.owners(node_no) {
                    let mut nb = [0u32; 2];
                    let mut k = 0;
                    for &nn in mesh.neighbors(nc) {
                        if nn != node_no && k < 2 {
                            nb[k] = nn;
                            k += 1;
                        }
                    }
                    if nb[0] > nb[1] {
                        nb.swap(0, 1);
                    }

                    let g = match avg {
                        Some(g) => g,
                        None => match cell_gradient_2d(mesh, nc, thread) {
                            Some(g) => g.normalized(),
                            None => continue,
                        },
                    };
                    let v1 = (mesh.node(nb[0]) - mesh.node(node_no)).normalized();
                    let v2 = (mesh.node(nb[1]) - mesh.node(node_no)).normalized();

                    let theta1 = v1.dot(g).clamp(-1.0, 1.0).acos();
                    let theta2 = v1.dot(v2).clamp(-1.0, 1.0).acos();
                    if theta1 > theta2 {
                        if pass == 0 {
                            grads.push(g);
                        }
                        continue;
                    }
                    if sign(v1.cross(g)) != sign(v1.cross(v2)) {
                        if pass == 0 {
                            grads.push(g);
                        }
                        continue;
                    }

                    found = true;
                    let landed_on_node = find_intersection(mesh, nb[0], nb[1], g, &mut curr_pt);
                    r_data.push(curr_pt);
                    if landed_on_node {
                        break 'cells;
                    }
                    on_edge = true;
                    edge_nodes = nb;
                    match find_next_cell1(mesh, nb[0], nb[1], node_no) {
                        Some(c) => cell_no = c,
                        None => return fail_2d(rx),
                    }
                    break 'cells;
                }
            }
            if !found {
                return fail_2d(rx);
            }
        } else {
            let g = match cell_gradient_2d(mesh, cell_no, thread) {
                Some(g) => g.normalized(),
                None => return fail_2d(rx),
            };

            let nn = mesh.neighbors(cell_no);
            let mut ind = [[nn[0], nn[1]], [nn[0], nn[2]], [nn[1], nn[2]]];
            for e in ind.iter_mut() {
                if e[0] > e[1] {
                    e.swap(0, 1);
                }
            }

            let mut found = false;
            for e in ind {
                let p0 = mesh.node(e[0]);
                let p1 = mesh.node(e[1]);

                let den = p1.x - p0.x;
                let (m1, b1) = if den == 0.0 {
                    (f64::INFINITY, p1.x)
                } else {
                    let m = (p1.z - p0.z) / den;
                    (m, p1.z - m * p1.x)
                };
                let (m2, b2) = if g.x == 0.0 {
                    (f64::INFINITY, curr_pt.x)
                } else {
                    let m = g.z / g.x;
                    (m, curr_pt.z - m * curr_pt.x)
                };

                if on_edge && e == edge_nodes {
                    if (m1 - m2).abs() < SMALL {
                        // gradient runs along the current edge: advance to
                        // the endpoint the gradient points at
                        if sign(den) == sign(g.x) {
                            curr_pt = p1;
                        } else {
                            curr_pt = p0;
                        }
                        r_data.push(curr_pt);
                        found = true;
                        break;
                    }
                    continue;
                }

                let pt_i = line_intersection(m1, b1, m2, b2);
                if (pt_i - curr_pt).dot(g) <= 0.0 {
                    continue; // behind the walk direction
                }

                let in_x = (pt_i.x <= p1.x && pt_i.x >= p0.x) || (pt_i.x >= p1.x && pt_i.x <= p0.x);
                let in_z = (pt_i.z <= p0.z && pt_i.z >= p1.z) || (pt_i.z >= p0.z && pt_i.z <= p1.z);
                if in_x && in_z {
                    found = true;
                    r_data.push(pt_i);
                    curr_pt = pt_i;
                    on_edge = true;
                    edge_nodes = e;
                    match find_next_cell2(mesh, e[0], e[1], cell_no) {
                        Some(c) => cell_no = c,
                        None => return fail_2d(rx),
                    }
                    break;
                }
            }

            if !found {
                // gradient points slightly outside the triangle: slide along
                // the current edge toward the endpoint it favors
                if !on_edge {
                    return fail_2d(rx);
                }
                let vec = mesh.node(edge_nodes[1]) - mesh.node(edge_nodes[0]);
                curr_pt = if vec.dot(g) > 0.0 {
                    mesh.node(edge_nodes[1])
                } else {
                    mesh.node(edge_nodes[0])
                };
                r_data.push(curr_pt);
            }
        }

        on_node = false;
        if let Some(n) = mesh.store.find_coincident(&curr_pt) {
            node_no = n;
            on_node = true;
            on_edge = false;
        }
    }

    fail_2d(rx)
}

fn fail_2d(rx: Point2) -> Vec<Point2> {
    warn!("raypath failed to converge for Rx {} {}", rx.x, rx.z);
    vec![rx]
}

fn fail_3d(rx: Point3) -> Vec<Point3> {
    warn!("raypath failed to converge for Rx {} {} {}", rx.x, rx.y, rx.z);
    vec![rx]
}

/// Intersection of the ray from `origin` along `dir` with triangle (a, b, c);
/// `None` when the ray misses the face or runs parallel to it.
fn ray_face_intersection(
    origin: Point3,
    dir: Point3,
    a: Point3,
    b: Point3,
    c: Point3,
) -> Option<Point3> {
    let n = (b - a).cross(c - a);
    let denom = n.dot(dir);
    if denom.abs() < f64::MIN_POSITIVE {
        return None;
    }
    let t = n.dot(a - origin) / denom;
    if t <= SMALL {
        return None;
    }
    let q = origin + dir * t;
    if crate::geometry::inside_triangle_3d(q, a, b, c) {
        Some(q)
    } else {
        None
    }
}

/// The tet across face `face` from the one owning `node_no`; on a boundary
/// face the single cell is returned.
fn find_next_cell1_3d(mesh: &TetMesh, face: [u32; 3], node_no: u32) -> Option<u32> {
    let cells = cells_on_face_3d(mesh, face, None);
    if cells.len() == 1 {
        return Some(cells[0]);
    }
    if cells.len() != 2 {
        return None;
    }
    for &nc in mesh.store.owners(node_no) {
        if nc == cells[0] {
            return Some(cells[1]);
        } else if nc == cells[1] {
            return Some(cells[0]);
        }
    }
    None
}

/// The other tet sharing `face`; on a boundary face the single cell is
/// returned.
fn find_next_cell2_3d(mesh: &TetMesh, face: [u32; 3], cell_no: u32) -> Option<u32> {
    let cells = cells_on_face_3d(mesh, face, None);
    if cells.len() == 1 {
        return Some(cells[0]);
    }
    if cells.len() != 2 {
        return None;
    }
    if cell_no == cells[0] {
        Some(cells[1])
    } else if cell_no == cells[1] {
        Some(cells[0])
    } else {
        None
    }
}

/// The four faces of a tet as sorted node triples.
fn tet_faces(mesh: &TetMesh, cell: u32) -> [[u32; 3]; 4] {
    let i = mesh.tetrahedron(cell).i;
    let mut faces = [
        [i[1], i[2], i[3]],
        [i[0], i[2], i[3]],
        [i[0], i[1], i[3]],
        [i[0], i[1], i[2]],
    ];
    for f in faces.iter_mut() {
        f.sort_unstable();
    }
    faces
}

/// Trace the ray path from receiver `rx` back to one of the sources in a
/// tetrahedral mesh. Returns the polyline from `rx` to the source, or `[rx]`
/// on failure.
pub(crate) fn trace_3d(mesh: &TetMesh, tx: &[Point3], rx: Point3, thread: usize) -> Vec<Point3> {
    let mut r_data = vec![rx];
    for t in tx {
        if rx.close_to(*t, MIN_DIST) {
            return r_data;
        }
    }

    let tx_node: Vec<Option<u32>> = tx.iter().map(|t| mesh.store.find_coincident(t)).collect();
    let tx_cell: Vec<Option<u32>> = tx
        .iter()
        .zip(&tx_node)
        .map(|(t, n)| if n.is_none() { mesh.cell_of(*t) } else { None })
        .collect();

    let mut curr_pt = rx;
    let mut on_node = false;
    let mut node_no = 0u32;
    let mut cell_no = 0u32;
    if let Some(n) = mesh.store.find_coincident(&rx) {
        node_no = n;
        on_node = true;
    } else {
        match mesh.cell_of(rx) {
            Some(c) => cell_no = c,
            None => return fail_3d(rx),
        }
    }
    let mut on_face = false;
    let mut face_nodes = [0u32; 3];

    let max_steps = 16 * mesh.n_cells() + 64;
    for _ in 0..max_steps {
        // reached a source?
        for (i, t) in tx.iter().enumerate() {
            if curr_pt.close_to(*t, MIN_DIST) {
                return r_data;
            }
            let arrived = if on_node {
                match tx_node[i] {
                    Some(tn) => mesh
                        .store
                        .owners(node_no)
                        .iter()
                        .any(|c| mesh.store.owners(tn).contains(c)),
                    None => tx_cell[i]
                        .map(|tc| mesh.store.owners(node_no).contains(&tc))
                        .unwrap_or(false),
                }
            } else {
                match tx_node[i] {
                    Some(tn) => mesh.store.owners(tn).contains(&cell_no),
                    None => tx_cell[i] == Some(cell_no),
                }
            };
            if arrived {
                r_data.push(*t);
                return r_data;
            }
        }

        if on_node {
            let mut grads: Vec<Point3> = Vec::new();
            let mut found = false;

            'cells3: for pass in 0..2 {
                let avg = if pass == 1 {
                    if grads.is_empty() {
                        break;
                    }
                    let mut g = Point3::default();
                    for gr in &grads {
                        g = g + *gr;
                    }
                    Some((g / grads.len() as f64).normalized())
                } else {
                    None
                };

                for &nc in mesh.store.owners(node_no) {
                    let g = match avg {
                        Some(g) => g,
                        None => match cell_gradient_3d(mesh, nc, curr_pt, thread) {
                            Some(g) => g.normalized(),
                            None => continue,
                        },
                    };

                    // opposite face: the three other vertices of the tet
                    let mut face = [0u32; 3];
                    let mut k = 0;
                    for &nn in mesh.neighbors(nc) {
                        if nn != node_no && k < 3 {
                            face[k] = nn;
                            k += 1;
                        }
                    }
                    face.sort_unstable();

                    let q = ray_face_intersection(
                        curr_pt,
                        g,
                        mesh.node(face[0]),
                        mesh.node(face[1]),
                        mesh.node(face[2]),
                    );
                    match q {
                        Some(q) => {
                            found = true;
                            curr_pt = q;
                            r_data.push(q);
                            on_face = true;
                            face_nodes = face;
                            match find_next_cell1_3d(mesh, face, node_no) {
                                Some(c) => cell_no = c,
                                None => return fail_3d(rx),
                            }
                            break 'cells3;
                        }
                        None => {
                            if pass == 0 {
                                grads.push(g);
                            }
                        }
                    }
                }
            }
            if !found {
                return fail_3d(rx);
            }
        } else {
            let g = match cell_gradient_3d(mesh, cell_no, curr_pt, thread) {
                Some(g) => g.normalized(),
                None => return fail_3d(rx),
            };

            let mut found = false;
            for face in tet_faces(mesh, cell_no) {
                if on_face && face == face_nodes {
                    continue;
                }
                if let Some(q) = ray_face_intersection(
                    curr_pt,
                    g,
                    mesh.node(face[0]),
                    mesh.node(face[1]),
                    mesh.node(face[2]),
                ) {
                    found = true;
                    curr_pt = q;
                    r_data.push(q);
                    on_face = true;
                    face_nodes = face;
                    match find_next_cell2_3d(mesh, face, cell_no) {
                        Some(c) => cell_no = c,
                        None => return fail_3d(rx),
                    }
                    break;
                }
            }

            if !found {
                // gradient points slightly outside the tet: slide toward the
                // current face's vertex the gradient favors
                if !on_face {
                    return fail_3d(rx);
                }
                let mut best: Option<(f64, u32)> = None;
                for &n in &face_nodes {
                    let d = (mesh.node(n) - curr_pt).dot(g);
                    if d > 0.0 && best.map(|(bd, _)| d > bd).unwrap_or(true) {
                        best = Some((d, n));
                    }
                }
                match best {
                    Some((_, n)) => {
                        curr_pt = mesh.node(n);
                        r_data.push(curr_pt);
                    }
                    None => return fail_3d(rx),
                }
            }
        }

        on_node = false;
        if let Some(n) = mesh.store.find_coincident(&curr_pt) {
            node_no = n;
            on_node = true;
            on_face = false;
        }
    }

    fail_3d(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_intersection_general_and_vertical() {
        // y = x and y = -x + 2 meet at (1, 1)
        let p = line_intersection(1.0, 0.0, -1.0, 2.0);
        assert!(p.close_to(Point2::new(1.0, 1.0), 1e-12));

        // x = 3 and y = 2x meet at (3, 6)
        let p = line_intersection(f64::INFINITY, 3.0, 2.0, 0.0);
        assert!(p.close_to(Point2::new(3.0, 6.0), 1e-12));
        let p = line_intersection(2.0, 0.0, f64::INFINITY, 3.0);
        assert!(p.close_to(Point2::new(3.0, 6.0), 1e-12));
    }

    #[test]
    fn ray_face_intersection_hits_and_misses() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let q = ray_face_intersection(
            Point3::new(0.2, 0.2, 1.0),
            Point3::new(0.0, 0.0, -1.0),
            a,
            b,
            c,
        )
        .unwrap();
        assert!(q.close_to(Point3::new(0.2, 0.2, 0.0), 1e-12));

        // pointing away
        assert!(ray_face_intersection(
            Point3::new(0.2, 0.2, 1.0),
            Point3::new(0.0, 0.0, 1.0),
            a,
            b,
            c
        )
        .is_none());

        // parallel to the plane
        assert!(ray_face_intersection(
            Point3::new(0.2, 0.2, 1.0),
            Point3::new(1.0, 0.0, 0.0),
            a,
            b,
            c
        )
        .is_none());

        // crosses the plane outside the triangle
        assert!(ray_face_intersection(
            Point3::new(5.0, 5.0, 1.0),
            Point3::new(0.0, 0.0, -1.0),
            a,
            b,
            c
        )
        .is_none());
    }

    fn two_cell_mesh() -> TriMesh {
        let nodes = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        TriMesh::new(nodes, &[[0, 1, 2], [0, 2, 3]], 1).unwrap()
    }

    #[test]
    fn next_cell_helpers() {
        let mesh = two_cell_mesh();
        // edge (0, 2) is interior
        assert_eq!(find_next_cell2(&mesh, 0, 2, 0), Some(1));
        assert_eq!(find_next_cell2(&mesh, 0, 2, 1), Some(0));
        // edge (0, 1) is on the boundary: the single owning cell comes back
        assert_eq!(find_next_cell2(&mesh, 0, 1, 0), Some(0));
        // from node 1, crossing edge (0, 2) leads into cell 1
        assert_eq!(find_next_cell1(&mesh, 0, 2, 1), Some(1));
    }

    #[test]
    fn trace_2d_direct_neighbor_terminates() {
        let mut mesh = two_cell_mesh();
        mesh.set_slowness_uniform(1.0).unwrap();
        let tx = [Point2::new(0.0, 0.0)];
        let rx = Point2::new(1.0, 1.0);
        mesh.raytrace(&tx, &[0.0], &[rx], 0).unwrap();
        let path = trace_2d(&mesh, &tx, rx, 0);
        assert_eq!(path.first(), Some(&rx));
        assert_eq!(path.last(), Some(&tx[0]));
    }

    #[test]
    fn trace_2d_rx_equals_tx() {
        let mut mesh = two_cell_mesh();
        mesh.set_slowness_uniform(1.0).unwrap();
        let tx = [Point2::new(0.0, 0.0)];
        mesh.raytrace(&tx, &[0.0], &[tx[0]], 0).unwrap();
        let path = trace_2d(&mesh, &tx, tx[0], 0);
        assert_eq!(path, vec![tx[0]]);
    }
}
