// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Local eikonal updates: recompute the tentative traveltime of one vertex
//! from the opposing edge (triangles) or opposing face (tetrahedra) of each
//! element that owns it. Updates only ever lower a traveltime.
//!
//! The wavefront construction follows Qian, Zhang and Zhao, "Fast Sweeping
//! Methods for Eikonal Equations on Triangular Meshes", SIAM Journal on
//! Numerical Analysis 45(1), 2007, doi:10.1137/050627083.

use std::f64::consts::FRAC_PI_2;

use nalgebra::{Matrix3, Vector3};

use crate::geometry::{inside_triangle_3d, Point3};
use crate::mesh::{TetMesh, TriMesh, TET_FACES};

/// Wavefront update of a vertex C from two supports A, B.
///
/// Side lengths follow the triangle (C, A, B): `a` = |CB|, `b` = |CA|,
/// `c` = |AB|; `alpha` is the interior angle at B and `beta` the angle at A.
/// When the plane wave through A and B is admissible (its incidence angle
/// theta falls in the cone where the characteristic crosses the support),
/// the update is the two-leg average of the wavefront arrivals; otherwise it
/// degrades to the edge-limited head-wave update.
pub fn two_point_update(
    ta: f64,
    tb: f64,
    a: f64,
    b: f64,
    c: f64,
    alpha: f64,
    beta: f64,
    s: f64,
) -> f64 {
    if (tb - ta).abs() <= c * s {
        let theta = ((tb - ta).abs() / (c * s)).asin();
        let in_cone = ((alpha - FRAC_PI_2).max(0.0) <= theta && theta <= FRAC_PI_2 - beta)
            || (alpha - FRAC_PI_2 <= theta && theta <= (FRAC_PI_2 - beta).min(0.0));
        if in_cone {
            let h = a * (alpha - theta).sin();
            let hh = b * (beta + theta).sin();
            return 0.5 * (h * s + tb) + 0.5 * (hh * s + ta);
        }
    }
    (ta + b * s).min(tb + a * s)
}

/// Update one vertex across every triangle that owns it. Obtuse vertices use
/// the unfolded virtual support when the registry has one for the triangle.
pub(crate) fn update_triangle_vertex(mesh: &TriMesh, vertex: u32, thread: usize) {
    let s = mesh.slowness_at(vertex);

    for &tri_no in mesh.store.owners(vertex) {
        let tri = mesh.triangle(tri_no);
        let i0 = match tri.i.iter().position(|&n| n == vertex) {
            Some(i) => i,
            None => continue,
        };

        let (na, nb, a, b, c, alpha, beta) = if tri.a[i0] > FRAC_PI_2 {
            match mesh.virtual_node(tri_no) {
                Some(vn) => (
                    vn.node1,
                    vn.node2,
                    vn.e[1],
                    vn.e[2],
                    vn.e[0],
                    vn.a[2],
                    vn.a[1],
                ),
                None => plain_support(tri.i, &tri.l, &tri.a, i0),
            }
        } else {
            plain_support(tri.i, &tri.l, &tri.a, i0)
        };

        let ta = mesh.traveltime(na, thread);
        let tb = mesh.traveltime(nb, thread);
        let t = two_point_update(ta, tb, a, b, c, alpha, beta, s);
        if t < mesh.traveltime(vertex, thread) {
            mesh.store.set_traveltime(vertex, thread, t);
            let parent = if ta <= tb { na } else { nb };
            mesh.store.set_parents(vertex, thread, parent, tri_no);
        }
    }
}

fn plain_support(
    i: [u32; 3],
    l: &[f64; 3],
    ang: &[f64; 3],
    i0: usize,
) -> (u32, u32, f64, f64, f64, f64, f64) {
    let i1 = (i0 + 1) % 3;
    let i2 = (i0 + 2) % 3;
    (i[i1], i[i2], l[i1], l[i2], l[i0], ang[i2], ang[i1])
}

/// Update one vertex across every tetrahedron that owns it: try the full
/// three-support wavefront solve, then every two-support update on the faces
/// through the vertex (which themselves degrade to edge-limited legs).
pub(crate) fn update_tet_vertex(mesh: &TetMesh, vertex: u32, thread: usize) {
    let s = mesh.slowness_at(vertex);
    let c_pt = mesh.node(vertex);

    for &tet_no in mesh.store.owners(vertex) {
        let tet = mesh.tetrahedron(tet_no);
        let k = match tet.i.iter().position(|&n| n == vertex) {
            Some(i) => i,
            None => continue,
        };
        let sup_locals = TET_FACES[k];
        let sup: Vec<(u32, Point3, f64)> = sup_locals
            .iter()
            .map(|&m| {
                let n = tet.i[m];
                (n, mesh.node(n), mesh.traveltime(n, thread))
            })
            .collect();

        let mut t = f64::INFINITY;
        let mut parent = sup[0].0;

        if let Some(u) = three_point_update(
            c_pt,
            [sup[0].1, sup[1].1, sup[2].1],
            [sup[0].2, sup[1].2, sup[2].2],
            s,
        ) {
            t = u;
            parent = sup
                .iter()
                .min_by(|x, y| x.2.partial_cmp(&y.2).unwrap_or(std::cmp::Ordering::Equal))
                .map(|x| x.0)
                .unwrap_or(sup[0].0);
        }

        // two-support updates on the three faces through the vertex; the
        // face holding supports m and n is the one opposite the third support
        for (m, n) in [(0usize, 1usize), (0, 2), (1, 2)] {
            let other = 3 - m - n;
            let face = sup_locals[other];
            let fv = TET_FACES[face];
            let pos_m = match fv.iter().position(|&v| v == sup_locals[m]) {
                Some(p) => p,
                None => continue,
            };
            let pos_n = match fv.iter().position(|&v| v == sup_locals[n]) {
                Some(p) => p,
                None => continue,
            };

            let a_len = tet.edge(k, sup_locals[n]);
            let b_len = tet.edge(k, sup_locals[m]);
            let c_len = tet.edge(sup_locals[m], sup_locals[n]);
            let alpha = tet.face_a[face][pos_n];
            let beta = tet.face_a[face][pos_m];

            let cand = two_point_update(sup[m].2, sup[n].2, a_len, b_len, c_len, alpha, beta, s);
            if cand < t {
                t = cand;
                parent = if sup[m].2 <= sup[n].2 {
                    sup[m].0
                } else {
                    sup[n].0
                };
            }
        }

        if t < mesh.traveltime(vertex, thread) {
            mesh.store.set_traveltime(vertex, thread, t);
            mesh.store.set_parents(vertex, thread, parent, tet_no);
        }
    }
}

/// Plane-wave solve through the face opposite C: find u such that the linear
/// time field interpolating (u, t0, t1, t2) on the tetrahedron has gradient
/// norm s, and accept it only when the characteristic from C crosses the
/// opposing face.
fn three_point_update(c: Point3, p: [Point3; 3], t: [f64; 3], s: f64) -> Option<f64> {
    if t.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let rows = [p[0] - c, p[1] - c, p[2] - c];
    let m = Matrix3::new(
        rows[0].x, rows[0].y, rows[0].z, //
        rows[1].x, rows[1].y, rows[1].z, //
        rows[2].x, rows[2].y, rows[2].z,
    );
    let m_inv = m.try_inverse()?;
    let n = (m * m.transpose()).try_inverse()?;
    let one = Vector3::new(1.0, 1.0, 1.0);
    let tau = Vector3::new(t[0], t[1], t[2]);

    // |grad|^2 = (tau - u 1)^T N (tau - u 1) = s^2, quadratic in u
    let a2 = (one.transpose() * n * one)[(0, 0)];
    let a1 = -2.0 * (tau.transpose() * n * one)[(0, 0)];
    let a0 = (tau.transpose() * n * tau)[(0, 0)] - s * s;
    let disc = a1 * a1 - 4.0 * a2 * a0;
    if disc < 0.0 || a2 == 0.0 {
        return None;
    }
    let u = (-a1 + disc.sqrt()) / (2.0 * a2);
    let t_max = t[0].max(t[1]).max(t[2]);
    if !(u > t_max) {
        return None;
    }

    // causality of the characteristic: the ray from C down the gradient must
    // pierce the opposing face
    let g = m_inv * (tau - one * u);
    let dir = Point3::new(-g[0], -g[1], -g[2]);
    let n_face = (p[1] - p[0]).cross(p[2] - p[0]);
    let denom = n_face.dot(dir);
    if denom.abs() < f64::MIN_POSITIVE {
        return None;
    }
    let tpar = n_face.dot(p[0] - c) / denom;
    if tpar <= 0.0 {
        return None;
    }
    let q = c + dir * tpar;
    if !inside_triangle_3d(q, p[0], p[1], p[2]) {
        return None;
    }
    Some(u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point2;

    #[test]
    fn two_point_equilateral_wavefront() {
        // unit equilateral triangle, both supports at t=0, s=1: the plane
        // wave arrives after the triangle height sqrt(3)/2
        let a = 1.0;
        let b = 1.0;
        let c = 1.0;
        let ang = std::f64::consts::FRAC_PI_3;
        let t = two_point_update(0.0, 0.0, a, b, c, ang, ang, 1.0);
        assert!((t - 3.0_f64.sqrt() / 2.0).abs() < 1e-12);
    }

    #[test]
    fn two_point_falls_back_outside_cone() {
        // right isoceles triangle (C at the square corner opposite the
        // hypotenuse): supports at 0 and 2 with c*s = 2 give theta = pi/2,
        // outside the cone, so the head wave along the b edge wins
        let t = two_point_update(
            0.0,
            2.0,
            1.0,
            2.0_f64.sqrt(),
            1.0,
            FRAC_PI_2,
            std::f64::consts::FRAC_PI_4,
            2.0,
        );
        assert!((t - 2.0 * 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn two_point_infinite_supports() {
        let ang = std::f64::consts::FRAC_PI_3;
        let t = two_point_update(
            f64::INFINITY,
            f64::INFINITY,
            1.0,
            1.0,
            1.0,
            ang,
            ang,
            1.0,
        );
        assert!(t.is_infinite());

        let t = two_point_update(0.5, f64::INFINITY, 1.0, 1.0, 1.0, ang, ang, 1.0);
        assert!((t - 1.5).abs() < 1e-12);
        assert!(!t.is_nan());
    }

    #[test]
    fn triangle_vertex_update_lowers_tt() {
        let nodes = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.5, 0.8),
        ];
        let mut mesh = TriMesh::new(nodes, &[[0, 1, 2]], 1).unwrap();
        mesh.set_slowness_uniform(1.0).unwrap();
        mesh.store.set_traveltime(0, 0, 0.0);
        mesh.store.set_traveltime(1, 0, 0.0);

        update_triangle_vertex(&mesh, 2, 0);
        let t = mesh.traveltime(2, 0);
        // plane wave from the base arrives after the apex height
        assert!((t - 0.8).abs() < 1e-12);

        // a second pass must not raise it
        update_triangle_vertex(&mesh, 2, 0);
        assert!((mesh.traveltime(2, 0) - t).abs() < 1e-15);
    }

    #[test]
    fn three_point_symmetric_tet() {
        // regular-ish tet: supports on the unit triangle at t=0, apex above
        // the centroid, s=1: arrival equals the apex height
        let h = 0.9;
        let apex = Point3::new(0.5, 3.0_f64.sqrt() / 6.0, h);
        let p = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 3.0_f64.sqrt() / 2.0, 0.0),
        ];
        let u = three_point_update(apex, p, [0.0, 0.0, 0.0], 1.0).unwrap();
        assert!((u - h).abs() < 1e-12);
    }

    #[test]
    fn three_point_rejects_unreached_supports() {
        let apex = Point3::new(0.0, 0.0, 1.0);
        let p = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        assert!(three_point_update(apex, p, [0.0, f64::INFINITY, 0.0], 1.0).is_none());
    }

    #[test]
    fn three_point_rejects_characteristic_outside_face() {
        // supports strongly skewed: the gradient leaves through a side face
        let apex = Point3::new(0.0, 0.0, 0.2);
        let p = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        // steep time growth along x pushes the characteristic out of the face
        assert!(three_point_update(apex, p, [0.0, 5.0, 0.0], 1.0).is_none());
    }
}
