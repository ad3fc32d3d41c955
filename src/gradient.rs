// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Least-squares recovery of the traveltime gradient over node stars.
//!
//! Every kernel returns the *descent* direction, the negative of the
//! recovered time gradient: it points from late arrivals toward early ones,
//! which is the direction a ray path walks. Kernels return `None` when the
//! sample set is too small, the system is singular, or the solution carries
//! NaN; callers treat that as a ray-path failure for the step.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, Vector3};

use crate::geometry::{Point2, Point3, SMALL};

/// Diagonal weighting applied to a least-squares system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// No weighting.
    Uniform,
    /// w_i = 1 / d_i^2.
    InvDistSq,
    /// w_i = 1 / d_i^4.
    InvDistPow4,
}

impl Weighting {
    fn weight(self, d2: f64) -> f64 {
        match self {
            Weighting::Uniform => 1.0,
            Weighting::InvDistSq => 1.0 / d2,
            Weighting::InvDistPow4 => 1.0 / (d2 * d2),
        }
    }
}

/// 2D gradient-recovery kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel2 {
    /// Direct solve from two vertex differences of a triangle (3 samples).
    Direct,
    /// Centroid-anchored first-order least squares (3 samples).
    Linear,
    /// Centroid-anchored least squares with quadratic terms (>= 5 samples).
    HighOrder,
}

/// 3D gradient-recovery kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel3 {
    /// Direct 3x3 solve from three vertex differences of a tetrahedron.
    Direct,
    /// Plane fit T = a x + b y + c z + d over four vertices.
    PlaneFit,
    /// Anchor-recentred first-order least squares (>= 4 samples).
    Recentred,
    /// Anchor-recentred least squares with Hessian terms (>= 9 samples).
    HighOrder,
    /// Affine basis {x, y, z, 1} with 1/d^2 weights.
    WeightedAffine,
    /// Trilinear basis {1, x, y, z, xy, xz, yz, xyz}, gradient evaluated
    /// analytically at the anchor.
    Trilinear(Weighting),
}

/// Options for the recentred 3D kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Grad3dOptions {
    /// When set, replace the SVD solve by the penalty-constrained iteration
    /// enforcing |g| close to this value. Experimental; off by default.
    pub constrained_norm: Option<f64>,
}

/// Recover the 2D descent direction from a node star.
pub fn recover_gradient_2d(kernel: Kernel2, samples: &[(Point2, f64)]) -> Option<Point2> {
    match kernel {
        Kernel2::Direct => direct_2d(samples),
        Kernel2::Linear => linear_2d(samples),
        Kernel2::HighOrder => high_order_2d(samples),
    }
}

/// Recover the 3D descent direction from a node star anchored at `anchor`.
pub fn recover_gradient_3d(
    kernel: Kernel3,
    samples: &[(Point3, f64)],
    anchor: Point3,
) -> Option<Point3> {
    match kernel {
        Kernel3::Direct => direct_3d(samples),
        Kernel3::PlaneFit => plane_fit_3d(samples),
        Kernel3::Recentred => recentred_3d(samples, anchor, Grad3dOptions::default()),
        Kernel3::HighOrder => high_order_3d(samples, anchor),
        Kernel3::WeightedAffine => affine_weighted_3d(samples, anchor),
        Kernel3::Trilinear(w) => trilinear_3d(samples, anchor, w),
    }
}

fn finite2(g: Point2) -> Option<Point2> {
    if g.is_nan() || !g.x.is_finite() || !g.z.is_finite() {
        None
    } else {
        Some(g)
    }
}

fn finite3(g: Point3) -> Option<Point3> {
    if g.is_nan() || !g.x.is_finite() || !g.y.is_finite() || !g.z.is_finite() {
        None
    } else {
        Some(g)
    }
}

/// Direct 2D solve: two Taylor rows between triangle vertices, with the
/// axis-aligned special cases solved by substitution.
fn direct_2d(samples: &[(Point2, f64)]) -> Option<Point2> {
    if samples.len() < 3 {
        return None;
    }
    let (p0, t0) = samples[0];
    let (p1, t1) = samples[1];
    let (p2, t2) = samples[2];
    let dx1 = p1.x - p0.x;
    let dz1 = p1.z - p0.z;
    let dt1 = t0 - t1;
    let dx2 = p2.x - p0.x;
    let dz2 = p2.z - p0.z;
    let dt2 = t0 - t2;

    let g = if dx1 == 0.0 {
        let gz = dt1 / dz1;
        Point2::new((dt2 - dz2 * gz) / dx2, gz)
    } else if dz2 == 0.0 {
        let gx = dt2 / dx2;
        Point2::new(gx, (dt1 - dx1 * gx) / dz1)
    } else {
        let gz = (dx1 * dt2 - dx2 * dt1) / (dx1 * dz2);
        Point2::new((dt1 - dz1 * gz) / dx1, gz)
    };
    finite2(g)
}

/// Inverse-distance weighted time at `anchor`, skipping coincident samples.
fn anchored_time_2d(anchor: Point2, samples: &[(Point2, f64)]) -> f64 {
    let mut t = 0.0;
    let mut den = 0.0;
    for (p, v) in samples {
        let d = p.distance(anchor);
        if d < SMALL {
            continue;
        }
        let w = 1.0 / d;
        t += w * v;
        den += w;
    }
    t / den
}

fn centroid_2d(samples: &[(Point2, f64)]) -> Point2 {
    let mut c = Point2::default();
    for (p, _) in samples {
        c = c + *p;
    }
    c / samples.len() as f64
}

fn linear_2d(samples: &[(Point2, f64)]) -> Option<Point2> {
    if samples.len() < 3 {
        return None;
    }
    let samples = &samples[..3];
    let cent = centroid_2d(samples);
    let t = anchored_time_2d(cent, samples);

    let a = DMatrix::from_fn(3, 2, |r, c| {
        let d = samples[r].0 - cent;
        if c == 0 {
            d.x
        } else {
            d.z
        }
    });
    let b = DVector::from_fn(3, |r, _| t - samples[r].1);
    let x = nalgebra::linalg::SVD::new(a, true, true)
        .solve(&b, 1e-12)
        .ok()?;
    finite2(Point2::new(x[0], x[1]))
}

fn high_order_2d(samples: &[(Point2, f64)]) -> Option<Point2> {
    if samples.len() < 5 {
        return None;
    }
    let cent = centroid_2d(samples);
    let t = anchored_time_2d(cent, samples);

    let a = DMatrix::from_fn(samples.len(), 5, |r, c| {
        let d = samples[r].0 - cent;
        match c {
            0 => d.x,
            1 => d.z,
            2 => d.x * d.x,
            3 => d.z * d.z,
            _ => d.x * d.z,
        }
    });
    let b = DVector::from_fn(samples.len(), |r, _| t - samples[r].1);
    let x = nalgebra::linalg::SVD::new(a, true, true)
        .solve(&b, 1e-12)
        .ok()?;
    finite2(Point2::new(x[0], x[1]))
}

/// Direct 3D solve: the 3x3 system of vertex differences of a tetrahedron.
fn direct_3d(samples: &[(Point3, f64)]) -> Option<Point3> {
    if samples.len() < 4 {
        return None;
    }
    let (p0, t0) = samples[0];
    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for r in 0..3 {
        let (p, t) = samples[r + 1];
        let d = p - p0;
        a[(r, 0)] = d.x;
        a[(r, 1)] = d.y;
        a[(r, 2)] = d.z;
        b[r] = t0 - t;
    }
    let x = a.try_inverse()? * b;
    finite3(Point3::new(x[0], x[1], x[2]))
}

/// Plane fit over four tetrahedron vertices; the descent direction is the
/// negated fitted plane slope.
fn plane_fit_3d(samples: &[(Point3, f64)]) -> Option<Point3> {
    if samples.len() < 4 {
        return None;
    }
    let mut a = Matrix4::zeros();
    let mut b = nalgebra::Vector4::zeros();
    for r in 0..4 {
        let (p, t) = samples[r];
        a[(r, 0)] = p.x;
        a[(r, 1)] = p.y;
        a[(r, 2)] = p.z;
        a[(r, 3)] = 1.0;
        b[r] = t;
    }
    let x = a.try_inverse()? * b;
    finite3(Point3::new(-x[0], -x[1], -x[2]))
}

/// Build the recentred first-order system, skipping samples coincident with
/// the anchor. Returns (A, b) or None when fewer than 3 rows remain.
fn recentred_system(
    samples: &[(Point3, f64)],
    anchor: Point3,
) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let mut t = 0.0;
    let mut den = 0.0;
    let mut kept: Vec<(Point3, f64)> = Vec::with_capacity(samples.len());
    for (p, v) in samples {
        let d = p.distance(anchor);
        if d < SMALL {
            continue;
        }
        let w = 1.0 / d;
        t += w * v;
        den += w;
        kept.push((*p, *v));
    }
    if kept.len() < 3 || den == 0.0 {
        return None;
    }
    let t = t / den;
    let a = DMatrix::from_fn(kept.len(), 3, |r, c| {
        let d = kept[r].0 - anchor;
        match c {
            0 => d.x,
            1 => d.y,
            _ => d.z,
        }
    });
    let b = DVector::from_fn(kept.len(), |r, _| t - kept[r].1);
    Some((a, b))
}

/// Anchor-recentred first-order least squares, optionally replacing the SVD
/// solve by the penalty-constrained iteration.
pub fn recentred_3d(
    samples: &[(Point3, f64)],
    anchor: Point3,
    opts: Grad3dOptions,
) -> Option<Point3> {
    if samples.len() < 4 {
        return None;
    }
    let (a, b) = recentred_system(samples, anchor)?;
    let x = match opts.constrained_norm {
        Some(norm) => constrained_solve(&a, &b, norm),
        None => {
            let x = nalgebra::linalg::SVD::new(a, true, true)
                .solve(&b, 1e-12)
                .ok()?;
            Vector3::new(x[0], x[1], x[2])
        }
    };
    finite3(Point3::new(x[0], x[1], x[2]))
}

fn high_order_3d(samples: &[(Point3, f64)], anchor: Point3) -> Option<Point3> {
    if samples.len() < 9 {
        return None;
    }
    let mut t = 0.0;
    let mut den = 0.0;
    let mut kept: Vec<(Point3, f64)> = Vec::with_capacity(samples.len());
    for (p, v) in samples {
        let d = p.distance(anchor);
        if d < SMALL {
            continue;
        }
        let w = 1.0 / d;
        t += w * v;
        den += w;
        kept.push((*p, *v));
    }
    if kept.len() < 9 || den == 0.0 {
        return None;
    }
    let t = t / den;
    let a = DMatrix::from_fn(kept.len(), 9, |r, c| {
        let d = kept[r].0 - anchor;
        match c {
            0 => d.x,
            1 => d.y,
            2 => d.z,
            3 => 0.5 * d.x * d.x,
            4 => 0.5 * d.y * d.y,
            5 => 0.5 * d.z * d.z,
            6 => d.x * d.y,
            7 => d.x * d.z,
            _ => d.y * d.z,
        }
    });
    let b = DVector::from_fn(kept.len(), |r, _| t - kept[r].1);
    let x = nalgebra::linalg::SVD::new(a, true, true)
        .solve(&b, 1e-12)
        .ok()?;
    finite3(Point3::new(x[0], x[1], x[2]))
}

/// Affine basis {x, y, z, 1} with 1/d^2 diagonal weights; fitting -T makes
/// the leading coefficients the descent direction.
fn affine_weighted_3d(samples: &[(Point3, f64)], anchor: Point3) -> Option<Point3> {
    if samples.len() < 5 {
        return None;
    }
    let n = samples.len();
    let mut a = DMatrix::zeros(n, 4);
    let mut b = DVector::zeros(n);
    for (r, (p, t)) in samples.iter().enumerate() {
        let d2 = (*p - anchor).norm2().max(SMALL * SMALL);
        let w = Weighting::InvDistSq.weight(d2);
        a[(r, 0)] = w * p.x;
        a[(r, 1)] = w * p.y;
        a[(r, 2)] = w * p.z;
        a[(r, 3)] = w;
        b[r] = -w * t;
    }
    let x = nalgebra::linalg::SVD::new(a, true, true)
        .solve(&b, 1e-12)
        .ok()?;
    finite3(Point3::new(x[0], x[1], x[2]))
}

/// Trilinear basis {1, x, y, z, xy, xz, yz, xyz}; the descent direction is
/// the analytic gradient of the fitted -T at the anchor.
fn trilinear_3d(samples: &[(Point3, f64)], anchor: Point3, weighting: Weighting) -> Option<Point3> {
    if samples.len() < 8 {
        return None;
    }
    let n = samples.len();
    let mut a = DMatrix::zeros(n, 8);
    let mut b = DVector::zeros(n);
    for (r, (p, t)) in samples.iter().enumerate() {
        let d2 = (*p - anchor).norm2().max(SMALL * SMALL);
        let w = weighting.weight(d2);
        a[(r, 0)] = w;
        a[(r, 1)] = w * p.x;
        a[(r, 2)] = w * p.y;
        a[(r, 3)] = w * p.z;
        a[(r, 4)] = w * p.x * p.y;
        a[(r, 5)] = w * p.x * p.z;
        a[(r, 6)] = w * p.y * p.z;
        a[(r, 7)] = w * p.x * p.y * p.z;
        b[r] = -w * t;
    }
    let x = nalgebra::linalg::SVD::new(a, true, true)
        .solve(&b, 1e-12)
        .ok()?;
    let g = Point3::new(
        x[1] + x[4] * anchor.y + x[5] * anchor.z + x[7] * anchor.y * anchor.z,
        x[2] + x[4] * anchor.x + x[6] * anchor.z + x[7] * anchor.x * anchor.z,
        x[3] + x[5] * anchor.x + x[6] * anchor.y + x[7] * anchor.x * anchor.y,
    );
    finite3(g)
}

/// Gauss-Newton iteration for the first-order system with a quadratic
/// penalty pulling |x| toward `norm`. Fixed 20-iteration cap, penalty
/// factor 10, and a 0.01 percent relative-step stopping criterion.
pub fn constrained_solve(a: &DMatrix<f64>, b: &DVector<f64>, norm: f64) -> Vector3<f64> {
    const N_ITER: usize = 20;
    const ALPHA: f64 = 10.0;

    let n = a.nrows();
    let mut x = Vector3::zeros();
    let mut j = DMatrix::zeros(n + 1, 3);
    j.view_mut((0, 0), (n, 3)).copy_from(a);
    let mut r = DVector::zeros(n + 1);

    for _ in 0..N_ITER {
        let ax = a * x;
        for i in 0..n {
            r[i] = ax[i] - b[i];
        }
        r[n] = (x.norm_squared() - norm * norm) * ALPHA;
        j[(n, 0)] = 2.0 * x[0] * ALPHA;
        j[(n, 1)] = 2.0 * x[1] * ALPHA;
        j[(n, 2)] = 2.0 * x[2] * ALPHA;

        let jt = j.transpose();
        let jtj = &jt * &j;
        let inv = match jtj.try_inverse() {
            Some(m) => m,
            None => break,
        };
        let s = inv * (jt * &r);
        let s = Vector3::new(s[0], s[1], s[2]);
        let rel = if x.norm() == 0.0 {
            f64::INFINITY
        } else {
            s.norm() / x.norm() * 100.0
        };
        if rel > 0.01 {
            x -= s;
        } else {
            break;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_time_2d(p: Point2) -> f64 {
        1.0 + 2.0 * p.x - 3.0 * p.z
    }

    fn linear_time_3d(p: Point3) -> f64 {
        0.5 + 1.0 * p.x + 2.0 * p.y + 3.0 * p.z
    }

    fn tri_samples() -> Vec<(Point2, f64)> {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.2),
            Point2::new(0.3, 1.0),
        ]
        .iter()
        .map(|&p| (p, linear_time_2d(p)))
        .collect()
    }

    fn tet_samples() -> Vec<(Point3, f64)> {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.1, 0.0),
            Point3::new(0.2, 1.0, 0.1),
            Point3::new(0.0, 0.3, 1.0),
        ]
        .iter()
        .map(|&p| (p, linear_time_3d(p)))
        .collect()
    }

    fn star_samples_3d(n_side: usize) -> Vec<(Point3, f64)> {
        let mut out = Vec::new();
        for i in 0..n_side {
            for j in 0..n_side {
                for k in 0..n_side {
                    let p = Point3::new(i as f64 * 0.31, j as f64 * 0.27, k as f64 * 0.23);
                    out.push((p, linear_time_3d(p)));
                }
            }
        }
        out
    }

    #[test]
    fn direct_2d_recovers_descent() {
        let g = recover_gradient_2d(Kernel2::Direct, &tri_samples()).unwrap();
        assert!((g.x - (-2.0)).abs() < 1e-12);
        assert!((g.z - 3.0).abs() < 1e-12);
    }

    #[test]
    fn direct_2d_axis_aligned_special_cases() {
        // dx1 == 0
        let samples: Vec<(Point2, f64)> = [
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(1.0, 0.0),
        ]
        .iter()
        .map(|&p| (p, linear_time_2d(p)))
        .collect();
        let g = recover_gradient_2d(Kernel2::Direct, &samples).unwrap();
        assert!((g.x - (-2.0)).abs() < 1e-12);
        assert!((g.z - 3.0).abs() < 1e-12);
    }

    #[test]
    fn linear_2d_recovers_descent() {
        let g = recover_gradient_2d(Kernel2::Linear, &tri_samples()).unwrap();
        assert!((g.x - (-2.0)).abs() < 1e-9);
        assert!((g.z - 3.0).abs() < 1e-9);
    }

    #[test]
    fn high_order_2d_recovers_descent() {
        let mut samples = tri_samples();
        for &p in &[
            Point2::new(1.0, 1.0),
            Point2::new(-0.5, 0.4),
            Point2::new(0.7, -0.6),
        ] {
            samples.push((p, linear_time_2d(p)));
        }
        let g = recover_gradient_2d(Kernel2::HighOrder, &samples).unwrap();
        assert!((g.x - (-2.0)).abs() < 1e-9);
        assert!((g.z - 3.0).abs() < 1e-9);
    }

    #[test]
    fn high_order_2d_needs_five_samples() {
        assert!(recover_gradient_2d(Kernel2::HighOrder, &tri_samples()).is_none());
    }

    #[test]
    fn direct_3d_recovers_descent() {
        let g = recover_gradient_3d(Kernel3::Direct, &tet_samples(), Point3::default()).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-12);
        assert!((g.y - (-2.0)).abs() < 1e-12);
        assert!((g.z - (-3.0)).abs() < 1e-12);
    }

    #[test]
    fn direct_3d_degenerate_is_none() {
        // all four points coplanar in z = 0
        let samples: Vec<(Point3, f64)> = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ]
        .iter()
        .map(|&p| (p, linear_time_3d(p)))
        .collect();
        assert!(recover_gradient_3d(Kernel3::Direct, &samples, Point3::default()).is_none());
    }

    #[test]
    fn plane_fit_3d_recovers_descent() {
        let g = recover_gradient_3d(Kernel3::PlaneFit, &tet_samples(), Point3::default()).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-10);
        assert!((g.y - (-2.0)).abs() < 1e-10);
        assert!((g.z - (-3.0)).abs() < 1e-10);
    }

    #[test]
    fn recentred_3d_recovers_descent() {
        let anchor = Point3::new(0.3, 0.3, 0.3);
        let g = recover_gradient_3d(Kernel3::Recentred, &tet_samples(), anchor).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-9);
        assert!((g.y - (-2.0)).abs() < 1e-9);
        assert!((g.z - (-3.0)).abs() < 1e-9);
    }

    #[test]
    fn recentred_3d_skips_coincident_sample() {
        let mut samples = tet_samples();
        let anchor = samples[0].0;
        samples.push((anchor, 123.0));
        let g = recover_gradient_3d(Kernel3::Recentred, &samples, anchor).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-9);
    }

    #[test]
    fn high_order_3d_recovers_descent() {
        let samples = star_samples_3d(3);
        let anchor = Point3::new(0.3, 0.3, 0.3);
        let g = recover_gradient_3d(Kernel3::HighOrder, &samples, anchor).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-8);
        assert!((g.y - (-2.0)).abs() < 1e-8);
        assert!((g.z - (-3.0)).abs() < 1e-8);
    }

    #[test]
    fn weighted_affine_recovers_descent() {
        let samples = star_samples_3d(2);
        let anchor = Point3::new(0.1, 0.1, 0.1);
        let g = recover_gradient_3d(Kernel3::WeightedAffine, &samples, anchor).unwrap();
        assert!((g.x - (-1.0)).abs() < 1e-8);
        assert!((g.y - (-2.0)).abs() < 1e-8);
        assert!((g.z - (-3.0)).abs() < 1e-8);
    }

    #[test]
    fn trilinear_recovers_descent() {
        for w in [Weighting::Uniform, Weighting::InvDistPow4] {
            let samples = star_samples_3d(2);
            let anchor = Point3::new(0.15, 0.12, 0.1);
            let g = recover_gradient_3d(Kernel3::Trilinear(w), &samples, anchor).unwrap();
            assert!((g.x - (-1.0)).abs() < 1e-7, "{:?}: {:?}", w, g);
            assert!((g.y - (-2.0)).abs() < 1e-7, "{:?}: {:?}", w, g);
            assert!((g.z - (-3.0)).abs() < 1e-7, "{:?}: {:?}", w, g);
        }
    }

    #[test]
    fn constrained_solve_stays_finite() {
        let samples = tet_samples();
        let anchor = Point3::new(0.3, 0.3, 0.3);
        let g = recentred_3d(
            &samples,
            anchor,
            Grad3dOptions {
                constrained_norm: Some(3.74),
            },
        )
        .unwrap();
        assert!(g.x.is_finite() && g.y.is_finite() && g.z.is_finite());
    }
}
