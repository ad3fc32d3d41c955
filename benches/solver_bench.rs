// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use eikonal_fmm::{Point2, Point3, TetMesh, TriMesh};

/// Structured n x n square sheet, each cell split into two triangles.
fn make_mesh_2d(n: usize) -> TriMesh {
    let mut nodes = Vec::with_capacity((n + 1) * (n + 1));
    for j in 0..=n {
        for i in 0..=n {
            nodes.push(Point2::new(i as f64, j as f64));
        }
    }
    let idx = |i: usize, j: usize| (j * (n + 1) + i) as u32;
    let mut tris = Vec::with_capacity(2 * n * n);
    for j in 0..n {
        for i in 0..n {
            tris.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]);
            tris.push([idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]);
        }
    }
    let mut mesh = TriMesh::new(nodes, &tris, 1).unwrap();
    mesh.set_slowness_uniform(1.0).unwrap();
    mesh
}

/// Structured n x n x n cube, each cell split into six tetrahedra along the
/// main diagonal.
fn make_mesh_3d(n: usize) -> TetMesh {
    let np = n + 1;
    let mut nodes = Vec::with_capacity(np * np * np);
    for k in 0..np {
        for j in 0..np {
            for i in 0..np {
                nodes.push(Point3::new(i as f64, j as f64, k as f64));
            }
        }
    }
    let idx = |i: usize, j: usize, k: usize| (k * np * np + j * np + i) as u32;
    let mut tets = Vec::with_capacity(6 * n * n * n);
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let v000 = idx(i, j, k);
                let v100 = idx(i + 1, j, k);
                let v010 = idx(i, j + 1, k);
                let v001 = idx(i, j, k + 1);
                let v110 = idx(i + 1, j + 1, k);
                let v101 = idx(i + 1, j, k + 1);
                let v011 = idx(i, j + 1, k + 1);
                let v111 = idx(i + 1, j + 1, k + 1);
                tets.push([v000, v100, v110, v111]);
                tets.push([v000, v100, v101, v111]);
                tets.push([v000, v010, v110, v111]);
                tets.push([v000, v010, v011, v111]);
                tets.push([v000, v001, v101, v111]);
                tets.push([v000, v001, v011, v111]);
            }
        }
    }
    let mut mesh = TetMesh::new(nodes, &tets, 1).unwrap();
    mesh.set_slowness_uniform(1.0).unwrap();
    mesh
}

/// 2D propagation over square sheets of increasing size.
fn bench_propagation_2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation_2d");
    for &n in &[16, 32, 64] {
        let mesh = make_mesh_2d(n);
        let tx = [Point2::new((n / 2) as f64, (n / 2) as f64)];
        let rx = [Point2::new(0.0, 0.0)];
        group.bench_function(format!("{}x{}", n, n), |b| {
            b.iter(|| {
                let tt = mesh.raytrace(&tx, &[0.0], &rx, 0).unwrap();
                black_box(tt)
            });
        });
    }
    group.finish();
}

/// 3D propagation over a tetrahedralized cube.
fn bench_propagation_3d(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation_3d");
    for &n in &[8, 16] {
        let mesh = make_mesh_3d(n);
        let half = (n / 2) as f64;
        let tx = [Point3::new(half, half, half)];
        let rx = [Point3::new(0.0, 0.0, 0.0)];
        group.bench_function(format!("{0}x{0}x{0}", n), |b| {
            b.iter(|| {
                let tt = mesh.raytrace(&tx, &[0.0], &rx, 0).unwrap();
                black_box(tt)
            });
        });
    }
    group.finish();
}

/// Ray tracing cost on top of a solved field: a fan of receivers on the
/// sheet boundary.
fn bench_ray_paths_2d(c: &mut Criterion) {
    let n = 32;
    let mesh = make_mesh_2d(n);
    let tx = [Point2::new((n / 2) as f64, (n / 2) as f64)];
    let rx: Vec<Point2> = (1..n).step_by(4).map(|i| Point2::new(i as f64, 0.0)).collect();
    c.bench_function("ray_paths_2d_32x32", |b| {
        b.iter(|| {
            let out = mesh.raytrace_with_paths(&tx, &[0.0], &rx, 0).unwrap();
            black_box(out)
        });
    });
}

criterion_group!(
    benches,
    bench_propagation_2d,
    bench_propagation_3d,
    bench_ray_paths_2d,
);
criterion_main!(benches);
