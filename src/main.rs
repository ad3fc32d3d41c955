// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;

use eikonal_fmm::{io, Point2, Point3, TetMesh, TriMesh};

#[derive(Parser)]
#[command(
    name = "eikonal-fmm",
    about = "Fast-marching traveltime solver and ray tracer on unstructured meshes"
)]
struct Cli {
    /// Dimensionality (2 or 3)
    #[arg(short = 'd', long)]
    dim: usize,

    /// Gmsh 2.2 ASCII mesh file (triangles in 2D, tetrahedra in 3D)
    #[arg(short = 'm', long)]
    mesh: PathBuf,

    /// Slowness field: "uniform:<val>" or "file:<path>" (one value per node)
    #[arg(long, default_value = "uniform:1.0")]
    slowness: String,

    /// Source coordinates, comma-separated (repeatable)
    #[arg(long, num_args = 1)]
    source: Vec<String>,

    /// Source onset time, repeatable to match --source (default 0 for all)
    #[arg(long)]
    t0: Vec<f64>,

    /// Receiver coordinates, comma-separated (repeatable)
    #[arg(long, num_args = 1)]
    rx: Vec<String>,

    /// Receiver file: one comma- or whitespace-separated point per line
    #[arg(long)]
    rx_file: Option<PathBuf>,

    /// Seeding radius around a single source (0 disables)
    #[arg(long, default_value = "0.0")]
    source_radius: f64,

    /// Also trace ray paths and write them next to the outputs
    #[arg(long)]
    paths: bool,

    /// Output file prefix
    #[arg(short = 'o', long, default_value = "tt")]
    output: String,

    /// Save the model (slowness + physical entity) as a VTK .vtu file
    #[arg(long)]
    save_model: bool,

    /// Save per-node traveltimes as VTK .vtu instead of .dat
    #[arg(long)]
    vtu: bool,

    /// Solve each source independently, one worker thread per source
    #[arg(long)]
    per_source: bool,

    /// Number of Rayon worker threads for --per-source
    #[arg(long)]
    threads: Option<usize>,
}

fn parse_coords(s: &str, dim: usize) -> Result<Vec<f64>> {
    let parts: Vec<f64> = s
        .split([',', ' '])
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid point '{}': expected comma-separated floats", s))?;
    if parts.len() != dim {
        bail!("point '{}' has {} components but --dim is {}", s, parts.len(), dim);
    }
    Ok(parts)
}

fn collect_points(cli: &Cli, dim: usize) -> Result<Vec<Vec<f64>>> {
    let mut pts = Vec::new();
    for s in &cli.rx {
        pts.push(parse_coords(s, dim)?);
    }
    if let Some(path) = &cli.rx_file {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open receiver file {}", path.display()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            pts.push(parse_coords(&line, dim)?);
        }
    }
    if pts.is_empty() {
        bail!("no receivers given: use --rx or --rx-file");
    }
    Ok(pts)
}

fn load_slowness(mode: &str, n_nodes: usize) -> Result<SlownessField> {
    if let Some(val_str) = mode.strip_prefix("uniform:") {
        let val: f64 = val_str.parse().context("invalid uniform slowness value")?;
        return Ok(SlownessField::Uniform(val));
    }
    if let Some(path_str) = mode.strip_prefix("file:") {
        let file = std::fs::File::open(path_str)
            .with_context(|| format!("cannot open slowness file {}", path_str))?;
        let mut values = Vec::with_capacity(n_nodes);
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let t = line.trim();
            if t.is_empty() {
                continue;
            }
            values.push(t.parse::<f64>().context("invalid slowness value")?);
        }
        return Ok(SlownessField::PerNode(values));
    }
    bail!(
        "unknown --slowness mode: '{}'. Expected 'uniform:<val>' or 'file:<path>'",
        mode
    );
}

enum SlownessField {
    Uniform(f64),
    PerNode(Vec<f64>),
}

fn write_rays<P>(path: &str, rays: &[Vec<P>], fmt: impl Fn(&P) -> String) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut w = std::io::BufWriter::new(file);
    for ray in rays {
        for p in ray {
            writeln!(w, "{}", fmt(p))?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn run_2d(cli: &Cli) -> Result<()> {
    let (nodes, tris) = io::read_msh_2d(&cli.mesh)?;
    let n_nodes = nodes.len();

    let sources: Vec<Point2> = cli
        .source
        .iter()
        .map(|s| parse_coords(s, 2).map(|c| Point2::new(c[0], c[1])))
        .collect::<Result<_>>()?;
    let t0 = source_times(cli, sources.len())?;
    let receivers: Vec<Point2> = collect_points(cli, 2)?
        .into_iter()
        .map(|c| Point2::new(c[0], c[1]))
        .collect();

    let nt = if cli.per_source { sources.len() } else { 1 };
    let mut mesh = TriMesh::new_tagged(nodes, &tris, nt)?;
    match load_slowness(&cli.slowness, n_nodes)? {
        SlownessField::Uniform(v) => mesh.set_slowness_uniform(v)?,
        SlownessField::PerNode(v) => mesh.set_slowness(&v)?,
    }
    mesh.set_source_radius(cli.source_radius)?;

    eprintln!(
        "mesh: {} nodes, {} cells, x [{}, {}], z [{}, {}]",
        mesh.n_nodes(),
        mesh.n_cells(),
        mesh.x_min(),
        mesh.x_max(),
        mesh.z_min(),
        mesh.z_max()
    );

    if cli.save_model {
        let path = format!("{}_model.vtu", cli.output);
        io::save_model_vtu_2d(&mesh, path.as_ref(), true, true)?;
    }

    if cli.per_source && sources.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads.unwrap_or(sources.len()))
            .build()
            .context("cannot build worker pool")?;
        let results: Vec<_> = pool.install(|| {
            sources
                .par_iter()
                .enumerate()
                .map(|(i, &src)| solve_2d_single(&mesh, src, t0[i], &receivers, i, cli.paths))
                .collect()
        });
        for (i, r) in results.into_iter().enumerate() {
            let (tt, rays) = r?;
            report_2d(&mesh, cli, &receivers, &tt, rays.as_deref(), i, Some(i))?;
        }
    } else {
        let (tt, rays) = if cli.paths {
            let (tt, rays) = mesh.raytrace_with_paths(&sources, &t0, &receivers, 0)?;
            (tt, Some(rays))
        } else {
            (mesh.raytrace(&sources, &t0, &receivers, 0)?, None)
        };
        report_2d(&mesh, cli, &receivers, &tt, rays.as_deref(), 0, None)?;
    }
    Ok(())
}

fn solve_2d_single(
    mesh: &TriMesh,
    src: Point2,
    t0: f64,
    receivers: &[Point2],
    thread: usize,
    paths: bool,
) -> eikonal_fmm::Result<(Vec<f64>, Option<Vec<Vec<Point2>>>)> {
    if paths {
        let (tt, rays) = mesh.raytrace_with_paths(&[src], &[t0], receivers, thread)?;
        Ok((tt, Some(rays)))
    } else {
        Ok((mesh.raytrace(&[src], &[t0], receivers, thread)?, None))
    }
}

fn report_2d(
    mesh: &TriMesh,
    cli: &Cli,
    receivers: &[Point2],
    tt: &[f64],
    rays: Option<&[Vec<Point2>]>,
    thread: usize,
    source_no: Option<usize>,
) -> Result<()> {
    let tag = source_no
        .map(|i| format!("_src{}", i))
        .unwrap_or_default();
    for (r, t) in receivers.iter().zip(tt) {
        match source_no {
            Some(i) => println!("src {}  rx {} {}  t {:.12}", i, r.x, r.z, t),
            None => println!("rx {} {}  t {:.12}", r.x, r.z, t),
        }
    }
    if cli.vtu {
        let path = format!("{}{}.vtu", cli.output, tag);
        io::save_tt_vtu_2d(mesh, path.as_ref(), thread)?;
    } else {
        let path = format!("{}{}.dat", cli.output, tag);
        io::save_tt_2d(mesh, path.as_ref(), thread)?;
    }
    if let Some(rays) = rays {
        let path = format!("{}{}_rays.dat", cli.output, tag);
        write_rays(&path, rays, |p| format!("{:.12}\t{:.12}", p.x, p.z))?;
    }
    Ok(())
}

fn run_3d(cli: &Cli) -> Result<()> {
    let (nodes, tets) = io::read_msh_3d(&cli.mesh)?;
    let n_nodes = nodes.len();

    let sources: Vec<Point3> = cli
        .source
        .iter()
        .map(|s| parse_coords(s, 3).map(|c| Point3::new(c[0], c[1], c[2])))
        .collect::<Result<_>>()?;
    let t0 = source_times(cli, sources.len())?;
    let receivers: Vec<Point3> = collect_points(cli, 3)?
        .into_iter()
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect();

    let nt = if cli.per_source { sources.len() } else { 1 };
    let mut mesh = TetMesh::new_tagged(nodes, &tets, nt)?;
    match load_slowness(&cli.slowness, n_nodes)? {
        SlownessField::Uniform(v) => mesh.set_slowness_uniform(v)?,
        SlownessField::PerNode(v) => mesh.set_slowness(&v)?,
    }
    mesh.set_source_radius(cli.source_radius)?;

    eprintln!("mesh: {} nodes, {} cells", mesh.n_nodes(), mesh.n_cells());

    if cli.save_model {
        let path = format!("{}_model.vtu", cli.output);
        io::save_model_vtu_3d(&mesh, path.as_ref(), true, true)?;
    }

    if cli.per_source && sources.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads.unwrap_or(sources.len()))
            .build()
            .context("cannot build worker pool")?;
        let results: Vec<_> = pool.install(|| {
            sources
                .par_iter()
                .enumerate()
                .map(|(i, &src)| solve_3d_single(&mesh, src, t0[i], &receivers, i, cli.paths))
                .collect()
        });
        for (i, r) in results.into_iter().enumerate() {
            let (tt, rays) = r?;
            report_3d(&mesh, cli, &receivers, &tt, rays.as_deref(), i, Some(i))?;
        }
    } else {
        let (tt, rays) = if cli.paths {
            let (tt, rays) = mesh.raytrace_with_paths(&sources, &t0, &receivers, 0)?;
            (tt, Some(rays))
        } else {
            (mesh.raytrace(&sources, &t0, &receivers, 0)?, None)
        };
        report_3d(&mesh, cli, &receivers, &tt, rays.as_deref(), 0, None)?;
    }
    Ok(())
}

fn solve_3d_single(
    mesh: &TetMesh,
    src: Point3,
    t0: f64,
    receivers: &[Point3],
    thread: usize,
    paths: bool,
) -> eikonal_fmm::Result<(Vec<f64>, Option<Vec<Vec<Point3>>>)> {
    if paths {
        let (tt, rays) = mesh.raytrace_with_paths(&[src], &[t0], receivers, thread)?;
        Ok((tt, Some(rays)))
    } else {
        Ok((mesh.raytrace(&[src], &[t0], receivers, thread)?, None))
    }
}

fn report_3d(
    mesh: &TetMesh,
    cli: &Cli,
    receivers: &[Point3],
    tt: &[f64],
    rays: Option<&[Vec<Point3>]>,
    thread: usize,
    source_no: Option<usize>,
) -> Result<()> {
    let tag = source_no
        .map(|i| format!("_src{}", i))
        .unwrap_or_default();
    for (r, t) in receivers.iter().zip(tt) {
        match source_no {
            Some(i) => println!("src {}  rx {} {} {}  t {:.12}", i, r.x, r.y, r.z, t),
            None => println!("rx {} {} {}  t {:.12}", r.x, r.y, r.z, t),
        }
    }
    if cli.vtu {
        let path = format!("{}{}.vtu", cli.output, tag);
        io::save_tt_vtu_3d(mesh, path.as_ref(), thread)?;
    } else {
        let path = format!("{}{}.dat", cli.output, tag);
        io::save_tt_3d(mesh, path.as_ref(), thread)?;
    }
    if let Some(rays) = rays {
        let path = format!("{}{}_rays.dat", cli.output, tag);
        write_rays(&path, rays, |p| {
            format!("{:.12}\t{:.12}\t{:.12}", p.x, p.y, p.z)
        })?;
    }
    Ok(())
}

fn source_times(cli: &Cli, n_sources: usize) -> Result<Vec<f64>> {
    if cli.t0.is_empty() {
        Ok(vec![0.0; n_sources])
    } else if cli.t0.len() == n_sources {
        Ok(cli.t0.clone())
    } else {
        bail!(
            "--t0 given {} times but there are {} sources",
            cli.t0.len(),
            n_sources
        );
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.dim != 2 && cli.dim != 3 {
        bail!("--dim must be 2 or 3, got {}", cli.dim);
    }
    if cli.source.is_empty() {
        bail!("at least one --source must be specified");
    }

    match cli.dim {
        2 => run_2d(&cli),
        3 => run_3d(&cli),
        _ => unreachable!(),
    }
}
