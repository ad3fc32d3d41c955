// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! File I/O: per-node traveltime dumps, VTK XML unstructured-grid export,
//! and a minimal Gmsh 2.2 ASCII mesh reader.

use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use crate::error::{RaytraceError, Result};
use crate::geometry::{Point2, Point3};
use crate::mesh::{TetMesh, TriMesh};

/// Write per-node traveltimes of a 2D mesh as tab-separated text, one
/// primary node per line: `x z T`.
pub fn save_tt_2d(mesh: &TriMesh, path: &Path, thread: usize) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut w = BufWriter::new(file);
    for n in 0..mesh.n_primary_nodes() as u32 {
        let p = mesh.node(n);
        writeln!(
            w,
            "{:.12}\t{:.12}\t{:.12}",
            p.x,
            p.z,
            mesh.traveltime(n, thread)
        )?;
    }
    w.flush()?;
    Ok(())
}

/// Write per-node traveltimes of a 3D mesh as tab-separated text, one
/// primary node per line: `x y z T`.
pub fn save_tt_3d(mesh: &TetMesh, path: &Path, thread: usize) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut w = BufWriter::new(file);
    for n in 0..mesh.n_primary_nodes() as u32 {
        let p = mesh.node(n);
        writeln!(
            w,
            "{:.12}\t{:.12}\t{:.12}\t{:.12}",
            p.x,
            p.y,
            p.z,
            mesh.traveltime(n, thread)
        )?;
    }
    w.flush()?;
    Ok(())
}

/// One scalar field attached to the points of a VTU export.
struct PointScalars<'a> {
    name: &'a str,
    values: Vec<f64>,
}

/// Minimal VTK XML unstructured-grid writer (ASCII data arrays).
///
/// The file layout follows the VTK XML format specification: a `Piece` with
/// `Points`, `Cells` (connectivity / offsets / types) and optional
/// `PointData` / `CellData` arrays. Cell type 5 is a triangle, 10 a
/// tetrahedron.
fn write_vtu(
    path: &Path,
    points: &[[f64; 3]],
    cells: &[&[u32]],
    cell_type: u8,
    point_scalars: &PointScalars<'_>,
    cell_scalars: Option<(&str, &[i32])>,
) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut w = BufWriter::new(file);

    writeln!(w, "<?xml version=\"1.0\"?>")?;
    writeln!(
        w,
        "<VTKFile type=\"UnstructuredGrid\" version=\"0.1\" byte_order=\"LittleEndian\">"
    )?;
    writeln!(w, "  <UnstructuredGrid>")?;
    writeln!(
        w,
        "    <Piece NumberOfPoints=\"{}\" NumberOfCells=\"{}\">",
        points.len(),
        cells.len()
    )?;

    writeln!(w, "      <Points>")?;
    writeln!(
        w,
        "        <DataArray type=\"Float64\" NumberOfComponents=\"3\" format=\"ascii\">"
    )?;
    for p in points {
        writeln!(w, "          {:.12} {:.12} {:.12}", p[0], p[1], p[2])?;
    }
    writeln!(w, "        </DataArray>")?;
    writeln!(w, "      </Points>")?;

    writeln!(w, "      <Cells>")?;
    writeln!(
        w,
        "        <DataArray type=\"Int64\" Name=\"connectivity\" format=\"ascii\">"
    )?;
    for c in cells {
        let ids: Vec<String> = c.iter().map(|i| i.to_string()).collect();
        writeln!(w, "          {}", ids.join(" "))?;
    }
    writeln!(w, "        </DataArray>")?;
    writeln!(
        w,
        "        <DataArray type=\"Int64\" Name=\"offsets\" format=\"ascii\">"
    )?;
    let mut offset = 0usize;
    for c in cells {
        offset += c.len();
        writeln!(w, "          {}", offset)?;
    }
    writeln!(w, "        </DataArray>")?;
    writeln!(
        w,
        "        <DataArray type=\"UInt8\" Name=\"types\" format=\"ascii\">"
    )?;
    for _ in cells {
        writeln!(w, "          {}", cell_type)?;
    }
    writeln!(w, "        </DataArray>")?;
    writeln!(w, "      </Cells>")?;

    writeln!(w, "      <PointData Scalars=\"{}\">", point_scalars.name)?;
    writeln!(
        w,
        "        <DataArray type=\"Float64\" Name=\"{}\" format=\"ascii\">",
        point_scalars.name
    )?;
    for v in &point_scalars.values {
        writeln!(w, "          {:.12}", v)?;
    }
    writeln!(w, "        </DataArray>")?;
    writeln!(w, "      </PointData>")?;

    if let Some((name, values)) = cell_scalars {
        writeln!(w, "      <CellData>")?;
        writeln!(
            w,
            "        <DataArray type=\"Int32\" Name=\"{}\" format=\"ascii\">",
            name
        )?;
        for v in values {
            writeln!(w, "          {}", v)?;
        }
        writeln!(w, "        </DataArray>")?;
        writeln!(w, "      </CellData>")?;
    }

    writeln!(w, "    </Piece>")?;
    writeln!(w, "  </UnstructuredGrid>")?;
    writeln!(w, "</VTKFile>")?;
    w.flush()?;
    Ok(())
}

/// Export a 2D model as a `.vtu` file with a per-node "Slowness" (or, when
/// `save_slowness` is false, "Velocity") scalar and optionally the per-cell
/// physical-entity tags.
pub fn save_model_vtu_2d(
    mesh: &TriMesh,
    path: &Path,
    save_slowness: bool,
    save_physical_entity: bool,
) -> Result<()> {
    let points: Vec<[f64; 3]> = (0..mesh.n_primary_nodes() as u32)
        .map(|n| {
            let p = mesh.node(n);
            [p.x, 0.0, p.z]
        })
        .collect();
    let conn: Vec<&[u32]> = mesh.triangles().iter().map(|t| &t.i[..]).collect();
    let scalars = model_scalars(
        save_slowness,
        (0..mesh.n_primary_nodes() as u32)
            .map(|n| mesh.slowness_at(n))
            .collect(),
    );
    let entities: Vec<i32> = mesh.triangles().iter().map(|t| t.physical_entity).collect();
    write_vtu(
        path,
        &points,
        &conn,
        5,
        &scalars,
        save_physical_entity.then_some(("Physical entity", entities.as_slice())),
    )
}

/// Export a 3D model as a `.vtu` file (see [`save_model_vtu_2d`]).
pub fn save_model_vtu_3d(
    mesh: &TetMesh,
    path: &Path,
    save_slowness: bool,
    save_physical_entity: bool,
) -> Result<()> {
    let points: Vec<[f64; 3]> = (0..mesh.n_primary_nodes() as u32)
        .map(|n| {
            let p = mesh.node(n);
            [p.x, p.y, p.z]
        })
        .collect();
    let conn: Vec<&[u32]> = mesh.tetrahedra().iter().map(|t| &t.i[..]).collect();
    let scalars = model_scalars(
        save_slowness,
        (0..mesh.n_primary_nodes() as u32)
            .map(|n| mesh.slowness_at(n))
            .collect(),
    );
    let entities: Vec<i32> = mesh
        .tetrahedra()
        .iter()
        .map(|t| t.physical_entity)
        .collect();
    write_vtu(
        path,
        &points,
        &conn,
        10,
        &scalars,
        save_physical_entity.then_some(("Physical entity", entities.as_slice())),
    )
}

fn model_scalars(save_slowness: bool, slowness: Vec<f64>) -> PointScalars<'static> {
    if save_slowness {
        PointScalars {
            name: "Slowness",
            values: slowness,
        }
    } else {
        PointScalars {
            name: "Velocity",
            values: slowness.into_iter().map(|s| 1.0 / s).collect(),
        }
    }
}

/// Export per-node traveltimes of a 2D mesh as a `.vtu` file with a
/// "Travel time" scalar.
pub fn save_tt_vtu_2d(mesh: &TriMesh, path: &Path, thread: usize) -> Result<()> {
    let points: Vec<[f64; 3]> = (0..mesh.n_primary_nodes() as u32)
        .map(|n| {
            let p = mesh.node(n);
            [p.x, 0.0, p.z]
        })
        .collect();
    let conn: Vec<&[u32]> = mesh.triangles().iter().map(|t| &t.i[..]).collect();
    let scalars = PointScalars {
        name: "Travel time",
        values: (0..mesh.n_primary_nodes() as u32)
            .map(|n| mesh.traveltime(n, thread))
            .collect(),
    };
    write_vtu(path, &points, &conn, 5, &scalars, None)
}

/// Export per-node traveltimes of a 3D mesh as a `.vtu` file with a
/// "Travel time" scalar.
pub fn save_tt_vtu_3d(mesh: &TetMesh, path: &Path, thread: usize) -> Result<()> {
    let points: Vec<[f64; 3]> = (0..mesh.n_primary_nodes() as u32)
        .map(|n| {
            let p = mesh.node(n);
            [p.x, p.y, p.z]
        })
        .collect();
    let conn: Vec<&[u32]> = mesh.tetrahedra().iter().map(|t| &t.i[..]).collect();
    let scalars = PointScalars {
        name: "Travel time",
        values: (0..mesh.n_primary_nodes() as u32)
            .map(|n| mesh.traveltime(n, thread))
            .collect(),
    };
    write_vtu(path, &points, &conn, 10, &scalars, None)
}

/// Raw contents of a Gmsh 2.2 ASCII file: node coordinates in file order and
/// the elements of one requested type with their first physical tag.
struct MshContents {
    node_ids: Vec<usize>,
    coords: Vec<[f64; 3]>,
    elements: Vec<(Vec<usize>, i32)>,
}

fn parse_msh(path: &Path, element_type: u32, nodes_per_elem: usize) -> Result<MshContents> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut node_ids = Vec::new();
    let mut coords = Vec::new();
    let mut elements = Vec::new();

    #[derive(PartialEq)]
    enum Section {
        None,
        Nodes,
        Elements,
    }
    let mut section = Section::None;
    let mut skip_count_line = false;

    for (lineno0, line) in reader.lines().enumerate() {
        let line = line?;
        let lineno = lineno0 + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed {
            "$Nodes" => {
                section = Section::Nodes;
                skip_count_line = true;
                continue;
            }
            "$EndNodes" | "$EndElements" => {
                section = Section::None;
                continue;
            }
            "$Elements" => {
                section = Section::Elements;
                skip_count_line = true;
                continue;
            }
            _ => {}
        }
        if trimmed.starts_with('$') {
            // other sections ($MeshFormat, $PhysicalNames, ...) are skipped
            section = Section::None;
            continue;
        }
        if skip_count_line {
            skip_count_line = false;
            continue;
        }

        match section {
            Section::Nodes => {
                let fields: Vec<&str> = trimmed.split_whitespace().collect();
                if fields.len() < 4 {
                    return Err(RaytraceError::Parse {
                        line: lineno,
                        reason: "expected: node-id x y z".to_string(),
                    });
                }
                let id: usize = fields[0].parse().map_err(|_| RaytraceError::Parse {
                    line: lineno,
                    reason: format!("invalid node id '{}'", fields[0]),
                })?;
                let mut xyz = [0.0f64; 3];
                for (k, f) in fields[1..4].iter().enumerate() {
                    xyz[k] = f.parse().map_err(|_| RaytraceError::Parse {
                        line: lineno,
                        reason: format!("invalid coordinate '{}'", f),
                    })?;
                }
                node_ids.push(id);
                coords.push(xyz);
            }
            Section::Elements => {
                let fields: Vec<&str> = trimmed.split_whitespace().collect();
                if fields.len() < 3 {
                    return Err(RaytraceError::Parse {
                        line: lineno,
                        reason: "expected: elem-id type ntags ...".to_string(),
                    });
                }
                let etype: u32 = fields[1].parse().map_err(|_| RaytraceError::Parse {
                    line: lineno,
                    reason: format!("invalid element type '{}'", fields[1]),
                })?;
                if etype != element_type {
                    continue;
                }
                let ntags: usize = fields[2].parse().map_err(|_| RaytraceError::Parse {
                    line: lineno,
                    reason: format!("invalid tag count '{}'", fields[2]),
                })?;
                let first = 3 + ntags;
                if fields.len() < first + nodes_per_elem {
                    return Err(RaytraceError::Parse {
                        line: lineno,
                        reason: format!("expected {} node indices", nodes_per_elem),
                    });
                }
                let physical_entity: i32 = if ntags > 0 {
                    fields[3].parse().unwrap_or(0)
                } else {
                    0
                };
                let mut ids = Vec::with_capacity(nodes_per_elem);
                for f in &fields[first..first + nodes_per_elem] {
                    let id: usize = f.parse().map_err(|_| RaytraceError::Parse {
                        line: lineno,
                        reason: format!("invalid node index '{}'", f),
                    })?;
                    ids.push(id);
                }
                elements.push((ids, physical_entity));
            }
            Section::None => {}
        }
    }

    Ok(MshContents {
        node_ids,
        coords,
        elements,
    })
}

fn id_map(node_ids: &[usize]) -> HashMap<usize, u32> {
    node_ids
        .iter()
        .enumerate()
        .map(|(k, &id)| (id, k as u32))
        .collect()
}

fn map_id(map: &HashMap<usize, u32>, id: usize) -> Result<u32> {
    map.get(&id)
        .copied()
        .ok_or_else(|| RaytraceError::InvalidMesh {
            reason: format!("element references unknown node id {}", id),
        })
}

/// Read a 2D mesh (element type 2, triangles) from a Gmsh 2.2 ASCII file.
///
/// Nodes take the x and z columns of the file, the convention of x-z-plane
/// cross-section models. Other element types are skipped.
pub fn read_msh_2d(path: &Path) -> Result<(Vec<Point2>, Vec<([u32; 3], i32)>)> {
    let msh = parse_msh(path, 2, 3)?;
    let map = id_map(&msh.node_ids);
    let nodes: Vec<Point2> = msh.coords.iter().map(|c| Point2::new(c[0], c[2])).collect();
    let mut tris = Vec::with_capacity(msh.elements.len());
    for (ids, pe) in &msh.elements {
        tris.push((
            [
                map_id(&map, ids[0])?,
                map_id(&map, ids[1])?,
                map_id(&map, ids[2])?,
            ],
            *pe,
        ));
    }
    Ok((nodes, tris))
}

/// Read a 3D mesh (element type 4, tetrahedra) from a Gmsh 2.2 ASCII file.
/// Other element types are skipped.
pub fn read_msh_3d(path: &Path) -> Result<(Vec<Point3>, Vec<([u32; 4], i32)>)> {
    let msh = parse_msh(path, 4, 4)?;
    let map = id_map(&msh.node_ids);
    let nodes: Vec<Point3> = msh
        .coords
        .iter()
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect();
    let mut tets = Vec::with_capacity(msh.elements.len());
    for (ids, pe) in &msh.elements {
        tets.push((
            [
                map_id(&map, ids[0])?,
                map_id(&map, ids[1])?,
                map_id(&map, ids[2])?,
                map_id(&map, ids[3])?,
            ],
            *pe,
        ));
    }
    Ok((nodes, tets))
}
