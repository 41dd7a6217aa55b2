//! Readers and writers for the persisted grid and mesh formats: the DEM
//! text format, the `.geodat` sidecar + big-endian binary velocity blobs,
//! Triangle's `.poly`/`.node`/`.ele`/`.area` conventions, the Arc/Info
//! ASCII grid ("QGIS") output, and plain per-vertex field files.
//!
//! Malformed files are always fatal here; nothing is parsed best-effort.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use ndarray::Array2;

use crate::error::{Error, Result};
use crate::mesh::Triangulation;
use crate::raster::Raster;

/// No-data fill for the Arc/Info ASCII grid maps.
pub const GRID_NO_DATA: f64 = -9999.0;

fn lines_of(path: &Path) -> Result<std::io::Lines<BufReader<File>>> {
    Ok(BufReader::new(File::open(path)?).lines())
}

fn next_line(
    lines: &mut std::io::Lines<BufReader<File>>,
    path: &Path,
    what: &str,
) -> Result<String> {
    match lines.next() {
        Some(l) => Ok(l?),
        None => Err(Error::format(path, format!("file ends before {}", what))),
    }
}

fn parse_tok<T: std::str::FromStr>(tok: &str, path: &Path, what: &str) -> Result<T> {
    tok.parse::<T>()
        .map_err(|_| Error::format(path, format!("bad {} token '{}'", what, tok)))
}

fn first_tok<'a>(line: &'a str, path: &Path, what: &str) -> Result<&'a str> {
    line.split_whitespace()
        .next()
        .ok_or_else(|| Error::format(path, format!("blank line where {} expected", what)))
}

/// Reads the DEM text format: a column count line, a row count line, then
/// `nx*ny` lines of `x y value` in column-major order.
pub fn read_dem(path: &Path) -> Result<Raster> {
    let mut lines = lines_of(path)?;

    let header = next_line(&mut lines, path, "column count")?;
    let nx: usize = parse_tok(first_tok(&header, path, "column count")?, path, "column count")?;
    let header = next_line(&mut lines, path, "row count")?;
    let ny: usize = parse_tok(first_tok(&header, path, "row count")?, path, "row count")?;

    let mut x = vec![0.0; nx];
    let mut y = vec![0.0; ny];
    let mut q = Array2::zeros((ny, nx));

    for j in 0..nx {
        for i in 0..ny {
            let line = next_line(&mut lines, path, "grid point")?;
            let mut toks = line.split_whitespace();
            let mut three = || -> Result<f64> {
                match toks.next() {
                    Some(t) => parse_tok(t, path, "grid point"),
                    None => Err(Error::format(path, "grid point line has fewer than 3 fields")),
                }
            };
            x[j] = three()?;
            y[i] = three()?;
            q[[i, j]] = three()?;
        }
    }

    Raster::new(x, y, q).map_err(|e| Error::format(path, e.to_string()))
}

/// Writes the DEM text format in the same column-major order [read_dem]
/// expects, so a write/read pair round-trips exactly.
pub fn write_dem(path: &Path, r: &Raster) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", r.nx())?;
    writeln!(out, "{}", r.ny())?;
    for j in 0..r.nx() {
        for i in 0..r.ny() {
            writeln!(out, "{} {} {}", r.x[j], r.y[i], r.get(i, j))?;
        }
    }
    Ok(())
}

/// Reads a binary velocity grid: `<stem>.geodat` holds three whitespace
/// pairs (grid dimensions, spacing, lower-left origin; spacing and origin
/// are in km and scale to meters), `<stem>` itself is a big-endian f32
/// blob in row-major order.
pub fn read_geodat(stem: &Path) -> Result<Raster> {
    let sidecar = PathBuf::from(format!("{}.geodat", stem.display()));
    let mut pairs: Vec<(f64, f64)> = Vec::new();
    for line in lines_of(&sidecar)? {
        let line = line?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() == 2 && pairs.len() < 3 {
            if let (Ok(a), Ok(b)) = (toks[0].parse::<f64>(), toks[1].parse::<f64>()) {
                pairs.push((a, b));
            }
        }
    }
    if pairs.len() < 3 {
        return Err(Error::format(
            &sidecar,
            format!("expected 3 coordinate pairs, found {}", pairs.len()),
        ));
    }

    let nx = pairs[0].0 as usize;
    let ny = pairs[0].1 as usize;
    let (dx, dy) = (pairs[1].0 * 1000.0, pairs[1].1 * 1000.0);
    let (xo, yo) = (pairs[2].0 * 1000.0, pairs[2].1 * 1000.0);

    let raw = fs::read(stem)?;
    if raw.len() % 4 != 0 {
        return Err(Error::format(stem, "binary length is not a multiple of 4"));
    }
    let nvals = raw.len() / 4;
    if nvals != nx * ny {
        return Err(Error::format(
            stem,
            format!("{} samples for a {}x{} grid", nvals, ny, nx),
        ));
    }

    let mut data = Array2::zeros((ny, nx));
    for i in 0..ny {
        for j in 0..nx {
            data[[i, j]] = BigEndian::read_f32(&raw[4 * (i * nx + j)..]) as f64;
        }
    }

    let x = (0..nx).map(|i| xo + i as f64 * dx).collect();
    let y = (0..ny).map(|i| yo + i as f64 * dy).collect();
    Raster::new(x, y, data).map_err(|e| Error::format(stem, e.to_string()))
}

/// A planar straight-line graph read from Triangle's `.poly` format.
#[derive(Debug, Clone)]
pub struct Pslg {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub boundary: Vec<i32>,
    pub edges: Vec<[usize; 2]>,
    pub hole_x: Vec<f64>,
    pub hole_y: Vec<f64>,
}

/// Reads a `.poly` file. Vertex and edge references are 1-indexed on disk
/// and 0-indexed in the result.
pub fn read_poly(path: &Path) -> Result<Pslg> {
    let mut lines = lines_of(path)?;

    let header = next_line(&mut lines, path, "vertex count")?;
    let nn: usize = parse_tok(first_tok(&header, path, "vertex count")?, path, "vertex count")?;

    let mut x = vec![0.0; nn];
    let mut y = vec![0.0; nn];
    let mut boundary = vec![0i32; nn];
    for i in 0..nn {
        let line = next_line(&mut lines, path, "vertex")?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 4 {
            return Err(Error::format(path, format!("vertex line {} has {} fields", i, toks.len())));
        }
        x[i] = parse_tok(toks[1], path, "vertex x")?;
        y[i] = parse_tok(toks[2], path, "vertex y")?;
        boundary[i] = parse_tok(toks[3], path, "boundary marker")?;
    }

    let header = next_line(&mut lines, path, "edge count")?;
    let ne: usize = parse_tok(first_tok(&header, path, "edge count")?, path, "edge count")?;

    let mut edges = Vec::with_capacity(ne);
    for i in 0..ne {
        let line = next_line(&mut lines, path, "edge")?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 3 {
            return Err(Error::format(path, format!("edge line {} has {} fields", i, toks.len())));
        }
        let a: usize = parse_tok(toks[1], path, "edge vertex")?;
        let b: usize = parse_tok(toks[2], path, "edge vertex")?;
        if a < 1 || a > nn || b < 1 || b > nn {
            return Err(Error::format(path, format!("edge {} references vertex out of range", i)));
        }
        edges.push([a - 1, b - 1]);
    }

    let header = next_line(&mut lines, path, "hole count")?;
    let nh: usize = parse_tok(first_tok(&header, path, "hole count")?, path, "hole count")?;
    let mut hole_x = vec![0.0; nh];
    let mut hole_y = vec![0.0; nh];
    for i in 0..nh {
        let line = next_line(&mut lines, path, "hole")?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 3 {
            return Err(Error::format(path, format!("hole line {} has {} fields", i, toks.len())));
        }
        hole_x[i] = parse_tok(toks[1], path, "hole x")?;
        hole_y[i] = parse_tok(toks[2], path, "hole y")?;
    }

    Ok(Pslg {
        x,
        y,
        boundary,
        edges,
        hole_x,
        hole_y,
    })
}

/// Reads a Triangle mesh from `<stem>.node` and `<stem>.ele`. Vertex
/// references are 1-indexed on disk and 0-indexed in memory.
pub fn read_triangle_mesh(stem: &Path) -> Result<Triangulation> {
    let node_path = PathBuf::from(format!("{}.node", stem.display()));
    let mut lines = lines_of(&node_path)?;

    let header = next_line(&mut lines, &node_path, "node count")?;
    let nn: usize = parse_tok(
        first_tok(&header, &node_path, "node count")?,
        &node_path,
        "node count",
    )?;

    let mut x = vec![0.0; nn];
    let mut y = vec![0.0; nn];
    let mut boundary = vec![0i32; nn];
    for i in 0..nn {
        let line = next_line(&mut lines, &node_path, "node")?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 4 {
            return Err(Error::format(
                &node_path,
                format!("node line {} has {} fields", i, toks.len()),
            ));
        }
        x[i] = parse_tok(toks[1], &node_path, "node x")?;
        y[i] = parse_tok(toks[2], &node_path, "node y")?;
        boundary[i] = parse_tok(toks[3], &node_path, "boundary marker")?;
    }

    let ele_path = PathBuf::from(format!("{}.ele", stem.display()));
    let mut lines = lines_of(&ele_path)?;

    let header = next_line(&mut lines, &ele_path, "element count")?;
    let ne: usize = parse_tok(
        first_tok(&header, &ele_path, "element count")?,
        &ele_path,
        "element count",
    )?;

    let mut triangles = Vec::with_capacity(ne);
    for n in 0..ne {
        let line = next_line(&mut lines, &ele_path, "element")?;
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 4 {
            return Err(Error::format(
                &ele_path,
                format!("element line {} has {} fields", n, toks.len()),
            ));
        }
        let mut t = [0usize; 3];
        for k in 0..3 {
            let v: usize = parse_tok(toks[k + 1], &ele_path, "element vertex")?;
            if v < 1 || v > nn {
                return Err(Error::format(
                    &ele_path,
                    format!("element {} references vertex {} of {}", n, v, nn),
                ));
            }
            t[k] = v - 1;
        }
        triangles.push(t);
    }

    Triangulation::new(x, y, triangles, boundary).map_err(|e| Error::format(&ele_path, e.to_string()))
}

/// Writes a Triangle `.area` file: element count, then 1-indexed
/// `index area` lines.
pub fn write_area_file(path: &Path, areas: &[f64]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", areas.len())?;
    for (n, a) in areas.iter().enumerate() {
        writeln!(out, "{} {}", n + 1, a)?;
    }
    Ok(())
}

/// Writes an Arc/Info ASCII grid, rows north to south.
pub fn write_qgis(
    path: &Path,
    data: &Array2<f64>,
    xllcorner: f64,
    yllcorner: f64,
    cellsize: f64,
    no_data: f64,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let (ny, nx) = (data.nrows(), data.ncols());
    writeln!(out, "ncols         {}", nx)?;
    writeln!(out, "nrows         {}", ny)?;
    writeln!(out, "xllcorner     {}", xllcorner)?;
    writeln!(out, "yllcorner     {}", yllcorner)?;
    writeln!(out, "cellsize      {}", cellsize)?;
    writeln!(out, "NODATA_value  {}", no_data)?;
    for i in (0..ny).rev() {
        for j in 0..nx {
            write!(out, "{} ", data[[i, j]])?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Reads a per-vertex field file: one value per line in node order. The
/// count must match the mesh it belongs to.
pub fn read_vertex_field(path: &Path, expected: usize) -> Result<Vec<f64>> {
    let mut values = Vec::with_capacity(expected);
    for line in lines_of(path)? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        values.push(parse_tok(
            first_tok(&line, path, "field value")?,
            path,
            "field value",
        )?);
    }
    if values.len() != expected {
        return Err(Error::format(
            path,
            format!("{} values for a mesh with {} vertices", values.len(), expected),
        ));
    }
    Ok(values)
}
